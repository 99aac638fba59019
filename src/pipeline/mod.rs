//! The processing-graph orchestrator.
//!
//! Planning converts the manifest and configuration into a DAG of build
//! steps; execution walks the graph with dependency-aware skipping,
//! tool-availability fallbacks, and per-step provenance capture.

pub mod dag;
pub mod executor;
pub mod provenance;

pub use dag::{Dag, Step, StepId};
pub use executor::{ExecMode, ExecSummary, Executor, LockGuard, StageCounts};
pub use provenance::{mark_ok, mark_skip, prov_path, write_prov, ProvenanceRecord};
