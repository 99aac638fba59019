//! SpinePrep - spinal-cord fMRI preprocessing.
//!
//! This library preprocesses spinal-cord functional MRI datasets organized
//! per the BIDS convention, producing derivative images, per-volume nuisance
//! regressors, quality-control inputs, and machine-readable provenance.
//!
//! The core is three tightly coupled subsystems:
//! - The processing-graph orchestrator ([`pipeline`]): plans a DAG of build
//!   steps from the discovered dataset and executes it with dependency-aware
//!   skipping, tool-availability fallbacks, and per-step provenance.
//! - The confounds engine ([`confounds`]): framewise displacement, DVARS,
//!   contiguity-aware frame censoring, and deterministic aCompCor PCA.
//! - The temporal-crop / motion-correction coordinator ([`crop`] and
//!   [`motion`]): a sidecar-mediated contract that decouples crop detection
//!   from motion correction and confounds extraction.
//!
//! # Modules
//!
//! * [`core`] - Errors, configuration, validation, logging setup
//! * [`bids`] - Run identity, manifest, derivative path model
//! * [`image`] - NIfTI-backed volumes and masks
//! * [`crop`] - Temporal crop detection and the sidecar contract
//! * [`motion`] - Motion-correction engines and the coordinator
//! * [`confounds`] - FD, DVARS, censoring, aCompCor, table writers
//! * [`adapters`] - Uniform external-tool wrappers with placeholder fallback
//! * [`pipeline`] - DAG planning, execution, provenance
//! * [`qc`] - Quality-control input collection
//! * [`doctor`] - External tool availability report

pub mod adapters;
pub mod bids;
pub mod confounds;
pub mod core;
pub mod crop;
pub mod doctor;
pub mod image;
pub mod motion;
pub mod pipeline;
pub mod qc;
pub mod utils;

/// A prelude module for convenient imports.
///
/// Re-exports the types most callers need: configuration, the manifest and
/// path model, the orchestrator, and the confounds engine.
pub mod prelude {
    pub use crate::bids::{
        AnatRecord, DerivativeLayout, Desc, EntityTuple, Manifest, RunRecord, Space,
    };
    pub use crate::confounds::{ConfoundsEngine, ConfoundsInputs};
    pub use crate::core::{
        init_tracing, ConfigLoader, MotionEngine, Result, SliceAxis, SpineConfig, SpineError,
        Stage,
    };
    pub use crate::crop::{CropReason, CropSidecar};
    pub use crate::doctor::DoctorReport;
    pub use crate::image::{Mask3d, Volume4d};
    pub use crate::motion::{MotionCoordinator, MotionStatus};
    pub use crate::pipeline::{Dag, ExecMode, ExecSummary, Executor};
}
