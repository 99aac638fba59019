//! Dataset model: run identity, manifest, and derivative path composition.

pub mod entities;
pub mod manifest;
pub mod paths;

pub use entities::EntityTuple;
pub use manifest::{AnatRecord, Manifest, RunRecord};
pub use paths::{DerivativeLayout, Desc, Space};
