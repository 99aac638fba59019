//! The core module of the preprocessing pipeline.
//!
//! This module contains the fundamental components shared by every subsystem:
//! - Error handling and the stage taxonomy
//! - Configuration types, validation, and loading
//! - Numeric input validation helpers
//!
//! It also provides re-exports of commonly used types for convenience.

pub mod config;
pub mod errors;
pub mod validation;

pub use config::{
    AcompcorOptions, CensorOptions, ConfigFormat, ConfigLoader, ConfigValidator, MaskOptions,
    MaskSource, MotionEngine, MotionOptions, PathOptions, ProcessingOptions, RegistrationOptions,
    SliceAxis, SpineConfig, TemporalCropOptions,
};
pub use errors::{Result, SpineError, Stage};

/// Initializes the tracing subscriber for logging.
///
/// Sets up the subscriber with an environment filter and a formatting layer.
/// Typically called once at the start of the binary.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
