use std::path::PathBuf;

use xattn_driver::{ArgOverflow, DriverError};

use crate::key::VariantKey;

/// Dispatcher errors.
///
/// An unsupported configuration is not an error: `support_config` answers `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("no precompiled kernel for {0}")]
    KernelNotFound(VariantKey),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ArgOverflow> for DispatchError {
    fn from(err: ArgOverflow) -> Self {
        DispatchError::Invariant(err.to_string())
    }
}
