//! Control surface errors.

use crate::engine::EngineError;
use crate::params::ParamsError;
use scan_data::ExportError;
use thiserror::Error;

/// Errors returned by [`FusionProcessor`](crate::FusionProcessor).
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Worker thread panicked")]
    WorkerPanicked,

    /// The engine and sensor provider were lost with a failed worker.
    #[error("Worker resources are unavailable")]
    WorkerUnavailable,

    #[error("Reconstruction volume is not initialized")]
    VolumeNotInitialized,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Parameter error: {0}")]
    Params(#[from] ParamsError),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
}
