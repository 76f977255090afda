use thiserror::Error;

/// Reasons a pipeline stage can refuse to start or give up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("not enough memory for stage buffers")]
    NoMemory,
    #[error("unsupported stream or container")]
    NotSupported,
    #[error("stream is incompatible with the active output")]
    InvalidArgument,
    #[error("worker could not be started")]
    InvalidState,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("{0}")]
    Failed(String),
}
