use stagewise_types::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution frame error: {0}")]
    Frame(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("output `{name}` is not produced by the final stage")]
    MissingOutput { name: String },

    #[error("request {request_id} failed: {message}")]
    RequestFailed { request_id: u64, message: String },

    #[error("request processing timed out after {waited_ms} ms")]
    Timeout { waited_ms: u64 },

    #[error("run was aborted")]
    Aborted,

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Error reported by an inference engine. Converted into a token-level
/// error message by the stage worker that observed it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<EngineError> for PipelineError {
    fn from(e: EngineError) -> Self {
        PipelineError::Execution(e.0)
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
