use thiserror::Error;

/// The six error kinds of the engine's diagnostic contract.
///
/// Every fallible operation in the crate returns an [`EngineResult`] whose
/// error carries one of these kinds plus a human-readable message.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_model(msg: impl Into<String>) -> Self {
        Self::InvalidModel(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::RuntimeError(msg.into())
    }

    /// Converts an internal `anyhow::Error` raised by an analysis helper
    /// (verifier, memory planner, pass scheduling) into the public error
    /// type at the module boundary.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        Self::RuntimeError(err.to_string())
    }
}
