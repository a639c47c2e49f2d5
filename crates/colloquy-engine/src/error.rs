use colloquy_llm::GeneratorError;
use colloquy_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The cycle was superseded or aborted; no further events may be emitted.
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("tool failure: {0}")]
    Tool(String),
    #[error("processing timed out")]
    Timeout,
    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
            || matches!(self, Self::Generator(GeneratorError::Cancelled))
    }
}
