use std::time::Duration;

use thiserror::Error;

use crate::llm::generation::GenerationError;
use crate::villa::catalog::Step;
use crate::villa::session::SessionState;

#[derive(Debug, Error)]
pub enum VillaError {
    #[error("callback for {got} does not match current state {expected}")]
    OutOfOrder { expected: SessionState, got: Step },

    #[error("'{value}' is not a valid {step} option")]
    InvalidOption { step: Step, value: String },

    #[error("session is not ready for composition (state: {state})")]
    IncompleteSession { state: SessionState },

    #[error("no active villa session")]
    NoActiveSession,

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("image generation did not finish within {}s", .0.as_secs())]
    GenerationTimeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl VillaError {
    pub fn config(message: impl Into<String>) -> Self {
        VillaError::Config(message.into())
    }
}
