use data_contracts::Head;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LossError {
    #[error("head `{head}` is predicted but the batch has no `{target}` target")]
    MissingTarget { head: Head, target: &'static str },
    #[error("vertex loss needs the `{0}` head in the model output")]
    MissingOutput(Head),
    #[error("loss configured for {expected} stacks but the model produced {actual}")]
    StackCount { expected: usize, actual: usize },
    #[error("reading loss `{key}` back to the host failed: {reason}")]
    Readback { key: &'static str, reason: String },
}

impl LossError {
    pub(crate) fn missing(head: Head, target: &'static str) -> Self {
        LossError::MissingTarget { head, target }
    }
}
