/// Errors raised by the merge primitives.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// The single consumer side has already been handed out.
    #[error("merged stream already has a consumer")]
    ConsumerClaimed,

    /// The primitive was stopped before the call.
    #[error("merge primitive stopped")]
    Stopped,
}

impl MergeError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConsumerClaimed => "consumer_claimed",
            Self::Stopped => "stopped",
        }
    }
}
