use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Nothing to resume: neither a launch descriptor nor a persisted one.
    #[error("no active study session was found")]
    MissingSession,
    #[error("the study session has already ended")]
    SessionEnded,
    #[error("session duration must be greater than zero")]
    InvalidDuration,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
