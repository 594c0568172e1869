use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailboxError {
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}
