use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport capability unavailable: {0}")]
    Unavailable(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("transport session closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("room {0} not found on relay")]
    RoomNotFound(String),
    #[error("relay rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signaling client stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("no open data channel to peer {0}")]
    ChannelNotOpen(String),
    #[error("mesh stopped")]
    Stopped,
}
