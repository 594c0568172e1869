//! Peer connection negotiation over a polled mailbox relay.
//!
//! A [`ConnectionSupervisor`] joins a room, negotiates one transport session
//! per remote peer through the relay, and keeps those sessions alive with
//! connect timeouts and reconnects. Transports plug in through
//! [`transport::SessionFactory`]; the relay through [`MailboxApi`].

pub mod config;
pub mod error;
mod negotiation;
pub mod peer;
pub mod retry;
pub mod signaling;
pub mod supervisor;
pub mod transport;

pub use config::MeshConfig;
pub use error::{MeshError, SignalingError, TransportError};
pub use peer::PeerState;
pub use retry::RetryPolicy;
pub use signaling::{HttpMailbox, LocalMailbox, MailboxApi, SignalingClient, SignalingEvent};
pub use supervisor::{ConnectionSupervisor, MeshEvent};
pub use transport::mock::{MockNetwork, MockOpKind};
pub use transport::webrtc::WebRtcSessionFactory;
pub use transport::{ConnectionState, DataChannel, Payload, SessionFactory, TransportSession};
