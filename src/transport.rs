//! Peer-to-peer transport capability
//!
//! A [`PeerConnection`] mirrors the callback style of engine WebRTC peers:
//! methods only queue work and results come back as [`PeerEvent`]s on the
//! connection's event channel.

mod memory;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::IceServer;
use crate::signaling::{IceCandidate, SdpDescription};

pub use memory::{MemoryConnection, MemoryNetwork};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local offer or answer is ready to be published
    SessionDescriptionCreated(SdpDescription),
    IceCandidateCreated(IceCandidate),
    StateChanged(ConnectionState),
    /// Text received on the reliable ordered channel
    Message(String),
}

pub type PeerEvents = async_channel::Receiver<PeerEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer connection closed")]
    Closed,

    #[error("operation not allowed in state {0}")]
    InvalidState(ConnectionState),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),
}

pub trait PeerConnection: Send + Sync {
    /// Start negotiating as the offering side
    fn create_offer(&self) -> Result<(), TransportError>;

    /// Apply the remote description. An offer makes this side create its
    /// answer.
    fn set_remote_description(&self, description: SdpDescription) -> Result<(), TransportError>;

    /// Fails until the remote description is set.
    fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn send(&self, text: &str) -> Result<(), TransportError>;

    fn close(&self);

    fn state(&self) -> ConnectionState;
}

/// Factory for peer connections, provided by the host engine
pub trait PeerTransport: Send + Sync {
    /// Open a connection that gathers candidates through `ice_servers`.
    fn new_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), TransportError>;
}
