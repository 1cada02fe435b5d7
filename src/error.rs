use thiserror::Error;

use crate::negotiator::AttemptState;
use crate::signaling::{PeerId, SignalingError};
use crate::transport::TransportError;

/// Errors surfaced by the room, mesh and negotiation layers
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("peer {0} already has a connection")]
    DuplicateConnection(PeerId),

    #[error("invalid attempt transition from {from} to {to}")]
    InvalidTransition { from: AttemptState, to: AttemptState },

    #[error("channel closed")]
    ChannelClosed,

    #[error("not in a room")]
    NotInRoom,

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
