//! Room signaling, peer-to-peer mesh negotiation and clock synchronization
//! for Behide rooms.

pub mod clock;
pub mod config;
pub mod error;
pub mod membership;
pub mod mesh;
pub mod negotiator;
pub mod room;
pub mod signaling;
pub mod transport;

pub use error::NetworkError;
pub use room::{JoinOutcome, RoomCoordinator};
