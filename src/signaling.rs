//! Signaling transport: the hub protocol, its reference server and the
//! client used by peers to reach it.

mod actor;
mod client;
mod messages;
mod server;
mod types;

pub use actor::{HubHandle, SessionId};
pub use client::{HubEvent, HubEvents, SignalingClient};
pub use messages::{ClientFrame, ClientInvocation, HubPush, HubReply, HubRequest, ServerFrame};
pub use server::{DEFAULT_SIGNALING_PORT, SignalingServer};
pub use types::{
    ConnectionAttemptId, FailedCreation, HubError, HubOperation, IceCandidate,
    PlayerConnectionInfo, PeerId, RoomConnectionInfo, RoomId, SdpDescription, SdpKind,
    SignalingError,
};
