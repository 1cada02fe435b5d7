use std::fmt;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors reported by the signaling hub itself.
///
/// These travel over the wire and are matched on by the client, so variants
/// must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubError {
    #[error("Player connection not found")]
    PlayerNotFound,
    #[error("Connection attempt not found")]
    ConnectionAttemptNotFound,
    #[error("Connection attempt already answered")]
    ConnectionAttemptAlreadyAnswered,
    #[error("Initiator cannot join")]
    InitiatorCannotJoin,
    #[error("Not answerer")]
    NotAnswerer,
    #[error("Not participant")]
    NotParticipant,
    #[error("No answerer")]
    NoAnswerer,
    #[error("Failed to update connection attempt")]
    FailedToUpdateConnectionAttempt,
    #[error("Failed to update player connection")]
    FailedToUpdatePlayer,
    #[error("Failed to update room")]
    FailedToUpdateRoom,
    #[error("Failed to create a connection attempt")]
    FailedToCreateConnectionAttempt,
    #[error("Failed to register room")]
    FailedToRegisterRoom,
    #[error("Room not found")]
    RoomNotFound,
    #[error("Player already in a room")]
    PlayerAlreadyInARoom,
    #[error("Not in a room")]
    NotInARoom,
}

/// Hub operation a [`SignalingError::Hub`] failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubOperation {
    CreateRoom,
    JoinRoom,
    ConnectToRoomPlayers,
    StartConnectionAttempt,
    JoinConnectionAttempt,
    SendAnswer,
    SendIceCandidate,
    EndConnectionAttempt,
    LeaveRoom,
}

impl fmt::Display for HubOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HubOperation::CreateRoom => "create a room",
            HubOperation::JoinRoom => "join a room",
            HubOperation::ConnectToRoomPlayers => "connect to room players",
            HubOperation::StartConnectionAttempt => "start a connection attempt",
            HubOperation::JoinConnectionAttempt => "join a connection attempt",
            HubOperation::SendAnswer => "send an answer",
            HubOperation::SendIceCandidate => "send an ice candidate",
            HubOperation::EndConnectionAttempt => "end a connection attempt",
            HubOperation::LeaveRoom => "leave a room",
        })
    }
}

/// Client-side signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Localized hub failure, e.g. "Failed to join a room: Room not found".
    #[error("Failed to {operation}: {error}")]
    Hub {
        operation: HubOperation,
        error: HubError,
    },

    #[error("signaling hub disconnected")]
    Disconnected,

    #[error("signaling request timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl SignalingError {
    /// The hub error carried by this failure, if the hub produced it.
    pub fn hub_error(&self) -> Option<HubError> {
        match self {
            SignalingError::Hub { error, .. } => Some(*error),
            _ => None,
        }
    }
}

const ROOM_ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const ROOM_ID_LEN: usize = 6;
const ATTEMPT_ID_LEN: usize = 16;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Room code: 6 upper-case alphanumeric characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId {
    bytes: [u8; ROOM_ID_LEN],
}

impl RoomId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; ROOM_ID_LEN];
        for byte in &mut bytes {
            *byte = ROOM_ID_CHARS[rng.random_range(0..ROOM_ID_CHARS.len())];
        }
        Self { bytes }
    }

    /// Parse a code typed by a player. Case and surrounding whitespace are
    /// ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() != ROOM_ID_LEN {
            return None;
        }

        let mut bytes = [0u8; ROOM_ID_LEN];
        for (byte, c) in bytes.iter_mut().zip(raw.bytes()) {
            let c = c.to_ascii_uppercase();
            if !ROOM_ID_CHARS.contains(&c) {
                return None;
            }
            *byte = c;
        }
        Some(Self { bytes })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RoomId::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid room id: {s}")))
    }
}

/// Peer id within a room session. The room creator is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl PeerId {
    pub const HOST: PeerId = PeerId(1);

    pub fn next(self) -> PeerId {
        PeerId(self.0 + 1)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection attempt id: 16 hex digits minted by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionAttemptId {
    bytes: [u8; ATTEMPT_ID_LEN],
}

impl ConnectionAttemptId {
    pub fn generate() -> Self {
        let value: u64 = rand::rng().random();
        let mut bytes = [0u8; ATTEMPT_ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            *byte = HEX_CHARS[nibble];
        }
        Self { bytes }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for ConnectionAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ConnectionAttemptId {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.len() != ATTEMPT_ID_LEN || !s.bytes().all(|b| HEX_CHARS.contains(&b)) {
            return Err(format!("invalid connection attempt id: {s}"));
        }
        let mut bytes = [0u8; ATTEMPT_ID_LEN];
        bytes.copy_from_slice(s.as_bytes());
        Ok(Self { bytes })
    }
}

impl Serialize for ConnectionAttemptId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConnectionAttemptId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ConnectionAttemptId::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during a connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SdpDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub media: String,
    pub index: u32,
    pub name: String,
}

/// One room member the caller has to answer a connection attempt for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConnectionInfo {
    pub peer_id: PeerId,
    pub attempt_id: ConnectionAttemptId,
}

/// A room member for which the hub could not obtain a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCreation {
    pub peer_id: PeerId,
    pub error: HubError,
}

/// Result of `ConnectToRoomPlayers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConnectionInfo {
    pub players_connection_info: Vec<PlayerConnectionInfo>,
    pub failed_creations: Vec<FailedCreation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_generate_has_correct_length() {
        let id = RoomId::generate();
        assert_eq!(id.as_str().len(), ROOM_ID_LEN);
    }

    #[test]
    fn room_id_generate_uses_valid_chars() {
        let id = RoomId::generate();
        for c in id.as_str().bytes() {
            assert!(ROOM_ID_CHARS.contains(&c), "Invalid char: {}", c as char);
        }
    }

    #[test]
    fn room_id_parse_normalizes_case_and_whitespace() {
        let id = RoomId::parse("  ab12cd \n").unwrap();
        assert_eq!(id.as_str(), "AB12CD");
    }

    #[test]
    fn room_id_parse_rejects_bad_input() {
        assert!(RoomId::parse("ABC").is_none());
        assert!(RoomId::parse("ABCDEFG").is_none());
        assert!(RoomId::parse("AB-12C").is_none());
        assert!(RoomId::parse("").is_none());
    }

    #[test]
    fn room_id_serialization() {
        let id = RoomId::parse("XY98ZQ").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"XY98ZQ\"");
        let back: RoomId = serde_json::from_str("\"xy98zq\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn room_id_deserialization_rejects_invalid() {
        assert!(serde_json::from_str::<RoomId>("\"nope\"").is_err());
    }

    #[test]
    fn attempt_id_generate_is_hex() {
        let id = ConnectionAttemptId::generate();
        assert_eq!(id.as_str().len(), ATTEMPT_ID_LEN);
        assert!(id.as_str().bytes().all(|b| HEX_CHARS.contains(&b)));
        assert_eq!(ConnectionAttemptId::try_from(id.as_str()).unwrap(), id);
    }

    #[test]
    fn attempt_id_rejects_non_hex() {
        assert!(ConnectionAttemptId::try_from("zzzzzzzzzzzzzzzz").is_err());
        assert!(ConnectionAttemptId::try_from("abc").is_err());
    }

    #[test]
    fn peer_id_orders_numerically() {
        assert!(PeerId(2) < PeerId(10));
        assert_eq!(PeerId::HOST.next(), PeerId(2));
        assert_eq!(serde_json::to_string(&PeerId(7)).unwrap(), "7");
    }

    #[test]
    fn sdp_description_wire_shape() {
        let json = serde_json::to_string(&SdpDescription::offer("v=0")).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[test]
    fn hub_error_wire_names() {
        let json = serde_json::to_string(&HubError::ConnectionAttemptAlreadyAnswered).unwrap();
        assert_eq!(json, "\"connection_attempt_already_answered\"");
    }

    #[test]
    fn hub_failure_is_localized() {
        let err = SignalingError::Hub {
            operation: HubOperation::JoinRoom,
            error: HubError::RoomNotFound,
        };
        assert_eq!(err.to_string(), "Failed to join a room: Room not found");
        assert_eq!(err.hub_error(), Some(HubError::RoomNotFound));
        assert_eq!(SignalingError::Timeout.hub_error(), None);
    }
}
