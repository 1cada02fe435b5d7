use serde::{Deserialize, Serialize};

use super::types::{
    ConnectionAttemptId, HubError, HubOperation, IceCandidate, PeerId, RoomConnectionInfo,
    RoomId, SdpDescription,
};

/// Hub methods callable by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HubRequest {
    CreateRoom,
    JoinRoom {
        room_id: RoomId,
    },
    ConnectToRoomPlayers,
    StartConnectionAttempt {
        offer: SdpDescription,
    },
    JoinConnectionAttempt {
        attempt_id: ConnectionAttemptId,
    },
    SendAnswer {
        attempt_id: ConnectionAttemptId,
        answer: SdpDescription,
    },
    SendIceCandidate {
        attempt_id: ConnectionAttemptId,
        candidate: IceCandidate,
    },
    EndConnectionAttempt {
        attempt_id: ConnectionAttemptId,
    },
    LeaveRoom,
}

impl HubRequest {
    pub fn operation(&self) -> HubOperation {
        match self {
            HubRequest::CreateRoom => HubOperation::CreateRoom,
            HubRequest::JoinRoom { .. } => HubOperation::JoinRoom,
            HubRequest::ConnectToRoomPlayers => HubOperation::ConnectToRoomPlayers,
            HubRequest::StartConnectionAttempt { .. } => HubOperation::StartConnectionAttempt,
            HubRequest::JoinConnectionAttempt { .. } => HubOperation::JoinConnectionAttempt,
            HubRequest::SendAnswer { .. } => HubOperation::SendAnswer,
            HubRequest::SendIceCandidate { .. } => HubOperation::SendIceCandidate,
            HubRequest::EndConnectionAttempt { .. } => HubOperation::EndConnectionAttempt,
            HubRequest::LeaveRoom => HubOperation::LeaveRoom,
        }
    }
}

/// Hub replies, one success shape per method plus a shared failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HubReply {
    RoomCreated { room_id: RoomId },
    RoomJoined { peer_id: PeerId },
    RoomPlayers { info: RoomConnectionInfo },
    AttemptStarted { attempt_id: ConnectionAttemptId },
    AttemptJoined { offer: SdpDescription },
    Done,
    Failed { error: HubError },
}

/// Calls the hub makes on a client and waits a result for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClientInvocation {
    /// Another peer wants to connect: publish an offer it can answer and
    /// reply with its attempt id.
    ConnectionRequested { asking_peer: PeerId },
}

/// Fire-and-forget hub events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubPush {
    SdpAnswerReceived {
        attempt_id: ConnectionAttemptId,
        answer: SdpDescription,
    },
    IceCandidateReceived {
        attempt_id: ConnectionAttemptId,
        candidate: IceCandidate,
    },
}

/// Frames sent from client to hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Request {
        id: u64,
        call: HubRequest,
    },
    InvokeResult {
        id: u64,
        attempt: Option<ConnectionAttemptId>,
    },
}

/// Frames sent from hub to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Response { id: u64, reply: HubReply },
    Invoke { id: u64, call: ClientInvocation },
    Push { event: HubPush },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_create_room_request() {
        let json = r#"{"type": "request", "id": 1, "call": {"method": "create_room"}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Request {
                id: 1,
                call: HubRequest::CreateRoom
            }
        );
    }

    #[test]
    fn parse_join_room_request() {
        let json = r#"{"type": "request", "id": 4, "call": {"method": "join_room", "room_id": "abc123"}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        if let ClientFrame::Request {
            call: HubRequest::JoinRoom { room_id },
            ..
        } = frame
        {
            assert_eq!(room_id.as_str(), "ABC123");
        } else {
            panic!("Expected JoinRoom");
        }
    }

    #[test]
    fn parse_invoke_result_without_attempt() {
        let json = r#"{"type": "invoke_result", "id": 9, "attempt": null}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame, ClientFrame::InvokeResult { id: 9, attempt: None });
    }

    #[test]
    fn serialize_failed_response() {
        let frame = ServerFrame::Response {
            id: 3,
            reply: HubReply::Failed {
                error: HubError::RoomNotFound,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"response\""));
        assert!(json.contains("\"kind\":\"failed\""));
        assert!(json.contains("room_not_found"));
    }

    #[test]
    fn serialize_connection_requested() {
        let frame = ServerFrame::Invoke {
            id: 11,
            call: ClientInvocation::ConnectionRequested {
                asking_peer: PeerId(3),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("connection_requested"));
        assert!(json.contains("\"asking_peer\":3"));
    }

    #[test]
    fn ice_push_survives_the_wire() {
        let attempt_id = ConnectionAttemptId::generate();
        let frame = ServerFrame::Push {
            event: HubPush::IceCandidateReceived {
                attempt_id,
                candidate: IceCandidate {
                    media: "0".to_string(),
                    index: 0,
                    name: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
                },
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn request_operation_names() {
        let call = HubRequest::EndConnectionAttempt {
            attempt_id: ConnectionAttemptId::generate(),
        };
        assert_eq!(call.operation(), HubOperation::EndConnectionAttempt);
        assert_eq!(
            HubRequest::ConnectToRoomPlayers.operation().to_string(),
            "connect to room players"
        );
    }
}
