use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::{ClientFrame, ClientInvocation, HubPush, HubReply, HubRequest, ServerFrame};
use super::types::{
    ConnectionAttemptId, FailedCreation, HubError, PeerId, PlayerConnectionInfo,
    RoomConnectionInfo, RoomId, SdpDescription, SdpKind,
};
use crate::config::HubConfig;

const ROOM_ID_RETRIES: usize = 16;

/// Hub-side identity of one connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Commands sent to the hub actor
pub(crate) enum HubCommand {
    Open {
        outbound: mpsc::UnboundedSender<ServerFrame>,
        reply: oneshot::Sender<SessionId>,
    },
    Call {
        session: SessionId,
        request: HubRequest,
        reply: oneshot::Sender<HubReply>,
    },
    InvokeResult {
        session: SessionId,
        id: u64,
        attempt: Option<ConnectionAttemptId>,
    },
    Close {
        session: SessionId,
    },
}

struct Session {
    outbound: mpsc::UnboundedSender<ServerFrame>,
    room: Option<(RoomId, PeerId)>,
}

struct Room {
    players: HashMap<PeerId, SessionId>,
    next_peer: PeerId,
}

struct Attempt {
    initiator: SessionId,
    offer: SdpDescription,
    answerer: Option<SessionId>,
    created: Instant,
}

struct PendingInvocation {
    session: SessionId,
    reply: oneshot::Sender<Option<ConnectionAttemptId>>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, Session>,
    rooms: HashMap<RoomId, Room>,
    attempts: HashMap<ConnectionAttemptId, Attempt>,
    invocations: HashMap<u64, PendingInvocation>,
    next_session: u64,
    next_invocation: u64,
}

pub(crate) async fn hub_actor(mut rx: mpsc::Receiver<HubCommand>, config: HubConfig) {
    let mut state = HubState::default();
    let mut sweep = tokio::time::interval(config.sweep_interval());
    let attempt_ttl = config.attempt_ttl();
    let invoke_timeout = config.invoke_timeout();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    HubCommand::Open { outbound, reply } => {
                        state.next_session += 1;
                        let id = SessionId(state.next_session);
                        state.sessions.insert(id, Session { outbound, room: None });
                        debug!("Hub {} opened", id);
                        let _ = reply.send(id);
                    }

                    HubCommand::Call { session, request, reply } => {
                        if let HubRequest::ConnectToRoomPlayers = request {
                            state.connect_to_room_players(session, reply, invoke_timeout);
                        } else {
                            let result = state.handle_request(session, request);
                            let _ = reply.send(match result {
                                Ok(reply) => reply,
                                Err(error) => HubReply::Failed { error },
                            });
                        }
                    }

                    HubCommand::InvokeResult { session, id, attempt } => {
                        state.resolve_invocation(session, id, attempt);
                    }

                    HubCommand::Close { session } => state.close(session),
                }
            }

            _ = sweep.tick() => state.sweep(attempt_ttl),
        }
    }
}

impl HubState {
    fn handle_request(
        &mut self,
        session: SessionId,
        request: HubRequest,
    ) -> Result<HubReply, HubError> {
        if !self.sessions.contains_key(&session) {
            return Err(HubError::PlayerNotFound);
        }

        match request {
            HubRequest::CreateRoom => self.create_room(session),
            HubRequest::JoinRoom { room_id } => self.join_room(session, room_id),
            HubRequest::StartConnectionAttempt { offer } => {
                if offer.kind != SdpKind::Offer {
                    return Err(HubError::FailedToCreateConnectionAttempt);
                }
                let attempt_id = self.unused_attempt_id()?;
                self.attempts.insert(
                    attempt_id,
                    Attempt {
                        initiator: session,
                        offer,
                        answerer: None,
                        created: Instant::now(),
                    },
                );
                debug!("Connection attempt {} started by {}", attempt_id, session);
                Ok(HubReply::AttemptStarted { attempt_id })
            }
            HubRequest::JoinConnectionAttempt { attempt_id } => {
                let attempt = self
                    .attempts
                    .get_mut(&attempt_id)
                    .ok_or(HubError::ConnectionAttemptNotFound)?;
                if attempt.initiator == session {
                    return Err(HubError::InitiatorCannotJoin);
                }
                if attempt.answerer.is_some() {
                    return Err(HubError::ConnectionAttemptAlreadyAnswered);
                }
                attempt.answerer = Some(session);
                debug!("Connection attempt {} joined by {}", attempt_id, session);
                Ok(HubReply::AttemptJoined {
                    offer: attempt.offer.clone(),
                })
            }
            HubRequest::SendAnswer { attempt_id, answer } => {
                let attempt = self
                    .attempts
                    .get(&attempt_id)
                    .ok_or(HubError::ConnectionAttemptNotFound)?;
                if attempt.answerer != Some(session) {
                    return Err(HubError::NotAnswerer);
                }
                self.push(
                    attempt.initiator,
                    HubPush::SdpAnswerReceived { attempt_id, answer },
                )?;
                Ok(HubReply::Done)
            }
            HubRequest::SendIceCandidate {
                attempt_id,
                candidate,
            } => {
                let attempt = self
                    .attempts
                    .get(&attempt_id)
                    .ok_or(HubError::ConnectionAttemptNotFound)?;
                let answerer = attempt.answerer.ok_or(HubError::NoAnswerer)?;
                let target = if session == attempt.initiator {
                    answerer
                } else if session == answerer {
                    attempt.initiator
                } else {
                    return Err(HubError::NotParticipant);
                };
                self.push(
                    target,
                    HubPush::IceCandidateReceived {
                        attempt_id,
                        candidate,
                    },
                )?;
                Ok(HubReply::Done)
            }
            HubRequest::EndConnectionAttempt { attempt_id } => {
                let attempt = self
                    .attempts
                    .get(&attempt_id)
                    .ok_or(HubError::ConnectionAttemptNotFound)?;
                if attempt.initiator != session && attempt.answerer != Some(session) {
                    return Err(HubError::NotParticipant);
                }
                self.attempts.remove(&attempt_id);
                debug!("Connection attempt {} ended by {}", attempt_id, session);
                Ok(HubReply::Done)
            }
            HubRequest::LeaveRoom => {
                self.leave_room(session)?;
                Ok(HubReply::Done)
            }
            // Served asynchronously by `connect_to_room_players`.
            HubRequest::ConnectToRoomPlayers => Err(HubError::FailedToUpdateRoom),
        }
    }

    fn create_room(&mut self, session: SessionId) -> Result<HubReply, HubError> {
        let entry = self
            .sessions
            .get(&session)
            .ok_or(HubError::PlayerNotFound)?;
        if entry.room.is_some() {
            return Err(HubError::PlayerAlreadyInARoom);
        }

        let room_id = (0..ROOM_ID_RETRIES)
            .map(|_| RoomId::generate())
            .find(|id| !self.rooms.contains_key(id))
            .ok_or(HubError::FailedToRegisterRoom)?;

        self.rooms.insert(
            room_id,
            Room {
                players: HashMap::from([(PeerId::HOST, session)]),
                next_peer: PeerId::HOST.next(),
            },
        );
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.room = Some((room_id, PeerId::HOST));
        }

        info!("Room created: {} by {}", room_id, session);
        Ok(HubReply::RoomCreated { room_id })
    }

    fn join_room(&mut self, session: SessionId, room_id: RoomId) -> Result<HubReply, HubError> {
        let entry = self
            .sessions
            .get_mut(&session)
            .ok_or(HubError::PlayerNotFound)?;
        if entry.room.is_some() {
            return Err(HubError::PlayerAlreadyInARoom);
        }
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(HubError::RoomNotFound)?;

        let peer_id = room.next_peer;
        room.next_peer = peer_id.next();
        room.players.insert(peer_id, session);
        entry.room = Some((room_id, peer_id));

        info!("Peer {} ({}) joined room {}", peer_id, session, room_id);
        Ok(HubReply::RoomJoined { peer_id })
    }

    fn leave_room(&mut self, session: SessionId) -> Result<(), HubError> {
        let entry = self
            .sessions
            .get_mut(&session)
            .ok_or(HubError::PlayerNotFound)?;
        let (room_id, peer_id) = entry.room.take().ok_or(HubError::NotInARoom)?;

        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(HubError::FailedToUpdateRoom)?;
        room.players.remove(&peer_id);
        if room.players.is_empty() {
            self.rooms.remove(&room_id);
            info!("Room {} removed (empty)", room_id);
        }

        info!("Peer {} left room {}", peer_id, room_id);
        Ok(())
    }

    /// Ask every other member of the caller's room to publish an offer, then
    /// reply once all of them answered, declined or timed out.
    fn connect_to_room_players(
        &mut self,
        session: SessionId,
        reply: oneshot::Sender<HubReply>,
        invoke_timeout: Duration,
    ) {
        let members = match self.room_members_except(session) {
            Ok(members) => members,
            Err(error) => {
                let _ = reply.send(HubReply::Failed { error });
                return;
            }
        };
        let Some(asking_peer) = self
            .sessions
            .get(&session)
            .and_then(|s| s.room)
            .map(|(_, peer_id)| peer_id)
        else {
            let _ = reply.send(HubReply::Failed {
                error: HubError::NotInARoom,
            });
            return;
        };

        let mut waiting = Vec::with_capacity(members.len());
        let mut failed_creations = Vec::new();
        for (peer_id, member) in members {
            self.next_invocation += 1;
            let id = self.next_invocation;
            let (tx, rx) = oneshot::channel();

            let frame = ServerFrame::Invoke {
                id,
                call: ClientInvocation::ConnectionRequested { asking_peer },
            };
            let sent = self
                .sessions
                .get(&member)
                .is_some_and(|s| s.outbound.send(frame).is_ok());
            if !sent {
                failed_creations.push(FailedCreation {
                    peer_id,
                    error: HubError::PlayerNotFound,
                });
                continue;
            }

            self.invocations.insert(
                id,
                PendingInvocation {
                    session: member,
                    reply: tx,
                },
            );
            waiting.push((peer_id, rx));
        }

        tokio::spawn(async move {
            let results = join_all(waiting.into_iter().map(|(peer_id, rx)| async move {
                let attempt = tokio::time::timeout(invoke_timeout, rx)
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .flatten();
                (peer_id, attempt)
            }))
            .await;

            let mut info = RoomConnectionInfo {
                players_connection_info: Vec::new(),
                failed_creations,
            };
            for (peer_id, attempt) in results {
                match attempt {
                    Some(attempt_id) => info.players_connection_info.push(PlayerConnectionInfo {
                        peer_id,
                        attempt_id,
                    }),
                    None => {
                        warn!("Peer {} did not publish an offer for {}", peer_id, asking_peer);
                        info.failed_creations.push(FailedCreation {
                            peer_id,
                            error: HubError::FailedToCreateConnectionAttempt,
                        });
                    }
                }
            }
            let _ = reply.send(HubReply::RoomPlayers { info });
        });
    }

    fn room_members_except(
        &self,
        session: SessionId,
    ) -> Result<Vec<(PeerId, SessionId)>, HubError> {
        let entry = self
            .sessions
            .get(&session)
            .ok_or(HubError::PlayerNotFound)?;
        let (room_id, _) = entry.room.ok_or(HubError::NotInARoom)?;
        let room = self.rooms.get(&room_id).ok_or(HubError::NotInARoom)?;

        let mut members: Vec<_> = room
            .players
            .iter()
            .filter(|(_, s)| **s != session)
            .map(|(peer_id, s)| (*peer_id, *s))
            .collect();
        members.sort_by_key(|(peer_id, _)| *peer_id);
        Ok(members)
    }

    fn resolve_invocation(
        &mut self,
        session: SessionId,
        id: u64,
        attempt: Option<ConnectionAttemptId>,
    ) {
        let Some(pending) = self.invocations.remove(&id) else {
            debug!("Late invocation result {} from {}", id, session);
            return;
        };
        if pending.session != session {
            warn!("{} answered an invocation addressed to {}", session, pending.session);
            self.invocations.insert(id, pending);
            return;
        }

        // Only attempts the member itself started count as an answer.
        let attempt = attempt.filter(|attempt_id| {
            self.attempts
                .get(attempt_id)
                .is_some_and(|a| a.initiator == session)
        });
        let _ = pending.reply.send(attempt);
    }

    fn push(&self, target: SessionId, event: HubPush) -> Result<(), HubError> {
        let session = self
            .sessions
            .get(&target)
            .ok_or(HubError::PlayerNotFound)?;
        session
            .outbound
            .send(ServerFrame::Push { event })
            .map_err(|_| HubError::PlayerNotFound)
    }

    fn unused_attempt_id(&self) -> Result<ConnectionAttemptId, HubError> {
        (0..ROOM_ID_RETRIES)
            .map(|_| ConnectionAttemptId::generate())
            .find(|id| !self.attempts.contains_key(id))
            .ok_or(HubError::FailedToCreateConnectionAttempt)
    }

    fn close(&mut self, session: SessionId) {
        if self
            .sessions
            .get(&session)
            .is_some_and(|s| s.room.is_some())
        {
            let _ = self.leave_room(session);
        }
        self.attempts
            .retain(|_, a| a.initiator != session && a.answerer != Some(session));
        self.invocations.retain(|_, p| p.session != session);
        self.sessions.remove(&session);
        debug!("Hub {} closed", session);
    }

    fn sweep(&mut self, attempt_ttl: Duration) {
        let before = self.attempts.len();
        self.attempts.retain(|_, a| a.created.elapsed() < attempt_ttl);
        let expired = before - self.attempts.len();
        if expired > 0 {
            info!("Expired {} abandoned connection attempt(s)", expired);
        }
        self.invocations.retain(|_, p| !p.reply.is_closed());
    }
}

/// Handle to communicate with the hub actor
#[derive(Clone)]
pub struct HubHandle {
    pub(crate) tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Spawn a hub actor on the current runtime
    pub fn spawn(config: HubConfig) -> Self {
        let (tx, rx) = mpsc::channel::<HubCommand>(1024);
        tokio::spawn(hub_actor(rx, config));
        Self { tx }
    }

    /// Register a client; frames for it are written to `outbound`
    pub async fn open_session(
        &self,
        outbound: mpsc::UnboundedSender<ServerFrame>,
    ) -> Option<SessionId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Open {
                outbound,
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn call(&self, session: SessionId, request: HubRequest) -> HubReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(HubCommand::Call {
                session,
                request,
                reply: reply_tx,
            })
            .await;
        if sent.is_err() {
            return HubReply::Failed {
                error: HubError::PlayerNotFound,
            };
        }
        reply_rx.await.unwrap_or(HubReply::Failed {
            error: HubError::PlayerNotFound,
        })
    }

    pub async fn close_session(&self, session: SessionId) {
        let _ = self.tx.send(HubCommand::Close { session }).await;
    }

    /// Serve one client frame on behalf of `session`. Responses go to
    /// `outbound`.
    pub async fn serve_frame(
        &self,
        session: SessionId,
        frame: ClientFrame,
        outbound: &mpsc::UnboundedSender<ServerFrame>,
    ) {
        match frame {
            ClientFrame::Request { id, call } => {
                let reply = self.call(session, call).await;
                let _ = outbound.send(ServerFrame::Response { id, reply });
            }
            ClientFrame::InvokeResult { id, attempt } => {
                let _ = self
                    .tx
                    .send(HubCommand::InvokeResult {
                        session,
                        id,
                        attempt,
                    })
                    .await;
            }
        }
    }
}
