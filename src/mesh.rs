//! Peer connection manager
//!
//! Keeps one transport connection per remote peer, spins up negotiators for
//! hub connection requests and for the attempts handed out on join, and turns
//! peer traffic into [`MeshEvent`]s.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::membership::{Player, PlayerState};
use crate::negotiator::{AttemptRouter, AttemptSignal, ConnectionAttempt, NegotiatedPeer, Negotiator};
use crate::signaling::{
    ConnectionAttemptId, HubEvent, HubEvents, HubOperation, PeerId, RoomConnectionInfo,
    SignalingClient, SignalingError,
};
use crate::transport::{ConnectionState, PeerConnection, PeerEvent, PeerTransport, TransportError};

/// Messages exchanged between peers over the reliable channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
    RegisterPlayer { player: Player },
    PlayerStateChanged { peer_id: PeerId, state: PlayerState },
    TimePoll { t0: i64 },
    TimeAnswer { t0: i64, tr: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Message { from: PeerId, message: MeshMessage },
}

#[derive(Debug)]
pub struct PeerFailure {
    pub peer_id: PeerId,
    pub error: NetworkError,
}

/// Outcome of connecting to the members of a joined room
#[derive(Debug, Default)]
pub struct JoinReport {
    pub connected: Vec<PeerId>,
    pub failed: Vec<PeerFailure>,
}

struct PeerLink {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct MeshState {
    local_peer_id: Option<PeerId>,
    peers: HashMap<PeerId, PeerLink>,
    in_flight: HashSet<PeerId>,
    next_generation: u64,
}

struct MeshInner {
    signaling: SignalingClient,
    negotiator: Negotiator,
    router: AttemptRouter,
    state: Mutex<MeshState>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl MeshInner {
    fn state(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct PeerMesh {
    inner: Arc<MeshInner>,
}

impl PeerMesh {
    /// Build a mesh over `signaling`. Hub pushes are consumed from
    /// `hub_events` for as long as the mesh is alive.
    pub fn new(
        signaling: SignalingClient,
        hub_events: HubEvents,
        transport: Arc<dyn PeerTransport>,
        config: &NetworkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let router = AttemptRouter::default();
        let negotiator = Negotiator::new(
            signaling.clone(),
            transport,
            router.clone(),
            config.ice_servers.clone(),
            config.connection_timeout(),
        );
        let inner = Arc::new(MeshInner {
            signaling,
            negotiator,
            router,
            state: Mutex::new(MeshState::default()),
            events,
        });
        tokio::spawn(pump_hub_events(Arc::downgrade(&inner), hub_events));
        (Self { inner }, events_rx)
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.inner.signaling
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.inner.state().local_peer_id
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.inner.state().peers.keys().copied().collect();
        peers.sort();
        peers
    }

    /// The room creator: local id 1 and nobody to connect to yet.
    pub fn init_host(&self) {
        self.inner.state().local_peer_id = Some(PeerId::HOST);
        info!("Mesh initialized as host (peer {})", PeerId::HOST);
    }

    /// Answer every attempt handed out by the hub, concurrently. Completes
    /// once each of them connected or failed.
    pub async fn init_client(&self, peer_id: PeerId, info: RoomConnectionInfo) -> JoinReport {
        {
            let mut state = self.inner.state();
            state.local_peer_id = Some(peer_id);
            state
                .in_flight
                .extend(info.players_connection_info.iter().map(|p| p.peer_id));
        }
        info!(
            "Mesh initialized as peer {}, connecting to {} player(s)",
            peer_id,
            info.players_connection_info.len()
        );

        let results = join_all(info.players_connection_info.iter().map(|player| {
            let mesh = self.clone();
            async move {
                let mut attempt = ConnectionAttempt::answerer(player.peer_id, player.attempt_id);
                let result = mesh.inner.negotiator.answer(&mut attempt).await;
                (player.peer_id, result)
            }
        }))
        .await;

        let mut report = JoinReport::default();
        for (peer_id, result) in results {
            match result {
                Ok(peer) => {
                    add_peer(&self.inner, peer);
                    report.connected.push(peer_id);
                }
                Err(error) => {
                    self.inner.state().in_flight.remove(&peer_id);
                    warn!("Could not connect to peer {}: {}", peer_id, error);
                    report.failed.push(PeerFailure { peer_id, error });
                }
            }
        }
        for failed in info.failed_creations {
            warn!("Hub could not reach peer {}: {}", failed.peer_id, failed.error);
            report.failed.push(PeerFailure {
                peer_id: failed.peer_id,
                error: SignalingError::Hub {
                    operation: HubOperation::ConnectToRoomPlayers,
                    error: failed.error,
                }
                .into(),
            });
        }
        report
    }

    pub fn send(&self, peer_id: PeerId, message: &MeshMessage) -> Result<(), NetworkError> {
        let text = serde_json::to_string(message)?;
        let connection = self
            .inner
            .state()
            .peers
            .get(&peer_id)
            .map(|link| link.connection.clone())
            .ok_or(TransportError::Closed)?;
        connection.send(&text)?;
        Ok(())
    }

    /// Send to every connected peer. Per-peer failures are logged.
    pub fn broadcast(&self, message: &MeshMessage) -> Result<(), NetworkError> {
        let text = serde_json::to_string(message)?;
        let connections: Vec<_> = self
            .inner
            .state()
            .peers
            .iter()
            .map(|(peer_id, link)| (*peer_id, link.connection.clone()))
            .collect();
        for (peer_id, connection) in connections {
            if let Err(e) = connection.send(&text) {
                warn!("Failed to send to peer {}: {}", peer_id, e);
            }
        }
        Ok(())
    }

    /// Close every peer connection, then leave the room on the hub.
    pub async fn leave(&self) -> Result<(), NetworkError> {
        let links: Vec<_> = {
            let mut state = self.inner.state();
            state.local_peer_id = None;
            state.in_flight.clear();
            state.peers.drain().collect()
        };
        for (peer_id, link) in links {
            link.reader.abort();
            link.connection.close();
            debug!("Closed connection to peer {}", peer_id);
        }

        self.inner.signaling.leave_room().await?;
        info!("Left the room");
        Ok(())
    }

    /// Publish an offer for `asking_peer` and finish it in the background.
    /// The reply carries the attempt id, or nothing when declined.
    async fn handle_connection_request(
        &self,
        asking_peer: PeerId,
        reply: oneshot::Sender<Option<ConnectionAttemptId>>,
    ) {
        if let Err(e) = self.reserve(asking_peer) {
            warn!("Declining connection request: {}", e);
            let _ = reply.send(None);
            return;
        }

        let mut attempt = ConnectionAttempt::offerer(asking_peer);
        let published = match self.inner.negotiator.publish_offer(&mut attempt).await {
            Ok(published) => published,
            Err(e) => {
                warn!("Could not publish an offer for peer {}: {}", asking_peer, e);
                self.inner.state().in_flight.remove(&asking_peer);
                let _ = reply.send(None);
                return;
            }
        };
        let _ = reply.send(attempt.id());

        match self
            .inner
            .negotiator
            .complete_offer(&mut attempt, published)
            .await
        {
            Ok(peer) => add_peer(&self.inner, peer),
            Err(e) => {
                warn!("Connection with peer {} failed: {}", asking_peer, e);
                self.inner.state().in_flight.remove(&asking_peer);
            }
        }
    }

    fn reserve(&self, peer_id: PeerId) -> Result<(), NetworkError> {
        let mut state = self.inner.state();
        if state.local_peer_id.is_none() {
            return Err(NetworkError::NotInRoom);
        }
        if state.peers.contains_key(&peer_id) || !state.in_flight.insert(peer_id) {
            return Err(NetworkError::DuplicateConnection(peer_id));
        }
        Ok(())
    }
}

async fn pump_hub_events(mesh: Weak<MeshInner>, mut hub_events: HubEvents) {
    while let Some(event) = hub_events.recv().await {
        let Some(inner) = mesh.upgrade() else {
            break;
        };
        match event {
            HubEvent::SdpAnswerReceived { attempt_id, answer } => {
                inner.router.route(attempt_id, AttemptSignal::Answer(answer));
            }
            HubEvent::IceCandidateReceived {
                attempt_id,
                candidate,
            } => inner
                .router
                .route(attempt_id, AttemptSignal::Candidate(candidate)),
            HubEvent::ConnectionRequested { asking_peer, reply } => {
                let mesh = PeerMesh { inner };
                tokio::spawn(async move {
                    mesh.handle_connection_request(asking_peer, reply).await;
                });
            }
            HubEvent::Disconnected => {
                let failed = inner.router.fail_all();
                warn!(
                    "Lost the signaling hub, failing {} pending attempt(s); peer connections stay up",
                    failed
                );
            }
        }
    }
    debug!("Hub event pump stopped");
}

fn add_peer(inner: &Arc<MeshInner>, peer: NegotiatedPeer) {
    let NegotiatedPeer {
        peer_id,
        connection,
        events,
        ..
    } = peer;

    let mut state = inner.state();
    state.in_flight.remove(&peer_id);
    if state.local_peer_id.is_none() {
        debug!("Dropping connection to peer {} after leaving", peer_id);
        connection.close();
        return;
    }
    state.next_generation += 1;
    let generation = state.next_generation;

    let _ = inner.events.send(MeshEvent::PeerConnected(peer_id));

    let weak = Arc::downgrade(inner);
    let reader = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PeerEvent::Message(text) => match serde_json::from_str::<MeshMessage>(&text) {
                    Ok(message) => {
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        let _ = inner.events.send(MeshEvent::Message {
                            from: peer_id,
                            message,
                        });
                    }
                    Err(e) => warn!("Invalid message from peer {}: {}", peer_id, e),
                },
                PeerEvent::StateChanged(ConnectionState::Disconnected | ConnectionState::Closed) => {
                    break;
                }
                _ => {}
            }
        }
        if let Some(inner) = weak.upgrade() {
            remove_peer(&inner, peer_id, generation);
        }
    });

    if let Some(old) = state.peers.insert(
        peer_id,
        PeerLink {
            generation,
            connection,
            reader,
        },
    ) {
        old.reader.abort();
        old.connection.close();
    }
    info!("Peer {} connected", peer_id);
}

fn remove_peer(inner: &MeshInner, peer_id: PeerId, generation: u64) {
    let removed = {
        let mut state = inner.state();
        match state.peers.get(&peer_id) {
            Some(link) if link.generation == generation => state.peers.remove(&peer_id),
            _ => None,
        }
    };
    if let Some(link) = removed {
        link.connection.close();
        info!("Peer {} disconnected", peer_id);
        let _ = inner.events.send(MeshEvent::PeerDisconnected(peer_id));
    }
}
