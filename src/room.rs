//! Room lifecycle: create/join/leave, wiring the mesh to the membership
//! registry and the clock synchronizer.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::{ClockDelta, ClockSync};
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::membership::{MembershipEvent, MembershipRegistry, Player, PlayerState};
use crate::mesh::{MeshEvent, PeerFailure, PeerMesh};
use crate::signaling::{HubEvents, HubHandle, PeerId, RoomId, SignalingClient};
use crate::transport::PeerTransport;

#[derive(Debug)]
pub struct JoinOutcome {
    pub peer_id: PeerId,
    /// Players expected to register, the local one included
    pub player_count: usize,
    pub failed: Vec<PeerFailure>,
}

/// Stops background work once the last coordinator handle is gone.
struct Background {
    dispatcher: JoinHandle<()>,
    clock: ClockSync,
}

impl Drop for Background {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.clock.stop();
    }
}

#[derive(Clone)]
pub struct RoomCoordinator {
    mesh: PeerMesh,
    registry: MembershipRegistry,
    clock: ClockSync,
    room_id: Arc<Mutex<Option<RoomId>>>,
    _background: Arc<Background>,
}

impl RoomCoordinator {
    pub fn new(
        signaling: SignalingClient,
        hub_events: HubEvents,
        transport: Arc<dyn PeerTransport>,
        config: &NetworkConfig,
    ) -> Self {
        let (mesh, mesh_events) = PeerMesh::new(signaling, hub_events, transport, config);
        let registry = MembershipRegistry::new(mesh.clone());
        let clock = ClockSync::new(mesh.clone(), config.clock.clone());

        let dispatcher = tokio::spawn(dispatch(mesh_events, registry.clone(), clock.clone()));
        Self {
            mesh,
            registry,
            clock: clock.clone(),
            room_id: Arc::new(Mutex::new(None)),
            _background: Arc::new(Background { dispatcher, clock }),
        }
    }

    /// Reach the hub at `config.signaling_url`.
    pub async fn connect(
        config: &NetworkConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, NetworkError> {
        let (signaling, hub_events) = SignalingClient::connect(config).await?;
        Ok(Self::new(signaling, hub_events, transport, config))
    }

    pub async fn in_process(
        hub: &HubHandle,
        config: &NetworkConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, NetworkError> {
        let (signaling, hub_events) = SignalingClient::in_process(hub, config).await?;
        Ok(Self::new(signaling, hub_events, transport, config))
    }

    pub async fn create_room(&self) -> Result<RoomId, NetworkError> {
        let room_id = self.mesh.signaling().create_room().await?;
        self.mesh.init_host();
        self.set_room(Some(room_id));
        self.clock.start();
        info!("Created room {}", room_id);
        Ok(room_id)
    }

    /// Join `room_id` and connect to every member. Completes once each
    /// connection attempt succeeded or failed.
    pub async fn join_room(&self, room_id: RoomId) -> Result<JoinOutcome, NetworkError> {
        let signaling = self.mesh.signaling();
        let peer_id = signaling.join_room(room_id).await?;
        let info = signaling.connect_to_room_players().await?;

        let report = self.mesh.init_client(peer_id, info).await;
        self.set_room(Some(room_id));
        self.clock.start();

        info!(
            "Joined room {} as peer {} ({} connected, {} failed)",
            room_id,
            peer_id,
            report.connected.len(),
            report.failed.len()
        );
        Ok(JoinOutcome {
            peer_id,
            player_count: report.connected.len() + 1,
            failed: report.failed,
        })
    }

    pub async fn leave_room(&self) -> Result<(), NetworkError> {
        self.clock.stop();
        let result = self.mesh.leave().await;
        self.registry.clear();
        self.set_room(None);
        result
    }

    fn set_room(&self, room_id: Option<RoomId>) {
        if let Ok(mut room) = self.room_id.lock() {
            *room = room_id;
        }
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.room_id.lock().ok().and_then(|room| *room)
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.mesh.local_peer_id()
    }

    pub fn register_local_player(&self, username: &str) -> Result<Player, NetworkError> {
        self.registry.register_local_player(username)
    }

    pub fn set_player_state(&self, state: PlayerState) -> Result<(), NetworkError> {
        self.registry.set_player_state(state)
    }

    pub fn players(&self) -> Vec<Player> {
        self.registry.players()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.registry.subscribe()
    }

    pub async fn wait_for_players(&self, count: usize) -> Result<Vec<Player>, NetworkError> {
        self.registry.wait_for_players(count).await
    }

    pub async fn wait_all_in_game(&self) -> Result<(), NetworkError> {
        self.registry.wait_all_in_game().await
    }

    pub fn clock_delta(&self) -> Option<ClockDelta> {
        self.clock.delta()
    }

    pub fn clock_updates(&self) -> watch::Receiver<Option<ClockDelta>> {
        self.clock.subscribe()
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn mesh(&self) -> &PeerMesh {
        &self.mesh
    }
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<MeshEvent>,
    registry: MembershipRegistry,
    clock: ClockSync,
) {
    while let Some(event) = events.recv().await {
        match event {
            MeshEvent::PeerConnected(peer_id) => {
                registry.on_peer_connected(peer_id);
                clock.on_peer_connected(peer_id);
            }
            MeshEvent::PeerDisconnected(peer_id) => {
                registry.on_peer_disconnected(peer_id);
                clock.on_peer_disconnected(peer_id);
            }
            MeshEvent::Message { from, message } => {
                registry.on_message(from, &message);
                clock.on_message(from, &message);
            }
        }
    }
    debug!("Mesh event dispatch stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::HubConfig;
    use crate::mesh::MeshMessage;
    use crate::signaling::HubError;
    use crate::transport::MemoryNetwork;

    async fn coordinator(hub: &HubHandle, network: &MemoryNetwork) -> RoomCoordinator {
        RoomCoordinator::in_process(hub, &NetworkConfig::default(), Arc::new(network.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creator_is_peer_one() {
        let hub = HubHandle::spawn(HubConfig::default());
        let network = MemoryNetwork::new();
        let a = coordinator(&hub, &network).await;

        let room_id = a.create_room().await.unwrap();

        assert_eq!(a.local_peer_id(), Some(PeerId::HOST));
        assert_eq!(a.room_id(), Some(room_id));
        assert_eq!(a.clock().reference(), None);
    }

    #[tokio::test]
    async fn joining_a_missing_room_fails() {
        let hub = HubHandle::spawn(HubConfig::default());
        let network = MemoryNetwork::new();
        let a = coordinator(&hub, &network).await;

        let err = a.join_room(RoomId::parse("ZZZZZZ").unwrap()).await.unwrap_err();
        match err {
            NetworkError::Signaling(e) => assert_eq!(e.hub_error(), Some(HubError::RoomNotFound)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(a.room_id(), None);
    }

    #[tokio::test]
    async fn three_players_register_everywhere() {
        let hub = HubHandle::spawn(HubConfig::default());
        let network = MemoryNetwork::new();
        let a = coordinator(&hub, &network).await;
        let b = coordinator(&hub, &network).await;
        let c = coordinator(&hub, &network).await;

        let room_id = a.create_room().await.unwrap();
        a.register_local_player("alice").unwrap();

        let joined = b.join_room(room_id).await.unwrap();
        assert_eq!((joined.peer_id, joined.player_count), (PeerId(2), 2));
        b.register_local_player("bob").unwrap();

        let joined = c.join_room(room_id).await.unwrap();
        assert_eq!((joined.peer_id, joined.player_count), (PeerId(3), 3));
        assert!(joined.failed.is_empty());
        c.register_local_player("carol").unwrap();

        for room in [&a, &b, &c] {
            let players = room.wait_for_players(3).await.unwrap();
            let names: Vec<_> = players.iter().map(|p| p.username.as_str()).collect();
            assert_eq!(names, vec!["alice", "bob", "carol"]);
        }
        assert_eq!(c.clock().reference(), Some(PeerId::HOST));
    }

    #[tokio::test]
    async fn leaving_removes_the_player_elsewhere() {
        let hub = HubHandle::spawn(HubConfig::default());
        let network = MemoryNetwork::new();
        let a = coordinator(&hub, &network).await;
        let b = coordinator(&hub, &network).await;

        let room_id = a.create_room().await.unwrap();
        a.register_local_player("alice").unwrap();
        b.join_room(room_id).await.unwrap();
        b.register_local_player("bob").unwrap();
        a.wait_for_players(2).await.unwrap();

        let mut events = a.subscribe();
        b.leave_room().await.unwrap();

        loop {
            if let MembershipEvent::Left(player) = events.recv().await.unwrap() {
                assert_eq!(player.username, "bob");
                break;
            }
        }
        assert_eq!(a.players().len(), 1);
        assert!(b.players().is_empty());
        assert_eq!(b.room_id(), None);
    }

    #[tokio::test]
    async fn forged_time_answer_keeps_the_room_running() {
        let hub = HubHandle::spawn(HubConfig::default());
        let network = MemoryNetwork::new();
        let a = coordinator(&hub, &network).await;
        let b = coordinator(&hub, &network).await;

        let room_id = a.create_room().await.unwrap();
        a.register_local_player("alice").unwrap();
        b.join_room(room_id).await.unwrap();
        b.register_local_player("bob").unwrap();
        a.wait_for_players(2).await.unwrap();
        b.wait_for_players(2).await.unwrap();

        let forged = MeshMessage::TimeAnswer {
            t0: i64::MIN + 1,
            tr: i64::MAX,
        };
        a.mesh().send(PeerId(2), &forged).unwrap();

        let mut events = b.subscribe();
        a.set_player_state(PlayerState::InGame).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let MembershipEvent::StateChanged { peer_id, .. } = events.recv().await.unwrap() {
                    assert_eq!(peer_id, PeerId::HOST);
                    break;
                }
            }
        })
        .await
        .expect("state change after the forged answer never arrived");
        assert_eq!(b.players()[0].state, PlayerState::InGame);
    }
}
