//! Room membership and presence
//!
//! The registry keeps the last known [`Player`] per peer. Observers read the
//! current snapshot and subscribe to [`MembershipEvent`]s for what follows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::mesh::{MeshMessage, PeerMesh};
use crate::signaling::PeerId;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerState {
    InLobby { is_ready: bool },
    InGame,
}

impl Default for PlayerState {
    fn default() -> Self {
        PlayerState::InLobby { is_ready: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub peer_id: PeerId,
    pub username: String,
    pub state: PlayerState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Registered(Player),
    StateChanged { peer_id: PeerId, state: PlayerState },
    Left(Player),
}

type Players = BTreeMap<PeerId, Player>;

struct RegistryInner {
    mesh: PeerMesh,
    players: watch::Sender<Players>,
    events: broadcast::Sender<MembershipEvent>,
    /// Local record sent to every peer that connects
    local: Mutex<Option<PeerId>>,
}

#[derive(Clone)]
pub struct MembershipRegistry {
    inner: Arc<RegistryInner>,
}

impl MembershipRegistry {
    pub fn new(mesh: PeerMesh) -> Self {
        let (players, _) = watch::channel(Players::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                mesh,
                players,
                events,
                local: Mutex::new(None),
            }),
        }
    }

    fn local(&self) -> MutexGuard<'_, Option<PeerId>> {
        self.inner
            .local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn players(&self) -> Vec<Player> {
        self.inner.players.borrow().values().cloned().collect()
    }

    pub fn player(&self, peer_id: PeerId) -> Option<Player> {
        self.inner.players.borrow().get(&peer_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events.subscribe()
    }

    /// Register the local player with every current peer, and with every peer
    /// that connects from now on.
    pub fn register_local_player(&self, username: &str) -> Result<Player, NetworkError> {
        let peer_id = self.inner.mesh.local_peer_id().ok_or(NetworkError::NotInRoom)?;
        let player = Player {
            peer_id,
            username: username.to_string(),
            state: PlayerState::default(),
        };

        *self.local() = Some(peer_id);
        self.apply_registration(player.clone());
        self.inner.mesh.broadcast(&MeshMessage::RegisterPlayer {
            player: player.clone(),
        })?;
        info!("Registered local player {} as peer {}", player.username, peer_id);
        Ok(player)
    }

    /// Applied locally through the same path remote peers use.
    pub fn set_player_state(&self, state: PlayerState) -> Result<(), NetworkError> {
        let peer_id = self.inner.mesh.local_peer_id().ok_or(NetworkError::NotInRoom)?;
        self.apply_state(peer_id, state);
        self.inner
            .mesh
            .broadcast(&MeshMessage::PlayerStateChanged { peer_id, state })
    }

    pub fn on_peer_connected(&self, peer_id: PeerId) {
        let Some(local_id) = *self.local() else {
            return;
        };
        let Some(player) = self.player(local_id) else {
            return;
        };
        if let Err(e) = self
            .inner
            .mesh
            .send(peer_id, &MeshMessage::RegisterPlayer { player })
        {
            warn!("Could not register with peer {}: {}", peer_id, e);
        }
    }

    pub fn on_peer_disconnected(&self, peer_id: PeerId) {
        let mut removed = None;
        self.inner.players.send_if_modified(|players| {
            removed = players.remove(&peer_id);
            removed.is_some()
        });
        match removed {
            Some(player) => {
                info!("Player {} (peer {}) left", player.username, peer_id);
                let _ = self.inner.events.send(MembershipEvent::Left(player));
            }
            None => debug!("Disconnect of unregistered peer {}", peer_id),
        }
    }

    pub fn on_message(&self, from: PeerId, message: &MeshMessage) {
        match message {
            MeshMessage::RegisterPlayer { player } => {
                if player.peer_id != from {
                    warn!("Peer {} tried to register peer {}", from, player.peer_id);
                    return;
                }
                self.apply_registration(player.clone());
            }
            MeshMessage::PlayerStateChanged { peer_id, state } => {
                if *peer_id != from {
                    warn!("Peer {} tried to change the state of peer {}", from, peer_id);
                    return;
                }
                self.apply_state(*peer_id, *state);
            }
            MeshMessage::TimePoll { .. } | MeshMessage::TimeAnswer { .. } => {}
        }
    }

    /// Forget every player, e.g. after leaving the room.
    pub fn clear(&self) {
        *self.local() = None;
        self.inner.players.send_modify(Players::clear);
    }

    pub async fn wait_for_players(&self, count: usize) -> Result<Vec<Player>, NetworkError> {
        let mut players = self.inner.players.subscribe();
        let snapshot = players
            .wait_for(|players| players.len() >= count)
            .await
            .map_err(|_| NetworkError::ChannelClosed)?;
        Ok(snapshot.values().cloned().collect())
    }

    /// Resolves once there is at least one player and all of them are in game.
    pub async fn wait_all_in_game(&self) -> Result<(), NetworkError> {
        let mut players = self.inner.players.subscribe();
        players
            .wait_for(|players| {
                !players.is_empty() && players.values().all(|p| p.state == PlayerState::InGame)
            })
            .await
            .map_err(|_| NetworkError::ChannelClosed)?;
        Ok(())
    }

    fn apply_registration(&self, player: Player) {
        debug!("Player {} registered as peer {}", player.username, player.peer_id);
        self.inner.players.send_modify(|players| {
            players.insert(player.peer_id, player.clone());
        });
        let _ = self.inner.events.send(MembershipEvent::Registered(player));
    }

    fn apply_state(&self, peer_id: PeerId, state: PlayerState) {
        let known = self.inner.players.send_if_modified(|players| {
            players
                .get_mut(&peer_id)
                .map(|player| player.state = state)
                .is_some()
        });
        if !known {
            warn!("State change for unknown peer {}", peer_id);
            return;
        }
        let _ = self
            .inner
            .events
            .send(MembershipEvent::StateChanged { peer_id, state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubConfig, NetworkConfig};
    use crate::signaling::{HubHandle, SignalingClient};
    use crate::transport::MemoryNetwork;

    async fn registry(hub: &HubHandle, host: bool) -> MembershipRegistry {
        let config = NetworkConfig::default();
        let (client, events) = SignalingClient::in_process(hub, &config).await.unwrap();
        let (mesh, _mesh_events) =
            PeerMesh::new(client, events, Arc::new(MemoryNetwork::new()), &config);
        if host {
            mesh.init_host();
        }
        MembershipRegistry::new(mesh)
    }

    fn player(peer_id: u32, username: &str) -> Player {
        Player {
            peer_id: PeerId(peer_id),
            username: username.to_string(),
            state: PlayerState::default(),
        }
    }

    #[tokio::test]
    async fn remote_registration_is_stored_and_announced() {
        let hub = HubHandle::spawn(HubConfig::default());
        let registry = registry(&hub, true).await;
        let mut events = registry.subscribe();

        let alice = player(2, "alice");
        registry.on_message(
            PeerId(2),
            &MeshMessage::RegisterPlayer {
                player: alice.clone(),
            },
        );

        assert_eq!(registry.player(PeerId(2)), Some(alice.clone()));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Registered(alice));
    }

    #[tokio::test]
    async fn registration_for_another_peer_is_refused() {
        let hub = HubHandle::spawn(HubConfig::default());
        let registry = registry(&hub, true).await;

        registry.on_message(
            PeerId(3),
            &MeshMessage::RegisterPlayer {
                player: player(2, "mallory"),
            },
        );
        assert!(registry.players().is_empty());
    }

    #[tokio::test]
    async fn local_and_remote_state_changes_agree() {
        let hub = HubHandle::spawn(HubConfig::default());
        let host = registry(&hub, true).await;
        let observer = registry(&hub, true).await;

        let local = host.register_local_player("bob").unwrap();
        observer.on_message(
            PeerId::HOST,
            &MeshMessage::RegisterPlayer {
                player: local.clone(),
            },
        );

        let state = PlayerState::InLobby { is_ready: true };
        host.set_player_state(state).unwrap();
        observer.on_message(
            PeerId::HOST,
            &MeshMessage::PlayerStateChanged {
                peer_id: PeerId::HOST,
                state,
            },
        );

        let seen_locally = host.player(PeerId::HOST).unwrap();
        assert_eq!(seen_locally.state, state);
        assert_eq!(observer.player(PeerId::HOST), Some(seen_locally));
    }

    #[tokio::test]
    async fn unknown_disconnect_is_a_no_op() {
        let hub = HubHandle::spawn(HubConfig::default());
        let registry = registry(&hub, true).await;
        let mut events = registry.subscribe();

        registry.on_peer_disconnected(PeerId(7));

        assert!(registry.players().is_empty());
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn disconnect_removes_the_player() {
        let hub = HubHandle::spawn(HubConfig::default());
        let registry = registry(&hub, true).await;
        let alice = player(2, "alice");
        registry.on_message(
            PeerId(2),
            &MeshMessage::RegisterPlayer {
                player: alice.clone(),
            },
        );
        let mut events = registry.subscribe();

        registry.on_peer_disconnected(PeerId(2));

        assert_eq!(registry.player(PeerId(2)), None);
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Left(alice));
    }

    #[tokio::test]
    async fn registering_outside_a_room_fails() {
        let hub = HubHandle::spawn(HubConfig::default());
        let registry = registry(&hub, false).await;
        assert!(matches!(
            registry.register_local_player("carol"),
            Err(NetworkError::NotInRoom)
        ));
    }

    #[tokio::test]
    async fn waiters_resolve_on_updates() {
        let hub = HubHandle::spawn(HubConfig::default());
        let registry = registry(&hub, true).await;
        registry.register_local_player("host").unwrap();

        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for_players(2).await })
        };
        registry.on_message(
            PeerId(2),
            &MeshMessage::RegisterPlayer {
                player: player(2, "guest"),
            },
        );
        assert_eq!(waiting.await.unwrap().unwrap().len(), 2);

        let in_game = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_all_in_game().await })
        };
        registry.set_player_state(PlayerState::InGame).unwrap();
        registry.on_message(
            PeerId(2),
            &MeshMessage::PlayerStateChanged {
                peer_id: PeerId(2),
                state: PlayerState::InGame,
            },
        );
        in_game.await.unwrap().unwrap();
    }
}
