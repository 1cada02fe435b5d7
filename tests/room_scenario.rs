use std::sync::Arc;
use std::time::Duration;

use behide_link::RoomCoordinator;
use behide_link::config::{HubConfig, NetworkConfig};
use behide_link::membership::{MembershipEvent, PlayerState};
use behide_link::signaling::{HubHandle, PeerId, SignalingServer};
use behide_link::transport::MemoryNetwork;
use tokio::net::TcpListener;

fn fast_clock_config() -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.clock.poll_interval_ms = 10;
    config
}

async fn wait_for_delta(room: &RoomCoordinator) {
    let mut updates = room.clock_updates();
    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|_| room.clock().sample_count() >= 9),
    )
    .await
    .expect("clock never collected enough samples")
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_join_register_and_sync() {
    let hub = HubHandle::spawn(HubConfig::default());
    let network = Arc::new(MemoryNetwork::new());
    let config = fast_clock_config();

    let a = RoomCoordinator::in_process(&hub, &config, network.clone())
        .await
        .unwrap();
    let b = RoomCoordinator::in_process(&hub, &config, network.clone())
        .await
        .unwrap();

    let room_id = a.create_room().await.unwrap();
    assert_eq!(a.local_peer_id(), Some(PeerId(1)));
    a.register_local_player("hunter").unwrap();

    let joined = b.join_room(room_id).await.unwrap();
    assert_eq!(joined.peer_id, PeerId(2));
    assert_eq!(joined.player_count, 2);
    assert!(joined.failed.is_empty());
    b.register_local_player("prop").unwrap();

    let seen_by_a = a.wait_for_players(2).await.unwrap();
    let seen_by_b = b.wait_for_players(2).await.unwrap();
    assert_eq!(seen_by_a, seen_by_b);
    assert_eq!(seen_by_a[0].username, "hunter");
    assert_eq!(seen_by_a[1].username, "prop");

    let mut events = a.subscribe();
    b.set_player_state(PlayerState::InLobby { is_ready: true })
        .unwrap();
    while !matches!(
        events.recv().await.unwrap(),
        MembershipEvent::StateChanged { .. }
    ) {}
    assert_eq!(
        a.players()[1].state,
        PlayerState::InLobby { is_ready: true }
    );

    assert_eq!(b.clock().reference(), Some(PeerId(1)));
    wait_for_delta(&b).await;
    let delta = b.clock_delta().unwrap();
    // Same wall clock on both sides.
    assert!(delta.as_millis().abs() < 50.0, "delta {delta:?}");
    assert_eq!(a.clock_delta(), None);

    b.leave_room().await.unwrap();
    a.leave_room().await.unwrap();
    assert_eq!(b.clock_delta(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rooms_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SignalingServer::new(HubConfig::default());
    tokio::spawn(async move { server.serve(listener).await });

    let mut config = fast_clock_config();
    config.signaling_url = format!("ws://{addr}");
    let network = Arc::new(MemoryNetwork::new());

    let a = RoomCoordinator::connect(&config, network.clone())
        .await
        .unwrap();
    let b = RoomCoordinator::connect(&config, network.clone())
        .await
        .unwrap();

    let room_id = a.create_room().await.unwrap();
    a.register_local_player("hunter").unwrap();
    let joined = b.join_room(room_id).await.unwrap();
    assert_eq!(joined.peer_id, PeerId(2));
    b.register_local_player("prop").unwrap();

    assert_eq!(a.wait_for_players(2).await.unwrap().len(), 2);
    assert_eq!(b.wait_for_players(2).await.unwrap().len(), 2);

    a.set_player_state(PlayerState::InGame).unwrap();
    b.set_player_state(PlayerState::InGame).unwrap();
    tokio::time::timeout(Duration::from_secs(5), a.wait_all_in_game())
        .await
        .unwrap()
        .unwrap();
}
