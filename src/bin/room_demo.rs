use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use behide_link::RoomCoordinator;
use behide_link::config::{HubConfig, NetworkConfig};
use behide_link::membership::PlayerState;
use behide_link::signaling::HubHandle;
use behide_link::transport::MemoryNetwork;
use tracing_subscriber::EnvFilter;

const PLAYERS: [&str; 3] = ["alice", "bob", "carol"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = NetworkConfig::load(std::env::args().nth(1).as_deref().map(Path::new))?;
    config.clock.poll_interval_ms = 50;

    let hub = HubHandle::spawn(HubConfig::default());
    let network = Arc::new(MemoryNetwork::new());

    let mut rooms = Vec::new();
    for _ in PLAYERS {
        rooms.push(RoomCoordinator::in_process(&hub, &config, network.clone()).await?);
    }

    // 1. Host creates the room
    let room_id = rooms[0].create_room().await?;
    rooms[0].register_local_player(PLAYERS[0])?;
    println!("Room code: {}", room_id);

    // 2. Everyone else joins with the code
    for (room, name) in rooms.iter().zip(PLAYERS).skip(1) {
        let joined = room.join_room(room_id).await?;
        println!(
            "{} joined as peer {} ({} player(s), {} failed)",
            name,
            joined.peer_id,
            joined.player_count,
            joined.failed.len()
        );
        room.register_local_player(name)?;
    }

    for room in &rooms {
        room.wait_for_players(PLAYERS.len()).await?;
    }
    println!("All players registered");

    // 3. Ready up and start the round
    for room in &rooms {
        room.set_player_state(PlayerState::InLobby { is_ready: true })?;
        room.set_player_state(PlayerState::InGame)?;
    }
    rooms[0].wait_all_in_game().await?;
    println!("Everybody is in game");

    // 4. Let the clocks settle
    tokio::time::sleep(Duration::from_millis(config.clock.poll_interval_ms * 12)).await;
    for room in &rooms {
        let peer = room.local_peer_id().map(|p| p.to_string()).unwrap_or_default();
        match room.clock_delta() {
            Some(delta) => println!("Peer {} clock delta: {:.1} ms", peer, delta.as_millis()),
            None => println!("Peer {} is the clock reference", peer),
        }
    }

    for room in rooms.iter().rev() {
        room.leave_room().await?;
    }
    println!("Room closed");
    Ok(())
}
