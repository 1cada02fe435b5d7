use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::{ConnectionState, PeerConnection, PeerEvent, PeerEvents, PeerTransport, TransportError};
use crate::config::IceServer;
use crate::signaling::{IceCandidate, SdpDescription, SdpKind};

const SDP_PREFIX: &str = "memory-endpoint:";
const CANDIDATE_PREFIX: &str = "candidate:";
const CANDIDATES_PER_ENDPOINT: u32 = 2;

type EndpointId = u64;

struct Endpoint {
    events: async_channel::Sender<PeerEvent>,
    state: ConnectionState,
    local: Option<SdpKind>,
    remote: Option<EndpointId>,
    remote_candidates: usize,
    applied: Vec<IceCandidate>,
    /// Messages that arrived before this side was connected
    inbox: Vec<String>,
}

impl Endpoint {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.try_send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(PeerEvent::StateChanged(state));
        }
    }
}

#[derive(Default)]
struct NetworkState {
    next_endpoint: EndpointId,
    endpoints: HashMap<EndpointId, Endpoint>,
}

impl NetworkState {
    fn endpoint(&mut self, id: EndpointId) -> Result<&mut Endpoint, TransportError> {
        self.endpoints.get_mut(&id).ok_or(TransportError::Closed)
    }

    /// Publish the local description and this endpoint's candidates.
    fn publish_local(&mut self, id: EndpointId, kind: SdpKind) -> Result<(), TransportError> {
        let endpoint = self.endpoint(id)?;
        endpoint.local = Some(kind);
        endpoint.emit(PeerEvent::SessionDescriptionCreated(SdpDescription {
            kind,
            sdp: format!("{SDP_PREFIX}{id}"),
        }));
        endpoint.set_state(ConnectionState::Connecting);
        for n in 0..CANDIDATES_PER_ENDPOINT {
            endpoint.emit(PeerEvent::IceCandidateCreated(IceCandidate {
                media: "0".to_string(),
                index: 0,
                name: format!("{CANDIDATE_PREFIX}{id}:{n}"),
            }));
        }
        Ok(())
    }

    fn check_connected(&mut self, id: EndpointId) -> Result<(), TransportError> {
        let endpoint = self.endpoint(id)?;
        let ready =
            endpoint.local.is_some() && endpoint.remote.is_some() && endpoint.remote_candidates > 0;
        if ready && endpoint.state == ConnectionState::Connecting {
            endpoint.set_state(ConnectionState::Connected);
            for text in std::mem::take(&mut endpoint.inbox) {
                endpoint.emit(PeerEvent::Message(text));
            }
            debug!("Memory endpoint {} connected", id);
        }
        Ok(())
    }
}

/// Loopback network: every connection created from one `MemoryNetwork` can
/// reach the others.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> (Arc<MemoryConnection>, PeerEvents) {
        let (tx, rx) = async_channel::unbounded();
        let mut state = lock(&self.state);
        state.next_endpoint += 1;
        let id = state.next_endpoint;
        state.endpoints.insert(
            id,
            Endpoint {
                events: tx,
                state: ConnectionState::New,
                local: None,
                remote: None,
                remote_candidates: 0,
                applied: Vec::new(),
                inbox: Vec::new(),
            },
        );
        let connection = Arc::new(MemoryConnection {
            id,
            network: self.state.clone(),
        });
        (connection, rx)
    }
}

/// Loopback endpoints reach each other directly, so ICE servers are unused.
impl PeerTransport for MemoryNetwork {
    fn new_connection(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), TransportError> {
        let (connection, events) = self.connect();
        let connection: Arc<dyn PeerConnection> = connection;
        Ok((connection, events))
    }
}

fn lock(state: &Mutex<NetworkState>) -> MutexGuard<'_, NetworkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_endpoint(sdp: &str) -> Option<EndpointId> {
    sdp.strip_prefix(SDP_PREFIX)?.parse().ok()
}

fn parse_candidate(name: &str) -> Option<EndpointId> {
    let (endpoint, _) = name.strip_prefix(CANDIDATE_PREFIX)?.split_once(':')?;
    endpoint.parse().ok()
}

pub struct MemoryConnection {
    id: EndpointId,
    network: Arc<Mutex<NetworkState>>,
}

impl MemoryConnection {
    /// Remote candidates applied to this connection, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.network)
            .endpoints
            .get(&self.id)
            .map(|e| e.applied.clone())
            .unwrap_or_default()
    }
}

impl PeerConnection for MemoryConnection {
    fn create_offer(&self) -> Result<(), TransportError> {
        let mut network = lock(&self.network);
        let endpoint = network.endpoint(self.id)?;
        if endpoint.state != ConnectionState::New || endpoint.local.is_some() {
            return Err(TransportError::InvalidState(endpoint.state));
        }
        network.publish_local(self.id, SdpKind::Offer)
    }

    fn set_remote_description(&self, description: SdpDescription) -> Result<(), TransportError> {
        let remote = parse_endpoint(&description.sdp)
            .ok_or_else(|| TransportError::InvalidDescription(description.sdp.clone()))?;

        let mut network = lock(&self.network);
        if remote == self.id || !network.endpoints.contains_key(&remote) {
            return Err(TransportError::InvalidDescription(description.sdp));
        }

        let endpoint = network.endpoint(self.id)?;
        if endpoint.remote.is_some() {
            return Err(TransportError::InvalidState(endpoint.state));
        }
        match (description.kind, endpoint.local) {
            (SdpKind::Offer, None) => {
                endpoint.remote = Some(remote);
                network.publish_local(self.id, SdpKind::Answer)?;
            }
            (SdpKind::Answer, Some(SdpKind::Offer)) => {
                endpoint.remote = Some(remote);
            }
            _ => return Err(TransportError::InvalidState(endpoint.state)),
        }
        network.check_connected(self.id)
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut network = lock(&self.network);
        let endpoint = network.endpoint(self.id)?;
        let Some(remote) = endpoint.remote else {
            return Err(TransportError::InvalidState(endpoint.state));
        };
        if parse_candidate(&candidate.name) != Some(remote) {
            warn!("Memory endpoint {} got a foreign candidate {}", self.id, candidate.name);
            return Err(TransportError::InvalidDescription(candidate.name));
        }
        endpoint.applied.push(candidate);
        endpoint.remote_candidates += 1;
        network.check_connected(self.id)
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        let mut network = lock(&self.network);
        let endpoint = network.endpoint(self.id)?;
        if endpoint.state != ConnectionState::Connected {
            return Err(TransportError::InvalidState(endpoint.state));
        }
        let Some(remote) = endpoint.remote else {
            return Err(TransportError::Closed);
        };

        let peer = network.endpoint(remote)?;
        match peer.state {
            ConnectionState::Connected => peer.emit(PeerEvent::Message(text.to_string())),
            ConnectionState::Connecting => peer.inbox.push(text.to_string()),
            _ => return Err(TransportError::Closed),
        }
        Ok(())
    }

    fn close(&self) {
        let mut network = lock(&self.network);
        let Some(endpoint) = network.endpoints.remove(&self.id) else {
            return;
        };
        endpoint.events.close();

        if let Some(remote) = endpoint.remote
            && let Some(peer) = network.endpoints.get_mut(&remote)
            && peer.remote == Some(self.id)
        {
            peer.set_state(ConnectionState::Disconnected);
        }
        debug!("Memory endpoint {} closed", self.id);
    }

    fn state(&self) -> ConnectionState {
        lock(&self.network)
            .endpoints
            .get(&self.id)
            .map_or(ConnectionState::Closed, |e| e.state)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(events: &PeerEvents) -> Vec<PeerEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    fn descriptions(events: &[PeerEvent]) -> Vec<SdpDescription> {
        events
            .iter()
            .filter_map(|e| match e {
                PeerEvent::SessionDescriptionCreated(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    fn candidates(events: &[PeerEvent]) -> Vec<IceCandidate> {
        events
            .iter()
            .filter_map(|e| match e {
                PeerEvent::IceCandidateCreated(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Run a full handshake and return both connected ends.
    fn handshake(
        network: &MemoryNetwork,
    ) -> (
        (Arc<MemoryConnection>, PeerEvents),
        (Arc<MemoryConnection>, PeerEvents),
    ) {
        let (offerer, offerer_rx) = network.connect();
        let (answerer, answerer_rx) = network.connect();

        offerer.create_offer().unwrap();
        let offer_events = drain(&offerer_rx);
        answerer
            .set_remote_description(descriptions(&offer_events)[0].clone())
            .unwrap();
        let answer_events = drain(&answerer_rx);
        offerer
            .set_remote_description(descriptions(&answer_events)[0].clone())
            .unwrap();

        for c in candidates(&offer_events) {
            answerer.add_ice_candidate(c).unwrap();
        }
        for c in candidates(&answer_events) {
            offerer.add_ice_candidate(c).unwrap();
        }
        ((offerer, offerer_rx), (answerer, answerer_rx))
    }

    #[test]
    fn offer_emits_description_then_candidates() {
        let network = MemoryNetwork::new();
        let (connection, events) = network.connect();

        connection.create_offer().unwrap();
        let events = drain(&events);

        assert_eq!(descriptions(&events).len(), 1);
        assert_eq!(descriptions(&events)[0].kind, SdpKind::Offer);
        assert_eq!(candidates(&events).len(), 2);
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(connection.create_offer().is_err());
    }

    #[test]
    fn candidates_need_a_remote_description() {
        let network = MemoryNetwork::new();
        let (offerer, offerer_rx) = network.connect();
        let (answerer, _answerer_rx) = network.connect();
        offerer.create_offer().unwrap();

        let candidate = candidates(&drain(&offerer_rx))[0].clone();
        assert_eq!(
            answerer.add_ice_candidate(candidate),
            Err(TransportError::InvalidState(ConnectionState::New))
        );
    }

    #[test]
    fn handshake_connects_both_sides() {
        let network = MemoryNetwork::new();
        let ((offerer, offerer_rx), (answerer, answerer_rx)) = handshake(&network);

        assert_eq!(offerer.state(), ConnectionState::Connected);
        assert_eq!(answerer.state(), ConnectionState::Connected);
        assert_eq!(answerer.applied_candidates().len(), 2);
        assert!(drain(&offerer_rx).contains(&PeerEvent::StateChanged(ConnectionState::Connected)));
        assert!(drain(&answerer_rx).contains(&PeerEvent::StateChanged(ConnectionState::Connected)));
    }

    #[test]
    fn messages_arrive_in_order() {
        let network = MemoryNetwork::new();
        let ((offerer, _offerer_rx), (_answerer, answerer_rx)) = handshake(&network);
        drain(&answerer_rx);

        offerer.send("one").unwrap();
        offerer.send("two").unwrap();

        assert_eq!(
            drain(&answerer_rx),
            vec![
                PeerEvent::Message("one".to_string()),
                PeerEvent::Message("two".to_string())
            ]
        );
    }

    #[test]
    fn close_notifies_the_remote() {
        let network = MemoryNetwork::new();
        let ((offerer, _offerer_rx), (answerer, answerer_rx)) = handshake(&network);
        drain(&answerer_rx);

        offerer.close();

        assert_eq!(offerer.state(), ConnectionState::Closed);
        assert_eq!(answerer.state(), ConnectionState::Disconnected);
        assert_eq!(
            drain(&answerer_rx),
            vec![PeerEvent::StateChanged(ConnectionState::Disconnected)]
        );
        assert_eq!(answerer.send("late"), Err(TransportError::InvalidState(ConnectionState::Disconnected)));
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let network = MemoryNetwork::new();
        let (connection, _events) = network.connect();
        let result = connection.set_remote_description(SdpDescription::offer("memory-endpoint:99"));
        assert!(matches!(result, Err(TransportError::InvalidDescription(_))));
    }
}
