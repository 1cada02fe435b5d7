//! Offer/answer/ICE negotiation of a single connection attempt

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::config::IceServer;
use crate::error::NetworkError;
use crate::signaling::{
    ConnectionAttemptId, IceCandidate, PeerId, SdpDescription, SignalingClient, SignalingError,
};
use crate::transport::{
    ConnectionState, PeerConnection, PeerEvent, PeerEvents, PeerTransport, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Created,
    OfferPublished,
    AnswerAwaited,
    AnswerReceived,
    OfferFetched,
    AnswerSent,
    IceExchanging,
    Connected,
    Ended,
    Aborted,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Ended | AttemptState::Aborted)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl AttemptRole {
    fn allows(self, from: AttemptState, to: AttemptState) -> bool {
        use AttemptState::*;

        if to == Aborted {
            return !from.is_terminal();
        }
        match self {
            AttemptRole::Offerer => matches!(
                (from, to),
                (Created, OfferPublished)
                    | (OfferPublished, AnswerAwaited)
                    | (AnswerAwaited, AnswerReceived)
                    | (AnswerReceived, IceExchanging)
                    | (IceExchanging, Connected)
                    | (Connected, Ended)
            ),
            AttemptRole::Answerer => matches!(
                (from, to),
                (Created, OfferFetched)
                    | (OfferFetched, AnswerSent)
                    | (AnswerSent, IceExchanging)
                    | (IceExchanging, Connected)
                    | (Connected, Ended)
            ),
        }
    }
}

/// Candidates that cannot be used yet, kept in arrival order.
///
/// Remote candidates wait for the remote description, local ones for the
/// exchange phase. Each candidate is released exactly once.
#[derive(Debug, Default)]
pub struct IceBuffer {
    remote_ready: bool,
    remote: Vec<IceCandidate>,
    local_ready: bool,
    local: Vec<IceCandidate>,
}

impl IceBuffer {
    /// Returns the candidate back when it can be applied right away.
    pub fn push_remote(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            return Some(candidate);
        }
        self.remote.push(candidate);
        None
    }

    pub fn release_remote(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        std::mem::take(&mut self.remote)
    }

    /// Returns the candidate back when it can be sent right away.
    pub fn push_local(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.local_ready {
            return Some(candidate);
        }
        self.local.push(candidate);
        None
    }

    pub fn release_local(&mut self) -> Vec<IceCandidate> {
        self.local_ready = true;
        std::mem::take(&mut self.local)
    }
}

/// Client side view of one connection attempt
#[derive(Debug)]
pub struct ConnectionAttempt {
    role: AttemptRole,
    state: AttemptState,
    peer_id: PeerId,
    id: Option<ConnectionAttemptId>,
    ice: IceBuffer,
}

impl ConnectionAttempt {
    pub fn offerer(peer_id: PeerId) -> Self {
        Self {
            role: AttemptRole::Offerer,
            state: AttemptState::Created,
            peer_id,
            id: None,
            ice: IceBuffer::default(),
        }
    }

    pub fn answerer(peer_id: PeerId, id: ConnectionAttemptId) -> Self {
        Self {
            role: AttemptRole::Answerer,
            state: AttemptState::Created,
            peer_id,
            id: Some(id),
            ice: IceBuffer::default(),
        }
    }

    pub fn role(&self) -> AttemptRole {
        self.role
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn id(&self) -> Option<ConnectionAttemptId> {
        self.id
    }

    pub fn advance(&mut self, to: AttemptState) -> Result<(), NetworkError> {
        if !self.role.allows(self.state, to) {
            return Err(NetworkError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!("Attempt with peer {}: {} -> {}", self.peer_id, self.state, to);
        self.state = to;
        Ok(())
    }

    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = AttemptState::Aborted;
        }
    }
}

/// Per-attempt signaling pushed by the hub
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptSignal {
    Answer(SdpDescription),
    Candidate(IceCandidate),
}

/// Finished attempt ids remembered to drop their late signals
const FINISHED_ATTEMPTS_KEPT: usize = 256;

#[derive(Default)]
struct RouterState {
    routes: HashMap<ConnectionAttemptId, mpsc::UnboundedSender<AttemptSignal>>,
    pending: HashMap<ConnectionAttemptId, Vec<AttemptSignal>>,
    finished: HashSet<ConnectionAttemptId>,
    finished_order: VecDeque<ConnectionAttemptId>,
}

impl RouterState {
    fn mark_finished(&mut self, id: ConnectionAttemptId) {
        if !self.finished.insert(id) {
            return;
        }
        self.finished_order.push_back(id);
        while self.finished_order.len() > FINISHED_ATTEMPTS_KEPT {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

/// Delivers hub pushes to the negotiator owning the attempt. Signals for an
/// attempt nobody registered yet are held until it is.
#[derive(Clone, Default)]
pub struct AttemptRouter {
    state: Arc<Mutex<RouterState>>,
}

impl AttemptRouter {
    pub fn register(&self, id: ConnectionAttemptId) -> mpsc::UnboundedReceiver<AttemptSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            for signal in state.pending.remove(&id).unwrap_or_default() {
                let _ = tx.send(signal);
            }
            if state.finished.remove(&id) {
                state.finished_order.retain(|finished| *finished != id);
            }
            state.routes.insert(id, tx);
        }
        rx
    }

    pub fn route(&self, id: ConnectionAttemptId, signal: AttemptSignal) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.finished.contains(&id) {
            debug!("Dropping signal for finished attempt {}", id);
            return;
        }
        match state.routes.get(&id) {
            Some(route) => {
                let _ = route.send(signal);
            }
            None => state.pending.entry(id).or_default().push(signal),
        }
    }

    pub fn unregister(&self, id: ConnectionAttemptId) {
        if let Ok(mut state) = self.state.lock() {
            state.routes.remove(&id);
            state.pending.remove(&id);
            state.mark_finished(id);
        }
    }

    /// Close every route. Their negotiators see the hub as gone. Returns the
    /// number of attempts failed.
    pub fn fail_all(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        state.pending.clear();
        let failed = state.routes.len();
        state.routes.clear();
        failed
    }
}

/// A transport connection that finished negotiating
pub struct NegotiatedPeer {
    pub peer_id: PeerId,
    pub attempt_id: ConnectionAttemptId,
    pub connection: Arc<dyn PeerConnection>,
    pub events: PeerEvents,
}

struct Link {
    connection: Arc<dyn PeerConnection>,
    events: PeerEvents,
}

/// Offer published on the hub, waiting for its answer
pub struct PublishedOffer {
    link: Link,
    signals: mpsc::UnboundedReceiver<AttemptSignal>,
    deadline: Instant,
}

#[derive(Clone)]
pub struct Negotiator {
    signaling: SignalingClient,
    transport: Arc<dyn PeerTransport>,
    router: AttemptRouter,
    ice_servers: Arc<[IceServer]>,
    connection_timeout: Duration,
}

impl Negotiator {
    pub fn new(
        signaling: SignalingClient,
        transport: Arc<dyn PeerTransport>,
        router: AttemptRouter,
        ice_servers: Vec<IceServer>,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            signaling,
            transport,
            router,
            ice_servers: ice_servers.into(),
            connection_timeout,
        }
    }

    /// Create the local offer and publish it. On success the attempt id is
    /// known and the offer waits for an answer.
    pub async fn publish_offer(
        &self,
        attempt: &mut ConnectionAttempt,
    ) -> Result<PublishedOffer, NetworkError> {
        let deadline = Instant::now() + self.connection_timeout;
        let link = self.open_link(attempt)?;

        let result = match timeout_at(deadline, self.offer_phase(attempt, &link)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout),
        };
        match result {
            Ok(signals) => Ok(PublishedOffer {
                link,
                signals,
                deadline,
            }),
            Err(e) => Err(self.fail(attempt, &link, e)),
        }
    }

    /// Drive a published offer until the peers are connected.
    pub async fn complete_offer(
        &self,
        attempt: &mut ConnectionAttempt,
        offer: PublishedOffer,
    ) -> Result<NegotiatedPeer, NetworkError> {
        let PublishedOffer {
            link,
            mut signals,
            deadline,
        } = offer;

        let exchange = self.exchange_until_connected(attempt, &link, &mut signals);
        let result = match timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout),
        };
        if let Err(e) = result {
            return Err(self.fail(attempt, &link, e));
        }

        let id = self.attempt_id(attempt)?;
        if let Err(e) = self.signaling.end_connection_attempt(id).await {
            warn!("Could not end connection attempt {}: {}", id, e);
        }
        self.finish(attempt, link)
    }

    /// Answer the attempt `attempt` was created for.
    pub async fn answer(
        &self,
        attempt: &mut ConnectionAttempt,
    ) -> Result<NegotiatedPeer, NetworkError> {
        let deadline = Instant::now() + self.connection_timeout;
        let id = self.attempt_id(attempt)?;
        let link = self.open_link(attempt)?;
        let mut signals = self.router.register(id);

        let result = match timeout_at(deadline, self.answer_phase(attempt, &link, &mut signals)).await
        {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout),
        };
        match result {
            Ok(()) => self.finish(attempt, link),
            Err(e) => Err(self.fail(attempt, &link, e)),
        }
    }

    fn open_link(&self, attempt: &mut ConnectionAttempt) -> Result<Link, NetworkError> {
        match self.transport.new_connection(&self.ice_servers) {
            Ok((connection, events)) => Ok(Link { connection, events }),
            Err(e) => {
                attempt.abort();
                Err(e.into())
            }
        }
    }

    fn attempt_id(&self, attempt: &ConnectionAttempt) -> Result<ConnectionAttemptId, NetworkError> {
        attempt.id().ok_or(NetworkError::InvalidTransition {
            from: attempt.state(),
            to: AttemptState::IceExchanging,
        })
    }

    async fn offer_phase(
        &self,
        attempt: &mut ConnectionAttempt,
        link: &Link,
    ) -> Result<mpsc::UnboundedReceiver<AttemptSignal>, NetworkError> {
        link.connection.create_offer()?;
        let offer = self.local_description(attempt, link).await?;

        let id = self.signaling.start_connection_attempt(offer).await?;
        attempt.id = Some(id);
        attempt.advance(AttemptState::OfferPublished)?;
        let signals = self.router.register(id);
        attempt.advance(AttemptState::AnswerAwaited)?;

        info!("Offer {} published for peer {}", id, attempt.peer_id);
        Ok(signals)
    }

    async fn answer_phase(
        &self,
        attempt: &mut ConnectionAttempt,
        link: &Link,
        signals: &mut mpsc::UnboundedReceiver<AttemptSignal>,
    ) -> Result<(), NetworkError> {
        let id = self.attempt_id(attempt)?;

        let offer = self.signaling.join_connection_attempt(id).await?;
        attempt.advance(AttemptState::OfferFetched)?;
        link.connection.set_remote_description(offer)?;
        self.release_remote(attempt, link, signals);

        let answer = self.local_description(attempt, link).await?;
        self.signaling.send_answer(id, answer).await?;
        attempt.advance(AttemptState::AnswerSent)?;
        self.start_exchange(attempt, link, id).await?;

        self.exchange_until_connected(attempt, link, signals).await
    }

    /// Wait for the local offer or answer, holding back candidates produced
    /// meanwhile.
    async fn local_description(
        &self,
        attempt: &mut ConnectionAttempt,
        link: &Link,
    ) -> Result<SdpDescription, NetworkError> {
        loop {
            let event = link
                .events
                .recv()
                .await
                .map_err(|_| TransportError::Closed)?;
            match event {
                PeerEvent::SessionDescriptionCreated(description) => {
                    while let Ok(event) = link.events.try_recv() {
                        match event {
                            PeerEvent::IceCandidateCreated(candidate) => {
                                attempt.ice.push_local(candidate);
                            }
                            PeerEvent::StateChanged(
                                ConnectionState::Disconnected | ConnectionState::Closed,
                            ) => return Err(TransportError::Closed.into()),
                            other => debug!("Ignoring {:?} after local description", other),
                        }
                    }
                    return Ok(description);
                }
                PeerEvent::IceCandidateCreated(candidate) => {
                    attempt.ice.push_local(candidate);
                }
                PeerEvent::StateChanged(ConnectionState::Disconnected | ConnectionState::Closed) => {
                    return Err(TransportError::Closed.into());
                }
                other => debug!("Ignoring {:?} before local description", other),
            }
        }
    }

    async fn exchange_until_connected(
        &self,
        attempt: &mut ConnectionAttempt,
        link: &Link,
        signals: &mut mpsc::UnboundedReceiver<AttemptSignal>,
    ) -> Result<(), NetworkError> {
        let id = self.attempt_id(attempt)?;

        while attempt.state() != AttemptState::Connected {
            tokio::select! {
                event = link.events.recv() => {
                    let event = event.map_err(|_| TransportError::Closed)?;
                    self.on_peer_event(attempt, id, event).await?;
                }
                signal = signals.recv() => match signal {
                    Some(AttemptSignal::Answer(answer)) => {
                        if attempt.role() != AttemptRole::Offerer
                            || attempt.state() != AttemptState::AnswerAwaited
                        {
                            warn!("Unexpected answer for attempt {}", id);
                            continue;
                        }
                        link.connection.set_remote_description(answer)?;
                        attempt.advance(AttemptState::AnswerReceived)?;
                        self.release_remote(attempt, link, signals);
                        self.start_exchange(attempt, link, id).await?;
                    }
                    Some(AttemptSignal::Candidate(candidate)) => {
                        if let Some(candidate) = attempt.ice.push_remote(candidate) {
                            apply_candidate(link, candidate);
                        }
                    }
                    None => return Err(SignalingError::Disconnected.into()),
                },
            }
        }
        Ok(())
    }

    async fn on_peer_event(
        &self,
        attempt: &mut ConnectionAttempt,
        id: ConnectionAttemptId,
        event: PeerEvent,
    ) -> Result<(), NetworkError> {
        match event {
            PeerEvent::IceCandidateCreated(candidate) => {
                if let Some(candidate) = attempt.ice.push_local(candidate) {
                    self.send_candidate(id, candidate).await;
                }
            }
            PeerEvent::StateChanged(ConnectionState::Connected) => {
                attempt.advance(AttemptState::Connected)?;
            }
            PeerEvent::StateChanged(ConnectionState::Disconnected | ConnectionState::Closed) => {
                return Err(TransportError::Closed.into());
            }
            other => debug!("Ignoring {:?} during attempt {}", other, id),
        }
        Ok(())
    }

    /// Apply every remote candidate received so far, in arrival order.
    fn release_remote(
        &self,
        attempt: &mut ConnectionAttempt,
        link: &Link,
        signals: &mut mpsc::UnboundedReceiver<AttemptSignal>,
    ) {
        while let Ok(signal) = signals.try_recv() {
            match signal {
                AttemptSignal::Candidate(candidate) => {
                    if let Some(candidate) = attempt.ice.push_remote(candidate) {
                        apply_candidate(link, candidate);
                    }
                }
                AttemptSignal::Answer(_) => {
                    warn!("Unexpected answer for attempt with peer {}", attempt.peer_id)
                }
            }
        }
        for candidate in attempt.ice.release_remote() {
            apply_candidate(link, candidate);
        }
    }

    async fn start_exchange(
        &self,
        attempt: &mut ConnectionAttempt,
        link: &Link,
        id: ConnectionAttemptId,
    ) -> Result<(), NetworkError> {
        attempt.advance(AttemptState::IceExchanging)?;
        for candidate in attempt.ice.release_local() {
            self.send_candidate(id, candidate).await;
        }
        if link.connection.state() == ConnectionState::Connected {
            attempt.advance(AttemptState::Connected)?;
        }
        Ok(())
    }

    /// The other side may already have ended the attempt, so failures are
    /// only logged.
    async fn send_candidate(&self, id: ConnectionAttemptId, candidate: IceCandidate) {
        if let Err(e) = self.signaling.send_ice_candidate(id, candidate).await {
            debug!("Ice candidate for attempt {} not delivered: {}", id, e);
        }
    }

    fn finish(
        &self,
        attempt: &mut ConnectionAttempt,
        link: Link,
    ) -> Result<NegotiatedPeer, NetworkError> {
        let attempt_id = self.attempt_id(attempt)?;
        self.router.unregister(attempt_id);
        attempt.advance(AttemptState::Ended)?;
        info!("Connected to peer {} (attempt {})", attempt.peer_id, attempt_id);
        Ok(NegotiatedPeer {
            peer_id: attempt.peer_id,
            attempt_id,
            connection: link.connection,
            events: link.events,
        })
    }

    fn fail(&self, attempt: &mut ConnectionAttempt, link: &Link, error: NetworkError) -> NetworkError {
        warn!(
            "Connection attempt with peer {} aborted in state {}: {}",
            attempt.peer_id, attempt.state, error
        );
        attempt.abort();
        link.connection.close();
        if let Some(id) = attempt.id {
            self.router.unregister(id);
        }
        error
    }
}

fn apply_candidate(link: &Link, candidate: IceCandidate) {
    if let Err(e) = link.connection.add_ice_candidate(candidate) {
        warn!("Failed to apply remote ice candidate: {}", e);
    }
}
