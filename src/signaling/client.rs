use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::actor::HubHandle;
use super::messages::{ClientFrame, ClientInvocation, HubPush, HubReply, HubRequest, ServerFrame};
use super::types::{
    ConnectionAttemptId, IceCandidate, PeerId, RoomConnectionInfo, RoomId, SdpDescription,
    SignalingError,
};
use crate::config::{NetworkConfig, ReconnectConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Server-initiated events
#[derive(Debug)]
pub enum HubEvent {
    /// `asking_peer` wants to connect. Reply with the id of a connection
    /// attempt it can answer, or `None` to decline.
    ConnectionRequested {
        asking_peer: PeerId,
        reply: oneshot::Sender<Option<ConnectionAttemptId>>,
    },
    SdpAnswerReceived {
        attempt_id: ConnectionAttemptId,
        answer: SdpDescription,
    },
    IceCandidateReceived {
        attempt_id: ConnectionAttemptId,
        candidate: IceCandidate,
    },
    /// The hub connection dropped. Hub-side state of the old session is
    /// gone; the link reconnects on its own.
    Disconnected,
}

pub type HubEvents = mpsc::UnboundedReceiver<HubEvent>;

struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<HubReply>>>,
    connected: AtomicBool,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Shared {
    fn new(events: mpsc::UnboundedSender<HubEvent>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            events,
        }
    }

    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<HubReply>> {
        self.pending.lock().ok()?.remove(&id)
    }

    /// Drop every in-flight reply slot; waiting callers see `Disconnected`.
    fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if !pending.is_empty() {
                warn!("Failing {} pending signaling request(s)", pending.len());
            }
            pending.clear();
        }
    }

    fn dispatch(&self, frame: ServerFrame, invoke_tx: &mpsc::UnboundedSender<ClientFrame>) {
        match frame {
            ServerFrame::Response { id, reply } => match self.take_pending(id) {
                Some(slot) => {
                    let _ = slot.send(reply);
                }
                None => debug!("Response {} has no waiting caller", id),
            },

            ServerFrame::Push { event } => {
                let event = match event {
                    HubPush::SdpAnswerReceived { attempt_id, answer } => {
                        HubEvent::SdpAnswerReceived { attempt_id, answer }
                    }
                    HubPush::IceCandidateReceived {
                        attempt_id,
                        candidate,
                    } => HubEvent::IceCandidateReceived {
                        attempt_id,
                        candidate,
                    },
                };
                let _ = self.events.send(event);
            }

            ServerFrame::Invoke {
                id,
                call: ClientInvocation::ConnectionRequested { asking_peer },
            } => {
                let (reply, rx) = oneshot::channel();
                let _ = self
                    .events
                    .send(HubEvent::ConnectionRequested { asking_peer, reply });

                let invoke_tx = invoke_tx.clone();
                tokio::spawn(async move {
                    let attempt = rx.await.ok().flatten();
                    let _ = invoke_tx.send(ClientFrame::InvokeResult { id, attempt });
                });
            }
        }
    }

    /// Answer a frame that cannot be delivered right now.
    fn reject(&self, frame: ClientFrame) {
        if let ClientFrame::Request { id, .. } = frame {
            self.take_pending(id);
        }
    }
}

/// Handle to the signaling hub.
///
/// Cheap to clone; the underlying link shuts down once every clone is
/// dropped.
#[derive(Clone)]
pub struct SignalingClient {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl SignalingClient {
    fn new(
        request_timeout: Duration,
    ) -> (
        Self,
        Arc<Shared>,
        mpsc::UnboundedReceiver<ClientFrame>,
        HubEvents,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(events_tx));
        let client = Self {
            shared: shared.clone(),
            outbound,
            next_id: Arc::new(AtomicU64::new(1)),
            request_timeout,
        };
        (client, shared, outbound_rx, events_rx)
    }

    /// Connect to the hub at `config.signaling_url` over WebSocket. The first
    /// connection must succeed; later drops are retried with backoff.
    pub async fn connect(config: &NetworkConfig) -> Result<(Self, HubEvents), SignalingError> {
        let (ws, _) = connect_async(config.signaling_url.as_str()).await?;
        info!("Connected to signaling hub at {}", config.signaling_url);

        let (client, shared, outbound_rx, events) = Self::new(config.request_timeout());
        shared.connected.store(true, Ordering::SeqCst);
        tokio::spawn(run_websocket_link(
            config.signaling_url.clone(),
            ws,
            shared,
            outbound_rx,
            config.reconnect.clone(),
        ));
        Ok((client, events))
    }

    /// Talk to a hub actor living in this process.
    pub async fn in_process(
        hub: &HubHandle,
        config: &NetworkConfig,
    ) -> Result<(Self, HubEvents), SignalingError> {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let session = hub
            .open_session(server_tx.clone())
            .await
            .ok_or(SignalingError::Disconnected)?;

        let (client, shared, outbound_rx, events) = Self::new(config.request_timeout());
        shared.connected.store(true, Ordering::SeqCst);
        tokio::spawn(run_in_process_link(
            hub.clone(),
            session,
            shared,
            outbound_rx,
            server_tx,
            server_rx,
        ));
        Ok((client, events))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn call(&self, request: HubRequest) -> Result<HubReply, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, tx);
        }

        if self
            .outbound
            .send(ClientFrame::Request { id, call: request })
            .is_err()
        {
            self.shared.take_pending(id);
            return Err(SignalingError::Disconnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SignalingError::Disconnected),
            Err(_) => {
                self.shared.take_pending(id);
                Err(SignalingError::Timeout)
            }
        }
    }

    async fn call_expect<T>(
        &self,
        request: HubRequest,
        extract: impl FnOnce(HubReply) -> Option<T>,
    ) -> Result<T, SignalingError> {
        let operation = request.operation();
        match self.call(request).await? {
            HubReply::Failed { error } => Err(SignalingError::Hub { operation, error }),
            reply => {
                let unexpected = format!("unexpected reply to {operation}: {reply:?}");
                extract(reply).ok_or(SignalingError::Protocol(unexpected))
            }
        }
    }

    async fn call_done(&self, request: HubRequest) -> Result<(), SignalingError> {
        self.call_expect(request, |reply| matches!(reply, HubReply::Done).then_some(()))
            .await
    }

    pub async fn create_room(&self) -> Result<RoomId, SignalingError> {
        self.call_expect(HubRequest::CreateRoom, |reply| match reply {
            HubReply::RoomCreated { room_id } => Some(room_id),
            _ => None,
        })
        .await
    }

    pub async fn join_room(&self, room_id: RoomId) -> Result<PeerId, SignalingError> {
        self.call_expect(HubRequest::JoinRoom { room_id }, |reply| match reply {
            HubReply::RoomJoined { peer_id } => Some(peer_id),
            _ => None,
        })
        .await
    }

    pub async fn connect_to_room_players(&self) -> Result<RoomConnectionInfo, SignalingError> {
        self.call_expect(HubRequest::ConnectToRoomPlayers, |reply| match reply {
            HubReply::RoomPlayers { info } => Some(info),
            _ => None,
        })
        .await
    }

    pub async fn start_connection_attempt(
        &self,
        offer: SdpDescription,
    ) -> Result<ConnectionAttemptId, SignalingError> {
        self.call_expect(HubRequest::StartConnectionAttempt { offer }, |reply| match reply {
            HubReply::AttemptStarted { attempt_id } => Some(attempt_id),
            _ => None,
        })
        .await
    }

    pub async fn join_connection_attempt(
        &self,
        attempt_id: ConnectionAttemptId,
    ) -> Result<SdpDescription, SignalingError> {
        self.call_expect(
            HubRequest::JoinConnectionAttempt { attempt_id },
            |reply| match reply {
                HubReply::AttemptJoined { offer } => Some(offer),
                _ => None,
            },
        )
        .await
    }

    pub async fn send_answer(
        &self,
        attempt_id: ConnectionAttemptId,
        answer: SdpDescription,
    ) -> Result<(), SignalingError> {
        self.call_done(HubRequest::SendAnswer { attempt_id, answer })
            .await
    }

    pub async fn send_ice_candidate(
        &self,
        attempt_id: ConnectionAttemptId,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.call_done(HubRequest::SendIceCandidate {
            attempt_id,
            candidate,
        })
        .await
    }

    pub async fn end_connection_attempt(
        &self,
        attempt_id: ConnectionAttemptId,
    ) -> Result<(), SignalingError> {
        self.call_done(HubRequest::EndConnectionAttempt { attempt_id })
            .await
    }

    pub async fn leave_room(&self) -> Result<(), SignalingError> {
        self.call_done(HubRequest::LeaveRoom).await
    }
}

/// Client frames sent to an in-process hub are served on their own task, the
/// same way the WebSocket front-end serves them.
async fn run_in_process_link(
    hub: HubHandle,
    session: super::actor::SessionId,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    server_tx: mpsc::UnboundedSender<ServerFrame>,
    mut server_rx: mpsc::UnboundedReceiver<ServerFrame>,
) {
    let (invoke_tx, mut invoke_rx) = mpsc::unbounded_channel::<ClientFrame>();

    loop {
        let frame = tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            Some(frame) = invoke_rx.recv() => frame,
            Some(frame) = server_rx.recv() => {
                shared.dispatch(frame, &invoke_tx);
                continue;
            }
        };

        let hub = hub.clone();
        let server_tx = server_tx.clone();
        tokio::spawn(async move {
            hub.serve_frame(session, frame, &server_tx).await;
        });
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.fail_pending();
    hub.close_session(session).await;
    debug!("In-process signaling link closed");
}

enum LinkEnd {
    ClientGone,
    Lost,
}

async fn run_websocket_link(
    url: String,
    first: WsStream,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    reconnect: ReconnectConfig,
) {
    let (invoke_tx, mut invoke_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let mut stream = Some(first);
    let mut retries = 0u32;

    loop {
        if let Some(ws) = stream.take() {
            shared.connected.store(true, Ordering::SeqCst);
            retries = 0;

            let end = drive_websocket(ws, &shared, &mut outbound_rx, &invoke_tx, &mut invoke_rx).await;
            shared.connected.store(false, Ordering::SeqCst);
            shared.fail_pending();

            if let LinkEnd::ClientGone = end {
                debug!("Signaling client dropped, closing link");
                return;
            }
            warn!("Signaling hub connection lost, reconnecting");
            let _ = shared.events.send(HubEvent::Disconnected);
        }

        let sleep = tokio::time::sleep(reconnect.backoff(retries));
        tokio::pin!(sleep);
        retries = retries.saturating_add(1);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => shared.reject(frame),
                    None => return,
                },
                Some(_) = invoke_rx.recv() => {}
            }
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Reconnected to signaling hub at {}", url);
                stream = Some(ws);
            }
            Err(e) => warn!("Reconnect to {} failed: {}", url, e),
        }
    }
}

async fn drive_websocket(
    ws: WsStream,
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    invoke_tx: &mpsc::UnboundedSender<ClientFrame>,
    invoke_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
) -> LinkEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        let frame = tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => {
                    let _ = sink.close().await;
                    return LinkEnd::ClientGone;
                }
            },
            Some(frame) = invoke_rx.recv() => frame,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => shared.dispatch(frame, invoke_tx),
                            Err(e) => warn!("Invalid hub frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return LinkEnd::Lost,
                    Some(Err(e)) => {
                        warn!("Signaling WebSocket error: {}", e);
                        return LinkEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                }
                continue;
            }
        };

        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize client frame: {}", e);
                shared.reject(frame);
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            shared.reject(frame);
            return LinkEnd::Lost;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::signaling::types::HubError;

    async fn client(hub: &HubHandle) -> (SignalingClient, HubEvents) {
        SignalingClient::in_process(hub, &NetworkConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_join_room() {
        let hub = HubHandle::spawn(HubConfig::default());
        let (a, _a_events) = client(&hub).await;
        let (b, _b_events) = client(&hub).await;

        let room_id = a.create_room().await.unwrap();
        assert_eq!(b.join_room(room_id).await.unwrap(), PeerId(2));
    }

    #[tokio::test]
    async fn hub_errors_are_localized() {
        let hub = HubHandle::spawn(HubConfig::default());
        let (a, _events) = client(&hub).await;

        let err = a
            .join_room(RoomId::parse("AAAAAA").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.hub_error(), Some(HubError::RoomNotFound));
        assert_eq!(err.to_string(), "Failed to join a room: Room not found");
    }

    #[tokio::test]
    async fn connection_requested_round_trip() {
        let hub = HubHandle::spawn(HubConfig::default());
        let (a, mut a_events) = client(&hub).await;
        let (b, _b_events) = client(&hub).await;

        let room_id = a.create_room().await.unwrap();
        b.join_room(room_id).await.unwrap();

        let responder = {
            let a = a.clone();
            tokio::spawn(async move {
                let Some(HubEvent::ConnectionRequested { asking_peer, reply }) =
                    a_events.recv().await
                else {
                    panic!("expected a connection request");
                };
                assert_eq!(asking_peer, PeerId(2));
                let attempt_id = a
                    .start_connection_attempt(SdpDescription::offer("offer"))
                    .await
                    .unwrap();
                reply.send(Some(attempt_id)).unwrap();
                attempt_id
            })
        };

        let info = b.connect_to_room_players().await.unwrap();
        let attempt_id = responder.await.unwrap();
        assert_eq!(info.players_connection_info.len(), 1);
        assert_eq!(info.players_connection_info[0].peer_id, PeerId(1));
        assert_eq!(info.players_connection_info[0].attempt_id, attempt_id);
        assert!(info.failed_creations.is_empty());

        let offer = b.join_connection_attempt(attempt_id).await.unwrap();
        assert_eq!(offer, SdpDescription::offer("offer"));
    }

    #[tokio::test]
    async fn answers_are_pushed_to_the_offerer() {
        let hub = HubHandle::spawn(HubConfig::default());
        let (a, mut a_events) = client(&hub).await;
        let (b, _b_events) = client(&hub).await;

        let attempt_id = a
            .start_connection_attempt(SdpDescription::offer("offer"))
            .await
            .unwrap();
        b.join_connection_attempt(attempt_id).await.unwrap();
        b.send_answer(attempt_id, SdpDescription::answer("answer"))
            .await
            .unwrap();

        match a_events.recv().await {
            Some(HubEvent::SdpAnswerReceived {
                attempt_id: id,
                answer,
            }) => {
                assert_eq!(id, attempt_id);
                assert_eq!(answer.sdp, "answer");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_connection_attempt_once() {
        let hub = HubHandle::spawn(HubConfig::default());
        let (a, _a_events) = client(&hub).await;
        let (b, _b_events) = client(&hub).await;

        let attempt_id = a
            .start_connection_attempt(SdpDescription::offer("offer"))
            .await
            .unwrap();
        b.join_connection_attempt(attempt_id).await.unwrap();

        a.end_connection_attempt(attempt_id).await.unwrap();
        let err = a.end_connection_attempt(attempt_id).await.unwrap_err();
        assert_eq!(err.hub_error(), Some(HubError::ConnectionAttemptNotFound));
        let err = b.end_connection_attempt(attempt_id).await.unwrap_err();
        assert_eq!(err.hub_error(), Some(HubError::ConnectionAttemptNotFound));
    }

    #[tokio::test]
    async fn dropped_reply_slots_surface_as_disconnected() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let shared = Shared::new(events_tx);
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(7, tx);

        shared.fail_pending();

        assert!(rx.await.is_err());
        assert!(shared.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn declined_invocation_without_listener() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        drop(events_rx);
        let shared = Shared::new(events_tx);
        let (invoke_tx, mut invoke_rx) = mpsc::unbounded_channel();

        shared.dispatch(
            ServerFrame::Invoke {
                id: 5,
                call: ClientInvocation::ConnectionRequested {
                    asking_peer: PeerId(4),
                },
            },
            &invoke_tx,
        );

        assert_eq!(
            invoke_rx.recv().await.unwrap(),
            ClientFrame::InvokeResult {
                id: 5,
                attempt: None
            }
        );
    }
}
