//! Connection coordinator: owns the peer-connection lifecycle, drives the
//! offer/answer/candidate exchange over the signaling store, and surfaces
//! a single ordered, reliable data channel once negotiation completes.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tracing::{debug, error, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::Error;
use crate::signaling::{CandidateRecord, PeerRole, SignalingRecord, SignalingStore};
use crate::transfer::{FrameSink, TransferEvent, TransferReceiver};

/// Label of the single data channel created by the initiator.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// Negotiation lifecycle. `Closed` and `Failed` are terminal; a new
/// session must be started to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// ICE connectivity status line, e.g. "checking" or "failed".
    IceStateChanged(String),
    /// Negotiation stalled on an error; no automatic retry is attempted.
    NegotiationError(String),
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    Transfer(TransferEvent),
}

/// STUN configuration for NAT traversal. Without ICE servers,
/// connections fail for peers behind NAT.
fn rtc_configuration() -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// [`FrameSink`] over an open data channel.
pub struct DataChannelSink(Arc<RTCDataChannel>);

impl DataChannelSink {
    pub fn new(channel: Arc<RTCDataChannel>) -> Self {
        Self(channel)
    }
}

#[async_trait]
impl FrameSink for DataChannelSink {
    fn is_open(&self) -> bool {
        self.0.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), Error> {
        self.0
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| Error::Channel(e.to_string()))
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), Error> {
        self.0
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| Error::Channel(e.to_string()))
    }
}

/// One channel event, queued so the receive state machine processes
/// messages strictly in arrival order.
enum ChannelSignal {
    Text(String),
    Frame(Bytes),
    Closed,
}

pub struct ConnectionCoordinator {
    role: PeerRole,
    room_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    state: Arc<Mutex<ConnectionState>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionCoordinator {
    /// Create the peer connection and start negotiating in the given
    /// role. Returns once the local side of the exchange is published
    /// and the signaling subscriptions are running; the connection
    /// itself completes asynchronously via the event stream.
    pub async fn connect(
        role: PeerRole,
        room_id: &str,
        store: Arc<dyn SignalingStore>,
        event_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Self, Error> {
        info!("negotiating as {} in room {}", role, room_id);

        let api = APIBuilder::new().build();
        let peer_connection = Arc::new(api.new_peer_connection(rtc_configuration()).await?);
        let state = Arc::new(Mutex::new(ConnectionState::New));
        transition(&state, &event_tx, ConnectionState::Negotiating).await;

        // Every locally gathered candidate is published immediately,
        // tagged with the local role.
        {
            let store = store.clone();
            let room = room_id.to_string();
            peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let store = store.clone();
                let room = room.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        info!("ice gathering complete for room {}", room);
                        return;
                    };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!("could not serialize local candidate: {}", e);
                            return;
                        }
                    };
                    match serde_json::to_string(&init) {
                        Ok(json) => {
                            if let Err(e) = store.publish_candidate(&room, json, role).await {
                                warn!("failed to publish local candidate: {}", e);
                            }
                        }
                        Err(e) => warn!("could not encode local candidate: {}", e),
                    }
                })
            }));
        }

        {
            let state = state.clone();
            let events = event_tx.clone();
            peer_connection.on_peer_connection_state_change(Box::new(
                move |s: RTCPeerConnectionState| {
                    let state = state.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        match s {
                            RTCPeerConnectionState::Connected => {
                                info!("peer connection established");
                                transition(&state, &events, ConnectionState::Connected).await;
                            }
                            RTCPeerConnectionState::Failed => {
                                error!("peer connection failed");
                                transition(&state, &events, ConnectionState::Failed).await;
                            }
                            RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Closed => {
                                info!("peer connection closed");
                                transition(&state, &events, ConnectionState::Closed).await;
                            }
                            other => debug!("peer connection state: {:?}", other),
                        }
                    })
                },
            ));
        }

        {
            let events = event_tx.clone();
            peer_connection.on_ice_connection_state_change(Box::new(
                move |s: RTCIceConnectionState| {
                    let events = events.clone();
                    Box::pin(async move {
                        ice_status(&events, s).await;
                    })
                },
            ));
        }

        let data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));
        match role {
            PeerRole::Initiator => {
                let dc = peer_connection
                    .create_data_channel(DATA_CHANNEL_LABEL, None)
                    .await?;
                bind_channel(dc.clone(), event_tx.clone());
                *data_channel.lock().await = Some(dc);
            }
            PeerRole::Responder => {
                // The channel arrives from the initiator once the
                // remote offer is applied.
                let slot = data_channel.clone();
                let events = event_tx.clone();
                peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    info!("received data channel {} from initiator", dc.label());
                    bind_channel(dc.clone(), events.clone());
                    let slot = slot.clone();
                    Box::pin(async move {
                        *slot.lock().await = Some(dc);
                    })
                }));
            }
        }

        // Subscribe before publishing anything so no push is missed.
        // Candidates may arrive before the matching description; the
        // loops re-check preconditions on every event.
        let record_rx = store.watch_room(room_id).await;
        let candidate_rx = store.watch_candidates(room_id).await;

        if role == PeerRole::Initiator {
            let offer = peer_connection.create_offer(None).await?;
            peer_connection.set_local_description(offer).await?;
            let local = peer_connection.local_description().await.ok_or_else(|| {
                Error::Negotiation("no local description after offer".to_string())
            })?;
            store
                .publish_offer(room_id, serde_json::to_string(&local)?)
                .await?;
            info!("offer published to room {}", room_id);
        }

        let record_task = spawn_record_loop(
            role,
            room_id.to_string(),
            peer_connection.clone(),
            store.clone(),
            event_tx.clone(),
            record_rx,
        );
        let candidate_task =
            spawn_candidate_loop(role, peer_connection.clone(), candidate_rx);

        Ok(Self {
            role,
            room_id: room_id.to_string(),
            peer_connection,
            data_channel,
            state,
            event_tx,
            tasks: vec![record_task, candidate_task],
        })
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Sink over the negotiated data channel, if one exists yet.
    pub async fn frame_sink(&self) -> Option<DataChannelSink> {
        let channel = self.data_channel.lock().await;
        channel.as_ref().map(|dc| DataChannelSink::new(dc.clone()))
    }

    /// Close the peer connection and stop the signaling subscriptions.
    pub async fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        transition(&self.state, &self.event_tx, ConnectionState::Closed).await;
        if let Err(e) = self.peer_connection.close().await {
            warn!("error closing peer connection: {}", e);
        }
    }
}

async fn transition(
    state: &Arc<Mutex<ConnectionState>>,
    events: &mpsc::Sender<ConnectionEvent>,
    next: ConnectionState,
) {
    {
        let mut current = state.lock().await;
        if current.is_terminal() || *current == next {
            return;
        }
        *current = next;
    }
    let _ = events.send(ConnectionEvent::StateChanged(next)).await;
}

/// Log an ICE connectivity change and surface it on the event stream.
async fn ice_status(events: &mpsc::Sender<ConnectionEvent>, s: RTCIceConnectionState) {
    match s {
        RTCIceConnectionState::Failed => error!("ice connectivity failed"),
        RTCIceConnectionState::Disconnected => warn!("ice disconnected"),
        other => debug!("ice connection state: {:?}", other),
    }
    let _ = events
        .send(ConnectionEvent::IceStateChanged(s.to_string()))
        .await;
}

async fn negotiation_error(events: &mpsc::Sender<ConnectionEvent>, message: String) {
    error!("{}", message);
    let _ = events
        .send(ConnectionEvent::NegotiationError(message))
        .await;
}

/// Apply a remote description blob at most once. Returns false when it
/// was already set, the blob was invalid, or applying failed.
async fn apply_remote_description(
    pc: &Arc<RTCPeerConnection>,
    blob: &str,
    kind: &str,
    events: &mpsc::Sender<ConnectionEvent>,
) -> bool {
    if pc.remote_description().await.is_some() {
        debug!("remote description already set; ignoring {} snapshot", kind);
        return false;
    }
    let desc = match serde_json::from_str::<RTCSessionDescription>(blob) {
        Ok(desc) => desc,
        Err(e) => {
            negotiation_error(events, format!("invalid {} blob: {}", kind, e)).await;
            return false;
        }
    };
    if let Err(e) = pc.set_remote_description(desc).await {
        negotiation_error(events, format!("failed to apply remote {}: {}", kind, e)).await;
        return false;
    }
    info!("remote {} applied", kind);
    true
}

fn spawn_record_loop(
    role: PeerRole,
    room_id: String,
    pc: Arc<RTCPeerConnection>,
    store: Arc<dyn SignalingStore>,
    events: mpsc::Sender<ConnectionEvent>,
    mut record_rx: mpsc::UnboundedReceiver<SignalingRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = record_rx.recv().await {
            match role {
                PeerRole::Initiator => {
                    let Some(answer) = record.answer.as_deref() else {
                        continue;
                    };
                    apply_remote_description(&pc, answer, "answer", &events).await;
                }
                PeerRole::Responder => {
                    let Some(offer) = record.offer.as_deref() else {
                        continue;
                    };
                    if !apply_remote_description(&pc, offer, "offer", &events).await {
                        continue;
                    }
                    let answer = match pc.create_answer(None).await {
                        Ok(answer) => answer,
                        Err(e) => {
                            negotiation_error(&events, format!("failed to create answer: {}", e))
                                .await;
                            continue;
                        }
                    };
                    if let Err(e) = pc.set_local_description(answer).await {
                        negotiation_error(
                            &events,
                            format!("failed to set local description: {}", e),
                        )
                        .await;
                        continue;
                    }
                    let Some(local) = pc.local_description().await else {
                        negotiation_error(
                            &events,
                            "no local description after answer".to_string(),
                        )
                        .await;
                        continue;
                    };
                    let json = match serde_json::to_string(&local) {
                        Ok(json) => json,
                        Err(e) => {
                            negotiation_error(&events, format!("failed to encode answer: {}", e))
                                .await;
                            continue;
                        }
                    };
                    if let Err(e) = store.publish_answer(&room_id, json).await {
                        negotiation_error(&events, format!("failed to publish answer: {}", e))
                            .await;
                        continue;
                    }
                    info!("answer published to room {}", room_id);
                }
            }
        }
    })
}

fn spawn_candidate_loop(
    role: PeerRole,
    pc: Arc<RTCPeerConnection>,
    mut candidate_rx: mpsc::UnboundedReceiver<CandidateRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(record) = candidate_rx.recv().await {
            if !should_apply_candidate(&record, role, &mut seen) {
                continue;
            }
            match serde_json::from_str::<RTCIceCandidateInit>(&record.candidate) {
                Ok(init) => {
                    if let Err(e) = pc.add_ice_candidate(init).await {
                        warn!("failed to add remote candidate: {}", e);
                    }
                }
                Err(e) => warn!("discarding malformed candidate record: {}", e),
            }
        }
    })
}

/// Only candidates written by the opposite role are applied, each
/// distinct candidate once. Replays are filtered by the seen-set.
fn should_apply_candidate(
    record: &CandidateRecord,
    local_role: PeerRole,
    seen: &mut HashSet<String>,
) -> bool {
    if record.from != local_role.opposite() {
        return false;
    }
    seen.insert(record.candidate.clone())
}

/// Wire a data channel to a fresh receive state machine. Messages are
/// queued and processed by one task so frames are reassembled strictly
/// in arrival order.
fn bind_channel(dc: Arc<RTCDataChannel>, events: mpsc::Sender<ConnectionEvent>) {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ChannelSignal>();

    let pump_events = events.clone();
    tokio::spawn(async move {
        let (transfer_tx, mut transfer_rx) = mpsc::channel::<TransferEvent>(64);
        let forward = pump_events;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = transfer_rx.recv().await {
                if forward.send(ConnectionEvent::Transfer(event)).await.is_err() {
                    break;
                }
            }
        });

        let mut receiver = TransferReceiver::new(transfer_tx);
        while let Some(signal) = signal_rx.recv().await {
            match signal {
                ChannelSignal::Text(text) => receiver.handle_text(&text).await,
                ChannelSignal::Frame(frame) => receiver.handle_frame(frame).await,
                ChannelSignal::Closed => {
                    receiver.handle_close().await;
                    break;
                }
            }
        }
        drop(receiver);
        let _ = forwarder.await;
    });

    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            info!("data channel open");
            let _ = events.send(ConnectionEvent::ChannelOpen).await;
        })
    }));

    let message_tx = signal_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let signal = if msg.is_string {
            ChannelSignal::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            ChannelSignal::Frame(msg.data)
        };
        let _ = message_tx.send(signal);
        Box::pin(async {})
    }));

    let close_tx = signal_tx.clone();
    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let _ = close_tx.send(ChannelSignal::Closed);
        let events = close_events.clone();
        Box::pin(async move {
            info!("data channel closed");
            let _ = events.send(ConnectionEvent::ChannelClosed).await;
        })
    }));

    let error_tx = signal_tx;
    dc.on_error(Box::new(move |err| {
        let _ = error_tx.send(ChannelSignal::Closed);
        let events = events.clone();
        Box::pin(async move {
            error!("data channel error: {}", err);
            let _ = events.send(ConnectionEvent::ChannelError(err.to_string())).await;
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(from: PeerRole, payload: &str) -> CandidateRecord {
        CandidateRecord {
            candidate: payload.to_string(),
            from,
        }
    }

    #[test]
    fn only_opposite_role_candidates_are_applied() {
        let mut seen = HashSet::new();
        assert!(should_apply_candidate(
            &candidate(PeerRole::Responder, "c1"),
            PeerRole::Initiator,
            &mut seen
        ));
        assert!(!should_apply_candidate(
            &candidate(PeerRole::Initiator, "c2"),
            PeerRole::Initiator,
            &mut seen
        ));
        assert!(!should_apply_candidate(
            &candidate(PeerRole::Responder, "c3"),
            PeerRole::Responder,
            &mut seen
        ));
    }

    #[test]
    fn replayed_candidates_are_applied_once() {
        let mut seen = HashSet::new();
        let record = candidate(PeerRole::Initiator, "c1");
        assert!(should_apply_candidate(&record, PeerRole::Responder, &mut seen));
        assert!(!should_apply_candidate(&record, PeerRole::Responder, &mut seen));
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let (tx, mut rx) = mpsc::channel(8);
        let state = Arc::new(Mutex::new(ConnectionState::New));

        transition(&state, &tx, ConnectionState::Negotiating).await;
        transition(&state, &tx, ConnectionState::Failed).await;
        transition(&state, &tx, ConnectionState::Connected).await;
        assert_eq!(*state.lock().await, ConnectionState::Failed);

        let mut observed = Vec::new();
        while let Ok(ConnectionEvent::StateChanged(s)) = rx.try_recv() {
            observed.push(s);
        }
        assert_eq!(
            observed,
            vec![ConnectionState::Negotiating, ConnectionState::Failed]
        );
    }

    #[tokio::test]
    async fn ice_changes_are_surfaced_as_status_events() {
        let (tx, mut rx) = mpsc::channel(8);
        ice_status(&tx, RTCIceConnectionState::Checking).await;
        ice_status(&tx, RTCIceConnectionState::Failed).await;

        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionEvent::IceStateChanged(s)) if s == "checking"
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionEvent::IceStateChanged(s)) if s == "failed"
        ));
    }

    async fn offer_blob() -> String {
        let api = APIBuilder::new().build();
        let pc = api.new_peer_connection(rtc_configuration()).await.unwrap();
        pc.create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        serde_json::to_string(&pc.local_description().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn remote_description_is_applied_at_most_once() {
        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_configuration()).await.unwrap());
        let (tx, _rx) = mpsc::channel(8);

        let first = offer_blob().await;
        let second = offer_blob().await;
        assert!(apply_remote_description(&pc, &first, "offer", &tx).await);
        assert!(!apply_remote_description(&pc, &second, "offer", &tx).await);

        let expected: RTCSessionDescription = serde_json::from_str(&first).unwrap();
        let applied = pc.remote_description().await.unwrap();
        assert_eq!(applied.sdp, expected.sdp);
    }

    #[tokio::test]
    async fn repeated_transitions_emit_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let state = Arc::new(Mutex::new(ConnectionState::New));
        transition(&state, &tx, ConnectionState::Negotiating).await;
        transition(&state, &tx, ConnectionState::Negotiating).await;

        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionEvent::StateChanged(ConnectionState::Negotiating))
        ));
        assert!(rx.try_recv().is_err());
    }
}
