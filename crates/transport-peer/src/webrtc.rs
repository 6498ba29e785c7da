//! [`PeerTransport`] backed by the `webrtc` crate.
//!
//! Every call into the native peer connection runs on one worker task, in
//! the order the calls were made. The synchronous trait methods (channel
//! creation, track attach/detach) only enqueue their work, so a channel
//! created right before `create_offer` is still part of that offer.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::config::{ChannelOptions, IceServer, PeerConfig};
use crate::error::{TransportError, TransportResult};
use crate::signal::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelPayload, ChannelState, IceConnectionState, LocalTrack,
    MediaStream, PeerTransport, RemoteTrackInfo, SenderId, TrackKind, TransportEvent,
    TransportEvents, TransportFactory,
};

/// Media source attached to a [`LocalTrack`] via
/// [`LocalTrack::with_source`]. The stream id is carried by the native track.
#[derive(Clone)]
pub struct WebRtcTrackSource(pub Arc<dyn TrackLocal + Send + Sync>);

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

fn op_error(op: &'static str) -> impl Fn(webrtc::Error) -> TransportError {
    move |err| TransportError::operation(op, err.to_string())
}

pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    /// Builds the native API with the default codecs and interceptors.
    pub fn new() -> TransportResult<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(op_error("register_default_codecs"))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(op_error("register_default_interceptors"))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }

    pub fn with_api(api: API) -> Self {
        Self { api }
    }
}

fn rtc_configuration(config: &PeerConfig) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server: &IceServer| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    let mut rtc = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    if let Some(size) = config
        .transport_config
        .get("iceCandidatePoolSize")
        .and_then(|value| value.as_u64())
    {
        rtc.ice_candidate_pool_size = size.min(u8::MAX as u64) as u8;
    }
    rtc
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> TransportResult<(Arc<dyn PeerTransport>, TransportEvents)> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(config))
                .await
                .map_err(op_error("new_peer_connection"))?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        install_handlers(&pc, &events_tx);

        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = jobs_rx.recv().await {
                job.await;
            }
            trace!("webrtc worker stopped");
        });

        let transport = WebRtcTransport {
            pc,
            jobs: jobs_tx,
            events: events_tx,
            senders: Arc::new(Mutex::new(HashMap::new())),
            next_sender: AtomicU64::new(1),
        };
        debug!("webrtc peer connection created");
        Ok((Arc::new(transport) as Arc<dyn PeerTransport>, events_rx))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: &mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let event = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => TransportEvent::LocalCandidate(Some(IceCandidate {
                        candidate: init.candidate,
                        sdp_m_line_index: init.sdp_mline_index,
                        sdp_mid: init.sdp_mid,
                    })),
                    Err(err) => {
                        warn!(error = %err, "dropping unserializable local candidate");
                        return;
                    }
                },
                None => TransportEvent::LocalCandidate(None),
            };
            let _ = tx.send(event);
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let mapped = match state {
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
            _ => IceConnectionState::New,
        };
        let _ = tx.send(TransportEvent::ConnectionState(mapped));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let channel = WebRtcChannel::pending(dc.label().to_string(), options_of(&dc));
        channel.attach(dc);
        let _ = tx.send(TransportEvent::DataChannel(channel));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Other,
        };
        let _ = tx.send(TransportEvent::Track(RemoteTrackInfo {
            track_id: track.id(),
            kind,
            stream_ids: vec![track.stream_id()],
        }));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let _ = tx.send(TransportEvent::NegotiationNeeded);
        Box::pin(async {})
    }));
}

fn options_of(dc: &RTCDataChannel) -> ChannelOptions {
    ChannelOptions {
        ordered: dc.ordered(),
        max_packet_life_time: Some(dc.max_packet_lifetime()).filter(|ms| *ms != 0),
        max_retransmits: Some(dc.max_retransmits()).filter(|count| *count != 0),
        protocol: dc.protocol().to_string(),
        negotiated: dc.negotiated().then(|| dc.id()),
    }
}

fn to_native(description: SessionDescription) -> TransportResult<RTCSessionDescription> {
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(op_error("parse_description"))
}

fn from_native(description: RTCSessionDescription) -> TransportResult<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(TransportError::operation(
            "local_description",
            format!("unexpected description type {other}"),
        )),
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    jobs: mpsc::UnboundedSender<Job>,
    events: mpsc::UnboundedSender<TransportEvent>,
    senders: Arc<Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>>,
    next_sender: AtomicU64,
}

impl WebRtcTransport {
    fn enqueue(&self, job: impl Future<Output = ()> + Send + 'static) -> TransportResult<()> {
        self.jobs
            .send(Box::pin(job))
            .map_err(|_| TransportError::Closed)
    }

    /// Runs `op` on the worker after everything queued before it.
    async fn call<T, F, Fut>(&self, op: F) -> TransportResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<RTCPeerConnection>) -> Fut + Send + 'static,
        Fut: Future<Output = TransportResult<T>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let pc = Arc::clone(&self.pc);
        self.enqueue(async move {
            let _ = reply.send(op(pc).await);
        })?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        self.call(|pc| async move {
            let offer = pc.create_offer(None).await.map_err(op_error("create_offer"))?;
            from_native(offer)
        })
        .await
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        self.call(|pc| async move {
            let answer = pc
                .create_answer(None)
                .await
                .map_err(op_error("create_answer"))?;
            from_native(answer)
        })
        .await
    }

    async fn set_local_description(&self, description: SessionDescription) -> TransportResult<()> {
        let native = to_native(description)?;
        self.call(|pc| async move {
            pc.set_local_description(native)
                .await
                .map_err(op_error("set_local_description"))
        })
        .await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> TransportResult<()> {
        let native = to_native(description)?;
        self.call(|pc| async move {
            pc.set_remote_description(native)
                .await
                .map_err(op_error("set_remote_description"))
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.call(|pc| async move {
            pc.add_ice_candidate(init)
                .await
                .map_err(op_error("add_ice_candidate"))
        })
        .await
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let native = self.pc.local_description().await?;
        from_native(native).ok()
    }

    fn create_data_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> TransportResult<Arc<dyn ChannelHandle>> {
        let channel = WebRtcChannel::pending(label.to_string(), options.clone());
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_packet_life_time: options.max_packet_life_time,
            max_retransmits: options.max_retransmits,
            protocol: Some(options.protocol.clone()),
            negotiated: options.negotiated,
        };
        let pc = Arc::clone(&self.pc);
        let label = label.to_string();
        let pending = Arc::clone(&channel);
        let events = self.events.clone();
        self.enqueue(async move {
            match pc.create_data_channel(&label, Some(init)).await {
                Ok(dc) => pending.attach(dc),
                Err(err) => {
                    warn!(%label, error = %err, "data channel creation failed");
                    pending.fail(err.to_string());
                    let failure = op_error("create_data_channel")(err);
                    let _ = events.send(TransportEvent::Failed(failure));
                }
            }
        })?;
        Ok(channel as Arc<dyn ChannelHandle>)
    }

    fn add_track(&self, track: &LocalTrack, _stream: &MediaStream) -> TransportResult<SenderId> {
        let source = track
            .source::<WebRtcTrackSource>()
            .ok_or_else(|| TransportError::operation("add_track", "track has no webrtc source"))?;
        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        let pc = Arc::clone(&self.pc);
        let senders = Arc::clone(&self.senders);
        let track_id = track.id().to_string();
        let events = self.events.clone();
        self.enqueue(async move {
            match pc.add_track(Arc::clone(&source.0)).await {
                Ok(sender) => {
                    senders.lock().insert(id, sender);
                }
                Err(err) => {
                    warn!(%track_id, error = %err, "attaching track failed");
                    let _ = events.send(TransportEvent::Failed(op_error("add_track")(err)));
                }
            }
        })?;
        Ok(id)
    }

    fn remove_track(&self, sender: SenderId) -> TransportResult<()> {
        let pc = Arc::clone(&self.pc);
        let senders = Arc::clone(&self.senders);
        let events = self.events.clone();
        self.enqueue(async move {
            let removed = senders.lock().remove(&sender);
            let Some(native) = removed else {
                warn!(sender = sender.0, "detaching unknown sender");
                let _ = events.send(TransportEvent::Failed(TransportError::operation(
                    "remove_track",
                    "unknown sender",
                )));
                return;
            };
            if let Err(err) = pc.remove_track(&native).await {
                warn!(sender = sender.0, error = %err, "detaching track failed");
                let _ = events.send(TransportEvent::Failed(op_error("remove_track")(err)));
            }
        })
    }

    async fn close(&self) -> TransportResult<()> {
        let _ = self.events.send(TransportEvent::ConnectionState(IceConnectionState::Closed));
        self.pc.close().await.map_err(op_error("close"))
    }
}

struct ChannelInner {
    native: Option<Arc<RTCDataChannel>>,
    state: ChannelState,
}

/// [`ChannelHandle`] over an `RTCDataChannel` that may still be in creation.
/// Outbound payloads go through a per-channel sender loop so they keep their
/// order.
pub struct WebRtcChannel {
    label: String,
    options: ChannelOptions,
    inner: Mutex<ChannelInner>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ChannelPayload>>>,
}

impl WebRtcChannel {
    fn pending(label: String, options: ChannelOptions) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label,
            options,
            inner: Mutex::new(ChannelInner {
                native: None,
                state: ChannelState::Connecting,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            outbound: Mutex::new(None),
        })
    }

    fn attach(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let open_now = dc.ready_state() == RTCDataChannelState::Open;

        let weak = Arc::downgrade(self);
        dc.on_open(Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                channel.opened();
            }
            Box::pin(async {})
        }));
        let tx = self.events_tx.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let payload = if message.is_string {
                ChannelPayload::Text(String::from_utf8_lossy(&message.data).into_owned())
            } else {
                ChannelPayload::Binary(message.data)
            };
            let _ = tx.send(ChannelEvent::Message(payload));
            Box::pin(async {})
        }));
        let tx = self.events_tx.clone();
        dc.on_error(Box::new(move |err| {
            let _ = tx.send(ChannelEvent::Error(err.to_string()));
            Box::pin(async {})
        }));
        let weak = Arc::downgrade(self);
        dc.on_close(Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                channel.closed();
            }
            Box::pin(async {})
        }));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ChannelPayload>();
        let sender = Arc::clone(&dc);
        let label = self.label.clone();
        tokio::spawn(async move {
            while let Some(payload) = outbound_rx.recv().await {
                let result = match payload {
                    ChannelPayload::Text(text) => sender.send_text(text).await,
                    ChannelPayload::Binary(bytes) => sender.send(&bytes).await,
                };
                if let Err(err) = result {
                    warn!(%label, error = %err, "data channel send failed");
                }
            }
        });
        *self.outbound.lock() = Some(outbound_tx);
        self.inner.lock().native = Some(dc);
        if open_now {
            self.opened();
        }
    }

    fn opened(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != ChannelState::Connecting {
                return;
            }
            inner.state = ChannelState::Open;
        }
        let _ = self.events_tx.send(ChannelEvent::Open);
    }

    fn closed(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Closed;
        }
        self.outbound.lock().take();
        let _ = self.events_tx.send(ChannelEvent::Close);
    }

    fn fail(&self, reason: String) {
        let _ = self.events_tx.send(ChannelEvent::Error(reason));
        self.closed();
    }
}

impl ChannelHandle for WebRtcChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn options(&self) -> ChannelOptions {
        self.options.clone()
    }

    fn id(&self) -> Option<u16> {
        self.inner.lock().native.as_ref().map(|dc| dc.id())
    }

    fn ready_state(&self) -> ChannelState {
        self.inner.lock().state
    }

    fn buffered_amount(&self) -> usize {
        // The native counter is only reachable asynchronously.
        0
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    fn send(&self, payload: ChannelPayload) -> TransportResult<()> {
        if self.ready_state() != ChannelState::Open {
            return Err(TransportError::operation("send", "channel is not open"));
        }
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(TransportError::Closed)?;
        sender.send(payload).map_err(|_| TransportError::Closed)
    }

    fn close(&self) -> TransportResult<()> {
        let native = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ChannelState::Closing | ChannelState::Closed) {
                return Ok(());
            }
            inner.state = ChannelState::Closing;
            inner.native.clone()
        };
        match native {
            Some(dc) => {
                tokio::spawn(async move {
                    if let Err(err) = dc.close().await {
                        trace!(error = %err, "ignoring data channel close failure");
                    }
                });
            }
            None => self.closed(),
        }
        Ok(())
    }
}
