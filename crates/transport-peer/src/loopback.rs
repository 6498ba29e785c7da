//! In-process transport pair.
//!
//! [`pair`] returns two factories whose transports talk to each other through
//! shared memory. Descriptions are small but well-formed SDP bodies carrying
//! an origin line and one `msid` line per attached track, and connectivity is
//! declared once both descriptions are in place and the remote side's
//! candidates are known. Handy for tests and for exercising application code
//! without a network stack. Operations can be made to fail on demand.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::{ChannelOptions, PeerConfig};
use crate::error::{TransportError, TransportResult};
use crate::sdp;
use crate::signal::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelPayload, ChannelState, IceConnectionState, LocalTrack,
    MediaStream, PeerTransport, RemoteTrackInfo, SenderId, TrackKind, TransportEvent,
    TransportEvents, TransportFactory,
};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(4_000_000_000);

#[derive(Default)]
struct Switchboard {
    endpoints: [Weak<LoopbackTransport>; 2],
}

/// Two factories wired to each other. Each side's most recent transport is
/// the peer of the other side's most recent transport.
pub fn pair() -> (LoopbackFactory, LoopbackFactory) {
    let board = Arc::new(Mutex::new(Switchboard::default()));
    (
        LoopbackFactory::new(0, Arc::clone(&board)),
        LoopbackFactory::new(1, board),
    )
}

pub struct LoopbackFactory {
    side: usize,
    board: Arc<Mutex<Switchboard>>,
    supported: bool,
    planned: Mutex<Vec<&'static str>>,
    delays: Mutex<Vec<(&'static str, Duration)>>,
    silent_completion: AtomicBool,
    latest: Mutex<Option<Arc<LoopbackTransport>>>,
}

impl LoopbackFactory {
    fn new(side: usize, board: Arc<Mutex<Switchboard>>) -> Self {
        Self {
            side,
            board,
            supported: true,
            planned: Mutex::new(Vec::new()),
            delays: Mutex::new(Vec::new()),
            silent_completion: AtomicBool::new(false),
            latest: Mutex::new(None),
        }
    }

    /// A factory reporting that no transport exists on this platform.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new(0, Arc::default())
        }
    }

    /// Makes `op` fail once on the next transport this factory creates.
    /// `"create"` fails the creation itself.
    pub fn fail_next(&self, op: &'static str) {
        self.planned.lock().push(op);
    }

    /// Holds the next call of `op` on the next transport for `delay` before
    /// it runs.
    pub fn delay_next(&self, op: &'static str, delay: Duration) {
        self.delays.lock().push((op, delay));
    }

    /// Transports created from now on never report that candidate gathering
    /// finished.
    pub fn silence_gathering_complete(&self) {
        self.silent_completion.store(true, Ordering::Relaxed);
    }

    /// The transport most recently created by this factory.
    pub fn latest(&self) -> Option<Arc<LoopbackTransport>> {
        self.latest.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn create(
        &self,
        _config: &PeerConfig,
    ) -> TransportResult<(Arc<dyn PeerTransport>, TransportEvents)> {
        let mut failures = std::mem::take(&mut *self.planned.lock());
        if let Some(index) = failures.iter().position(|op| *op == "create") {
            failures.remove(index);
            *self.planned.lock() = failures;
            return Err(TransportError::operation("create", "injected failure"));
        }
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(LoopbackTransport {
            side: self.side,
            session_id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            board: Arc::clone(&self.board),
            events,
            state: Mutex::new(EndpointState {
                failures,
                delays: std::mem::take(&mut *self.delays.lock()),
                silent_completion: self.silent_completion.load(Ordering::Relaxed),
                ..Default::default()
            }),
        });
        self.board.lock().endpoints[self.side] = Arc::downgrade(&transport);
        *self.latest.lock() = Some(Arc::clone(&transport));
        trace!(side = self.side, session = transport.session_id, "loopback transport created");
        Ok((transport as Arc<dyn PeerTransport>, rx))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Signaling {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct Sender {
    id: SenderId,
    track_id: String,
    stream_id: String,
    kind: TrackKind,
}

#[derive(Default)]
struct EndpointState {
    signaling: Signaling,
    version: u64,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    gathered: Vec<String>,
    remote_candidates: usize,
    ice_connected: bool,
    closed: bool,
    senders: Vec<Sender>,
    next_sender: u64,
    announced: HashSet<String>,
    channels: Vec<Arc<LoopbackChannel>>,
    next_channel_id: u16,
    failures: Vec<&'static str>,
    delays: Vec<(&'static str, Duration)>,
    silent_completion: bool,
}

pub struct LoopbackTransport {
    side: usize,
    session_id: u64,
    board: Arc<Mutex<Switchboard>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<EndpointState>,
}

impl LoopbackTransport {
    /// Makes the next call of `op` fail.
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().failures.push(op);
    }

    /// Reports a connectivity failure, as a real transport would after
    /// losing its path.
    pub fn fail_ice(&self) {
        self.emit(TransportEvent::ConnectionState(IceConnectionState::Failed));
    }

    /// Reports that queued work for `op` failed after its call returned.
    pub fn report_failure(&self, op: &'static str) {
        self.emit(TransportEvent::Failed(TransportError::operation(
            op,
            "reported failure",
        )));
    }

    /// Makes every channel of this transport refuse sends while staying open.
    pub fn refuse_channel_sends(&self) {
        for channel in &self.state.lock().channels {
            channel.link.lock().refusing = true;
        }
    }

    /// Remote candidates applied so far.
    pub fn remote_candidate_count(&self) -> usize {
        self.state.lock().remote_candidates
    }

    /// The last applied local description, without candidates.
    pub fn current_local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn peer(&self) -> Option<Arc<LoopbackTransport>> {
        self.board.lock().endpoints[1 - self.side].upgrade()
    }

    async fn stall(&self, op: &'static str) {
        let delay = {
            let mut state = self.state.lock();
            let index = state.delays.iter().position(|(planned, _)| *planned == op);
            index.map(|index| state.delays.remove(index).1)
        };
        if let Some(delay) = delay {
            trace!(side = self.side, op, ?delay, "delaying loopback call");
            tokio::time::sleep(delay).await;
        }
    }

    fn guard(&self, state: &mut EndpointState, op: &'static str) -> TransportResult<()> {
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(index) = state.failures.iter().position(|planned| *planned == op) {
            state.failures.remove(index);
            return Err(TransportError::operation(op, "injected failure"));
        }
        Ok(())
    }

    fn render(&self, state: &mut EndpointState) -> String {
        state.version += 1;
        let mut lines = vec![
            "v=0".to_string(),
            format!("o=- {} {} IN IP4 127.0.0.1", self.session_id, state.version),
            "s=-".to_string(),
            "t=0 0".to_string(),
            "m=application 9 UDP/DTLS/SCTP webrtc-datachannel".to_string(),
            "a=mid:0".to_string(),
        ];
        for (index, sender) in state.senders.iter().enumerate() {
            lines.push(format!("m={} 9 UDP/TLS/RTP/SAVPF 96", sender.kind.as_str()));
            lines.push(format!("a=mid:{}", index + 1));
            lines.push(format!("a=msid:{} {}", sender.stream_id, sender.track_id));
        }
        let mut body = lines.join("\r\n");
        body.push_str("\r\n");
        body
    }

    /// Declares connectivity once both descriptions are applied and the
    /// remote candidates are known, then opens pending local channels.
    fn check_ice(&self) {
        let unpaired = {
            let mut state = self.state.lock();
            if state.closed || state.ice_connected {
                return;
            }
            let Some(remote) = state.remote.as_ref() else {
                return;
            };
            let remote_has_candidates =
                state.remote_candidates > 0 || remote.sdp.contains("a=candidate:");
            if state.local.is_none() || !remote_has_candidates {
                return;
            }
            state.ice_connected = true;
            state
                .channels
                .iter()
                .filter(|channel| channel.local && !channel.is_paired())
                .cloned()
                .collect::<Vec<_>>()
        };
        trace!(side = self.side, "loopback connectivity established");
        self.emit(TransportEvent::ConnectionState(IceConnectionState::Checking));
        self.emit(TransportEvent::ConnectionState(IceConnectionState::Connected));
        for channel in unpaired {
            self.open_channel(&channel);
        }
    }

    fn open_channel(&self, channel: &Arc<LoopbackChannel>) {
        let Some(peer) = self.peer() else {
            return;
        };
        let counterpart = LoopbackChannel::new(
            channel.label.clone(),
            channel.options.clone(),
            channel.id,
            false,
        );
        channel.link(&counterpart);
        counterpart.link(channel);
        counterpart.open();
        channel.open();
        peer.state.lock().channels.push(Arc::clone(&counterpart));
        peer.emit(TransportEvent::DataChannel(counterpart));
    }

    fn gather(&self, state: &mut EndpointState) -> Vec<IceCandidate> {
        if !state.gathered.is_empty() {
            return Vec::new();
        }
        let base = 50_000 + self.side as u16 * 100;
        state.gathered = (1..=2u16)
            .map(|n| format!("candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host", base + n))
            .collect();
        state
            .gathered
            .iter()
            .map(|line| IceCandidate::new(line.clone()).with_mid("0", 0))
            .collect()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        self.stall("create_offer").await;
        let mut state = self.state.lock();
        self.guard(&mut state, "create_offer")?;
        Ok(SessionDescription::offer(self.render(&mut state)))
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        self.stall("create_answer").await;
        let mut state = self.state.lock();
        self.guard(&mut state, "create_answer")?;
        if state.signaling != Signaling::HaveRemoteOffer {
            return Err(TransportError::operation("create_answer", "no remote offer"));
        }
        Ok(SessionDescription::answer(self.render(&mut state)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> TransportResult<()> {
        self.stall("set_local_description").await;
        let (candidates, silent_completion) = {
            let mut state = self.state.lock();
            self.guard(&mut state, "set_local_description")?;
            state.signaling = match (description.kind, state.signaling) {
                (SdpType::Offer, Signaling::Stable | Signaling::HaveLocalOffer) => {
                    Signaling::HaveLocalOffer
                }
                (SdpType::Answer, Signaling::HaveRemoteOffer) => Signaling::Stable,
                (kind, current) => {
                    return Err(TransportError::operation(
                        "set_local_description",
                        format!("cannot apply local {kind:?} in {current:?}"),
                    ))
                }
            };
            state.local = Some(description);
            (self.gather(&mut state), state.silent_completion)
        };
        if !candidates.is_empty() {
            for candidate in candidates {
                self.emit(TransportEvent::LocalCandidate(Some(candidate)));
            }
            if !silent_completion {
                self.emit(TransportEvent::LocalCandidate(None));
            }
        }
        self.check_ice();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> TransportResult<()> {
        self.stall("set_remote_description").await;
        let announced = {
            let mut state = self.state.lock();
            self.guard(&mut state, "set_remote_description")?;
            state.signaling = match (description.kind, state.signaling) {
                // A remote offer in have-local-offer rolls the local one back.
                (SdpType::Offer, _) => Signaling::HaveRemoteOffer,
                (SdpType::Answer, Signaling::HaveLocalOffer) => Signaling::Stable,
                (kind, current) => {
                    return Err(TransportError::operation(
                        "set_remote_description",
                        format!("cannot apply remote {kind:?} in {current:?}"),
                    ))
                }
            };
            let identifiers = sdp::media_identifiers(&description.sdp);
            let fresh: Vec<RemoteTrackInfo> = identifiers
                .iter()
                .filter(|media| !state.announced.contains(&media.track_id))
                .map(|media| RemoteTrackInfo {
                    track_id: media.track_id.clone(),
                    kind: media.kind,
                    stream_ids: vec![media.stream_id.clone()],
                })
                .collect();
            state.announced = identifiers.into_iter().map(|m| m.track_id).collect();
            state.remote = Some(description);
            fresh
        };
        for info in announced {
            self.emit(TransportEvent::Track(info));
        }
        self.check_ice();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        {
            let mut state = self.state.lock();
            self.guard(&mut state, "add_ice_candidate")?;
            if state.remote.is_none() {
                return Err(TransportError::operation(
                    "add_ice_candidate",
                    "no remote description",
                ));
            }
            trace!(side = self.side, candidate = %candidate.candidate, "remote candidate");
            state.remote_candidates += 1;
        }
        self.check_ice();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        let mut description = state.local.clone()?;
        for line in &state.gathered {
            description.sdp.push_str("a=");
            description.sdp.push_str(line);
            description.sdp.push_str("\r\n");
        }
        Some(description)
    }

    fn create_data_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> TransportResult<Arc<dyn ChannelHandle>> {
        let (channel, open_now) = {
            let mut state = self.state.lock();
            self.guard(&mut state, "create_data_channel")?;
            let id = options.negotiated.unwrap_or(state.next_channel_id);
            state.next_channel_id += 2;
            let channel =
                LoopbackChannel::new(label.to_string(), options.clone(), Some(id), true);
            state.channels.push(Arc::clone(&channel));
            (channel, state.ice_connected)
        };
        if open_now {
            self.open_channel(&channel);
        }
        Ok(channel as Arc<dyn ChannelHandle>)
    }

    fn add_track(&self, track: &LocalTrack, stream: &MediaStream) -> TransportResult<SenderId> {
        let id = {
            let mut state = self.state.lock();
            self.guard(&mut state, "add_track")?;
            if state.senders.iter().any(|s| s.track_id == track.id()) {
                return Err(TransportError::operation("add_track", "track already sent"));
            }
            state.next_sender += 1;
            let id = SenderId(state.next_sender);
            state.senders.push(Sender {
                id,
                track_id: track.id().to_string(),
                stream_id: stream.id().to_string(),
                kind: track.kind(),
            });
            id
        };
        self.emit(TransportEvent::NegotiationNeeded);
        Ok(id)
    }

    fn remove_track(&self, sender: SenderId) -> TransportResult<()> {
        {
            let mut state = self.state.lock();
            self.guard(&mut state, "remove_track")?;
            let Some(index) = state.senders.iter().position(|s| s.id == sender) else {
                return Err(TransportError::operation("remove_track", "unknown sender"));
            };
            state.senders.remove(index);
        }
        self.emit(TransportEvent::NegotiationNeeded);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let channels = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            let _ = channel.close();
        }
        self.emit(TransportEvent::ConnectionState(IceConnectionState::Closed));
        Ok(())
    }
}

struct ChannelLink {
    state: ChannelState,
    paired: bool,
    refusing: bool,
    peer: Weak<LoopbackChannel>,
}

pub struct LoopbackChannel {
    label: String,
    options: ChannelOptions,
    id: Option<u16>,
    local: bool,
    link: Mutex<ChannelLink>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl LoopbackChannel {
    fn new(label: String, options: ChannelOptions, id: Option<u16>, local: bool) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label,
            options,
            id,
            local,
            link: Mutex::new(ChannelLink {
                state: ChannelState::Connecting,
                paired: false,
                refusing: false,
                peer: Weak::new(),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn is_paired(&self) -> bool {
        self.link.lock().paired
    }

    fn link(&self, peer: &Arc<LoopbackChannel>) {
        let mut link = self.link.lock();
        link.paired = true;
        link.peer = Arc::downgrade(peer);
    }

    fn open(&self) {
        {
            let mut link = self.link.lock();
            if link.state != ChannelState::Connecting {
                return;
            }
            link.state = ChannelState::Open;
        }
        let _ = self.events_tx.send(ChannelEvent::Open);
    }

    fn deliver(&self, payload: ChannelPayload) {
        if self.link.lock().state == ChannelState::Open {
            let _ = self.events_tx.send(ChannelEvent::Message(payload));
        }
    }

    /// Marks the channel closed; `true` for the call that closed it.
    fn shut(&self) -> bool {
        let mut link = self.link.lock();
        if link.state == ChannelState::Closed {
            return false;
        }
        link.state = ChannelState::Closed;
        true
    }
}

impl ChannelHandle for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn options(&self) -> ChannelOptions {
        self.options.clone()
    }

    fn id(&self) -> Option<u16> {
        self.id
    }

    fn ready_state(&self) -> ChannelState {
        self.link.lock().state
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    fn send(&self, payload: ChannelPayload) -> TransportResult<()> {
        let peer = {
            let link = self.link.lock();
            if link.state != ChannelState::Open {
                return Err(TransportError::operation("send", "channel is not open"));
            }
            if link.refusing {
                return Err(TransportError::operation("send", "injected failure"));
            }
            link.peer.upgrade()
        };
        let peer = peer.ok_or(TransportError::Closed)?;
        peer.deliver(payload);
        Ok(())
    }

    fn close(&self) -> TransportResult<()> {
        if !self.shut() {
            return Ok(());
        }
        let _ = self.events_tx.send(ChannelEvent::Close);
        let peer = self.link.lock().peer.upgrade();
        if let Some(peer) = peer {
            if peer.shut() {
                let _ = peer.events_tx.send(ChannelEvent::Close);
            }
        }
        Ok(())
    }
}
