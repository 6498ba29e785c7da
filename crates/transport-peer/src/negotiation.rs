//! The per-peer negotiation actor.
//!
//! A single task owns all connection state. Commands from the [`Peer`]
//! handle, transport and internal-channel events, timer expiries and the
//! completions of asynchronous transport calls all arrive on one queue and are
//! handled one at a time, so no two handlers ever interleave.
//!
//! Asynchronous transport calls run on spawned tasks that post their result
//! back as a [`Step`]. Every connection attempt has its own epoch; inputs
//! tagged with a stale epoch are dropped, and in-flight calls check a
//! [`Ticket`] between awaits so they stop touching a transport that has been
//! torn down. Within a connection, a description generation counter plays the
//! same role for descriptions that were superseded by a newer one.
//!
//! [`Peer`]: crate::Peer

use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::DataChannel;
use crate::config::{CandidateMode, ChannelOptions, PeerConfig, Role, INTERNAL_CHANNEL_LABEL};
use crate::error::{PeerError, TransportError, TransportResult};
use crate::media::{Ended, RemoteMedia};
use crate::peer::PeerEvent;
use crate::sdp;
use crate::signal::{IceCandidate, SessionDescription, SignalInput, SignalMessage};
use crate::tracks::TrackQueue;
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelPayload, ChannelState, IceConnectionState, LocalTrack,
    MediaStream, PeerTransport, RemoteTrackInfo, TransportEvent, TransportEvents,
    TransportFactory,
};

/// Negotiation progress of the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    Closed,
}

pub(crate) enum Command {
    Connect {
        remote: Option<String>,
    },
    Signal(SignalInput),
    Disconnect,
    Close,
    CreateDataChannel {
        label: String,
        options: Option<ChannelOptions>,
        reply: oneshot::Sender<Result<DataChannel, PeerError>>,
    },
    AddTrack {
        track: LocalTrack,
        stream: MediaStream,
    },
    RemoveTrack {
        track_id: String,
    },
    Renegotiate,
    Phase {
        reply: oneshot::Sender<Phase>,
    },
    Shutdown,
}

pub(crate) enum Input {
    Command(Command),
    Transport { epoch: u64, event: TransportEvent },
    Channel { epoch: u64, event: ChannelEvent },
    Step { epoch: u64, step: Step },
    Timer { epoch: u64, timer: TimerKind, token: u64 },
}

/// Completion of an asynchronous transport call chain.
pub(crate) enum Step {
    TransportCreated(TransportResult<(Arc<dyn PeerTransport>, TransportEvents)>),
    /// A local offer; applied locally already unless it is a renegotiation.
    OfferReady {
        serial: u64,
        result: TransportResult<SessionDescription>,
    },
    RemoteOfferApplied {
        generation: u64,
        result: TransportResult<()>,
    },
    /// An answer, created and applied locally.
    AnswerReady {
        generation: u64,
        result: TransportResult<SessionDescription>,
    },
    AnswerApplied {
        generation: u64,
        answer: SessionDescription,
        result: TransportResult<()>,
    },
    CandidatesApplied(TransportResult<()>),
    LocalDescriptionRead {
        generation: u64,
        description: Option<SessionDescription>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Gather,
    Negotiation,
}

/// Issues [`Ticket`]s and invalidates all of them at once.
#[derive(Default)]
struct Lease(Arc<AtomicU64>);

impl Lease {
    fn ticket(&self) -> Ticket {
        Ticket {
            issued: self.0.load(Ordering::Acquire),
            current: Arc::clone(&self.0),
        }
    }

    fn revoke(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
struct Ticket {
    issued: u64,
    current: Arc<AtomicU64>,
}

impl Ticket {
    fn check(&self) -> TransportResult<()> {
        if self.current.load(Ordering::Acquire) == self.issued {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[derive(Default)]
struct TimerSlot {
    token: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    /// (Re)starts the timer; a pending expiry is discarded.
    fn arm(
        &mut self,
        inputs: &mpsc::UnboundedSender<Input>,
        epoch: u64,
        timer: TimerKind,
        after: Duration,
    ) {
        self.cancel();
        let token = self.token;
        let inputs = inputs.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inputs.send(Input::Timer {
                epoch,
                timer,
                token,
            });
        }));
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.token += 1;
    }

    /// Consumes an expiry; `false` when it belongs to a cancelled arming.
    fn fire(&mut self, token: u64) -> bool {
        if self.handle.is_some() && self.token == token {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

/// Release state of the local description sent through the caller's relay.
#[derive(Default)]
struct Outbound {
    pending: Option<SessionDescription>,
    released: bool,
    held: Vec<(u64, IceCandidate)>,
    gathering_complete: bool,
    reading: bool,
}

/// One connection attempt, from `connect` to teardown.
struct Connection {
    epoch: u64,
    role: Role,
    transport: Option<Arc<dyn PeerTransport>>,
    lease: Lease,
    offer_lease: Lease,
    internal: Option<Arc<dyn ChannelHandle>>,
    channel_open: bool,
    ice_connected: bool,
    /// The initial exchange finished on this side.
    settled: bool,
    established: bool,
    generation: u64,
    local_offer: Option<SessionDescription>,
    offer_serial: u64,
    offer_pending: bool,
    answer_pending: bool,
    remote_offer: Option<SessionDescription>,
    last_remote_offer: Option<String>,
    remote_described: bool,
    negotiation_needed: bool,
    outbound: Outbound,
    inbound_candidates: Vec<(u64, IceCandidate)>,
    deferred: VecDeque<SignalMessage>,
    gather_timer: TimerSlot,
    negotiation_timer: TimerSlot,
    pumps: Vec<JoinHandle<()>>,
}

impl Connection {
    fn new(epoch: u64, role: Role) -> Self {
        Self {
            epoch,
            role,
            transport: None,
            lease: Lease::default(),
            offer_lease: Lease::default(),
            internal: None,
            channel_open: false,
            ice_connected: false,
            settled: false,
            established: false,
            generation: 0,
            local_offer: None,
            offer_serial: 0,
            offer_pending: false,
            answer_pending: false,
            remote_offer: None,
            last_remote_offer: None,
            remote_described: false,
            negotiation_needed: false,
            outbound: Outbound::default(),
            inbound_candidates: Vec::new(),
            deferred: VecDeque::new(),
            gather_timer: TimerSlot::default(),
            negotiation_timer: TimerSlot::default(),
            pumps: Vec::new(),
        }
    }
}

/// Decides a glare: `true` when the local offer survives.
///
/// The offer with the greater origin version wins, then the greater session
/// id. When either key is missing or both are equal, the initiator's offer
/// wins.
pub(crate) fn local_offer_wins(
    local: &SessionDescription,
    remote: &SessionDescription,
    role: Role,
) -> bool {
    match (local.ordering_key(), remote.ordering_key()) {
        (Some(local), Some(remote)) if local != remote => local > remote,
        _ => role.is_initiator(),
    }
}

#[derive(Clone)]
pub(crate) struct Emitter(mpsc::UnboundedSender<PeerEvent>);

impl Emitter {
    pub(crate) fn new(sender: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self(sender)
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.0.send(event);
    }

    fn error(&self, err: PeerError) {
        warn!(error = %err, "peer error");
        self.emit(PeerEvent::Error(err));
    }
}

fn spawn_step<F>(inputs: &mpsc::UnboundedSender<Input>, epoch: u64, future: F)
where
    F: Future<Output = Step> + Send + 'static,
{
    let inputs = inputs.clone();
    tokio::spawn(async move {
        let step = future.await;
        let _ = inputs.send(Input::Step { epoch, step });
    });
}

async fn produce_offer(
    transport: Arc<dyn PeerTransport>,
    tickets: [Ticket; 2],
    apply_locally: bool,
) -> TransportResult<SessionDescription> {
    let offer = transport.create_offer().await?;
    if apply_locally {
        for ticket in &tickets {
            ticket.check()?;
        }
        transport.set_local_description(offer.clone()).await?;
    }
    Ok(offer)
}

async fn produce_answer(
    transport: Arc<dyn PeerTransport>,
    ticket: Ticket,
) -> TransportResult<SessionDescription> {
    let answer = transport.create_answer().await?;
    ticket.check()?;
    transport.set_local_description(answer.clone()).await?;
    Ok(answer)
}

async fn apply_answer(
    transport: Arc<dyn PeerTransport>,
    ticket: Ticket,
    held_offer: Option<SessionDescription>,
    answer: SessionDescription,
) -> TransportResult<()> {
    if let Some(offer) = held_offer {
        transport.set_local_description(offer).await?;
        ticket.check()?;
    }
    transport.set_remote_description(answer).await
}

async fn apply_candidates(
    transport: Arc<dyn PeerTransport>,
    ticket: Ticket,
    candidates: Vec<IceCandidate>,
) -> TransportResult<()> {
    for candidate in candidates {
        ticket.check()?;
        transport.add_ice_candidate(candidate).await?;
    }
    Ok(())
}

fn pump<T, F>(mut events: mpsc::UnboundedReceiver<T>, inputs: mpsc::UnboundedSender<Input>, wrap: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Input + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if inputs.send(wrap(event)).is_err() {
                break;
            }
        }
    })
}

pub(crate) struct Negotiator {
    id: String,
    config: PeerConfig,
    factory: Arc<dyn TransportFactory>,
    inputs: mpsc::UnboundedSender<Input>,
    events: Emitter,
    phase: Phase,
    conn: Option<Connection>,
    tracks: TrackQueue,
    remote: RemoteMedia,
    next_epoch: u64,
    shut: bool,
}

impl Negotiator {
    pub(crate) fn new(
        id: String,
        config: PeerConfig,
        factory: Arc<dyn TransportFactory>,
        inputs: mpsc::UnboundedSender<Input>,
        events: Emitter,
    ) -> Self {
        Self {
            id,
            config,
            factory,
            inputs,
            events,
            phase: Phase::Idle,
            conn: None,
            tracks: TrackQueue::default(),
            remote: RemoteMedia::default(),
            next_epoch: 0,
            shut: false,
        }
    }

    pub(crate) async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            match input {
                Input::Command(Command::Shutdown) => break,
                Input::Command(command) => self.handle_command(command),
                Input::Transport { epoch, event } => {
                    if self.is_current(epoch) {
                        self.handle_transport_event(event);
                    }
                }
                Input::Channel { epoch, event } => {
                    if self.is_current(epoch) {
                        self.handle_channel_event(event);
                    }
                }
                Input::Step { epoch, step } => {
                    if self.is_current(epoch) {
                        self.handle_step(step);
                    } else {
                        discard_step(step);
                    }
                }
                Input::Timer {
                    epoch,
                    timer,
                    token,
                } => {
                    if self.is_current(epoch) {
                        self.handle_timer(timer, token);
                    }
                }
            }
        }
        self.teardown();
        debug!(peer_id = %self.id, "negotiator stopped");
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.epoch == epoch)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { remote } => self.connect(remote),
            Command::Signal(input) => self.signal(input),
            Command::Disconnect => self.teardown(),
            Command::Close => self.close(),
            Command::CreateDataChannel {
                label,
                options,
                reply,
            } => {
                let _ = reply.send(self.create_data_channel(&label, options));
            }
            Command::AddTrack { track, stream } => self.add_track(track, stream),
            Command::RemoveTrack { track_id } => self.remove_track(&track_id),
            Command::Renegotiate => self.request_negotiation("requested"),
            Command::Phase { reply } => {
                let _ = reply.send(self.phase);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_step(&mut self, step: Step) {
        match step {
            Step::TransportCreated(result) => self.transport_created(result),
            Step::OfferReady { serial, result } => self.offer_ready(serial, result),
            Step::RemoteOfferApplied { generation, result } => {
                self.remote_offer_applied(generation, result)
            }
            Step::AnswerReady { generation, result } => self.answer_ready(generation, result),
            Step::AnswerApplied {
                generation,
                answer,
                result,
            } => self.answer_applied(generation, answer, result),
            Step::CandidatesApplied(result) => {
                if let Err(err) = result {
                    self.fail(err);
                }
            }
            Step::LocalDescriptionRead {
                generation,
                description,
            } => self.local_description_read(generation, description),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        trace!(peer_id = %self.id, ?event, "transport event");
        match event {
            TransportEvent::LocalCandidate(candidate) => self.local_candidate(candidate),
            TransportEvent::ConnectionState(state) => self.connection_state(state),
            TransportEvent::DataChannel(channel) => self.remote_channel(channel),
            TransportEvent::Track(info) => self.remote_track(info),
            TransportEvent::NegotiationNeeded => self.request_negotiation("transport"),
            TransportEvent::Failed(err) => self.fail(err),
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                debug!(peer_id = %self.id, "internal channel open");
                if let Some(conn) = self.conn.as_mut() {
                    conn.channel_open = true;
                }
                self.maybe_connected();
            }
            ChannelEvent::Message(payload) => self.in_band_message(payload),
            ChannelEvent::Error(reason) => {
                warn!(peer_id = %self.id, %reason, "internal channel error");
            }
            ChannelEvent::Close => {
                debug!(peer_id = %self.id, "internal channel closed");
                self.teardown();
            }
        }
    }

    fn handle_timer(&mut self, timer: TimerKind, token: u64) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let slot = match timer {
            TimerKind::Gather => &mut conn.gather_timer,
            TimerKind::Negotiation => &mut conn.negotiation_timer,
        };
        if !slot.fire(token) {
            return;
        }
        match timer {
            TimerKind::Gather => self.gathering_finished("debounce elapsed"),
            TimerKind::Negotiation => {
                if self.phase != Phase::Connected {
                    conn.negotiation_needed = true;
                    return;
                }
                conn.negotiation_needed = false;
                self.start_offer();
            }
        }
    }

    // ---- lifecycle -------------------------------------------------------

    fn connect(&mut self, remote: Option<String>) {
        if self.shut {
            self.events
                .error(PeerError::invalid_state("peer is closed"));
            return;
        }
        self.teardown();
        let role = match remote.as_deref() {
            Some(remote) => match Role::from_ids(&self.id, remote) {
                Some(role) => role,
                None => {
                    self.events.error(PeerError::invalid_state(
                        "cannot connect two peers with the same id",
                    ));
                    return;
                }
            },
            None => self.config.role,
        };
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.phase = if role.is_initiator() {
            Phase::HaveLocalOffer
        } else {
            Phase::Idle
        };
        self.conn = Some(Connection::new(epoch, role));
        info!(peer_id = %self.id, epoch, ?role, "connecting");

        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        spawn_step(&self.inputs, epoch, async move {
            Step::TransportCreated(factory.create(&config).await)
        });
    }

    fn transport_created(
        &mut self,
        result: TransportResult<(Arc<dyn PeerTransport>, TransportEvents)>,
    ) {
        let (transport, events) = match result {
            Ok(created) => created,
            Err(err) => return self.fail(err),
        };
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let epoch = conn.epoch;
        conn.pumps.push(pump(events, self.inputs.clone(), move |event| {
            Input::Transport { epoch, event }
        }));
        conn.transport = Some(Arc::clone(&transport));
        let initiator = conn.role.is_initiator();
        debug!(peer_id = %self.id, epoch, "transport ready");

        if initiator {
            match transport.create_data_channel(INTERNAL_CHANNEL_LABEL, &ChannelOptions::default())
            {
                Ok(channel) => self.attach_internal(channel),
                Err(err) => return self.fail(err),
            }
            self.start_offer();
        }
        self.replay_deferred();
    }

    fn attach_internal(&mut self, channel: Arc<dyn ChannelHandle>) {
        let Some(conn) = self.conn.as_mut() else {
            let _ = channel.close();
            return;
        };
        let epoch = conn.epoch;
        match channel.take_events() {
            Some(events) => conn.pumps.push(pump(events, self.inputs.clone(), move |event| {
                Input::Channel { epoch, event }
            })),
            None => warn!(peer_id = %self.id, "internal channel events already taken"),
        }
        let open = channel.ready_state() == ChannelState::Open;
        conn.internal = Some(channel);
        if open {
            conn.channel_open = true;
            self.maybe_connected();
        }
    }

    fn maybe_connected(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.established || !(conn.settled && conn.channel_open && conn.ice_connected) {
            return;
        }
        conn.established = true;
        conn.local_offer = None;
        conn.remote_offer = None;
        self.phase = Phase::Connected;
        info!(peer_id = %self.id, epoch = conn.epoch, "connected");
        self.events.emit(PeerEvent::Connect);
        self.after_settle();
    }

    /// Runs once no negotiation is in flight: queued track changes first,
    /// then any renegotiation that was owed.
    fn after_settle(&mut self) {
        self.drain_tracks();
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if mem::take(&mut conn.negotiation_needed) {
            self.request_negotiation("owed");
        }
    }

    fn finish_negotiation(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.local_offer = None;
            conn.remote_offer = None;
            debug!(peer_id = %self.id, epoch = conn.epoch, "negotiation complete");
        }
        self.phase = Phase::Connected;
        self.after_settle();
    }

    fn teardown(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        conn.lease.revoke();
        conn.offer_lease.revoke();
        conn.gather_timer.cancel();
        conn.negotiation_timer.cancel();
        for pump in conn.pumps.drain(..) {
            pump.abort();
        }
        self.tracks.requeue_active();
        let ended = self.remote.clear();
        self.emit_ended(ended);
        if let Some(channel) = conn.internal.take() {
            if let Err(err) = channel.close() {
                trace!(peer_id = %self.id, error = %err, "ignoring internal channel close failure");
            }
        }
        if let Some(transport) = conn.transport.take() {
            let peer_id = self.id.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.close().await {
                    trace!(%peer_id, error = %err, "ignoring transport close failure");
                }
            });
        }
        self.phase = Phase::Closed;
        info!(
            peer_id = %self.id,
            epoch = conn.epoch,
            established = conn.established,
            "connection closed"
        );
        if conn.established {
            self.events.emit(PeerEvent::Disconnect);
        }
    }

    fn close(&mut self) {
        if self.shut {
            return;
        }
        self.teardown();
        self.shut = true;
        self.phase = Phase::Closed;
        self.events.emit(PeerEvent::Close);
    }

    fn report(&mut self, err: PeerError) {
        let fatal = err.is_fatal();
        self.events.error(err);
        if fatal {
            self.teardown();
        }
    }

    fn fail(&mut self, err: TransportError) {
        self.report(PeerError::Transport(err));
    }

    // ---- offers and answers ----------------------------------------------

    fn start_offer(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let Some(transport) = conn.transport.clone() else {
            return;
        };
        conn.offer_serial += 1;
        conn.offer_pending = true;
        conn.local_offer = None;
        let serial = conn.offer_serial;
        let renegotiation = conn.established;
        let tickets = [conn.lease.ticket(), conn.offer_lease.ticket()];
        self.phase = Phase::HaveLocalOffer;
        debug!(peer_id = %self.id, epoch = conn.epoch, serial, renegotiation, "creating offer");
        spawn_step(&self.inputs, conn.epoch, async move {
            Step::OfferReady {
                serial,
                result: produce_offer(transport, tickets, !renegotiation).await,
            }
        });
    }

    fn offer_ready(&mut self, serial: u64, result: TransportResult<SessionDescription>) {
        {
            let Some(conn) = self.conn.as_mut() else {
                return;
            };
            if !conn.offer_pending || conn.offer_serial != serial {
                debug!(peer_id = %self.id, serial, "dropping superseded offer");
                return;
            }
            conn.offer_pending = false;
        }
        let offer = match result {
            Ok(offer) => offer,
            Err(err) => return self.fail(err),
        };
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.local_offer = Some(offer.clone());
        if conn.established {
            self.send_in_band(offer.into());
        } else {
            self.release_local(offer);
        }
    }

    fn signal(&mut self, input: SignalInput) {
        if self.shut || (self.phase == Phase::Closed && self.conn.is_none()) {
            self.events.error(PeerError::PostCloseSignal);
            return;
        }
        let message = match input.decode() {
            Ok(message) => message,
            Err(err) => return self.events.error(err),
        };
        let Some(conn) = self.conn.as_mut() else {
            match message {
                SignalMessage::Candidate(_) => {
                    trace!(peer_id = %self.id, "dropping candidate without a connection")
                }
                SignalMessage::Description(_) => self.events.error(PeerError::invalid_state(
                    "description received before connect",
                )),
            }
            return;
        };
        if conn.transport.is_none() {
            conn.deferred.push_back(message);
            return;
        }
        self.dispatch_signal(message);
    }

    fn dispatch_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::Description(description) if description.is_offer() => {
                self.receive_offer(description)
            }
            SignalMessage::Description(description) => self.receive_answer(description),
            SignalMessage::Candidate(candidate) => self.receive_candidate(candidate),
        }
    }

    fn replay_deferred(&mut self) {
        loop {
            let Some(conn) = self.conn.as_mut() else {
                return;
            };
            if conn.transport.is_none() || conn.answer_pending {
                return;
            }
            let Some(message) = conn.deferred.pop_front() else {
                return;
            };
            self.dispatch_signal(message);
        }
    }

    fn receive_offer(&mut self, offer: SessionDescription) {
        let phase = self.phase;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.last_remote_offer.as_deref() == Some(offer.sdp.as_str()) {
            debug!(peer_id = %self.id, "ignoring retransmitted offer");
            return;
        }
        if phase == Phase::HaveLocalOffer {
            if conn.answer_pending {
                // Our own exchange is about to settle; look at this one after.
                conn.deferred.push_back(offer.into());
                return;
            }
            if let Some(local) = conn.local_offer.as_ref() {
                if local_offer_wins(local, &offer, conn.role) {
                    debug!(peer_id = %self.id, "glare: keeping local offer");
                    return;
                }
                debug!(peer_id = %self.id, "glare: yielding to remote offer");
                conn.local_offer = None;
                conn.negotiation_needed = conn.established;
            } else if conn.offer_pending {
                debug!(peer_id = %self.id, "glare: abandoning local offer in production");
                conn.offer_pending = false;
                conn.offer_lease.revoke();
                conn.negotiation_needed = conn.established;
            }
        }

        conn.generation += 1;
        if !conn.established {
            conn.settled = false;
        }
        conn.remote_offer = Some(offer.clone());
        conn.last_remote_offer = Some(offer.sdp.clone());
        let Some(transport) = conn.transport.clone() else {
            return;
        };
        let generation = conn.generation;
        let ticket = conn.lease.ticket();
        self.phase = Phase::HaveRemoteOffer;
        debug!(peer_id = %self.id, epoch = conn.epoch, generation, "applying remote offer");
        spawn_step(&self.inputs, conn.epoch, async move {
            let result = match ticket.check() {
                Ok(()) => transport.set_remote_description(offer).await,
                Err(err) => Err(err),
            };
            Step::RemoteOfferApplied { generation, result }
        });
    }

    fn remote_offer_applied(&mut self, generation: u64, result: TransportResult<()>) {
        let body = {
            let Some(conn) = self.conn.as_ref() else {
                return;
            };
            if conn.generation != generation {
                return;
            }
            match conn.remote_offer.as_ref() {
                Some(offer) => offer.sdp.clone(),
                None => return,
            }
        };
        if let Err(err) = result {
            return self.fail(err);
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.remote_described = true;
        }
        self.reconcile_remote(&body);
        self.flush_inbound_candidates();

        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        let Some(transport) = conn.transport.clone() else {
            return;
        };
        let ticket = conn.lease.ticket();
        spawn_step(&self.inputs, conn.epoch, async move {
            Step::AnswerReady {
                generation,
                result: produce_answer(transport, ticket).await,
            }
        });
    }

    fn answer_ready(&mut self, generation: u64, result: TransportResult<SessionDescription>) {
        if !self
            .conn
            .as_ref()
            .is_some_and(|conn| conn.generation == generation)
        {
            return;
        }
        let answer = match result {
            Ok(answer) => answer,
            Err(err) => return self.fail(err),
        };
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.remote_offer = None;
        if conn.established {
            if self.send_in_band(answer.into()) {
                self.finish_negotiation();
            }
        } else {
            conn.settled = true;
            self.release_local(answer);
            self.maybe_connected();
        }
    }

    fn receive_answer(&mut self, answer: SessionDescription) {
        let phase = self.phase;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let held = conn
            .local_offer
            .clone()
            .filter(|_| phase == Phase::HaveLocalOffer && !conn.answer_pending);
        let Some(offer) = held else {
            self.events.error(PeerError::invalid_state(
                "answer received without a pending local offer",
            ));
            return;
        };
        let Some(transport) = conn.transport.clone() else {
            return;
        };
        conn.answer_pending = true;
        let generation = conn.generation;
        let ticket = conn.lease.ticket();
        let held_offer = conn.established.then_some(offer);
        debug!(peer_id = %self.id, epoch = conn.epoch, "applying remote answer");
        spawn_step(&self.inputs, conn.epoch, async move {
            let result = apply_answer(transport, ticket, held_offer, answer.clone()).await;
            Step::AnswerApplied {
                generation,
                answer,
                result,
            }
        });
    }

    fn answer_applied(
        &mut self,
        generation: u64,
        answer: SessionDescription,
        result: TransportResult<()>,
    ) {
        {
            let Some(conn) = self.conn.as_mut() else {
                return;
            };
            if conn.generation != generation {
                return;
            }
            conn.answer_pending = false;
        }
        if let Err(err) = result {
            return self.fail(err);
        }
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.local_offer = None;
        conn.remote_described = true;
        let renegotiation = conn.established;
        self.reconcile_remote(&answer.sdp);
        self.flush_inbound_candidates();
        if renegotiation {
            self.finish_negotiation();
        } else {
            if let Some(conn) = self.conn.as_mut() {
                conn.settled = true;
            }
            self.maybe_connected();
        }
        self.replay_deferred();
    }

    fn request_negotiation(&mut self, reason: &'static str) {
        let debounce = self.config.negotiation_debounce;
        let phase = self.phase;
        let Some(conn) = self.conn.as_mut() else {
            trace!(peer_id = %self.id, reason, "negotiation needed without a connection");
            return;
        };
        if !conn.established {
            trace!(peer_id = %self.id, reason, "negotiation needed before connect");
            return;
        }
        if phase != Phase::Connected {
            debug!(peer_id = %self.id, reason, "negotiation in flight; renegotiating after");
            conn.negotiation_needed = true;
            return;
        }
        debug!(peer_id = %self.id, reason, "negotiation needed");
        conn.negotiation_timer
            .arm(&self.inputs, conn.epoch, TimerKind::Negotiation, debounce);
    }

    fn reconcile_remote(&mut self, body: &str) {
        let identifiers = sdp::media_identifiers(body);
        let ended = self.remote.reconcile(&identifiers);
        self.emit_ended(ended);
    }

    fn emit_ended(&self, ended: Ended) {
        if ended.is_empty() {
            return;
        }
        for track in ended.tracks {
            debug!(peer_id = %self.id, track_id = track.id(), "remote track ended");
            self.events.emit(PeerEvent::TrackEnded(track));
        }
        for stream in ended.streams {
            debug!(peer_id = %self.id, stream_id = stream.id(), "remote stream ended");
            self.events.emit(PeerEvent::StreamEnded(stream));
        }
    }

    // ---- candidates --------------------------------------------------------

    /// Hands the first local description of this exchange to the caller's
    /// relay according to the candidate mode.
    fn release_local(&mut self, description: SessionDescription) {
        let mode = self.config.candidate_mode;
        let debounce = self.config.gather_debounce;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.outbound.pending = Some(description.clone());
        conn.outbound.released = false;
        match mode {
            CandidateMode::Trickle => self.publish_local(description),
            CandidateMode::Batched => {
                if conn.outbound.gathering_complete {
                    self.read_local_description();
                } else {
                    conn.gather_timer
                        .arm(&self.inputs, conn.epoch, TimerKind::Gather, debounce);
                }
            }
        }
    }

    fn publish_local(&mut self, description: SessionDescription) {
        let trickle = self.config.candidate_mode == CandidateMode::Trickle;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.outbound.released {
            return;
        }
        conn.outbound.released = true;
        conn.outbound.pending = None;
        conn.gather_timer.cancel();
        let generation = conn.generation;
        let held: Vec<IceCandidate> = mem::take(&mut conn.outbound.held)
            .into_iter()
            .filter(|(held_in, _)| *held_in == generation)
            .map(|(_, candidate)| candidate)
            .collect();
        debug!(
            peer_id = %self.id,
            kind = ?description.kind,
            held = held.len(),
            "signalling local description"
        );
        self.events.emit(PeerEvent::Signal(description.into()));
        if trickle {
            for candidate in held {
                self.events.emit(PeerEvent::Signal(candidate.into()));
            }
        }
    }

    fn read_local_description(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.outbound.reading {
            return;
        }
        let Some(transport) = conn.transport.clone() else {
            return;
        };
        conn.outbound.reading = true;
        let generation = conn.generation;
        spawn_step(&self.inputs, conn.epoch, async move {
            Step::LocalDescriptionRead {
                generation,
                description: transport.local_description().await,
            }
        });
    }

    fn local_description_read(
        &mut self,
        generation: u64,
        description: Option<SessionDescription>,
    ) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.outbound.reading = false;
        let Some(pending) = conn.outbound.pending.clone() else {
            return;
        };
        if conn.generation != generation {
            self.read_local_description();
            return;
        }
        let finalized = description
            .filter(|read| read.kind == pending.kind)
            .unwrap_or(pending);
        self.publish_local(finalized);
    }

    fn local_candidate(&mut self, candidate: Option<IceCandidate>) {
        let mode = self.config.candidate_mode;
        let debounce = self.config.gather_debounce;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.outbound.gathering_complete {
            trace!(peer_id = %self.id, "ignoring candidate after gathering completed");
            return;
        }
        let Some(candidate) = candidate else {
            return self.gathering_finished("transport reported completion");
        };
        if conn.established {
            self.send_in_band(candidate.into());
            return;
        }
        match mode {
            CandidateMode::Trickle if conn.outbound.released => {
                self.events.emit(PeerEvent::Signal(candidate.into()));
            }
            CandidateMode::Trickle => {
                let generation = conn.generation;
                conn.outbound.held.push((generation, candidate));
            }
            CandidateMode::Batched => {
                conn.gather_timer
                    .arm(&self.inputs, conn.epoch, TimerKind::Gather, debounce);
            }
        }
    }

    fn gathering_finished(&mut self, reason: &'static str) {
        let batched = self.config.candidate_mode == CandidateMode::Batched;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.outbound.gathering_complete {
            return;
        }
        conn.outbound.gathering_complete = true;
        conn.gather_timer.cancel();
        let awaiting = conn.outbound.pending.is_some() && !conn.outbound.released;
        debug!(peer_id = %self.id, reason, "candidate gathering finished");
        self.events.emit(PeerEvent::IceComplete);
        if batched && awaiting {
            self.read_local_description();
        }
    }

    fn receive_candidate(&mut self, candidate: IceCandidate) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if !conn.remote_described {
            let generation = conn.generation;
            conn.inbound_candidates.push((generation, candidate));
            return;
        }
        let Some(transport) = conn.transport.clone() else {
            return;
        };
        let ticket = conn.lease.ticket();
        spawn_step(&self.inputs, conn.epoch, async move {
            Step::CandidatesApplied(apply_candidates(transport, ticket, vec![candidate]).await)
        });
    }

    fn flush_inbound_candidates(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let generation = conn.generation;
        let candidates: Vec<IceCandidate> = mem::take(&mut conn.inbound_candidates)
            .into_iter()
            .filter(|(received_in, _)| *received_in == generation)
            .map(|(_, candidate)| candidate)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let Some(transport) = conn.transport.clone() else {
            return;
        };
        let ticket = conn.lease.ticket();
        trace!(peer_id = %self.id, count = candidates.len(), "applying buffered candidates");
        spawn_step(&self.inputs, conn.epoch, async move {
            Step::CandidatesApplied(apply_candidates(transport, ticket, candidates).await)
        });
    }

    // ---- transport and channel events --------------------------------------

    fn connection_state(&mut self, state: IceConnectionState) {
        debug!(peer_id = %self.id, ?state, "ice connection state");
        if state.is_terminal() {
            self.teardown();
            return;
        }
        if state.is_connected() {
            if let Some(conn) = self.conn.as_mut() {
                conn.ice_connected = true;
            }
            self.maybe_connected();
        }
    }

    fn remote_channel(&mut self, channel: Arc<dyn ChannelHandle>) {
        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        if channel.label() != INTERNAL_CHANNEL_LABEL {
            self.events
                .emit(PeerEvent::DataChannel(DataChannel::new(channel)));
            return;
        }
        if conn.internal.is_some() {
            warn!(peer_id = %self.id, "remote opened a second internal channel; ignoring it");
            return;
        }
        self.attach_internal(channel);
    }

    fn remote_track(&mut self, info: RemoteTrackInfo) {
        match self.remote.register(info) {
            Some(event) => {
                debug!(peer_id = %self.id, track_id = event.track.id(), "remote track");
                self.events.emit(PeerEvent::Track(event));
            }
            None => trace!(peer_id = %self.id, "repeated remote track announcement"),
        }
    }

    fn in_band_message(&mut self, payload: ChannelPayload) {
        let text = match payload {
            ChannelPayload::Text(text) => text,
            ChannelPayload::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    return self
                        .events
                        .error(PeerError::MalformedSignal(err.to_string()))
                }
            },
        };
        match SignalMessage::from_json(&text) {
            Ok(message) => self.dispatch_signal(message),
            Err(err) => self.events.error(err),
        }
    }

    /// Sends over the internal channel. A refused send tears the connection
    /// down; `false` when that happened.
    fn send_in_band(&mut self, message: SignalMessage) -> bool {
        let Some(channel) = self.conn.as_ref().and_then(|conn| conn.internal.clone()) else {
            warn!(peer_id = %self.id, "no internal channel for in-band signal");
            self.fail(TransportError::Closed);
            return false;
        };
        match channel.send(ChannelPayload::Text(message.to_json())) {
            Ok(()) => true,
            Err(err) => {
                warn!(peer_id = %self.id, error = %err, "in-band signal send failed");
                self.fail(err);
                false
            }
        }
    }

    // ---- channels and tracks -----------------------------------------------

    fn create_data_channel(
        &mut self,
        label: &str,
        options: Option<ChannelOptions>,
    ) -> Result<DataChannel, PeerError> {
        if self.shut {
            return Err(PeerError::invalid_state("peer is closed"));
        }
        if label == INTERNAL_CHANNEL_LABEL {
            return Err(PeerError::invalid_state(format!(
                "channel label `{INTERNAL_CHANNEL_LABEL}` is reserved"
            )));
        }
        let transport = self
            .conn
            .as_ref()
            .and_then(|conn| conn.transport.clone())
            .ok_or_else(|| PeerError::invalid_state("no connection"))?;
        let options = options.unwrap_or_else(|| self.config.channel_config.clone());
        let handle = transport.create_data_channel(label, &options)?;
        debug!(peer_id = %self.id, label, "data channel created");
        Ok(DataChannel::new(handle))
    }

    fn ready_transport(&self) -> Option<Arc<dyn PeerTransport>> {
        if self.phase != Phase::Connected {
            return None;
        }
        self.conn.as_ref()?.transport.clone()
    }

    fn add_track(&mut self, track: LocalTrack, stream: MediaStream) {
        if self.shut {
            return self.events.error(PeerError::invalid_state("peer is closed"));
        }
        let transport = self.ready_transport();
        let track_id = track.id().to_string();
        match self.tracks.add(track, stream, transport.as_deref()) {
            Ok(outcome) => debug!(peer_id = %self.id, %track_id, ?outcome, "add track"),
            Err(err) => self.report(err),
        }
    }

    fn remove_track(&mut self, track_id: &str) {
        if self.shut {
            return self.events.error(PeerError::invalid_state("peer is closed"));
        }
        let transport = self.ready_transport();
        match self.tracks.remove(track_id, transport.as_deref()) {
            Ok(outcome) => debug!(peer_id = %self.id, track_id, ?outcome, "remove track"),
            Err(err) => self.report(err),
        }
    }

    fn drain_tracks(&mut self) {
        let Some(transport) = self.ready_transport() else {
            return;
        };
        match self.tracks.drain(&*transport) {
            Ok(0) => {}
            Ok(applied) => debug!(peer_id = %self.id, applied, "applied queued track changes"),
            Err(err) => self.report(err),
        }
    }
}

fn discard_step(step: Step) {
    if let Step::TransportCreated(Ok((transport, _))) = step {
        tokio::spawn(async move {
            let _ = transport.close().await;
        });
    }
}
