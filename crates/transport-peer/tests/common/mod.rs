#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use transport_peer::loopback::{self, LoopbackFactory, LoopbackTransport};
use transport_peer::{Peer, PeerConfig, PeerEvent, PeerEvents, Role};

/// How long a side must stay silent before it counts as settled.
pub const QUIET: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// One endpoint under test. Every event it publishes is observed here after
/// its signals have been relayed to the other side.
pub struct Side {
    pub peer: Peer,
    pub factory: Arc<LoopbackFactory>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
    pub signals: usize,
}

impl Side {
    pub fn transport(&self) -> Arc<LoopbackTransport> {
        self.factory.latest().expect("transport created")
    }

    /// Waits for the first event matching `want`; everything before it is
    /// returned alongside.
    pub async fn until(
        &mut self,
        want: impl Fn(&PeerEvent) -> bool,
    ) -> (PeerEvent, Vec<PeerEvent>) {
        let mut skipped = Vec::new();
        loop {
            let event = self.events.recv().await.expect("event stream ended");
            if matches!(event, PeerEvent::Signal(_)) {
                self.signals += 1;
            }
            if want(&event) {
                return (event, skipped);
            }
            skipped.push(event);
        }
    }

    pub async fn connected(&mut self) -> Vec<PeerEvent> {
        self.until(|event| matches!(event, PeerEvent::Connect)).await.1
    }

    /// Collects events until none arrive for [`QUIET`].
    pub async fn settle(&mut self) -> Vec<PeerEvent> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = timeout(QUIET, self.events.recv()).await {
            if matches!(event, PeerEvent::Signal(_)) {
                self.signals += 1;
            }
            seen.push(event);
        }
        seen
    }
}

/// Forwards `from`'s signals to `to` and republishes every event.
fn relay(mut from: PeerEvents, to: Peer) -> mpsc::UnboundedReceiver<PeerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = from.recv().await {
            if let PeerEvent::Signal(message) = &event {
                to.signal(message.clone());
            }
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    rx
}

/// Two peers wired to each other through the loopback transport and a relay.
pub fn wired(left: PeerConfig, right: PeerConfig) -> (Side, Side) {
    let (left_factory, right_factory) = loopback::pair();
    let left_factory = Arc::new(left_factory);
    let right_factory = Arc::new(right_factory);
    let (a, a_events) = Peer::new(left, left_factory.clone()).expect("left peer");
    let (b, b_events) = Peer::new(right, right_factory.clone()).expect("right peer");
    let a_rx = relay(a_events, b.clone());
    let b_rx = relay(b_events, a.clone());
    (
        Side {
            peer: a,
            factory: left_factory,
            events: a_rx,
            signals: 0,
        },
        Side {
            peer: b,
            factory: right_factory,
            events: b_rx,
            signals: 0,
        },
    )
}

pub fn pair() -> (Side, Side) {
    wired(
        PeerConfig::new(Role::Initiator),
        PeerConfig::new(Role::Responder),
    )
}

/// Connects both sides and waits for `Connect` on each.
pub async fn connected_pair() -> (Side, Side) {
    let (mut a, mut b) = pair();
    a.peer.connect(None);
    b.peer.connect(None);
    a.connected().await;
    b.connected().await;
    (a, b)
}

pub fn count(events: &[PeerEvent], want: impl Fn(&PeerEvent) -> bool) -> usize {
    events.iter().filter(|event| want(event)).count()
}

/// Concatenates event batches collected from several waits.
pub fn joined<const N: usize>(batches: [Vec<PeerEvent>; N]) -> Vec<PeerEvent> {
    batches.into_iter().flatten().collect()
}
