use std::sync::Arc;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::channel::DataChannel;
use crate::config::{ChannelOptions, PeerConfig};
use crate::error::PeerError;
use crate::media::{RemoteStream, RemoteTrack, TrackEvent};
use crate::negotiation::{Command, Emitter, Input, Negotiator, Phase};
use crate::signal::{SignalInput, SignalMessage};
use crate::transport::{LocalTrack, MediaStream, TransportFactory};

/// Notifications published by a [`Peer`], in the order they happened.
#[derive(Debug)]
pub enum PeerEvent {
    /// A message to hand to the remote peer through the caller's relay.
    Signal(SignalMessage),
    Connect,
    /// A connection that had reached [`PeerEvent::Connect`] went away.
    Disconnect,
    /// The peer was closed. Emitted once.
    Close,
    Track(TrackEvent),
    TrackEnded(RemoteTrack),
    StreamEnded(RemoteStream),
    /// A data channel opened by the remote side.
    DataChannel(DataChannel),
    /// Local candidate gathering finished.
    IceComplete,
    Error(PeerError),
}

/// Receiving half of a peer's notifications.
#[derive(Debug)]
pub struct PeerEvents {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl PeerEvents {
    /// Next notification; `None` once the peer's negotiator has stopped.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.rx.try_recv().ok()
    }
}

struct PeerInner {
    id: String,
    inputs: mpsc::UnboundedSender<Input>,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Command(Command::Shutdown));
    }
}

/// Handle to one endpoint of a peer connection.
///
/// All operations are queued to the peer's negotiator and return at once;
/// their outcome is reported through [`PeerEvents`]. Clones share the same
/// negotiator, which stops when the last clone is dropped.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Creates a peer and starts its negotiator on the current Tokio runtime.
    pub fn new(
        config: PeerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(Peer, PeerEvents), PeerError> {
        if !factory.is_supported() {
            return Err(PeerError::UnsupportedPlatform);
        }
        let runtime = Handle::try_current()
            .map_err(|_| PeerError::invalid_state("peer must be created inside a Tokio runtime"))?;
        let id = config.id.clone().unwrap_or_else(random_id);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            id.clone(),
            config,
            factory,
            inputs_tx.clone(),
            Emitter::new(events_tx),
        );
        runtime.spawn(negotiator.run(inputs_rx));
        debug!(peer_id = %id, "peer created");
        let peer = Peer {
            inner: Arc::new(PeerInner {
                id,
                inputs: inputs_tx,
            }),
        };
        Ok((peer, PeerEvents { rx: events_rx }))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Starts a fresh connection, tearing down any existing one.
    ///
    /// With a remote identifier the role is derived from both ids (the larger
    /// one offers); without one the configured role is used.
    pub fn connect(&self, remote_id: Option<&str>) {
        self.send(Command::Connect {
            remote: remote_id.map(str::to_string),
        });
    }

    /// Feeds a message received from the remote peer's relay.
    pub fn signal(&self, message: impl Into<SignalInput>) {
        self.send(Command::Signal(message.into()));
    }

    /// Tears down the current connection; the peer can connect again.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Tears down the current connection for good.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    pub async fn create_data_channel(
        &self,
        label: &str,
        options: Option<ChannelOptions>,
    ) -> Result<DataChannel, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateDataChannel {
            label: label.to_string(),
            options,
            reply,
        });
        rx.await
            .map_err(|_| PeerError::invalid_state("peer negotiator stopped"))?
    }

    /// Adds an outbound track. Applied at once when connected and idle,
    /// otherwise queued.
    pub fn add_track(&self, track: LocalTrack, stream: MediaStream) {
        self.send(Command::AddTrack { track, stream });
    }

    pub fn remove_track(&self, track: &LocalTrack) {
        self.remove_track_id(track.id());
    }

    pub fn remove_track_id(&self, track_id: &str) {
        self.send(Command::RemoveTrack {
            track_id: track_id.to_string(),
        });
    }

    /// Asks for a renegotiation as if the transport had requested one.
    pub fn renegotiate(&self) {
        self.send(Command::Renegotiate);
    }

    pub async fn phase(&self) -> Phase {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Phase { reply });
        rx.await.unwrap_or(Phase::Closed)
    }

    fn send(&self, command: Command) {
        let _ = self.inner.inputs.send(Input::Command(command));
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("id", &self.inner.id).finish()
    }
}

fn random_id() -> String {
    rand::thread_rng().r#gen::<u64>().to_string()
}
