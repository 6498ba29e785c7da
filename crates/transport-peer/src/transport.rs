//! Contract of the host-supplied peer transport.
//!
//! The negotiation engine never talks to ICE, DTLS or SCTP directly. It drives
//! an implementation of [`PeerTransport`] (one per connection attempt, built by
//! a [`TransportFactory`]) and reacts to the [`TransportEvent`]s that
//! implementation publishes.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{ChannelOptions, PeerConfig};
use crate::error::{TransportError, TransportResult};
use crate::signal::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
    Other,
}

impl TrackKind {
    pub fn from_media(media: &str) -> Self {
        match media {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            _ => TrackKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
            TrackKind::Other => "application",
        }
    }
}

/// Outbound media track. The optional source is whatever the transport needs
/// to actually send media; the engine only looks at the id.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: Option<Arc<dyn Any + Send + Sync>>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            source: None,
        }
    }

    pub fn with_source<T: Any + Send + Sync>(mut self, source: Arc<T>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.source.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaStream {
    id: String,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Transport-assigned handle for an attached outbound track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Remote track as announced by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub kind: TrackKind,
    pub stream_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }

    /// States after which the transport cannot recover on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, IceConnectionState::Failed | IceConnectionState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

impl ChannelPayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ChannelPayload::Text(text) => Some(text),
            ChannelPayload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ChannelPayload::Text(text) => text.as_bytes(),
            ChannelPayload::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for ChannelPayload {
    fn from(text: &str) -> Self {
        ChannelPayload::Text(text.to_string())
    }
}

impl From<String> for ChannelPayload {
    fn from(text: String) -> Self {
        ChannelPayload::Text(text)
    }
}

impl From<Bytes> for ChannelPayload {
    fn from(bytes: Bytes) -> Self {
        ChannelPayload::Binary(bytes)
    }
}

impl From<Vec<u8>> for ChannelPayload {
    fn from(bytes: Vec<u8>) -> Self {
        ChannelPayload::Binary(Bytes::from(bytes))
    }
}

impl From<&[u8]> for ChannelPayload {
    fn from(bytes: &[u8]) -> Self {
        ChannelPayload::Binary(Bytes::copy_from_slice(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelPayload),
    Error(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One native data channel.
pub trait ChannelHandle: Send + Sync {
    fn label(&self) -> String;
    fn options(&self) -> ChannelOptions;
    /// Stream id once the transport has assigned one.
    fn id(&self) -> Option<u16>;
    fn ready_state(&self) -> ChannelState;
    fn buffered_amount(&self) -> usize;
    /// Hands out the channel's event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
    fn send(&self, payload: ChannelPayload) -> TransportResult<()>;
    fn close(&self) -> TransportResult<()>;
}

pub enum TransportEvent {
    /// A gathered candidate, or `None` once gathering is complete.
    LocalCandidate(Option<IceCandidate>),
    ConnectionState(IceConnectionState),
    /// A channel opened by the remote side.
    DataChannel(Arc<dyn ChannelHandle>),
    Track(RemoteTrackInfo),
    NegotiationNeeded,
    /// A queued operation failed after its call had already returned.
    Failed(TransportError),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            TransportEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            TransportEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            TransportEvent::Track(track) => f.debug_tuple("Track").field(track).finish(),
            TransportEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            TransportEvent::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Native peer connection driven by the negotiation engine.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> TransportResult<SessionDescription>;
    async fn create_answer(&self) -> TransportResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> TransportResult<()>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> TransportResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()>;
    /// Current local description including every candidate gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;
    fn create_data_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> TransportResult<Arc<dyn ChannelHandle>>;
    fn add_track(&self, track: &LocalTrack, stream: &MediaStream) -> TransportResult<SenderId>;
    fn remove_track(&self, sender: SenderId) -> TransportResult<()>;
    async fn close(&self) -> TransportResult<()>;
}

/// Builds a fresh transport for every connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// `false` when the platform offers no usable transport at all.
    fn is_supported(&self) -> bool {
        true
    }

    async fn create(
        &self,
        config: &PeerConfig,
    ) -> TransportResult<(Arc<dyn PeerTransport>, TransportEvents)>;
}
