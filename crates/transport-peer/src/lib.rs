//! Peer connection negotiation over a pluggable transport.
//!
//! A [`Peer`] drives one side of a peer-to-peer connection: it produces and
//! consumes offers, answers and candidates, emits the messages the caller must
//! relay to the remote side as [`PeerEvent::Signal`], and, once connected,
//! moves all further negotiation onto a reserved in-band data channel. Track
//! changes requested while a negotiation is in flight are queued, competing
//! offers are resolved deterministically, and remote tracks that disappear from
//! the remote description are reported as ended.
//!
//! The actual connection is provided by a [`TransportFactory`]. The
//! [`loopback`] module offers an in-process pair for tests; with the
//! `webrtc-transport` feature, [`webrtc`] adapts the `webrtc` crate.
//!
//! ```no_run
//! use std::sync::Arc;
//! use transport_peer::{loopback, Peer, PeerConfig, PeerEvent, Role};
//!
//! # async fn demo() -> Result<(), transport_peer::PeerError> {
//! let (left, right) = loopback::pair();
//! let (a, mut a_events) = Peer::new(PeerConfig::new(Role::Initiator), Arc::new(left))?;
//! let (b, _b_events) = Peer::new(PeerConfig::new(Role::Responder), Arc::new(right))?;
//! a.connect(None);
//! b.connect(None);
//! while let Some(event) = a_events.recv().await {
//!     match event {
//!         PeerEvent::Signal(message) => b.signal(message),
//!         PeerEvent::Connect => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod loopback;
pub mod media;
mod negotiation;
pub mod peer;
pub mod sdp;
pub mod signal;
mod tracks;
pub mod transport;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

pub use channel::DataChannel;
pub use config::{
    CandidateMode, ChannelOptions, IceServer, PeerConfig, PeerOptions, Role,
    INTERNAL_CHANNEL_LABEL,
};
pub use error::{PeerError, TransportError, TransportResult};
pub use media::{RemoteStream, RemoteTrack, TrackEvent};
pub use negotiation::Phase;
pub use peer::{Peer, PeerEvent, PeerEvents};
pub use signal::{IceCandidate, SdpType, SessionDescription, SignalInput, SignalMessage};
pub use transport::{
    ChannelEvent, ChannelHandle, ChannelPayload, ChannelState, IceConnectionState, LocalTrack,
    MediaStream, PeerTransport, RemoteTrackInfo, SenderId, TrackKind, TransportEvent,
    TransportEvents, TransportFactory,
};
