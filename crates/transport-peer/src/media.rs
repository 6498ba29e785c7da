//! Local representations of remote tracks and streams.
//!
//! The transport announces remote tracks as they appear, but a remote peer that
//! stops sending a track only says so implicitly: the track disappears from
//! its next description. [`RemoteMedia`] remembers what the last accepted
//! remote description carried and ends every track or stream that vanished.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::sdp::MediaIdentifier;
use crate::transport::{RemoteTrackInfo, TrackKind};

/// Exactly-once end flag shared by every clone of a handle.
struct EndSignal(watch::Sender<bool>);

impl EndSignal {
    fn new() -> Self {
        Self(watch::channel(false).0)
    }

    fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Returns `true` only for the call that actually ended it.
    fn set(&self) -> bool {
        self.0.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        })
    }

    async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    stream_ids: Vec<String>,
    ended: EndSignal,
}

impl RemoteTrack {
    fn new(info: &RemoteTrackInfo) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: info.track_id.clone(),
                kind: info.kind,
                stream_ids: info.stream_ids.clone(),
                ended: EndSignal::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn stream_ids(&self) -> &[String] {
        &self.inner.stream_ids
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_set()
    }

    /// Resolves once the track has ended.
    pub async fn ended(&self) {
        self.inner.ended.wait().await
    }

    fn end(&self) -> bool {
        self.inner.ended.set()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[derive(Clone)]
pub struct RemoteStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: String,
    ended: EndSignal,
}

impl RemoteStream {
    fn new(id: &str) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.to_string(),
                ended: EndSignal::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_set()
    }

    pub async fn ended(&self) {
        self.inner.ended.wait().await
    }

    fn end(&self) -> bool {
        self.inner.ended.set()
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.inner.id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A newly announced remote track together with the streams it belongs to.
#[derive(Debug, Clone)]
pub struct TrackEvent {
    pub track: RemoteTrack,
    pub streams: Vec<RemoteStream>,
}

/// Handles ended by one reconciliation pass.
#[derive(Debug, Default)]
pub(crate) struct Ended {
    pub tracks: Vec<RemoteTrack>,
    pub streams: Vec<RemoteStream>,
}

impl Ended {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty() && self.streams.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct RemoteMedia {
    tracks: HashMap<String, RemoteTrack>,
    streams: HashMap<String, RemoteStream>,
    present_tracks: HashSet<String>,
    present_streams: HashSet<String>,
}

impl RemoteMedia {
    /// Records a track announced by the transport. Returns `None` when the
    /// track is already live, so repeated announcements stay silent.
    pub fn register(&mut self, info: RemoteTrackInfo) -> Option<TrackEvent> {
        if self.tracks.contains_key(&info.track_id) {
            return None;
        }
        let track = RemoteTrack::new(&info);
        let streams = info
            .stream_ids
            .iter()
            .map(|id| {
                self.streams
                    .entry(id.clone())
                    .or_insert_with(|| RemoteStream::new(id))
                    .clone()
            })
            .collect();
        self.tracks.insert(info.track_id, track.clone());
        Some(TrackEvent { track, streams })
    }

    /// Applies the media identifiers of a freshly accepted remote description
    /// and ends everything it no longer carries.
    pub fn reconcile(&mut self, identifiers: &[MediaIdentifier]) -> Ended {
        self.present_tracks = identifiers.iter().map(|m| m.track_id.clone()).collect();
        self.present_streams = identifiers.iter().map(|m| m.stream_id.clone()).collect();

        let mut ended = Ended::default();
        let present_tracks = &self.present_tracks;
        self.tracks.retain(|id, track| {
            if present_tracks.contains(id) {
                return true;
            }
            if track.end() {
                ended.tracks.push(track.clone());
            }
            false
        });
        let present_streams = &self.present_streams;
        self.streams.retain(|id, stream| {
            if present_streams.contains(id) {
                return true;
            }
            if stream.end() {
                ended.streams.push(stream.clone());
            }
            false
        });
        ended
    }

    /// Ends every remote track and stream, as on teardown.
    pub fn clear(&mut self) -> Ended {
        self.reconcile(&[])
    }

    #[cfg(test)]
    fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(track: &str, stream: &str) -> RemoteTrackInfo {
        RemoteTrackInfo {
            track_id: track.into(),
            kind: TrackKind::Audio,
            stream_ids: vec![stream.into()],
        }
    }

    fn present(pairs: &[(&str, &str)]) -> Vec<MediaIdentifier> {
        pairs
            .iter()
            .map(|(stream, track)| MediaIdentifier {
                kind: TrackKind::Audio,
                stream_id: stream.to_string(),
                track_id: track.to_string(),
            })
            .collect()
    }

    #[test]
    fn repeated_announcement_is_ignored_while_live() {
        let mut media = RemoteMedia::default();
        let first = media.register(info("mic", "s1")).expect("first announcement");
        assert_eq!(first.track.id(), "mic");
        assert_eq!(first.streams[0].id(), "s1");
        assert!(media.register(info("mic", "s1")).is_none());
        assert_eq!(media.live_tracks(), 1);
    }

    #[test]
    fn tracks_share_stream_handles() {
        let mut media = RemoteMedia::default();
        let a = media.register(info("mic", "s1")).expect("mic");
        let b = media.register(info("cam", "s1")).expect("cam");
        let ended = media.reconcile(&present(&[]));
        assert_eq!(ended.streams.len(), 1);
        assert!(a.streams[0].is_ended());
        assert!(b.streams[0].is_ended());
    }

    #[test]
    fn missing_track_ends_exactly_once() {
        let mut media = RemoteMedia::default();
        let event = media.register(info("mic", "s1")).expect("mic");
        media.register(info("cam", "s2")).expect("cam");

        let ended = media.reconcile(&present(&[("s2", "cam")]));
        assert_eq!(ended.tracks.len(), 1);
        assert_eq!(ended.tracks[0].id(), "mic");
        assert_eq!(ended.streams.len(), 1);
        assert!(event.track.is_ended());

        let again = media.reconcile(&present(&[("s2", "cam")]));
        assert!(again.is_empty());
    }

    #[test]
    fn re_added_track_gets_a_fresh_handle() {
        let mut media = RemoteMedia::default();
        let old = media.register(info("mic", "s1")).expect("mic");
        media.reconcile(&present(&[]));
        let new = media.register(info("mic", "s1")).expect("re-added");
        assert!(old.track.is_ended());
        assert!(!new.track.is_ended());
        assert!(!new.streams[0].is_ended());
    }

    #[test]
    fn clear_ends_everything() {
        let mut media = RemoteMedia::default();
        media.register(info("mic", "s1"));
        media.register(info("cam", "s1"));
        let ended = media.clear();
        assert_eq!(ended.tracks.len(), 2);
        assert_eq!(ended.streams.len(), 1);
        assert!(media.clear().is_empty());
    }

    #[tokio::test]
    async fn ended_future_resolves_after_end() {
        let mut media = RemoteMedia::default();
        let event = media.register(info("mic", "s1")).expect("mic");
        let track = event.track.clone();
        let waiter = tokio::spawn(async move { track.ended().await });
        media.clear();
        waiter.await.expect("waiter joins");
        assert!(event.track.is_ended());
    }
}
