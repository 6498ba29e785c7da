use std::collections::VecDeque;

use crate::error::PeerError;
use crate::transport::{LocalTrack, MediaStream, PeerTransport, SenderId};

struct ActiveTrack {
    track: LocalTrack,
    stream: MediaStream,
    sender: SenderId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackOutcome {
    /// Handed to the transport right away.
    Applied,
    /// Deferred until the connection is ready.
    Queued,
    /// A removal that cancelled a not yet applied addition.
    Cancelled,
}

/// Outbound track bookkeeping. Changes requested while a connection is not
/// ready are queued and applied in order once it is.
#[derive(Default)]
pub(crate) struct TrackQueue {
    active: Vec<ActiveTrack>,
    pending_add: VecDeque<(LocalTrack, MediaStream)>,
    pending_remove: VecDeque<String>,
}

impl TrackQueue {
    /// `transport` is `Some` only when the connection can take changes now.
    pub fn add(
        &mut self,
        track: LocalTrack,
        stream: MediaStream,
        transport: Option<&dyn PeerTransport>,
    ) -> Result<TrackOutcome, PeerError> {
        if self.is_active(track.id()) || self.is_pending_add(track.id()) {
            return Err(PeerError::DuplicateTrack(track.id().to_string()));
        }
        let Some(transport) = transport else {
            self.pending_add.push_back((track, stream));
            return Ok(TrackOutcome::Queued);
        };
        self.apply_add(track, stream, transport)?;
        Ok(TrackOutcome::Applied)
    }

    pub fn remove(
        &mut self,
        track_id: &str,
        transport: Option<&dyn PeerTransport>,
    ) -> Result<TrackOutcome, PeerError> {
        if let Some(index) = self.pending_add.iter().position(|(t, _)| t.id() == track_id) {
            self.pending_add.remove(index);
            return Ok(TrackOutcome::Cancelled);
        }
        if !self.is_active(track_id) {
            return Err(PeerError::UnknownTrack(track_id.to_string()));
        }
        let Some(transport) = transport else {
            if !self.pending_remove.iter().any(|id| id == track_id) {
                self.pending_remove.push_back(track_id.to_string());
            }
            return Ok(TrackOutcome::Queued);
        };
        self.apply_remove(track_id, transport)?;
        Ok(TrackOutcome::Applied)
    }

    /// Applies queued removals, then queued additions, each in request order.
    /// Returns how many changes reached the transport.
    pub fn drain(&mut self, transport: &dyn PeerTransport) -> Result<usize, PeerError> {
        let mut applied = 0;
        while let Some(track_id) = self.pending_remove.pop_front() {
            if self.is_active(&track_id) {
                self.apply_remove(&track_id, transport)?;
                applied += 1;
            }
        }
        while let Some((track, stream)) = self.pending_add.pop_front() {
            self.apply_add(track, stream, transport)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Moves every attached track back to the pending additions so it is
    /// re-added on the next connection. Pending removals are dropped.
    pub fn requeue_active(&mut self) {
        for active in self.active.drain(..).rev() {
            self.pending_add.push_front((active.track, active.stream));
        }
        self.pending_remove.clear();
    }

    pub fn is_active(&self, track_id: &str) -> bool {
        self.active.iter().any(|a| a.track.id() == track_id)
    }

    pub fn is_pending_add(&self, track_id: &str) -> bool {
        self.pending_add.iter().any(|(t, _)| t.id() == track_id)
    }

    #[cfg(test)]
    fn pending(&self) -> (usize, usize) {
        (self.pending_add.len(), self.pending_remove.len())
    }

    fn apply_add(
        &mut self,
        track: LocalTrack,
        stream: MediaStream,
        transport: &dyn PeerTransport,
    ) -> Result<(), PeerError> {
        match transport.add_track(&track, &stream) {
            Ok(sender) => {
                self.active.push(ActiveTrack {
                    track,
                    stream,
                    sender,
                });
                Ok(())
            }
            Err(err) => {
                // Kept so the next connection attempt picks it up again.
                self.pending_add.push_front((track, stream));
                Err(err.into())
            }
        }
    }

    fn apply_remove(
        &mut self,
        track_id: &str,
        transport: &dyn PeerTransport,
    ) -> Result<(), PeerError> {
        self.pending_remove.retain(|id| id != track_id);
        let Some(index) = self.active.iter().position(|a| a.track.id() == track_id) else {
            return Err(PeerError::UnknownTrack(track_id.to_string()));
        };
        let active = self.active.remove(index);
        transport.remove_track(active.sender)?;
        Ok(())
    }
}
