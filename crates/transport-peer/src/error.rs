use thiserror::Error;

/// Failure reported by a [`PeerTransport`](crate::transport::PeerTransport) operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },
    #[error("transport closed")]
    Closed,
    #[error("peer transport unavailable on this platform")]
    Unsupported,
}

impl TransportError {
    pub fn operation(op: &'static str, reason: impl Into<String>) -> Self {
        TransportError::Operation {
            op,
            reason: reason.into(),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by a [`Peer`](crate::Peer).
///
/// Only [`PeerError::UnsupportedPlatform`] is returned directly (from
/// [`Peer::new`](crate::Peer::new)); every other kind is delivered as
/// [`PeerEvent::Error`](crate::PeerEvent::Error).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("no usable peer transport on this platform")]
    UnsupportedPlatform,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("track {0} already added")]
    DuplicateTrack(String),
    #[error("unrecognized track {0}")]
    UnknownTrack(String),
    #[error("signal received after close")]
    PostCloseSignal,
    #[error("malformed signal: {0}")]
    MalformedSignal(String),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

impl PeerError {
    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        PeerError::InvalidState(reason.into())
    }

    /// Whether this error tears down the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PeerError::UnsupportedPlatform | PeerError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_fatal_others_are_not() {
        let err: PeerError = TransportError::operation("create_offer", "boom").into();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "transport failure: create_offer failed: boom");
        assert!(!PeerError::DuplicateTrack("t1".into()).is_fatal());
        assert!(!PeerError::PostCloseSignal.is_fatal());
    }
}
