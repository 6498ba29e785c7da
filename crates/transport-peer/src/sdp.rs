//! Narrow scans over opaque session description bodies.
//!
//! Descriptions are never parsed beyond two facts: the origin line's session
//! id/version (used to order competing offers) and the `msid` identifiers of
//! the media they carry (used to notice remote tracks that silently went
//! away). Everything else in the body is passed through untouched.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::transport::TrackKind;

/// Deterministic ordering key of an offer, taken from its `o=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingKey {
    version: Token,
    session: Token,
}

impl OrderingKey {
    pub fn new(version: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            version: Token(version.into()),
            session: Token(session.into()),
        }
    }

    pub fn version(&self) -> &str {
        &self.version.0
    }
}

impl Ord for OrderingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.session.cmp(&other.session))
    }
}

impl PartialOrd for OrderingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Opaque origin token. Pure digit strings compare by numeric magnitude
/// without being parsed (they routinely exceed `u64`); anything else compares
/// byte-wise.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Token(String);

impl Token {
    fn digits(&self) -> Option<&str> {
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            let trimmed = self.0.trim_start_matches('0');
            Some(if trimmed.is_empty() { "0" } else { trimmed })
        } else {
            None
        }
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.digits(), other.digits()) {
            (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Extracts the ordering key from the first `o=` line of `body`.
pub fn ordering_key(body: &str) -> Option<OrderingKey> {
    let origin = body.lines().find_map(|line| line.trim().strip_prefix("o="))?;
    let mut fields = origin.split_whitespace();
    let _username = fields.next()?;
    let session = fields.next()?;
    let version = fields.next()?;
    Some(OrderingKey::new(version, session))
}

/// A `(stream, track)` pair announced by a description.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaIdentifier {
    pub kind: TrackKind,
    pub stream_id: String,
    pub track_id: String,
}

/// Lists the media identifiers present in `body`.
///
/// Both `a=msid:<stream> <track>` and the older
/// `a=ssrc:<n> msid:<stream> <track>` spellings are recognised. The kind comes
/// from the enclosing `m=` section. Pairs are reported once, in body order.
pub fn media_identifiers(body: &str) -> Vec<MediaIdentifier> {
    let mut kind = TrackKind::Other;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if let Some(media) = line.strip_prefix("m=") {
            kind = media
                .split_whitespace()
                .next()
                .map(TrackKind::from_media)
                .unwrap_or(TrackKind::Other);
            continue;
        }
        let Some(attribute) = line.strip_prefix("a=") else {
            continue;
        };
        let msid = if let Some(rest) = attribute.strip_prefix("msid:") {
            rest
        } else if let Some(rest) = attribute.strip_prefix("ssrc:") {
            match rest.split_once(" msid:") {
                Some((_, msid)) => msid,
                None => continue,
            }
        } else {
            continue;
        };
        let mut parts = msid.split_whitespace();
        let (Some(stream_id), Some(track_id)) = (parts.next(), parts.next()) else {
            continue;
        };
        let identifier = MediaIdentifier {
            kind,
            stream_id: stream_id.to_string(),
            track_id: track_id.to_string(),
        };
        if seen.insert((identifier.stream_id.clone(), identifier.track_id.clone())) {
            out.push(identifier);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        a=msid-semantic: WMS stream-a\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=mid:0\r\n\
        a=msid:stream-a mic\r\n\
        a=ssrc:1001 msid:stream-a mic\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=mid:1\r\n\
        a=msid:stream-a cam\r\n\
        m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
        a=mid:2\r\n";

    #[test]
    fn extracts_origin_version_and_session() {
        let key = ordering_key(OFFER).expect("origin line");
        assert_eq!(key.version(), "2");
        assert_eq!(key, OrderingKey::new("2", "4611731400430051336"));
    }

    #[test]
    fn missing_origin_yields_no_key() {
        assert_eq!(ordering_key("v=0\r\ns=-\r\n"), None);
        assert_eq!(ordering_key("o=- 12\r\n"), None);
    }

    #[test]
    fn numeric_tokens_compare_by_magnitude() {
        assert!(OrderingKey::new("10", "1") > OrderingKey::new("9", "1"));
        assert!(OrderingKey::new("007", "1") < OrderingKey::new("10", "1"));
        assert!(
            OrderingKey::new("3", "99999999999999999999999")
                > OrderingKey::new("3", "99999999999999999999998")
        );
        assert!(OrderingKey::new("b", "1") > OrderingKey::new("a", "1"));
    }

    #[test]
    fn version_dominates_session() {
        assert!(OrderingKey::new("3", "1") > OrderingKey::new("2", "9999"));
    }

    #[test]
    fn scans_media_identifiers_once_with_kinds() {
        let ids = media_identifiers(OFFER);
        assert_eq!(
            ids,
            vec![
                MediaIdentifier {
                    kind: TrackKind::Audio,
                    stream_id: "stream-a".into(),
                    track_id: "mic".into(),
                },
                MediaIdentifier {
                    kind: TrackKind::Video,
                    stream_id: "stream-a".into(),
                    track_id: "cam".into(),
                },
            ]
        );
    }

    #[test]
    fn ignores_malformed_msid_lines() {
        let body = "m=audio 9 RTP/AVP 0\na=msid:lonely\na=msid-semantic: WMS x\n";
        assert!(media_identifiers(body).is_empty());
    }
}
