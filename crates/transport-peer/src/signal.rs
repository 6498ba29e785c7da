use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PeerError;
use crate::sdp::{self, OrderingKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An offer or answer. The body is opaque apart from the fields scanned in
/// [`crate::sdp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpType::Offer
    }

    pub fn ordering_key(&self) -> Option<OrderingKey> {
        sdp::ordering_key(&self.sdp)
    }
}

/// A network path candidate in its signalled form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_m_line_index: None,
            sdp_mid: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, m_line_index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_m_line_index = Some(m_line_index);
        self
    }
}

/// Message exchanged with the remote peer, either through the caller's relay
/// or in-band over the internal channel once connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalMessage {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalMessage {
    pub fn to_json(&self) -> String {
        // Both variants are plain string/integer records; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(text: &str) -> Result<Self, PeerError> {
        serde_json::from_str(text).map_err(|err| PeerError::MalformedSignal(err.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, PeerError> {
        serde_json::from_value(value).map_err(|err| PeerError::MalformedSignal(err.to_string()))
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match self {
            SignalMessage::Description(description) => Some(description),
            SignalMessage::Candidate(_) => None,
        }
    }

    pub fn candidate(&self) -> Option<&IceCandidate> {
        match self {
            SignalMessage::Candidate(candidate) => Some(candidate),
            SignalMessage::Description(_) => None,
        }
    }
}

impl From<SessionDescription> for SignalMessage {
    fn from(description: SessionDescription) -> Self {
        SignalMessage::Description(description)
    }
}

impl From<IceCandidate> for SignalMessage {
    fn from(candidate: IceCandidate) -> Self {
        SignalMessage::Candidate(candidate)
    }
}

/// Anything [`Peer::signal`](crate::Peer::signal) accepts: a structured
/// message or its serialized text / JSON value equivalent.
#[derive(Debug, Clone)]
pub enum SignalInput {
    Message(SignalMessage),
    Text(String),
    Value(Value),
}

impl SignalInput {
    pub fn decode(self) -> Result<SignalMessage, PeerError> {
        match self {
            SignalInput::Message(message) => Ok(message),
            SignalInput::Text(text) => SignalMessage::from_json(&text),
            SignalInput::Value(value) => SignalMessage::from_value(value),
        }
    }
}

impl From<SignalMessage> for SignalInput {
    fn from(message: SignalMessage) -> Self {
        SignalInput::Message(message)
    }
}

impl From<SessionDescription> for SignalInput {
    fn from(description: SessionDescription) -> Self {
        SignalInput::Message(description.into())
    }
}

impl From<IceCandidate> for SignalInput {
    fn from(candidate: IceCandidate) -> Self {
        SignalInput::Message(candidate.into())
    }
}

impl From<String> for SignalInput {
    fn from(text: String) -> Self {
        SignalInput::Text(text)
    }
}

impl From<&str> for SignalInput {
    fn from(text: &str) -> Self {
        SignalInput::Text(text.to_string())
    }
}

impl From<Value> for SignalInput {
    fn from(value: Value) -> Self {
        SignalInput::Value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_wire_shape() {
        let message = SignalMessage::from(SessionDescription::offer("v=0\r\n"));
        assert_eq!(message.to_value(), json!({ "type": "offer", "sdp": "v=0\r\n" }));
    }

    #[test]
    fn candidate_wire_shape_uses_browser_field_names() {
        let message = SignalMessage::from(IceCandidate::new("candidate:1 1 udp 1 1.2.3.4 9 typ host").with_mid("0", 0));
        assert_eq!(
            message.to_value(),
            json!({
                "candidate": "candidate:1 1 udp 1 1.2.3.4 9 typ host",
                "sdpMLineIndex": 0,
                "sdpMid": "0",
            })
        );
    }

    #[test]
    fn text_and_value_inputs_decode_to_the_same_message() {
        let text = r#"{"type":"answer","sdp":"v=0"}"#;
        let from_text = SignalInput::from(text).decode().expect("text decodes");
        let from_value = SignalInput::from(json!({ "type": "answer", "sdp": "v=0" }))
            .decode()
            .expect("value decodes");
        assert_eq!(from_text, from_value);
        assert_eq!(from_text.description().map(|d| d.kind), Some(SdpType::Answer));
    }

    #[test]
    fn candidate_without_mid_decodes() {
        let message = SignalMessage::from_json(r#"{"candidate":"candidate:x"}"#).expect("decodes");
        assert_eq!(message.candidate(), Some(&IceCandidate::new("candidate:x")));
    }

    #[test]
    fn unknown_description_type_is_malformed() {
        let err = SignalMessage::from_json(r#"{"type":"rollback","sdp":""}"#).unwrap_err();
        assert!(matches!(err, PeerError::MalformedSignal(_)));
        let err = SignalInput::from("not json").decode().unwrap_err();
        assert!(matches!(err, PeerError::MalformedSignal(_)));
    }
}
