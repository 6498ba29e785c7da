use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const DEFAULT_STUN_URL: &str = "stun:23.21.150.121";
pub const DEFAULT_GATHER_DEBOUNCE: Duration = Duration::from_millis(250);
pub const DEFAULT_NEGOTIATION_DEBOUNCE: Duration = Duration::from_millis(50);
/// Label of the channel the peer reserves for in-band signaling.
pub const INTERNAL_CHANNEL_LABEL: &str = "internal";

/// Which side produces the first offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    #[default]
    Responder,
}

impl Role {
    /// Derives the role from both identifiers: the larger id offers. Equal
    /// ids cannot be ordered and yield `None`.
    pub fn from_ids(local: &str, remote: &str) -> Option<Role> {
        match local.cmp(remote) {
            std::cmp::Ordering::Greater => Some(Role::Initiator),
            std::cmp::Ordering::Less => Some(Role::Responder),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// How gathered candidates are released during the initial handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateMode {
    /// Emit the description at once, then every candidate as it is found.
    #[default]
    Trickle,
    /// Hold everything back and emit one finalized description.
    Batched,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Data channel options, applied verbatim by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelOptions {
    pub ordered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiated: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            protocol: String::new(),
            negotiated: None,
        }
    }
}

impl ChannelOptions {
    pub fn unordered() -> Self {
        Self {
            ordered: false,
            ..Default::default()
        }
    }
}

/// Configuration of a [`Peer`](crate::Peer).
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    /// Local identifier; a random one is generated when unset.
    pub id: Option<String>,
    /// Role used when `connect` is called without a remote identifier.
    pub role: Role,
    pub candidate_mode: CandidateMode,
    /// Options for channels created without explicit options.
    pub channel_config: ChannelOptions,
    pub ice_servers: Vec<IceServer>,
    /// Opaque transport configuration, handed to the transport factory as is.
    pub transport_config: Value,
    pub gather_debounce: Duration,
    pub negotiation_debounce: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: None,
            role: Role::Responder,
            candidate_mode: CandidateMode::Trickle,
            channel_config: ChannelOptions::default(),
            ice_servers: vec![IceServer::new(DEFAULT_STUN_URL)],
            transport_config: Value::Null,
            gather_debounce: DEFAULT_GATHER_DEBOUNCE,
            negotiation_debounce: DEFAULT_NEGOTIATION_DEBOUNCE,
        }
    }
}

impl PeerConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            ..Default::default()
        }
    }

    /// Defaults overridden by `PEER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(trickle) = parse_bool(lookup("PEER_TRICKLE")) {
            config.candidate_mode = if trickle {
                CandidateMode::Trickle
            } else {
                CandidateMode::Batched
            };
        }
        if let Some(urls) = lookup("PEER_ICE_SERVERS") {
            config.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::new)
                .collect();
        }
        config.gather_debounce = parse_millis(
            lookup("PEER_GATHER_DEBOUNCE_MS"),
            DEFAULT_GATHER_DEBOUNCE,
        );
        config.negotiation_debounce = parse_millis(
            lookup("PEER_NEGOTIATION_DEBOUNCE_MS"),
            DEFAULT_NEGOTIATION_DEBOUNCE,
        );
        config
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_candidate_mode(mut self, mode: CandidateMode) -> Self {
        self.candidate_mode = mode;
        self
    }

    pub fn with_trickle(self, trickle: bool) -> Self {
        self.with_candidate_mode(if trickle {
            CandidateMode::Trickle
        } else {
            CandidateMode::Batched
        })
    }

    pub fn with_channel_config(mut self, options: ChannelOptions) -> Self {
        self.channel_config = options;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_transport_config(mut self, config: Value) -> Self {
        self.transport_config = config;
        self
    }

    pub fn with_gather_debounce(mut self, debounce: Duration) -> Self {
        self.gather_debounce = debounce;
        self
    }

    pub fn with_negotiation_debounce(mut self, debounce: Duration) -> Self {
        self.negotiation_debounce = debounce;
        self
    }
}

fn parse_bool(value: Option<String>) -> Option<bool> {
    match value?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_millis(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Option names as accepted from JSON configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerOptions {
    pub id: Option<String>,
    pub initiator: bool,
    pub trickle: Option<bool>,
    pub channel_config: Option<ChannelOptions>,
    pub ice_servers: Option<Vec<IceServer>>,
    pub config: Option<Value>,
}

impl From<PeerOptions> for PeerConfig {
    fn from(options: PeerOptions) -> Self {
        let defaults = PeerConfig::default();
        PeerConfig {
            id: options.id,
            role: if options.initiator {
                Role::Initiator
            } else {
                Role::Responder
            },
            candidate_mode: match options.trickle {
                Some(false) => CandidateMode::Batched,
                _ => CandidateMode::Trickle,
            },
            channel_config: options.channel_config.unwrap_or(defaults.channel_config),
            ice_servers: options.ice_servers.unwrap_or(defaults.ice_servers),
            transport_config: options.config.unwrap_or(Value::Null),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn larger_id_initiates() {
        assert_eq!(Role::from_ids("b", "a"), Some(Role::Initiator));
        assert_eq!(Role::from_ids("a", "b"), Some(Role::Responder));
        assert_eq!(Role::from_ids("same", "same"), None);
    }

    #[test]
    fn options_map_onto_config() {
        let options: PeerOptions = serde_json::from_value(json!({
            "id": "peer-1",
            "initiator": true,
            "trickle": false,
            "channelConfig": { "ordered": false, "maxRetransmits": 0 },
            "iceServers": [{ "urls": "stun:example.org" }, { "urls": ["turn:a", "turn:b"], "username": "u" }],
            "config": { "bundlePolicy": "max-bundle" },
        }))
        .expect("options parse");
        let config = PeerConfig::from(options);
        assert_eq!(config.id.as_deref(), Some("peer-1"));
        assert_eq!(config.role, Role::Initiator);
        assert_eq!(config.candidate_mode, CandidateMode::Batched);
        assert!(!config.channel_config.ordered);
        assert_eq!(config.channel_config.max_retransmits, Some(0));
        assert_eq!(config.ice_servers[0].urls, vec!["stun:example.org".to_string()]);
        assert_eq!(config.ice_servers[1].urls.len(), 2);
        assert_eq!(config.transport_config, json!({ "bundlePolicy": "max-bundle" }));
        assert_eq!(config.gather_debounce, DEFAULT_GATHER_DEBOUNCE);
    }

    #[test]
    fn empty_options_keep_defaults() {
        let config = PeerConfig::from(PeerOptions::default());
        assert_eq!(config, PeerConfig::default());
        assert_eq!(config.ice_servers, vec![IceServer::new(DEFAULT_STUN_URL)]);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PEER_TRICKLE", "off"),
            ("PEER_ICE_SERVERS", "stun:a, stun:b,"),
            ("PEER_GATHER_DEBOUNCE_MS", "40"),
            ("PEER_NEGOTIATION_DEBOUNCE_MS", "zero"),
        ]);
        let config = PeerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.candidate_mode, CandidateMode::Batched);
        assert_eq!(
            config.ice_servers,
            vec![IceServer::new("stun:a"), IceServer::new("stun:b")]
        );
        assert_eq!(config.gather_debounce, Duration::from_millis(40));
        assert_eq!(config.negotiation_debounce, DEFAULT_NEGOTIATION_DEBOUNCE);
    }

    #[test]
    fn empty_ice_server_list_means_local_only() {
        let config = PeerConfig::from_lookup(|key| (key == "PEER_ICE_SERVERS").then(String::new));
        assert!(config.ice_servers.is_empty());
    }
}
