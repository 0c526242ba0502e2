//! Connectivity configuration.

use serde::{Deserialize, Serialize};

/// Public STUN servers used when nothing else is configured.
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Number of candidates pre-gathered before negotiation starts.
pub const DEFAULT_ICE_CANDIDATE_POOL_SIZE: u8 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Settings of the underlying peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
            ice_candidate_pool_size: DEFAULT_ICE_CANDIDATE_POOL_SIZE,
        }
    }
}

impl ConnectivityConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ConnectivityConfig::default();

        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.ice_servers.len(), DEFAULT_STUN_SERVERS.len());
        assert_eq!(
            config.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r#"{"ice_candidate_pool_size": 4}"#;
        let config = ConnectivityConfig::from_json_str(raw).unwrap();

        assert_eq!(config.ice_candidate_pool_size, 4);
        let defaults = ConnectivityConfig::default();
        assert_eq!(config.ice_servers, defaults.ice_servers);
    }

    #[test]
    fn custom_servers() {
        let config = ConnectivityConfig::from_json_str(
            r#"{"ice_servers": [{"urls": ["turn:turn.example.org"],
                "username": "u", "credential": "p"}]}"#,
        )
        .unwrap();

        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(config.ice_candidate_pool_size, 10);
    }
}
