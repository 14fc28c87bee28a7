use std::{fs, io, path::Path};

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("at least one outbound is required")]
    NoOutbound,

    #[error("vmess inbound on port {0} has no clients")]
    NoClients(u16),

    #[error("duplicate outbound tag {0}")]
    DuplicateTag(String),

    #[error("routing rule points at unknown outbound {0}")]
    UnknownOutbound(String),

    #[error("unsupported security {0}")]
    Security(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    /// Seconds an auth id is remembered by vmess inbounds.
    #[serde(default = "default_replay_window")]
    pub replay_window: i64,
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub routing: Vec<RoutingRule>,
}

fn default_replay_window() -> i64 {
    120
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundConfig {
    pub tag: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
    pub port: u16,
    #[serde(flatten)]
    pub protocol: InboundProtocol,
}

fn default_listen() -> String {
    "127.0.0.1".to_owned()
}

impl InboundConfig {
    pub fn listen_addr(&self) -> String {
        if self.listen.contains(':') {
            format!("[{}]:{}", self.listen, self.port)
        } else {
            format!("{}:{}", self.listen, self.port)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "protocol", content = "settings", rename_all = "kebab-case")]
pub enum InboundProtocol {
    Socks,
    DokodemoDoor(DokodemoSettings),
    Vmess(VmessInboundSettings),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DokodemoSettings {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmessInboundSettings {
    pub clients: Vec<Account>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: Uuid,
    #[serde(default)]
    pub level: u32,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboundConfig {
    pub tag: Option<String>,
    #[serde(flatten)]
    pub protocol: OutboundProtocol,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "protocol", content = "settings", rename_all = "kebab-case")]
pub enum OutboundProtocol {
    Freedom,
    Vmess(VmessOutboundSettings),
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmessOutboundSettings {
    pub address: String,
    pub port: u16,
    pub id: Uuid,
    #[serde(default = "default_security")]
    pub security: String,
}

fn default_security() -> String {
    "aes-128-gcm".to_owned()
}

/// Sends destinations whose host ends with `domain` to a tagged outbound.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRule {
    pub domain: String,
    pub outbound: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.outbounds.is_empty() {
            return Err(ConfigError::NoOutbound);
        }

        let mut tags = Vec::new();
        for outbound in &self.outbounds {
            if let Some(tag) = &outbound.tag {
                if tags.contains(&tag) {
                    return Err(ConfigError::DuplicateTag(tag.clone()));
                }
                tags.push(tag);
            }
            if let OutboundProtocol::Vmess(settings) = &outbound.protocol {
                settings
                    .security
                    .parse::<vmess::Security>()
                    .map_err(|_| ConfigError::Security(settings.security.clone()))?;
            }
        }

        for rule in &self.routing {
            if !tags.contains(&&rule.outbound) {
                return Err(ConfigError::UnknownOutbound(rule.outbound.clone()));
            }
        }

        for inbound in &self.inbounds {
            if let InboundProtocol::Vmess(settings) = &inbound.protocol {
                if settings.clients.is_empty() {
                    return Err(ConfigError::NoClients(inbound.port));
                }
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "log": { "level": "debug" },
        "inbounds": [
            { "tag": "socks-in", "port": 1080, "protocol": "socks" },
            {
                "listen": "0.0.0.0",
                "port": 10086,
                "protocol": "vmess",
                "settings": {
                    "clients": [
                        { "id": "b831381d-6324-4d53-ad4f-8cda48b30811", "email": "love@example.com" }
                    ]
                }
            },
            {
                "port": 2222,
                "protocol": "dokodemo-door",
                "settings": { "address": "10.0.0.2", "port": 22 }
            }
        ],
        "outbounds": [
            { "tag": "direct", "protocol": "freedom" },
            {
                "tag": "proxy",
                "protocol": "vmess",
                "settings": {
                    "address": "vmess.example.com",
                    "port": 443,
                    "id": "b831381d-6324-4d53-ad4f-8cda48b30811"
                }
            }
        ],
        "routing": [{ "domain": "example.org", "outbound": "proxy" }]
    }"#;

    #[test]
    fn parses_every_protocol() {
        let config: Config = FULL.parse().unwrap();
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert_eq!(config.replay_window, 120);

        assert_eq!(config.inbounds.len(), 3);
        assert!(matches!(config.inbounds[0].protocol, InboundProtocol::Socks));
        assert_eq!(config.inbounds[0].listen_addr(), "127.0.0.1:1080");
        match &config.inbounds[1].protocol {
            InboundProtocol::Vmess(settings) => {
                assert_eq!(settings.clients.len(), 1);
                assert_eq!(settings.clients[0].level, 0);
                assert_eq!(settings.clients[0].email.as_deref(), Some("love@example.com"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &config.inbounds[2].protocol {
            InboundProtocol::DokodemoDoor(settings) => {
                assert_eq!(settings.address, "10.0.0.2");
                assert_eq!(settings.port, 22);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(config.outbounds[0].protocol, OutboundProtocol::Freedom));
        match &config.outbounds[1].protocol {
            OutboundProtocol::Vmess(settings) => assert_eq!(settings.security, "aes-128-gcm"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let text = r#"{
            "inbounds": [{ "port": 1, "protocol": "http" }],
            "outbounds": [{ "protocol": "freedom" }]
        }"#;
        assert!(matches!(text.parse::<Config>(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn semantic_errors() {
        assert!(matches!(
            r#"{ "inbounds": [] }"#.parse::<Config>(),
            Err(ConfigError::NoOutbound)
        ));

        let no_clients = r#"{
            "inbounds": [{ "port": 1, "protocol": "vmess", "settings": { "clients": [] } }],
            "outbounds": [{ "protocol": "freedom" }]
        }"#;
        assert!(matches!(
            no_clients.parse::<Config>(),
            Err(ConfigError::NoClients(1))
        ));

        let bad_security = r#"{
            "outbounds": [{
                "protocol": "vmess",
                "settings": {
                    "address": "a", "port": 1,
                    "id": "b831381d-6324-4d53-ad4f-8cda48b30811",
                    "security": "rc4-md5"
                }
            }]
        }"#;
        assert!(matches!(
            bad_security.parse::<Config>(),
            Err(ConfigError::Security(_))
        ));

        let dangling_rule = r#"{
            "outbounds": [{ "tag": "direct", "protocol": "freedom" }],
            "routing": [{ "domain": "x", "outbound": "proxy" }]
        }"#;
        assert!(matches!(
            dangling_rule.parse::<Config>(),
            Err(ConfigError::UnknownOutbound(_))
        ));
    }

    #[test]
    fn ipv6_listen_is_bracketed() {
        let text = r#"{
            "inbounds": [{ "listen": "::", "port": 1080, "protocol": "socks" }],
            "outbounds": [{ "protocol": "freedom" }]
        }"#;
        let config: Config = text.parse().unwrap();
        assert_eq!(config.inbounds[0].listen_addr(), "[::]:1080");
    }
}
