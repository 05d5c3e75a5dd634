//! TOML configuration for the gateway.

use std::path::Path;

use serde::Deserialize;

use {
    courier_common::types::SecurityConfig,
    courier_router::{ProviderInfo, RouterConfig, SkillInfo},
    courier_tunnel::{TunnelConfig, TunnelProvider},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub database: DatabaseConfig,
    pub channels: Vec<ChannelConfig>,
    pub providers: Vec<ProviderConfig>,
    pub skills: Vec<SkillConfig>,
    pub tunnel: Option<TunnelSettings>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            channels: Vec::new(),
            providers: Vec::new(),
            skills: Vec::new(),
            tunnel: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "courier.db".into(),
        }
    }
}

/// One channel endpoint: adapter-specific settings stay an opaque blob.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSettings {
    pub provider: TunnelProvider,
    pub port: u16,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default)]
    pub binary: Option<String>,
}

fn default_true() -> bool {
    true
}

impl GatewayConfig {
    /// Parse a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Router knobs derived from this config.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            providers: self
                .providers
                .iter()
                .map(|p| ProviderInfo {
                    name: p.name.clone(),
                    models: p.models.clone(),
                })
                .collect(),
            skills: self
                .skills
                .iter()
                .map(|s| SkillInfo {
                    name: s.name.clone(),
                    description: s.description.clone(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Tunnel manager config, when a tunnel section is present.
    pub fn tunnel_config(&self) -> Option<TunnelConfig> {
        self.tunnel.as_ref().map(|t| {
            let mut config = TunnelConfig::new(t.provider, t.port);
            config.auto_restart = t.auto_restart;
            config.binary = t.binary.clone();
            config
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_common::types::AccessMode;

    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.database.path, "courier.db");
        assert!(config.channels.is_empty());
        assert!(config.tunnel.is_none());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [database]
            path = "/var/lib/courier/gw.db"

            [[channels]]
            type = "telegram"
            name = "Main bot"
            enabled = true

            [channels.security]
            mode = "pairing"
            pairing_code_ttl_secs = 120
            allowed_users = ["alice"]

            [channels.config]
            token = "123:abc"

            [[providers]]
            name = "anthropic"
            models = ["claude-sonnet", "claude-haiku"]

            [[skills]]
            name = "summarize"
            description = "Summarize a document"

            [tunnel]
            provider = "cloudflare"
            port = 8443
            auto_restart = false
        "#;
        let config: GatewayConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.channels.len(), 1);
        let channel = &config.channels[0];
        assert_eq!(channel.channel_type, "telegram");
        assert!(channel.enabled);
        assert_eq!(channel.security.mode, AccessMode::Pairing);
        assert_eq!(channel.security.pairing_code_ttl_secs, 120);
        assert_eq!(channel.config["token"], "123:abc");

        let router = config.router_config();
        assert_eq!(router.providers.len(), 1);
        assert_eq!(router.providers[0].models.len(), 2);
        assert_eq!(router.skills.len(), 1);

        let tunnel = config.tunnel_config().unwrap();
        assert_eq!(tunnel.provider, TunnelProvider::Cloudflare);
        assert_eq!(tunnel.port, 8443);
        assert!(!tunnel.auto_restart);
    }
}
