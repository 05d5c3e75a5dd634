use serde::{Deserialize, Serialize};

/// Supported tunneling providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProvider {
    Ngrok,
    Tailscale,
    Cloudflare,
    Localtunnel,
}

impl TunnelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ngrok => "ngrok",
            Self::Tailscale => "tailscale",
            Self::Cloudflare => "cloudflare",
            Self::Localtunnel => "localtunnel",
        }
    }

    /// CLI binary expected on PATH for this provider.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Ngrok => "ngrok",
            Self::Tailscale => "tailscale",
            Self::Cloudflare => "cloudflared",
            Self::Localtunnel => "lt",
        }
    }
}

impl std::fmt::Display for TunnelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TunnelProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ngrok" => Ok(Self::Ngrok),
            "tailscale" => Ok(Self::Tailscale),
            "cloudflare" | "cloudflared" => Ok(Self::Cloudflare),
            "localtunnel" | "lt" => Ok(Self::Localtunnel),
            other => Err(format!(
                "unknown tunnel provider: '{other}' (expected ngrok, tailscale, cloudflare, or localtunnel)"
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn provider_from_str() {
        assert_eq!("ngrok".parse::<TunnelProvider>().unwrap(), TunnelProvider::Ngrok);
        assert_eq!(
            "Cloudflared".parse::<TunnelProvider>().unwrap(),
            TunnelProvider::Cloudflare
        );
        assert_eq!(
            "lt".parse::<TunnelProvider>().unwrap(),
            TunnelProvider::Localtunnel
        );
        assert!("frp".parse::<TunnelProvider>().is_err());
    }

    #[test]
    fn provider_display_matches_config_values() {
        assert_eq!(TunnelProvider::Tailscale.to_string(), "tailscale");
        assert_eq!(TunnelProvider::Cloudflare.binary(), "cloudflared");
    }
}
