//! Tunnel process lifecycle.
//!
//! State machine: `stopped → starting → running`, or `→ error`. `start()` is
//! idempotent: concurrent callers serialize behind an internal lock and a
//! caller arriving while the tunnel runs gets the cached URL. An unexpected
//! process exit while running schedules exactly one debounced restart when
//! `auto_restart` is set. `stop()` is safe in every state.

use std::{
    process::Stdio,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    regex::Regex,
    serde::Serialize,
    tokio::{
        io::{AsyncBufRead, AsyncBufReadExt, BufReader},
        process::{Child, Command},
    },
    tracing::{debug, info, warn},
};

use crate::{Error, Result, provider::TunnelProvider};

const NGROK_STATUS_API: &str = "http://127.0.0.1:4040/api/tunnels";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Tunnel configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub provider: TunnelProvider,
    /// Local port the public URL forwards to.
    pub port: u16,
    /// Restart the provider process once after an unexpected exit.
    pub auto_restart: bool,
    /// Provider binary override; discovered on PATH when unset.
    pub binary: Option<String>,
    /// How long to wait for the provider to report a URL.
    pub start_timeout: Duration,
    /// Delay before an automatic restart attempt.
    pub restart_debounce: Duration,
}

impl TunnelConfig {
    pub fn new(provider: TunnelProvider, port: u16) -> Self {
        Self {
            provider,
            port,
            auto_restart: true,
            binary: None,
            start_timeout: Duration::from_secs(30),
            restart_debounce: Duration::from_secs(2),
        }
    }
}

/// Observable tunnel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TunnelState {
    Stopped,
    Starting,
    Running { url: String },
    Error { message: String },
}

struct Shared {
    config: TunnelConfig,
    /// Serializes `start()`/`stop()`; concurrent starters await one outcome.
    start_lock: tokio::sync::Mutex<()>,
    state: Mutex<TunnelState>,
    child: tokio::sync::Mutex<Option<Child>>,
    restart_pending: AtomicBool,
    /// Bumped on every start/stop; stale monitors and restart timers bail
    /// when their generation no longer matches.
    generation: AtomicU64,
}

/// Obtains and maintains a public URL forwarding to a local port.
#[derive(Clone)]
pub struct TunnelManager {
    shared: Arc<Shared>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                start_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(TunnelState::Stopped),
                child: tokio::sync::Mutex::new(None),
                restart_pending: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The public URL, when running.
    pub fn url(&self) -> Option<String> {
        match self.state() {
            TunnelState::Running { url } => Some(url),
            _ => None,
        }
    }

    fn set_state(&self, state: TunnelState) {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Start the tunnel and return its public URL.
    ///
    /// Already running: returns the cached URL. Concurrent callers while
    /// starting: await the in-flight attempt's outcome.
    pub async fn start(&self) -> Result<String> {
        let _guard = self.shared.start_lock.lock().await;

        if let TunnelState::Running { url } = self.state() {
            return Ok(url);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(TunnelState::Starting);
        info!(
            provider = %self.shared.config.provider,
            port = self.shared.config.port,
            "starting tunnel"
        );

        match self.launch().await {
            Ok(url) => {
                self.set_state(TunnelState::Running { url: url.clone() });
                info!(provider = %self.shared.config.provider, url = %url, "tunnel running");
                self.spawn_monitor(generation);
                Ok(url)
            },
            Err(e) => {
                // Reap a half-started process so it cannot linger.
                if let Some(mut child) = self.shared.child.lock().await.take() {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                self.set_state(TunnelState::Error {
                    message: e.to_string(),
                });
                Err(e)
            },
        }
    }

    /// Stop the tunnel. Safe to call in any state; clears any pending
    /// restart timer.
    pub async fn stop(&self) {
        let _guard = self.shared.start_lock.lock().await;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.restart_pending.store(false, Ordering::SeqCst);

        if let Some(mut child) = self.shared.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "tunnel process kill failed");
            }
            let _ = child.wait().await;
        }

        if self.shared.config.provider == TunnelProvider::Tailscale
            && let Ok(binary) = self.resolve_binary()
        {
            let _ = run_once(&binary, &["serve", "reset"]).await;
        }

        self.set_state(TunnelState::Stopped);
        info!(provider = %self.shared.config.provider, "tunnel stopped");
    }

    // ── Provider launch strategies ──────────────────────────────────────────

    async fn launch(&self) -> Result<String> {
        let binary = self.resolve_binary()?;
        let port = self.shared.config.port;
        let timeout = self.shared.config.start_timeout;

        match self.shared.config.provider {
            TunnelProvider::Tailscale => self.launch_tailscale(&binary, port).await,
            TunnelProvider::Ngrok => {
                let child = Command::new(&binary)
                    .args(["http", &port.to_string()])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()?;
                *self.shared.child.lock().await = Some(child);
                self.poll_ngrok_api(port, timeout).await
            },
            TunnelProvider::Cloudflare => {
                let mut child = Command::new(&binary)
                    .args(["tunnel", "--url", &format!("http://localhost:{port}")])
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .spawn()?;
                let stderr = child.stderr.take();
                *self.shared.child.lock().await = Some(child);
                let Some(stderr) = stderr else {
                    return Err(Error::ExitedEarly {
                        provider: "cloudflare".into(),
                        code: None,
                    });
                };
                self.scan_output(BufReader::new(stderr), cloudflare_url, timeout)
                    .await
            },
            TunnelProvider::Localtunnel => {
                let mut child = Command::new(&binary)
                    .args(["--port", &port.to_string()])
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()?;
                let stdout = child.stdout.take();
                *self.shared.child.lock().await = Some(child);
                let Some(stdout) = stdout else {
                    return Err(Error::ExitedEarly {
                        provider: "localtunnel".into(),
                        code: None,
                    });
                };
                self.scan_output(BufReader::new(stdout), localtunnel_url, timeout)
                    .await
            },
        }
    }

    /// Tailscale has no long-running child: `serve --bg` registers the proxy
    /// and exits, and the URL is derived from `status --json`.
    async fn launch_tailscale(&self, binary: &str, port: u16) -> Result<String> {
        let target = format!("http://127.0.0.1:{port}");
        let output = run_once(binary, &["serve", "--bg", "--yes", &target]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stderr = %stderr.trim(), "tailscale serve failed");
            return Err(Error::ExitedEarly {
                provider: "tailscale".into(),
                code: output.status.code(),
            });
        }

        let status = run_once(binary, &["status", "--json"]).await?;
        let value: serde_json::Value = serde_json::from_slice(&status.stdout)?;
        tailscale_hostname(&value)
            .map(|host| format!("https://{host}"))
            .ok_or_else(|| Error::Timeout {
                provider: "tailscale".into(),
                waited_secs: 0,
            })
    }

    async fn poll_ngrok_api(&self, port: u16, timeout: Duration) -> Result<String> {
        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(code) = self.child_exit_code().await {
                return Err(Error::ExitedEarly {
                    provider: "ngrok".into(),
                    code,
                });
            }
            if let Ok(resp) = client.get(NGROK_STATUS_API).send().await
                && let Ok(value) = resp.json::<serde_json::Value>().await
                && let Some(url) = ngrok_public_url(&value, port)
            {
                return Ok(url);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    provider: "ngrok".into(),
                    waited_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn scan_output<R>(
        &self,
        reader: R,
        extract: fn(&str) -> Option<String>,
        timeout: Duration,
    ) -> Result<String>
    where
        R: AsyncBufRead + Unpin,
    {
        let provider = self.shared.config.provider.as_str().to_string();
        let scan = async {
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(provider = %provider, line = %line, "tunnel output");
                if let Some(url) = extract(&line) {
                    return Some(url);
                }
            }
            None
        };
        match tokio::time::timeout(timeout, scan).await {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(Error::ExitedEarly {
                provider: self.shared.config.provider.as_str().into(),
                code: self.child_exit_code().await.flatten(),
            }),
            Err(_) => Err(Error::Timeout {
                provider: self.shared.config.provider.as_str().into(),
                waited_secs: timeout.as_secs(),
            }),
        }
    }

    async fn child_exit_code(&self) -> Option<Option<i32>> {
        let mut child = self.shared.child.lock().await;
        match child.as_mut()?.try_wait() {
            Ok(Some(status)) => {
                *child = None;
                Some(status.code())
            },
            Ok(None) => None,
            Err(_) => {
                *child = None;
                Some(None)
            },
        }
    }

    fn resolve_binary(&self) -> Result<String> {
        if let Some(binary) = &self.shared.config.binary {
            if std::path::Path::new(binary).exists() {
                return Ok(binary.clone());
            }
            return Err(Error::ProviderMissing {
                provider: self.shared.config.provider.as_str().into(),
                hint: format!("configured binary '{binary}' does not exist"),
            });
        }
        let name = self.shared.config.provider.binary();
        which::which(name)
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|_| Error::ProviderMissing {
                provider: self.shared.config.provider.as_str().into(),
                hint: format!("install '{name}' or set the tunnel binary path"),
            })
    }

    // ── Exit monitoring / auto-restart ──────────────────────────────────────

    fn spawn_monitor(&self, generation: u64) {
        let mgr = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                if mgr.shared.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let exited = {
                    let mut child = mgr.shared.child.lock().await;
                    match child.as_mut() {
                        // Tailscale mode or already reaped: nothing to watch.
                        None => return,
                        Some(c) => match c.try_wait() {
                            Ok(None) => None,
                            Ok(Some(status)) => {
                                *child = None;
                                Some(status.code())
                            },
                            Err(_) => {
                                *child = None;
                                Some(None)
                            },
                        },
                    }
                };
                if let Some(code) = exited {
                    mgr.on_unexpected_exit(generation, code).await;
                    return;
                }
            }
        });
    }

    async fn on_unexpected_exit(&self, generation: u64, code: Option<i32>) {
        warn!(
            provider = %self.shared.config.provider,
            ?code,
            "tunnel process exited unexpectedly"
        );
        self.set_state(TunnelState::Error {
            message: format!("process exited (code {code:?})"),
        });

        if !self.shared.config.auto_restart {
            return;
        }
        // A single debounce timer schedules exactly one restart; exits
        // observed while a timer is armed are ignored.
        if self.shared.restart_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let mgr = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(mgr.shared.config.restart_debounce).await;
            mgr.shared.restart_pending.store(false, Ordering::SeqCst);
            if mgr.shared.generation.load(Ordering::SeqCst) != generation {
                // stop() or a manual start superseded this timer.
                return;
            }
            if let Err(e) = mgr.start().await {
                warn!(error = %e, "tunnel auto-restart failed");
            }
        });
    }
}

// ── URL discovery helpers ───────────────────────────────────────────────────

async fn run_once(binary: &str, args: &[&str]) -> Result<std::process::Output> {
    Ok(Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?)
}

fn cloudflare_url(line: &str) -> Option<String> {
    let re = Regex::new(r"https://[a-zA-Z0-9-]+\.trycloudflare\.com").ok()?;
    re.find(line).map(|m| m.as_str().to_string())
}

fn localtunnel_url(line: &str) -> Option<String> {
    let re = Regex::new(r"your url is:\s*(https://\S+)").ok()?;
    re.captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn ngrok_public_url(value: &serde_json::Value, port: u16) -> Option<String> {
    let tunnels = value.get("tunnels")?.as_array()?;
    let local = format!(":{port}");
    tunnels
        .iter()
        .filter(|t| {
            t.pointer("/config/addr")
                .and_then(|a| a.as_str())
                .is_none_or(|addr| addr.ends_with(&local))
        })
        .filter_map(|t| t.get("public_url").and_then(|u| u.as_str()))
        .find(|u| u.starts_with("https://"))
        .map(String::from)
}

fn tailscale_hostname(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/Self/DNSName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim_end_matches('.').to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cloudflare_url_extraction() {
        let line = "2026-01-01T00:00:00Z INF |  https://witty-crab-example.trycloudflare.com  |";
        assert_eq!(
            cloudflare_url(line).unwrap(),
            "https://witty-crab-example.trycloudflare.com"
        );
        assert!(cloudflare_url("connecting to edge").is_none());
    }

    #[test]
    fn localtunnel_url_extraction() {
        assert_eq!(
            localtunnel_url("your url is: https://tame-otter-7.loca.lt").unwrap(),
            "https://tame-otter-7.loca.lt"
        );
        assert!(localtunnel_url("tunnel established").is_none());
    }

    #[test]
    fn ngrok_tunnel_parsing() {
        let value = serde_json::json!({
            "tunnels": [
                {"public_url": "http://abc.ngrok.io", "config": {"addr": "http://localhost:8080"}},
                {"public_url": "https://abc.ngrok.io", "config": {"addr": "http://localhost:8080"}},
                {"public_url": "https://other.ngrok.io", "config": {"addr": "http://localhost:9999"}}
            ]
        });
        assert_eq!(
            ngrok_public_url(&value, 8080).unwrap(),
            "https://abc.ngrok.io"
        );
        assert!(ngrok_public_url(&serde_json::json!({"tunnels": []}), 8080).is_none());
    }

    #[test]
    fn tailscale_hostname_parsing() {
        let value = serde_json::json!({"Self": {"DNSName": "box.tail1234.ts.net."}});
        assert_eq!(tailscale_hostname(&value).unwrap(), "box.tail1234.ts.net");
        assert!(tailscale_hostname(&serde_json::json!({})).is_none());
    }

    #[tokio::test]
    async fn stop_is_safe_when_stopped() {
        let mgr = TunnelManager::new(TunnelConfig::new(TunnelProvider::Localtunnel, 3000));
        assert_eq!(mgr.state(), TunnelState::Stopped);
        mgr.stop().await;
        mgr.stop().await;
        assert_eq!(mgr.state(), TunnelState::Stopped);
        assert!(mgr.url().is_none());
    }

    #[tokio::test]
    async fn missing_binary_fails_start() {
        let mut config = TunnelConfig::new(TunnelProvider::Localtunnel, 3000);
        config.binary = Some("/nonexistent/courier-test-tunnel".into());
        let mgr = TunnelManager::new(config);

        let err = mgr.start().await.unwrap_err();
        assert!(matches!(err, Error::ProviderMissing { .. }));
        assert!(matches!(mgr.state(), TunnelState::Error { .. }));
        // stop() recovers cleanly.
        mgr.stop().await;
        assert_eq!(mgr.state(), TunnelState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        use std::{io::Write, os::unix::fs::PermissionsExt};

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-lt");
        {
            let mut f = std::fs::File::create(&script).unwrap();
            writeln!(f, "#!/bin/sh").unwrap();
            writeln!(f, "echo 'your url is: https://fake-tunnel.loca.lt'").unwrap();
            writeln!(f, "sleep 60").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = TunnelConfig::new(TunnelProvider::Localtunnel, 3000);
        config.binary = Some(script.to_string_lossy().into_owned());
        config.auto_restart = false;
        let mgr = TunnelManager::new(config);

        let url = mgr.start().await.unwrap();
        assert_eq!(url, "https://fake-tunnel.loca.lt");
        assert_eq!(mgr.url().as_deref(), Some("https://fake-tunnel.loca.lt"));

        // Second start returns the cached URL without respawning.
        let again = mgr.start().await.unwrap();
        assert_eq!(again, url);

        mgr.stop().await;
        assert_eq!(mgr.state(), TunnelState::Stopped);
    }
}
