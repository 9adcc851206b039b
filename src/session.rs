use crate::config::EngineConfig;
use crate::model::ProxyEndpoint;
use crate::probe::{self, ProbeReport, ProxiedRequest};
use crate::synth::{self, ConfigError};
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("engine binary not found at {0}")]
    EngineNotFound(String),
    #[error("failed to start engine: {0}")]
    SpawnFailed(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

const STOP_GRACE: Duration = Duration::from_secs(2);

/// A running engine instance fronting one endpoint: the child process, its
/// temporary working directory and the local SOCKS port. The child is spawned
/// with kill_on_drop and the directory is a TempDir, so both are released on
/// every exit path even when `stop` is never reached.
#[derive(Debug)]
pub struct ProxySession {
    child: Child,
    _dir: TempDir,
    socks_port: u16,
    proxy_url: String,
}

impl ProxySession {
    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn proxy_url(&self) -> &str {
        &self.proxy_url
    }

    /// Graceful stop: termination signal, bounded wait, force-kill.
    pub async fn stop(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let _ = Command::new("kill").arg(pid.to_string()).status().await;
            if timeout(STOP_GRACE, self.child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!("engine pid {pid} ignored the termination signal, killing");
        }
        let _ = self.child.kill().await;
    }
}

/// One-shot probing interface over endpoint sessions. The engine-backed
/// implementation spawns a real process per call; tests substitute a fake
/// that scripts the reports.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Opens a session, issues one request through it, tears the session
    /// down. Never fails: config/session/probe faults become the report.
    async fn check(&self, endpoint: &ProxyEndpoint, request: ProxiedRequest<'_>) -> ProbeReport;

    /// Same lifecycle, but returns the response JSON (long-poll reuse).
    async fn fetch_json(
        &self,
        endpoint: &ProxyEndpoint,
        url: &str,
        query: &[(&str, String)],
        request_timeout: Duration,
    ) -> Option<Value>;
}

/// Spawns and tears down engine processes. One instance is shared by the
/// scheduler, the notification router and the live-monitor handler.
pub struct SessionManager {
    engine: EngineConfig,
}

impl SessionManager {
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Persistent session: synthesize, spawn, wait out the startup grace.
    /// The caller owns the session and must stop it exactly once; dropping
    /// it without stopping still reclaims the process and directory.
    pub async fn open(&self, endpoint: &ProxyEndpoint) -> Result<ProxySession, SessionError> {
        let socks_port = free_port().map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // Synthesis failures abort before anything is allocated.
        let config = synth::build_config(endpoint, socks_port)?;

        let dir = tempfile::Builder::new()
            .prefix("proxywatch-")
            .tempdir()
            .map_err(|e| SessionError::SpawnFailed(format!("tempdir: {e}")))?;
        let config_path = dir.path().join("engine.json");
        let body = serde_json::to_vec_pretty(&config)
            .map_err(|e| SessionError::SpawnFailed(format!("serialize config: {e}")))?;
        tokio::fs::write(&config_path, body)
            .await
            .map_err(|e| SessionError::SpawnFailed(format!("write config: {e}")))?;

        let child = Command::new(&self.engine.binary)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SessionError::EngineNotFound(self.engine.binary.clone()),
                _ => SessionError::SpawnFailed(e.to_string()),
            })?;

        tracing::debug!(
            endpoint = endpoint.id,
            socks_port,
            "engine session started, waiting out startup grace"
        );
        // No readiness probe; the engine gets a fixed grace period to bind.
        sleep(self.engine.startup_delay()).await;

        Ok(ProxySession {
            child,
            _dir: dir,
            socks_port,
            proxy_url: format!("socks5h://127.0.0.1:{socks_port}"),
        })
    }
}

#[async_trait]
impl Prober for SessionManager {
    async fn check(&self, endpoint: &ProxyEndpoint, request: ProxiedRequest<'_>) -> ProbeReport {
        let session = match self.open(endpoint).await {
            Ok(session) => session,
            Err(e) => return ProbeReport::down(format!("engine session error: {e}")),
        };

        let report = match probe::socks_client(session.proxy_url()) {
            Ok(client) => ProbeReport::from_result(probe::timed_request(&client, &request).await),
            Err(e) => ProbeReport::down(format!("proxy client error: {e}")),
        };

        session.stop().await;
        report
    }

    async fn fetch_json(
        &self,
        endpoint: &ProxyEndpoint,
        url: &str,
        query: &[(&str, String)],
        request_timeout: Duration,
    ) -> Option<Value> {
        let session = match self.open(endpoint).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("engine session for relayed fetch failed: {e}");
                return None;
            }
        };

        let result = match probe::socks_client(session.proxy_url()) {
            Ok(client) => probe::json_request(&client, url, query, request_timeout).await,
            Err(e) => {
                tracing::warn!("proxy client for relayed fetch failed: {e}");
                None
            }
        };

        session.stop().await;
        result
    }
}

/// An OS-assigned free loopback port. The listener is dropped before the
/// engine binds, so a collision under concurrent allocation is possible;
/// there is no retry.
fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_link;

    fn manager(binary: &str) -> SessionManager {
        SessionManager::new(EngineConfig {
            binary: binary.to_string(),
            test_url: "https://www.google.com/generate_204".into(),
            startup_delay_ms: 0,
            request_timeout_ms: 1000,
            monitor_timeout_ms: 500,
        })
    }

    #[test]
    fn free_ports_are_loopback_bindable() {
        let port = free_port().unwrap();
        assert!(port > 0);
        // The port was just released, rebinding must work.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn missing_binary_surfaces_engine_not_found() {
        let manager = manager("/nonexistent/proxywatch-engine");
        let endpoint = parse_link("vless://u@h:443").unwrap().into_endpoint(1);

        let err = manager.open(&endpoint).await.unwrap_err();
        assert!(matches!(err, SessionError::EngineNotFound(_)));

        // Through the one-shot path the same failure becomes a report.
        let report = manager
            .check(
                &endpoint,
                ProxiedRequest::get("http://example.com", Duration::from_secs(1)),
            )
            .await;
        assert!(!report.ok);
        assert!(report.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn config_errors_abort_before_spawn() {
        let manager = manager("/nonexistent/proxywatch-engine");
        let mut endpoint = parse_link("vless://u@h:443").unwrap().into_endpoint(1);
        endpoint.credential = None;

        let err = manager.open(&endpoint).await.unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }
}
