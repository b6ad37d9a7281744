//! External protocol engine driver
//!
//! The engine (an xray-compatible binary) is a black box: it is started per
//! candidate with a generated config that exposes a local SOCKS inbound and
//! dials the candidate as its only outbound. Stages send test traffic
//! through that local endpoint.

use crate::config::EngineConfig;
use crate::error::{EngineError, StageError};
use crate::proxy::models::Candidate;
use crate::proxy::protocol::codec_for;
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, Proxy as ReqwestProxy};
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::debug;

/// Interval between readiness probes of a starting engine
const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Starts protocol engine sessions for candidates
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    async fn start(&self, candidate: &Candidate) -> Result<EngineSession, EngineError>;
}

/// A running tunnel to one candidate
///
/// Dropping the session stops the engine process.
pub struct EngineSession {
    proxy_url: Option<String>,
    child: Option<Child>,
}

impl EngineSession {
    /// Session for an endpoint managed elsewhere (an engine already running)
    pub fn attached(proxy_url: impl Into<String>) -> Self {
        Self {
            proxy_url: Some(proxy_url.into()),
            child: None,
        }
    }

    /// Session that sends traffic straight to its destination
    #[cfg(test)]
    pub(crate) fn direct() -> Self {
        Self {
            proxy_url: None,
            child: None,
        }
    }

    /// Local proxy URL, e.g. `socks5h://127.0.0.1:10808`
    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    /// HTTP client builder routed through the tunnel
    pub fn client_builder(&self, timeout: Duration) -> Result<ClientBuilder, StageError> {
        let builder = Client::builder().timeout(timeout);
        match &self.proxy_url {
            Some(url) => {
                let proxy = ReqwestProxy::all(url)
                    .map_err(|e| StageError::Protocol(format!("invalid engine endpoint: {}", e)))?;
                Ok(builder.proxy(proxy))
            }
            None => Ok(builder.no_proxy()),
        }
    }

    pub fn http_client(&self, timeout: Duration) -> Result<Client, StageError> {
        self.client_builder(timeout)?
            .build()
            .map_err(|e| StageError::Protocol(e.to_string()))
    }

    pub fn is_managed(&self) -> bool {
        self.child.is_some()
    }
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("proxy_url", &self.proxy_url)
            .field("managed", &self.child.is_some())
            .finish()
    }
}

/// Engine backed by an xray-core compatible binary
#[derive(Debug, Clone)]
pub struct XrayEngine {
    config: EngineConfig,
}

impl XrayEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Full engine configuration for a candidate listening on `port`
    pub fn engine_config(candidate: &Candidate, port: u16) -> Value {
        json!({
            "log": { "loglevel": "none" },
            "inbounds": [{
                "tag": "socks-in",
                "listen": "127.0.0.1",
                "port": port,
                "protocol": "socks",
                "settings": { "udp": false },
            }],
            "outbounds": [codec_for(candidate.protocol()).describe(candidate)],
        })
    }

    async fn free_port() -> Result<u16, EngineError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        Ok(listener.local_addr()?.port())
    }

    async fn wait_ready(&self, child: &mut Child, port: u16) -> Result<(), EngineError> {
        let timeout = self.config.startup_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(EngineError::Exited(status.to_string()));
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::StartupTimeout(timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ProtocolEngine for XrayEngine {
    async fn start(&self, candidate: &Candidate) -> Result<EngineSession, EngineError> {
        let port = Self::free_port().await?;
        let config = serde_json::to_vec(&Self::engine_config(candidate, port))
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let mut child = Command::new(&self.config.binary)
            .args(["run", "-config", "stdin:"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&config).await?;
            stdin.shutdown().await?;
        }

        self.wait_ready(&mut child, port).await?;
        debug!(candidate = %candidate, port, "protocol engine ready");

        Ok(EngineSession {
            proxy_url: Some(format!("socks5h://127.0.0.1:{}", port)),
            child: Some(child),
        })
    }
}
