use crate::broker::AccessCredential;
use crate::config::TunnelConfig;
use crate::error::{AuthoriserError, AuthoriserResult};
use crate::tunnel::{Tunnel, TunnelBinding};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Subset of `tailscale status --json`
#[derive(Deserialize)]
struct NodeStatus {
    #[serde(rename = "Self")]
    self_node: Option<PeerStatus>,
}

#[derive(Deserialize)]
struct PeerStatus {
    #[serde(rename = "DNSName", default)]
    dns_name: String,
}

/// Publishes the form through Tailscale Funnel.
///
/// The local listener is bound first, then the node joins the tailnet with
/// the single-use key and Funnel is pointed at the listener's port. Closing
/// resets Funnel and logs the node out, which removes the ephemeral device.
#[derive(Debug)]
pub struct FunnelTunnel {
    tailscale_bin: String,
    tailscale_socket: Option<PathBuf>,
    hostname: String,
    listen_addr: SocketAddr,
    public_url: Option<String>,
    /// Set once `tailscale up` succeeded; cleared by `close`
    joined: AtomicBool,
}

impl FunnelTunnel {
    pub fn new(config: &TunnelConfig) -> AuthoriserResult<Self> {
        Ok(Self {
            tailscale_bin: config.tailscale_bin.clone(),
            tailscale_socket: config.tailscale_socket.clone(),
            hostname: config.hostname.clone(),
            listen_addr: config.listen_addr()?,
            public_url: config.public_url.clone(),
            joined: AtomicBool::new(false),
        })
    }

    /// Run the tailscale CLI and return its stdout. `shown` is logged in
    /// place of the real arguments.
    async fn tailscale(&self, args: &[String], shown: &str) -> AuthoriserResult<Vec<u8>> {
        debug!(command = %shown, "Running tailscale");

        let mut command = Command::new(&self.tailscale_bin);
        if let Some(socket) = &self.tailscale_socket {
            command.arg(format!("--socket={}", socket.display()));
        }
        let output = command
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AuthoriserError::tunnel(format!("failed to run {}: {e}", self.tailscale_bin))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthoriserError::tunnel(format!(
                "`{shown}` exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Join the tailnet. The key is handed over in a 0600 temp file so it
    /// never appears in the process table; the file is removed on return.
    async fn join(&self, credential: &AccessCredential) -> AuthoriserResult<()> {
        let mut key_file = NamedTempFile::with_prefix("authoriser-key-")?;
        key_file.write_all(credential.key.as_bytes())?;
        key_file.flush()?;

        self.tailscale(
            &[
                "up".to_string(),
                "--reset".to_string(),
                format!("--auth-key=file:{}", key_file.path().display()),
                format!("--hostname={}", self.hostname),
            ],
            &format!(
                "tailscale up --reset --auth-key=file:<redacted> --hostname={}",
                self.hostname
            ),
        )
        .await?;

        self.joined.store(true, Ordering::SeqCst);
        info!(hostname = %self.hostname, credential_id = %credential.id, "Joined tailnet");
        Ok(())
    }

    async fn publish(&self, port: u16) -> AuthoriserResult<String> {
        self.tailscale(
            &["funnel".to_string(), "--bg".to_string(), port.to_string()],
            &format!("tailscale funnel --bg {port}"),
        )
        .await?;

        match &self.public_url {
            Some(url) => Ok(url.clone()),
            None => self.discover_url().await,
        }
    }

    /// `https://<MagicDNS name>/` of this node
    async fn discover_url(&self) -> AuthoriserResult<String> {
        let stdout = self
            .tailscale(
                &["status".to_string(), "--json".to_string()],
                "tailscale status --json",
            )
            .await?;

        let status: NodeStatus = serde_json::from_slice(&stdout)
            .map_err(|e| AuthoriserError::tunnel(format!("unreadable tailscale status: {e}")))?;
        let dns_name = status
            .self_node
            .map(|node| node.dns_name)
            .unwrap_or_default();
        let dns_name = dns_name.trim_end_matches('.');
        if dns_name.is_empty() {
            return Err(AuthoriserError::tunnel(
                "tailscale status reported no DNS name for this node",
            ));
        }
        Ok(format!("https://{dns_name}/"))
    }
}

#[async_trait]
impl Tunnel for FunnelTunnel {
    async fn open(&self, credential: &AccessCredential) -> AuthoriserResult<TunnelBinding> {
        if credential.is_expired(Utc::now()) {
            warn!(credential_id = %credential.id, "Access credential already expired");
        }

        let listener = TcpListener::bind(self.listen_addr).await.map_err(|e| {
            AuthoriserError::tunnel(format!("failed to bind {}: {e}", self.listen_addr))
        })?;
        let port = listener.local_addr()?.port();

        self.join(credential).await?;

        let public_url = match self.publish(port).await {
            Ok(url) => url,
            Err(e) => {
                if let Err(close_err) = self.close().await {
                    warn!(error = %close_err, "Failed to leave tailnet after publish failure");
                }
                return Err(e);
            }
        };

        info!(
            local = %self.listen_addr,
            public_url = %public_url,
            "Public form published through Funnel"
        );

        Ok(TunnelBinding {
            listener,
            public_url,
        })
    }

    async fn close(&self) -> AuthoriserResult<()> {
        if !self.joined.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let reset = self
            .tailscale(
                &["funnel".to_string(), "reset".to_string()],
                "tailscale funnel reset",
            )
            .await;
        if let Err(e) = &reset {
            warn!(error = %e, "Failed to reset Funnel");
        }

        // Logging out deletes the ephemeral node straight away
        self.tailscale(&["logout".to_string()], "tailscale logout").await?;
        reset?;

        info!("Funnel withdrawn and node logged out");
        Ok(())
    }
}

/// Binds locally and does nothing else. For development and tests; the
/// credential is not used.
#[derive(Debug, Clone)]
pub struct LoopbackTunnel {
    listen_addr: SocketAddr,
}

impl LoopbackTunnel {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }
}

#[async_trait]
impl Tunnel for LoopbackTunnel {
    async fn open(&self, _credential: &AccessCredential) -> AuthoriserResult<TunnelBinding> {
        let listener = TcpListener::bind(self.listen_addr).await.map_err(|e| {
            AuthoriserError::tunnel(format!("failed to bind {}: {e}", self.listen_addr))
        })?;
        let public_url = format!("http://{}/", listener.local_addr()?);
        info!(public_url = %public_url, "Public form bound on loopback");

        Ok(TunnelBinding {
            listener,
            public_url,
        })
    }
}
