//! Client for the authoriser's local relay socket.
//!
//! The relay answers `GET /` with `404` until the operator has submitted
//! the password, then with `200` and the raw value for as long as the
//! authoriser keeps running.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{header, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Default relay socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ynab-updater_authoriser.sock";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("Unexpected status from relay: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("Relayed secret is not valid UTF-8")]
    InvalidUtf8,

    #[error("No secret relayed within {0:?}")]
    Timeout(Duration),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Reads the secret from a relay socket. Each call opens a new connection.
#[derive(Debug, Clone)]
pub struct RelayClient {
    path: PathBuf,
}

impl RelayClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One request. `Ok(None)` means the relay is up but nothing has been
    /// submitted yet.
    pub async fn fetch(&self) -> ClientResult<Option<Zeroizing<String>>> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.path.clone(),
                source,
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Relay connection closed with error");
            }
        });

        let request = Request::builder()
            .method("GET")
            .uri("/")
            .header(header::HOST, "localhost")
            .body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => {
                let body = response.into_body().collect().await?.to_bytes();
                let secret = String::from_utf8(body.to_vec()).map_err(|_| ClientError::InvalidUtf8)?;
                Ok(Some(Zeroizing::new(secret)))
            }
            other => Err(ClientError::UnexpectedStatus(other)),
        }
    }

    /// Poll until the secret is available or `timeout` elapses.
    ///
    /// A missing socket is treated like "not yet": the authoriser binds it
    /// only after the operator has been notified.
    pub async fn wait_for_secret(
        &self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> ClientResult<Zeroizing<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.fetch().await {
                Ok(Some(secret)) => return Ok(secret),
                Ok(None) => debug!("Secret not submitted yet"),
                Err(ClientError::Connect { source, .. }) => {
                    debug!(error = %source, "Relay socket not available yet")
                }
                Err(e) => {
                    warn!(error = %e, "Relay request failed");
                    return Err(e);
                }
            }

            if Instant::now() + poll_interval > deadline {
                return Err(ClientError::Timeout(timeout));
            }
            sleep(poll_interval).await;
        }
    }
}
