//! Public password form, reachable only through the brokered tunnel.
//!
//! ## Flow
//!
//! ```text
//!   AccessCredential
//!         │
//!         ▼
//! ┌───────────────┐   bind listener, join tailnet,
//! │    Tunnel     │   publish via Funnel
//! └───────┬───────┘
//!         │ TunnelBinding { listener, public_url }
//!         ▼
//! ┌───────────────┐   GET /  → form
//! │ serve_public  │   POST / → SecretStore::write, then close
//! └───────┬───────┘
//!         │ listener dropped; later connects are refused
//!         ▼
//!   Tunnel::close
//! ```

pub mod form;
pub mod funnel;

pub use form::{
    form_router, serve_public, AcceptAny, FormError, FormState, RejectEmpty, SubmissionVerifier,
};
pub use funnel::{FunnelTunnel, LoopbackTunnel};

use crate::broker::AccessCredential;
use crate::config::{TunnelConfig, TunnelKind};
use crate::error::AuthoriserResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpListener;

/// A bound public listener and the URL the operator reaches it at.
#[derive(Debug)]
pub struct TunnelBinding {
    pub listener: TcpListener,
    pub public_url: String,
}

/// Exposes a local listener publicly using a single-use credential.
///
/// `open` must only return once the listener is accepting connections, so
/// the URL can be handed to the operator straight away.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn open(&self, credential: &AccessCredential) -> AuthoriserResult<TunnelBinding>;

    /// Withdraw the public route after the listener has stopped. Must be a
    /// no-op when nothing is published, as it may run more than once.
    async fn close(&self) -> AuthoriserResult<()> {
        Ok(())
    }
}

/// Build the tunnel selected by `tunnel.kind`.
pub fn from_config(config: &TunnelConfig) -> AuthoriserResult<Arc<dyn Tunnel>> {
    let addr = config.listen_addr()?;
    Ok(match config.kind {
        TunnelKind::Funnel => Arc::new(FunnelTunnel::new(config)?),
        TunnelKind::Loopback => Arc::new(LoopbackTunnel::new(addr)),
    })
}
