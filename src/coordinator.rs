//! Lifecycle coordinator.
//!
//! ```text
//! Start ─► CredentialProvisioned ─► TunnelServing ─► Notified ─► LocalServing ─► Terminated
//!                                        │
//!                                        └─ (concurrently) password submitted, public listener closed
//! ```
//!
//! Provisioning, notification and socket bind failures end the run. So
//! does a public form that receives nothing before the submission timeout.
//! Otherwise the run only ends on SIGINT/SIGTERM, after which the relay
//! socket has been unlinked.

use crate::broker::{Provisioner, TailscaleProvisioner};
use crate::config::AuthoriserConfig;
use crate::error::{AuthoriserError, AuthoriserResult};
use crate::notify::{NotificationMessage, Notifier, PushoverNotifier};
use crate::relay::{serve_local, RelaySocket};
use crate::store::{create_secret_store, SharedSecretStore};
use crate::tunnel::{self, serve_public, AcceptAny, FormState, RejectEmpty, SubmissionVerifier, Tunnel};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Where the run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Start,
    CredentialProvisioned,
    TunnelServing,
    Notified,
    LocalServing,
    Terminated,
}

/// Per-run settings the coordinator needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub prompt: NotificationMessage,
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub submission_timeout: Duration,
}

impl RunSettings {
    pub fn from_config(config: &AuthoriserConfig) -> Self {
        Self {
            prompt: NotificationMessage::template(&config.notifier),
            socket_path: config.relay.socket_path.clone(),
            socket_mode: config.relay.socket_mode,
            submission_timeout: config.tunnel.submission_timeout(),
        }
    }
}

pub struct Coordinator {
    provisioner: Arc<dyn Provisioner>,
    tunnel: Arc<dyn Tunnel>,
    notifier: Arc<dyn Notifier>,
    verifier: Arc<dyn SubmissionVerifier>,
    store: SharedSecretStore,
    settings: RunSettings,
    phase: watch::Sender<Phase>,
}

impl Coordinator {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        tunnel: Arc<dyn Tunnel>,
        notifier: Arc<dyn Notifier>,
        settings: RunSettings,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Start);
        Self {
            provisioner,
            tunnel,
            notifier,
            verifier: Arc::new(RejectEmpty),
            store: create_secret_store(),
            settings,
            phase,
        }
    }

    /// Wire up the production collaborators described by `config`.
    pub fn from_config(config: &AuthoriserConfig) -> AuthoriserResult<Self> {
        let provisioner = Arc::new(TailscaleProvisioner::new(&config.broker)?);
        let notifier = Arc::new(PushoverNotifier::new(&config.notifier)?);
        let tunnel = tunnel::from_config(&config.tunnel)?;

        let verifier: Arc<dyn SubmissionVerifier> = if config.tunnel.allow_empty_submission {
            Arc::new(AcceptAny)
        } else {
            Arc::new(RejectEmpty)
        };

        Ok(Self::new(provisioner, tunnel, notifier, RunSettings::from_config(config))
            .with_verifier(verifier))
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SubmissionVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn store(&self) -> SharedSecretStore {
        self.store.clone()
    }

    /// Observe phase transitions.
    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        info!(phase = ?phase, "Lifecycle transition");
        self.phase.send_replace(phase);
    }

    /// Run until a fatal error or until `shutdown` resolves with the name of
    /// the signal that asked us to stop.
    ///
    /// Never returns `Ok` under normal operation: the relay serves forever
    /// and termination is reported as [`AuthoriserError::Terminated`].
    pub async fn run<F>(self, shutdown: F) -> AuthoriserResult<()>
    where
        F: Future<Output = &'static str> + Send,
    {
        tokio::pin!(shutdown);

        let result = tokio::select! {
            result = self.drive() => result,
            signal = &mut shutdown => {
                info!(signal, "Shutdown requested");
                Err(AuthoriserError::Terminated(signal))
            }
        };
        // drive() has been dropped here, so the relay socket is already gone

        self.withdraw_tunnel().await;
        self.enter(Phase::Terminated);
        result
    }

    async fn drive(&self) -> AuthoriserResult<()> {
        self.enter(Phase::Start);

        let credential = self.provisioner.provision().await?;
        self.enter(Phase::CredentialProvisioned);

        let binding = self.tunnel.open(&credential).await?;
        drop(credential);
        let public_url = binding.public_url.clone();

        let form_state = Arc::new(FormState::new(self.store.clone(), self.verifier.clone()));
        let timeout = self.settings.submission_timeout;
        let tunnel = self.tunnel.clone();

        // Aborted on drop, so an early return also stops the public server.
        let mut public = JoinSet::new();
        public.spawn(async move {
            let result = serve_public(binding.listener, form_state, timeout).await;
            if let Err(e) = tunnel.close().await {
                warn!(error = %e, "Failed to withdraw tunnel");
            }
            result
        });
        self.enter(Phase::TunnelServing);

        let receipt = self
            .notifier
            .notify(&self.settings.prompt.for_url(&public_url))
            .await?;
        info!(request = %receipt.request, public_url = %public_url, "Operator notified");
        self.enter(Phase::Notified);

        let socket = RelaySocket::bind(&self.settings.socket_path, self.settings.socket_mode)?;
        self.enter(Phase::LocalServing);

        let local = serve_local(socket, self.store.clone());
        tokio::pin!(local);

        let mut public_running = true;
        loop {
            tokio::select! {
                result = &mut local => return result,
                joined = public.join_next(), if public_running => {
                    public_running = false;
                    match joined {
                        Some(Ok(Ok(()))) => info!("Password captured; relay stays up until terminated"),
                        Some(Ok(Err(e))) => return Err(e),
                        Some(Err(e)) => return Err(AuthoriserError::Task(e.to_string())),
                        None => {}
                    }
                }
            }
        }
    }

    async fn withdraw_tunnel(&self) {
        if let Err(e) = self.tunnel.close().await {
            warn!(error = %e, "Failed to withdraw tunnel during shutdown");
        }
    }
}

/// Resolves on SIGINT or SIGTERM with the signal's name.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGINT");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}
