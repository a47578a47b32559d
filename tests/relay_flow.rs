//! End-to-end runs of the coordinator with in-process collaborators.
//!
//! The public form is served on loopback, the relay on a socket in a temp
//! directory, and the broker and push provider are replaced by doubles.

use async_trait::async_trait;
use authoriser::broker::{AccessCredential, Provisioner};
use authoriser::coordinator::RunSettings;
use authoriser::notify::{DeliveryReceipt, NotificationMessage, Notifier};
use authoriser::relay::RelaySocket;
use authoriser::tunnel::{LoopbackTunnel, Tunnel, TunnelBinding};
use authoriser::{AuthoriserError, AuthoriserResult, Coordinator, Phase};
use authoriser_client::RelayClient;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct FixedProvisioner;

#[async_trait]
impl Provisioner for FixedProvisioner {
    async fn provision(&self) -> AuthoriserResult<AccessCredential> {
        let now = Utc::now();
        Ok(AccessCredential {
            id: "k1".to_string(),
            key: "abc".to_string(),
            created: now,
            expires: now + chrono::Duration::seconds(10),
        })
    }
}

struct FailingProvisioner;

#[async_trait]
impl Provisioner for FailingProvisioner {
    async fn provision(&self) -> AuthoriserResult<AccessCredential> {
        Err(AuthoriserError::Provisioning("broker returned 500".to_string()))
    }
}

struct FailingTunnel;

#[async_trait]
impl Tunnel for FailingTunnel {
    async fn open(&self, _credential: &AccessCredential) -> AuthoriserResult<TunnelBinding> {
        Err(AuthoriserError::tunnel("address already in use"))
    }
}

/// Records every message; optionally fails each delivery.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<NotificationMessage>>,
    fail: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn last_url(&self) -> String {
        self.sent.lock().unwrap().last().unwrap().url.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &NotificationMessage) -> AuthoriserResult<DeliveryReceipt> {
        self.sent.lock().unwrap().push(message.clone());
        if self.fail {
            return Err(AuthoriserError::Notification("invalid token".to_string()));
        }
        Ok(DeliveryReceipt {
            status: 1,
            request: "req-1".to_string(),
        })
    }
}

fn settings(socket_path: &Path, submission_timeout: Duration) -> RunSettings {
    RunSettings {
        prompt: NotificationMessage {
            title: "Log in".to_string(),
            body: "Log into ynab-updater".to_string(),
            url: String::new(),
            url_title: "Open form".to_string(),
        },
        socket_path: socket_path.to_path_buf(),
        socket_mode: 0o600,
        submission_timeout,
    }
}

fn loopback() -> Arc<dyn Tunnel> {
    Arc::new(LoopbackTunnel::new("127.0.0.1:0".parse().unwrap()))
}

/// Spawn a run; the returned sender plays the part of SIGTERM.
fn spawn_run(
    coordinator: Coordinator,
) -> (oneshot::Sender<()>, JoinHandle<AuthoriserResult<()>>) {
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(coordinator.run(async move {
        let _ = rx.await;
        "SIGTERM"
    }));
    (tx, handle)
}

fn socket_in(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("authoriser.sock")
}

async fn wait_until_refused(addr: &str) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("public listener at {addr} is still accepting connections");
}

#[tokio::test]
async fn test_password_flows_from_form_to_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let notifier = Arc::new(RecordingNotifier::default());

    let coordinator = Coordinator::new(
        Arc::new(FixedProvisioner),
        loopback(),
        notifier.clone(),
        settings(&path, Duration::from_secs(30)),
    );
    let store = coordinator.store();
    let mut phases = coordinator.phases();
    let (shutdown, run) = spawn_run(coordinator);

    phases.wait_for(|p| *p >= Phase::LocalServing).await.unwrap();
    assert_eq!(*phases.borrow(), Phase::LocalServing);
    assert_eq!(notifier.count(), 1);

    // Relay is up but nothing has been submitted
    let client = RelayClient::new(&path);
    assert!(client.fetch().await.unwrap().is_none());

    let url = notifier.last_url();
    let http = reqwest::Client::new();
    let response = http
        .post(&url)
        .form(&[("password", "hunter2")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.text().await.unwrap().contains("Saved password"));
    drop(http);

    assert_eq!(store.read().await.unwrap().expose(), "hunter2");

    let addr = url.trim_start_matches("http://").trim_end_matches('/').to_string();
    wait_until_refused(&addr).await;

    let secret = client
        .wait_for_secret(Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(secret.as_str(), "hunter2");

    // Still served on repeat reads, and still only one notification
    assert_eq!(client.fetch().await.unwrap().unwrap().as_str(), "hunter2");
    assert_eq!(notifier.count(), 1);

    shutdown.send(()).unwrap();
    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, AuthoriserError::Terminated("SIGTERM")));
    assert!(!path.exists());
    assert_eq!(*phases.borrow(), Phase::Terminated);
}

#[tokio::test]
async fn test_provisioning_failure_stops_before_anything_is_exposed() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let notifier = Arc::new(RecordingNotifier::default());

    let coordinator = Coordinator::new(
        Arc::new(FailingProvisioner),
        loopback(),
        notifier.clone(),
        settings(&path, Duration::from_secs(30)),
    );
    let err = coordinator.run(std::future::pending::<&'static str>()).await.unwrap_err();

    assert!(matches!(err, AuthoriserError::Provisioning(_)));
    assert_eq!(notifier.count(), 0);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_tunnel_failure_skips_notification() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let notifier = Arc::new(RecordingNotifier::default());

    let coordinator = Coordinator::new(
        Arc::new(FixedProvisioner),
        Arc::new(FailingTunnel),
        notifier.clone(),
        settings(&path, Duration::from_secs(30)),
    );
    let err = coordinator.run(std::future::pending::<&'static str>()).await.unwrap_err();

    assert!(matches!(err, AuthoriserError::Tunnel(_)));
    assert_eq!(notifier.count(), 0);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_notification_failure_never_binds_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let notifier = Arc::new(RecordingNotifier::failing());

    let coordinator = Coordinator::new(
        Arc::new(FixedProvisioner),
        loopback(),
        notifier.clone(),
        settings(&path, Duration::from_secs(30)),
    );
    let err = coordinator.run(std::future::pending::<&'static str>()).await.unwrap_err();

    assert!(matches!(err, AuthoriserError::Notification(_)));
    assert_eq!(notifier.count(), 1);
    assert!(!path.exists());

    // The public listener went down with the run
    wait_until_refused(&notifier.last_url().trim_start_matches("http://").trim_end_matches('/')).await;
}

#[tokio::test]
async fn test_submission_timeout_fails_run_and_removes_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let notifier = Arc::new(RecordingNotifier::default());

    let coordinator = Coordinator::new(
        Arc::new(FixedProvisioner),
        loopback(),
        notifier.clone(),
        settings(&path, Duration::from_millis(200)),
    );
    let err = coordinator.run(std::future::pending::<&'static str>()).await.unwrap_err();

    assert!(matches!(err, AuthoriserError::SubmissionTimeout(_)));
    assert_eq!(notifier.count(), 1);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_second_instance_fails_on_live_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);
    let first = RelaySocket::bind(&path, 0o600).unwrap();

    let coordinator = Coordinator::new(
        Arc::new(FixedProvisioner),
        loopback(),
        Arc::new(RecordingNotifier::default()),
        settings(&path, Duration::from_secs(30)),
    );
    let err = coordinator.run(std::future::pending::<&'static str>()).await.unwrap_err();

    assert!(matches!(err, AuthoriserError::SocketInUse(_)));
    // The live instance keeps its socket
    assert!(path.exists());
    drop(first);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_termination_before_submission_removes_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_in(&dir);

    let coordinator = Coordinator::new(
        Arc::new(FixedProvisioner),
        loopback(),
        Arc::new(RecordingNotifier::default()),
        settings(&path, Duration::from_secs(30)),
    );
    let mut phases = coordinator.phases();
    let (shutdown, run) = spawn_run(coordinator);

    phases.wait_for(|p| *p >= Phase::LocalServing).await.unwrap();
    assert!(path.exists());

    shutdown.send(()).unwrap();
    let err = run.await.unwrap().unwrap_err();
    assert!(err.is_termination());
    assert!(!path.exists());
}
