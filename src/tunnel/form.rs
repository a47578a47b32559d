//! Public form handlers and the single-submission server loop.

use crate::error::{AuthoriserError, AuthoriserResult};
use crate::store::{Secret, SharedSecretStore, WriteOutcome};
use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Router,
};
use serde::Deserialize;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use zeroize::Zeroize;

const ACK_HTML: &str = "<html><script type='text/javascript'>window.alert('Saved password');</script></html>\n";

const ALREADY_SUBMITTED_HTML: &str = "<html><p>A password has already been submitted.</p></html>\n";

/// Decides whether a submitted value is accepted as the secret.
///
/// A rejection keeps the listener open and re-renders the form with the
/// returned reason.
pub trait SubmissionVerifier: Send + Sync {
    fn verify(&self, candidate: &str) -> Result<(), String>;
}

/// Accepts anything, including an empty string.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAny;

impl SubmissionVerifier for AcceptAny {
    fn verify(&self, _candidate: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Rejects the empty string.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectEmpty;

impl SubmissionVerifier for RejectEmpty {
    fn verify(&self, candidate: &str) -> Result<(), String> {
        if candidate.is_empty() {
            return Err("Password must not be empty".to_string());
        }
        Ok(())
    }
}

/// The password form, with the verifier's reason above it after a rejection.
#[derive(Template)]
#[template(
    ext = "html",
    source = r#"<html>
<meta name="viewport" content='width=device-width,initial-scale=1,maximum-scale=1' />
{% match error %}{% when Some with (notice) %}<p style='color:#b00020;font-size:24px;'>{{ notice }}</p>
{% when None %}{% endmatch %}<form action='/' method='POST' style='height:50%;margin-top:25%;'>
  <input id='password' name='password' type='password' style='width:100%;height:10%;margin-bottom:10px;font-size:30px;'/>
  <button style='width:100%;height:10%;font-size:30px;'>Submit</button>
</form>
</html>
"#
)]
struct PasswordPage<'a> {
    error: Option<&'a str>,
}

/// Form body posted by the browser
#[derive(Deserialize)]
struct PasswordForm {
    #[serde(default)]
    password: String,
}

impl Drop for PasswordForm {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Public form errors.
#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Already submitted")]
    AlreadySubmitted,

    #[error("Template error: {0}")]
    Render(#[from] askama::Error),
}

impl IntoResponse for FormError {
    fn into_response(self) -> Response {
        match self {
            FormError::Rejected(reason) => match (PasswordPage { error: Some(&reason) }).render() {
                Ok(html) => (StatusCode::BAD_REQUEST, Html(html)).into_response(),
                Err(e) => FormError::Render(e).into_response(),
            },
            FormError::AlreadySubmitted => {
                (StatusCode::CONFLICT, Html(ALREADY_SUBMITTED_HTML)).into_response()
            }
            FormError::Render(e) => {
                warn!(error = %e, "Failed to render password form");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Shared state for the public form.
pub struct FormState {
    pub store: SharedSecretStore,
    pub verifier: Arc<dyn SubmissionVerifier>,
    /// Cancelled once the secret is stored; stops the listener
    pub closed: CancellationToken,
}

impl FormState {
    pub fn new(store: SharedSecretStore, verifier: Arc<dyn SubmissionVerifier>) -> Self {
        Self {
            store,
            verifier,
            closed: CancellationToken::new(),
        }
    }
}

/// Handler: GET /
async fn show_form() -> Result<Html<String>, FormError> {
    Ok(Html(PasswordPage { error: None }.render()?))
}

/// Handler: POST /
///
/// Stores the password, then signals the listener to close. The store
/// write completes before the signal, so the relay never misses it.
async fn submit(
    State(state): State<Arc<FormState>>,
    Form(mut form): Form<PasswordForm>,
) -> Result<Html<&'static str>, FormError> {
    if let Err(reason) = state.verifier.verify(&form.password) {
        warn!(reason = %reason, "Submission rejected; form stays open");
        return Err(FormError::Rejected(reason));
    }

    let secret = Secret::new(std::mem::take(&mut form.password));
    match state.store.write(secret).await {
        WriteOutcome::Accepted => {
            info!("Password received; closing public listener");
            state.closed.cancel();
            Ok(Html(ACK_HTML))
        }
        WriteOutcome::AlreadyPresent => {
            warn!("Second submission arrived before the listener closed; ignored");
            Err(FormError::AlreadySubmitted)
        }
    }
}

/// Create the public form router.
pub fn form_router(state: Arc<FormState>) -> Router {
    Router::new()
        .route("/", get(show_form).post(submit))
        .with_state(state)
}

/// Serve the form until one submission is accepted or `timeout` elapses.
///
/// On success the listener has been dropped by the time this returns. On
/// timeout the listener is dropped as well and the run is treated as failed.
pub async fn serve_public(
    listener: TcpListener,
    state: Arc<FormState>,
    timeout: Duration,
) -> AuthoriserResult<()> {
    let closed = state.closed.clone();
    let router = form_router(state).layer(TraceLayer::new_for_http());

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(closed.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = tokio::time::sleep(timeout) => {
            if !closed.is_cancelled() {
                closed.cancel();
                warn!(timeout_secs = timeout.as_secs(), "No submission received; public listener force-closed");
                return Err(AuthoriserError::SubmissionTimeout(timeout));
            }
            // A submission landed right at the deadline; let it finish.
            (&mut server).await?;
        }
    }

    if !closed.is_cancelled() {
        return Err(AuthoriserError::tunnel(
            "public listener stopped before a password was submitted",
        ));
    }

    info!("Public listener closed");
    Ok(())
}
