//! Local relay: republishes the captured secret on a Unix domain socket.
//!
//! Only processes that can open the socket file (mode `0600` by default)
//! can read the secret. The socket lives for the rest of the process and is
//! unlinked on every exit path through [`RelaySocket`]'s drop guard.

pub mod socket;

pub use socket::RelaySocket;

use crate::error::AuthoriserResult;
use crate::store::SharedSecretStore;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Handler: GET /
///
/// 404 with no body until the secret arrives, then 200 with the raw value.
async fn get_secret(State(store): State<SharedSecretStore>) -> Response {
    match store.read().await {
        Some(secret) => {
            debug!("Relayed secret to local client");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                // Zeroized when hyper drops the body
                Body::from(Bytes::from_owner(secret)),
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Create the local relay router.
pub fn relay_router(store: SharedSecretStore) -> Router {
    Router::new()
        .route("/", get(get_secret))
        .with_state(store)
}

/// Serve the relay on an already-bound socket. Runs until the task is
/// dropped; the socket path is removed when `socket` goes out of scope.
pub async fn serve_local(socket: RelaySocket, store: SharedSecretStore) -> AuthoriserResult<()> {
    let router = relay_router(store).layer(TraceLayer::new_for_http());
    let (listener, guard) = socket.into_parts();

    info!(path = %guard.path().display(), "Local relay serving");
    axum::serve(listener, router).await?;
    drop(guard);
    Ok(())
}
