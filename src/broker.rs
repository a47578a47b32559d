//! Trust broker client: issues the single-use key the public listener
//! joins the tailnet with.
//!
//! Two calls per run, no retries: an OAuth2 client-credentials token
//! exchange, then one `POST` to the key-issuance endpoint. Any failure is
//! fatal for the run.

use crate::config::BrokerConfig;
use crate::error::{AuthoriserError, AuthoriserResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthType, AuthUrl, ClientId, ClientSecret, Scope, TokenResponse, TokenUrl};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

const TOKEN_PATH: &str = "/api/v2/oauth/token";

/// Single-use, short-lived key issued by the broker.
#[derive(Clone, Deserialize)]
pub struct AccessCredential {
    pub id: String,
    pub key: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl AccessCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    /// Time left before the broker stops accepting the key
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessCredential")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("created", &self.created)
            .field("expires", &self.expires)
            .finish()
    }
}

/// Body of the key-issuance request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequest {
    pub capabilities: Capabilities,
    pub expiry_seconds: u64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Capabilities {
    pub devices: DeviceCapabilities,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceCapabilities {
    pub create: CreateCapability,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateCapability {
    pub reusable: bool,
    pub ephemeral: bool,
    pub preauthorized: bool,
    pub tags: Vec<String>,
}

impl KeyRequest {
    /// Non-reusable, ephemeral, pre-authorized key scoped to `tags`.
    pub fn single_use(tags: Vec<String>, expiry_seconds: u64, description: String) -> Self {
        Self {
            capabilities: Capabilities {
                devices: DeviceCapabilities {
                    create: CreateCapability {
                        reusable: false,
                        ephemeral: true,
                        preauthorized: true,
                        tags,
                    },
                },
            },
            expiry_seconds,
            description,
        }
    }
}

/// Source of access credentials.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self) -> AuthoriserResult<AccessCredential>;
}

/// Provisioner backed by the Tailscale API.
pub struct TailscaleProvisioner {
    http: Client,
    oauth: BasicClient,
    scopes: Vec<String>,
    keys_url: String,
    request: KeyRequest,
}

impl std::fmt::Debug for TailscaleProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailscaleProvisioner")
            .field("keys_url", &self.keys_url)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl TailscaleProvisioner {
    pub fn new(config: &BrokerConfig) -> AuthoriserResult<Self> {
        let http = Client::builder().timeout(config.timeout()).build()?;

        let token_url = config.endpoint(TOKEN_PATH);
        let oauth = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            // Client-credentials never visits the authorization endpoint
            AuthUrl::new(token_url.clone())
                .map_err(|e| AuthoriserError::invalid_config(format!("token url: {e}")))?,
            Some(
                TokenUrl::new(token_url)
                    .map_err(|e| AuthoriserError::invalid_config(format!("token url: {e}")))?,
            ),
        )
        .set_auth_type(AuthType::RequestBody);

        Ok(Self {
            http,
            oauth,
            scopes: config.scopes.clone(),
            keys_url: config.endpoint(&format!("/api/v2/tailnet/{}/keys?all=true", config.tailnet)),
            request: KeyRequest::single_use(
                config.tags.clone(),
                config.expiry_secs,
                config.description.clone(),
            ),
        })
    }

    async fn access_token(&self) -> AuthoriserResult<String> {
        let mut request = self.oauth.exchange_client_credentials();
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        let token = request.request_async(async_http_client).await.map_err(|e| {
            error!("Token exchange failed: {}", e);
            AuthoriserError::BrokerAuth(e.to_string())
        })?;

        let secret = token.access_token().secret();
        if secret.trim().is_empty() {
            return Err(AuthoriserError::BrokerAuth(
                "token response did not include access_token".to_string(),
            ));
        }
        Ok(secret.clone())
    }
}

#[async_trait]
impl Provisioner for TailscaleProvisioner {
    async fn provision(&self) -> AuthoriserResult<AccessCredential> {
        let token = self.access_token().await?;
        debug!("Obtained broker access token");

        let response = self
            .http
            .post(&self.keys_url)
            .bearer_auth(token)
            .json(&self.request)
            .send()
            .await
            .map_err(|e| AuthoriserError::Provisioning(format!("POST keys failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthoriserError::Provisioning(format!(
                "POST keys returned {status}: {body}"
            )));
        }

        let credential: AccessCredential = response.json().await.map_err(|e| {
            AuthoriserError::InvalidBrokerResponse(format!("key response: {e}"))
        })?;

        if credential.key.trim().is_empty() {
            return Err(AuthoriserError::InvalidBrokerResponse(
                "key response did not include a key".to_string(),
            ));
        }

        info!(
            credential_id = %credential.id,
            expires = %credential.expires,
            valid_for_secs = credential.remaining(Utc::now()).as_secs(),
            "Issued single-use access credential"
        );
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Form, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Seen {
        token_form: Option<HashMap<String, String>>,
        authorization: Option<String>,
        body: Option<Value>,
    }

    type Shared = Arc<Mutex<Seen>>;

    async fn token(
        State(seen): State<Shared>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        seen.lock().unwrap().token_form = Some(form);
        Json(json!({ "access_token": "bearer-123", "token_type": "Bearer", "expires_in": 3600 }))
    }

    async fn keys(
        State(seen): State<Shared>,
        headers: axum::http::HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let mut seen = seen.lock().unwrap();
        seen.authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.body = Some(body);
        Json(json!({
            "id": "k1",
            "key": "tskey-auth-abc",
            "created": "2026-10-19T10:00:00Z",
            "expires": "2026-10-19T10:00:10Z"
        }))
    }

    async fn spawn_broker(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn broker_config(base: &str) -> BrokerConfig {
        BrokerConfig {
            client_id: "client-1".to_string(),
            client_secret: "secret-1".to_string(),
            api_base_url: base.to_string(),
            tailnet: "-".to_string(),
            tags: vec!["tag:ynab-updater".to_string()],
            expiry_secs: 10,
            description: "ynab-updater_authoriser".to_string(),
            scopes: vec![],
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_key_request_wire_format() {
        let request = KeyRequest::single_use(
            vec!["tag:ynab-updater".to_string()],
            10,
            "desc".to_string(),
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "capabilities": { "devices": { "create": {
                    "reusable": false,
                    "ephemeral": true,
                    "preauthorized": true,
                    "tags": ["tag:ynab-updater"]
                }}},
                "expirySeconds": 10,
                "description": "desc"
            })
        );
    }

    #[test]
    fn test_credential_expiry() {
        let credential: AccessCredential = serde_json::from_value(json!({
            "id": "k1",
            "key": "abc",
            "created": "2026-10-19T10:00:00Z",
            "expires": "2026-10-19T10:00:10Z"
        }))
        .unwrap();

        let created = credential.created;
        assert!(!credential.is_expired(created));
        assert_eq!(credential.remaining(created), Duration::from_secs(10));
        assert!(credential.is_expired(credential.expires));
        assert_eq!(
            credential.remaining(credential.expires + chrono::Duration::seconds(5)),
            Duration::ZERO
        );
        assert!(!format!("{:?}", credential).contains("abc"));
    }

    #[tokio::test]
    async fn test_provision_flow() {
        let seen: Shared = Arc::default();
        let router = Router::new()
            .route("/api/v2/oauth/token", post(token))
            .route("/api/v2/tailnet/{tailnet}/keys", post(keys))
            .with_state(seen.clone());
        let base = spawn_broker(router).await;

        let provisioner = TailscaleProvisioner::new(&broker_config(&base)).unwrap();
        let credential = provisioner.provision().await.unwrap();

        assert_eq!(credential.id, "k1");
        assert_eq!(credential.key, "tskey-auth-abc");

        let seen = seen.lock().unwrap();
        let form = seen.token_form.as_ref().unwrap();
        assert_eq!(form.get("grant_type").map(String::as_str), Some("client_credentials"));
        assert_eq!(form.get("client_id").map(String::as_str), Some("client-1"));
        assert_eq!(form.get("client_secret").map(String::as_str), Some("secret-1"));
        assert_eq!(seen.authorization.as_deref(), Some("Bearer bearer-123"));
        assert_eq!(seen.body.as_ref().unwrap()["expirySeconds"], json!(10));
    }

    #[tokio::test]
    async fn test_provision_auth_failure_is_error() {
        let router = Router::new().route(
            "/api/v2/oauth/token",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "invalid_client" })),
                )
            }),
        );
        let base = spawn_broker(router).await;

        let provisioner = TailscaleProvisioner::new(&broker_config(&base)).unwrap();
        let err = provisioner.provision().await.unwrap_err();
        assert!(matches!(err, AuthoriserError::BrokerAuth(_)));
    }

    #[tokio::test]
    async fn test_provision_malformed_key_response() {
        let seen: Shared = Arc::default();
        let router = Router::new()
            .route("/api/v2/oauth/token", post(token))
            .route(
                "/api/v2/tailnet/{tailnet}/keys",
                post(|| async { Json(json!({ "id": "k1" })) }),
            )
            .with_state(seen);
        let base = spawn_broker(router).await;

        let provisioner = TailscaleProvisioner::new(&broker_config(&base)).unwrap();
        let err = provisioner.provision().await.unwrap_err();
        assert!(matches!(err, AuthoriserError::InvalidBrokerResponse(_)));
    }

    #[tokio::test]
    async fn test_provision_key_endpoint_rejection() {
        let seen: Shared = Arc::default();
        let router = Router::new()
            .route("/api/v2/oauth/token", post(token))
            .route(
                "/api/v2/tailnet/{tailnet}/keys",
                post(|| async { (StatusCode::FORBIDDEN, "missing scope auth_keys") }),
            )
            .with_state(seen);
        let base = spawn_broker(router).await;

        let provisioner = TailscaleProvisioner::new(&broker_config(&base)).unwrap();
        let err = provisioner.provision().await.unwrap_err();
        assert!(matches!(err, AuthoriserError::Provisioning(_)));
        assert!(err.to_string().contains("403"));
    }
}
