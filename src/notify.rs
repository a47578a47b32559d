//! Push notification to the operator's device.

use crate::config::NotifierConfig;
use crate::error::{AuthoriserError, AuthoriserResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

const MESSAGES_PATH: &str = "/1/messages.json";

/// Message asking the operator to open the form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
    pub url: String,
    pub url_title: String,
}

impl NotificationMessage {
    /// Login prompt with the configured wording and no URL yet.
    pub fn template(config: &NotifierConfig) -> Self {
        Self {
            title: config.title.clone(),
            body: config.message.clone(),
            url: String::new(),
            url_title: config.url_title.clone(),
        }
    }

    pub fn for_url(&self, url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..self.clone()
        }
    }
}

/// Provider acknowledgement; logged and otherwise ignored.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub status: i32,
    pub request: String,
}

/// Sends a notification exactly once. Failure aborts the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &NotificationMessage) -> AuthoriserResult<DeliveryReceipt>;
}

/// Form body sent to Pushover
#[derive(Serialize)]
struct PushoverRequest<'a> {
    token: &'a str,
    user: &'a str,
    message: &'a str,
    title: &'a str,
    url: &'a str,
    url_title: &'a str,
}

/// Error body returned by Pushover
#[derive(Debug, Deserialize)]
struct PushoverError {
    #[serde(default)]
    errors: Vec<String>,
}

pub struct PushoverNotifier {
    http: Client,
    url: String,
    api_key: String,
    user_key: String,
}

impl std::fmt::Debug for PushoverNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushoverNotifier")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl PushoverNotifier {
    pub fn new(config: &NotifierConfig) -> AuthoriserResult<Self> {
        let http = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            http,
            url: config.endpoint(MESSAGES_PATH),
            api_key: config.api_key.clone(),
            user_key: config.user_key.clone(),
        })
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn notify(&self, message: &NotificationMessage) -> AuthoriserResult<DeliveryReceipt> {
        let request = PushoverRequest {
            token: &self.api_key,
            user: &self.user_key,
            message: &message.body,
            title: &message.title,
            url: &message.url,
            url_title: &message.url_title,
        };

        let response = self
            .http
            .post(&self.url)
            .form(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Notification request failed: {}", e);
                AuthoriserError::Notification(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<PushoverError>(&body)
                .ok()
                .filter(|e| !e.errors.is_empty())
                .map(|e| e.errors.join("; "))
                .unwrap_or(body);
            return Err(AuthoriserError::Notification(format!(
                "provider returned {status}: {detail}"
            )));
        }

        let receipt: DeliveryReceipt = response.json().await.map_err(|e| {
            AuthoriserError::Notification(format!("invalid provider response: {e}"))
        })?;

        if receipt.status != 1 {
            return Err(AuthoriserError::Notification(format!(
                "provider reported status {} for request {}",
                receipt.status, receipt.request
            )));
        }

        info!(request = %receipt.request, "Notification delivered");
        Ok(receipt)
    }
}
