use crate::error::{AuthoriserError, AuthoriserResult};
use config::{Config, Environment, File};
use reqwest::Url;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the settings file inside the operator-supplied config directory.
pub const CONFIG_FILENAME: &str = "settings.toml";

/// Prefix for environment overrides, e.g. `AUTHORISER_BROKER__CLIENT_SECRET`.
pub const ENV_PREFIX: &str = "AUTHORISER";

/// Trust broker (Tailscale API) configuration
#[derive(Deserialize, Clone)]
pub struct BrokerConfig {
    /// OAuth client id (flat key `TS_OAUTH_CLIENT_ID`)
    #[serde(default)]
    pub client_id: String,
    /// OAuth client secret (flat key `TS_OAUTH_CLIENT_SECRET`)
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_broker_url")]
    pub api_base_url: String,
    /// Tailnet name; `-` selects the tailnet the OAuth client belongs to
    #[serde(default = "default_tailnet")]
    pub tailnet: String,
    /// Tags applied to the device the issued key creates
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    /// Lifetime of the issued key. Only needs to cover joining the tailnet.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default = "default_description")]
    pub description: String,
    /// OAuth scopes to request; empty uses the client's own scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_broker_url() -> String {
    "https://api.tailscale.com".to_string()
}

fn default_tailnet() -> String {
    "-".to_string()
}

fn default_tags() -> Vec<String> {
    vec!["tag:ynab-updater".to_string()]
}

fn default_expiry_secs() -> u64 {
    10
}

fn default_description() -> String {
    "ynab-updater_authoriser".to_string()
}

fn default_http_timeout_secs() -> u64 {
    15
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base_url: default_broker_url(),
            tailnet: default_tailnet(),
            tags: default_tags(),
            expiry_secs: default_expiry_secs(),
            description: default_description(),
            scopes: Vec::new(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("tailnet", &self.tailnet)
            .field("tags", &self.tags)
            .field("expiry_secs", &self.expiry_secs)
            .finish_non_exhaustive()
    }
}

/// Push notification (Pushover) configuration
#[derive(Deserialize, Clone)]
pub struct NotifierConfig {
    /// Application API token (flat key `PUSHOVER_API_KEY`)
    #[serde(default)]
    pub api_key: String,
    /// Recipient user key (flat key `PUSHOVER_USER_KEY`)
    #[serde(default)]
    pub user_key: String,
    #[serde(default = "default_pushover_url")]
    pub api_base_url: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_url_title")]
    pub url_title: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_pushover_url() -> String {
    "https://api.pushover.net".to_string()
}

fn default_title() -> String {
    "Log in".to_string()
}

fn default_message() -> String {
    "Log into ynab-updater".to_string()
}

fn default_url_title() -> String {
    "Open form".to_string()
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            user_key: String::new(),
            api_base_url: default_pushover_url(),
            title: default_title(),
            message: default_message(),
            url_title: default_url_title(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for NotifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierConfig")
            .field("api_key", &"<redacted>")
            .field("user_key", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

/// How the public form is exposed
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    /// Published through Tailscale Funnel using the issued key
    #[default]
    Funnel,
    /// Bound locally only (development)
    Loopback,
}

/// Public form listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    #[serde(default)]
    pub kind: TunnelKind,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Machine name the node joins the tailnet as
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Public URL sent to the operator. For `funnel` it is read from
    /// `tailscale status` when unset.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_tailscale_bin")]
    pub tailscale_bin: String,
    /// Control socket of a dedicated tailscaled; the system daemon when unset
    #[serde(default)]
    pub tailscale_socket: Option<PathBuf>,
    /// Force-close the public listener if nothing is submitted in time
    #[serde(default = "default_submission_timeout_secs")]
    pub submission_timeout_secs: u64,
    /// Accept an empty password instead of re-rendering the form
    #[serde(default)]
    pub allow_empty_submission: bool,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8443".to_string()
}

fn default_hostname() -> String {
    "ynab-updater".to_string()
}

fn default_tailscale_bin() -> String {
    "tailscale".to_string()
}

fn default_submission_timeout_secs() -> u64 {
    600
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            kind: TunnelKind::default(),
            listen_addr: default_listen_addr(),
            hostname: default_hostname(),
            public_url: None,
            tailscale_bin: default_tailscale_bin(),
            tailscale_socket: None,
            submission_timeout_secs: default_submission_timeout_secs(),
            allow_empty_submission: false,
        }
    }
}

/// Local relay socket configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after bind
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/ynab-updater_authoriser.sock")
}

fn default_socket_mode() -> u32 {
    0o600
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
        }
    }
}

/// Flat top-level keys of the `settings.toml` shared with the balance
/// updaters. Used only where the matching section field is unset.
#[derive(Debug, Default, Deserialize)]
struct LegacyKeys {
    #[serde(default, alias = "TS_OAUTH_CLIENT_ID")]
    ts_oauth_client_id: Option<String>,
    #[serde(default, alias = "TS_OAUTH_CLIENT_SECRET")]
    ts_oauth_client_secret: Option<String>,
    #[serde(default, alias = "PUSHOVER_API_KEY")]
    pushover_api_key: Option<String>,
    #[serde(default, alias = "PUSHOVER_USER_KEY")]
    pushover_user_key: Option<String>,
}

fn fill_unset(slot: &mut String, legacy: Option<String>) {
    if slot.trim().is_empty() {
        if let Some(value) = legacy {
            *slot = value;
        }
    }
}

/// Root service configuration. Loaded once at startup and never mutated.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthoriserConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

impl AuthoriserConfig {
    /// Load configuration from `<config_dir>/settings.toml` and environment
    /// variables, then validate it.
    pub fn load(config_dir: Option<&Path>) -> AuthoriserResult<Self> {
        let mut builder = Config::builder();

        if let Some(dir) = config_dir {
            builder = builder.add_source(File::from(dir.join(CONFIG_FILENAME)).required(true));
        }

        let built = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::resolve(built)
    }

    /// Parse configuration from a TOML string. Environment is not consulted.
    pub fn from_toml(contents: &str) -> AuthoriserResult<Self> {
        let built = Config::builder()
            .add_source(File::from_str(contents, config::FileFormat::Toml))
            .build()?;

        Self::resolve(built)
    }

    fn resolve(built: Config) -> AuthoriserResult<Self> {
        let legacy: LegacyKeys = built.clone().try_deserialize()?;
        let mut config: Self = built.try_deserialize()?;

        fill_unset(&mut config.broker.client_id, legacy.ts_oauth_client_id);
        fill_unset(&mut config.broker.client_secret, legacy.ts_oauth_client_secret);
        fill_unset(&mut config.notifier.api_key, legacy.pushover_api_key);
        fill_unset(&mut config.notifier.user_key, legacy.pushover_user_key);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AuthoriserResult<()> {
        require_non_empty("broker.client_id", &self.broker.client_id)?;
        require_non_empty("broker.client_secret", &self.broker.client_secret)?;
        require_non_empty("notifier.api_key", &self.notifier.api_key)?;
        require_non_empty("notifier.user_key", &self.notifier.user_key)?;

        Url::parse(&self.broker.api_base_url).map_err(|e| {
            AuthoriserError::invalid_config(format!("broker.api_base_url: {e}"))
        })?;
        Url::parse(&self.notifier.api_base_url).map_err(|e| {
            AuthoriserError::invalid_config(format!("notifier.api_base_url: {e}"))
        })?;

        if self.broker.expiry_secs == 0 {
            return Err(AuthoriserError::invalid_config(
                "broker.expiry_secs must be greater than zero",
            ));
        }
        if self.tunnel.submission_timeout_secs == 0 {
            return Err(AuthoriserError::invalid_config(
                "tunnel.submission_timeout_secs must be greater than zero",
            ));
        }

        self.tunnel.listen_addr()?;
        if let Some(url) = &self.tunnel.public_url {
            Url::parse(url).map_err(|e| {
                AuthoriserError::invalid_config(format!("tunnel.public_url: {e}"))
            })?;
        }

        if self.relay.socket_path.as_os_str().is_empty() {
            return Err(AuthoriserError::invalid_config("relay.socket_path is empty"));
        }

        Ok(())
    }
}

impl BrokerConfig {
    /// Join a path onto the API base URL
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.api_base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl NotifierConfig {
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.api_base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TunnelConfig {
    pub fn listen_addr(&self) -> AuthoriserResult<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            AuthoriserError::invalid_config(format!(
                "tunnel.listen_addr {:?}: {e}",
                self.listen_addr
            ))
        })
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }
}

fn require_non_empty(name: &str, value: &str) -> AuthoriserResult<()> {
    if value.trim().is_empty() {
        return Err(AuthoriserError::invalid_config(format!("{name} must be set")));
    }
    Ok(())
}
