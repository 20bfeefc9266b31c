//! The capability interface over the secret store.
//!
//! [`VaultClient`] is the seam between the watcher/supervisor machinery and
//! the store itself. Two implementations ship with the crate: the HTTP
//! client ([`http::HttpVaultClient`]) that talks to a real Vault server, and
//! an in-memory recording stub ([`stub::StubVaultClient`]) used by the
//! scenario tests and embedders that want to exercise the supervision loop
//! without a server.

pub mod http;
pub mod stub;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ClientError;
use crate::secret::{AuthInfo, DataMap, Secret};

/// Default Vault address when `VAULT_ADDR` is unset.
pub const DEFAULT_VAULT_ADDR: &str = "http://127.0.0.1:8200";

/// Default request timeout when `VAULT_CLIENT_TIMEOUT` is unset.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default retry count when `VAULT_MAX_RETRIES` is unset.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// TLS material and verification settings, read from the standard
/// `VAULT_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub ca_cert: String,
    pub ca_path: String,
    pub client_cert: String,
    pub client_key: String,
    pub skip_verify: bool,
    pub server_name: String,
}

impl TlsConfig {
    fn from_env() -> Self {
        Self {
            ca_cert: env_or_default("VAULT_CACERT"),
            ca_path: env_or_default("VAULT_CAPATH"),
            client_cert: env_or_default("VAULT_CLIENT_CERT"),
            client_key: env_or_default("VAULT_CLIENT_KEY"),
            skip_verify: env_flag("VAULT_SKIP_VERIFY"),
            server_name: env_or_default("VAULT_TLS_SERVER_NAME"),
        }
    }
}

/// Configuration for a Vault client instance.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Server address.
    pub address: String,
    /// Agent address, if requests go through a Vault agent.
    pub agent_address: String,
    /// The bootstrap token the client starts out with.
    pub token: String,
    /// Retry budget for transient request failures.
    pub max_retries: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    /// TLS settings.
    pub tls: TlsConfig,

    /// Policies attached to the derived child token.
    pub access_policies: Vec<String>,
    /// Secret paths to fetch into the template context.
    pub paths: Vec<String>,
    /// Create the child token without a parent relationship.
    pub orphan_token: bool,
    /// Create the child token non-renewable.
    pub disable_token_renew: bool,
    /// Withhold Vault connection settings from the child.
    pub no_inherit_token: bool,
    /// TTL for the child token; mutually exclusive with `token_period`.
    pub token_ttl: String,
    /// Renewal period for the child token; makes it periodic.
    pub token_period: String,
}

impl VaultConfig {
    /// Build a client configuration from the validated top-level [`Config`]
    /// plus the standard `VAULT_*` environment variables.
    #[must_use]
    pub fn from_config_and_env(config: &Config) -> Self {
        let timeout = std::env::var("VAULT_CLIENT_TIMEOUT")
            .ok()
            .and_then(|value| value.parse().ok())
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);

        let max_retries = std::env::var("VAULT_MAX_RETRIES")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        Self {
            address: config.vault_address.clone(),
            agent_address: env_or_default("VAULT_AGENT_ADDR"),
            token: config.vault_token.clone(),
            max_retries,
            timeout,
            tls: TlsConfig::from_env(),
            access_policies: config.access_policies.clone(),
            paths: config.paths.clone(),
            orphan_token: config.orphan_token,
            disable_token_renew: config.disable_token_renew,
            no_inherit_token: config.no_inherit_token,
            token_ttl: config.token_ttl.clone(),
            token_period: config.token_period.clone(),
        }
    }

    /// The `Vault` entry injected into the template context when token
    /// inheritance is enabled: connection settings plus the current token.
    #[must_use]
    pub fn settings_map(&self, token: &str) -> DataMap {
        let mut tls = DataMap::new();
        for (key, value) in [
            ("ca_cert", &self.tls.ca_cert),
            ("ca_path", &self.tls.ca_path),
            ("cert", &self.tls.client_cert),
            ("key", &self.tls.client_key),
            ("server_name", &self.tls.server_name),
        ] {
            if !value.is_empty() {
                tls.insert(key.to_owned(), Value::String(value.clone()));
            }
        }
        if self.tls.skip_verify {
            tls.insert("skip_verify".to_owned(), Value::Bool(true));
        }

        let mut data = DataMap::new();
        data.insert("address".to_owned(), Value::String(self.address.clone()));
        data.insert(
            "agent_address".to_owned(),
            Value::String(self.agent_address.clone()),
        );
        data.insert("max_retries".to_owned(), Value::from(self.max_retries));
        data.insert(
            "timeout".to_owned(),
            Value::String(format!("{}s", self.timeout.as_secs())),
        );
        data.insert("tls".to_owned(), Value::Object(tls));
        data.insert("token".to_owned(), Value::String(token.to_owned()));

        data
    }
}

fn env_or_default(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| value == "true" || value == "1")
}

/// A renewal message published by a lease renewer: the refreshed lease/auth
/// envelope and, when the store returned one, a replacement payload.
#[derive(Debug, Clone)]
pub struct LeaseRenewal {
    pub lease_id: String,
    pub lease_duration: u64,
    pub renewable: bool,
    pub auth: Option<AuthInfo>,
    pub data: Option<DataMap>,
}

/// Sender-side channels handed to a renewer driver task.
pub struct RenewerChannels {
    /// Periodic stream of successful renewals.
    pub renew_tx: mpsc::Sender<LeaseRenewal>,
    /// Terminal signal: `None` for a clean stop, `Some` for an error.
    pub done_tx: oneshot::Sender<Option<ClientError>>,
    /// Cancelled when the owner asks the renewer to stop.
    pub stop: CancellationToken,
}

/// Handle over a running lease renewer for a single lease or token.
///
/// The driver publishes on `renew` until it terminates, then signals `done`
/// exactly once. Consumers must drain `done` before treating the secret as
/// no longer being renewed.
pub struct LeaseRenewer {
    pub(crate) renew_rx: mpsc::Receiver<LeaseRenewal>,
    pub(crate) done_rx: oneshot::Receiver<Option<ClientError>>,
    stop: CancellationToken,
}

impl LeaseRenewer {
    /// Create a renewer handle and the matching driver-side channels.
    #[must_use]
    pub fn channel() -> (RenewerChannels, Self) {
        let (renew_tx, renew_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        let stop = CancellationToken::new();

        (
            RenewerChannels {
                renew_tx,
                done_tx,
                stop: stop.clone(),
            },
            Self {
                renew_rx,
                done_rx,
                stop,
            },
        )
    }

    /// Ask the driver to stop. The terminal `done` message still arrives.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Token observed by the driver to know when to stop.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl std::fmt::Debug for LeaseRenewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRenewer").finish_non_exhaustive()
    }
}

/// The operations the supervision machinery needs from the secret store.
#[async_trait]
pub trait VaultClient: Send + Sync {
    /// Health check: succeeds iff the server is initialized, unsealed, and
    /// not a standby.
    async fn check(&self) -> Result<(), ClientError>;

    /// Derive the child token: orphan creation entry point and `no_parent`
    /// when configured, renewable unless token renewal is disabled, TTL or
    /// period as configured.
    async fn create_child_token(&self, display_name: &str) -> Result<Secret, ClientError>;

    /// Install a new token for all subsequent operations and immediately
    /// re-run [`check`](VaultClient::check) to validate it.
    async fn set_token(&self, token: &str) -> Result<(), ClientError>;

    /// The token currently used for requests.
    async fn current_token(&self) -> String;

    /// Fetch one secret. A null response is not an error: it logs a warning
    /// and yields `Ok(None)`.
    async fn fetch_secret(&self, path: &str) -> Result<Option<Secret>, ClientError>;

    /// Fetch all configured paths in declared order, skipping nulls.
    ///
    /// # Errors
    ///
    /// Propagates the first [`ClientError::ReadFailed`].
    async fn fetch_secrets(&self) -> Result<Vec<Secret>, ClientError> {
        let mut secrets = Vec::with_capacity(self.config().paths.len());
        for path in &self.config().paths {
            match self.fetch_secret(path).await? {
                Some(secret) => secrets.push(secret),
                None => {
                    tracing::warn!(path = %path, "secret is null, skipping");
                }
            }
        }

        Ok(secrets)
    }

    /// Revoke a token by its accessor. Idempotent.
    async fn revoke_token_accessor(&self, accessor: &str) -> Result<(), ClientError>;

    /// Revoke a lease by its ID. Idempotent.
    async fn revoke_lease(&self, lease_id: &str) -> Result<(), ClientError>;

    /// Read the raw payload at a logical path.
    async fn read_logical(&self, path: &str) -> Result<Option<DataMap>, ClientError>;

    /// Construct (and start) a renewer driver for the given secret,
    /// returning the consumer-side handle.
    fn new_lease_renewer(&self, secret: &Secret) -> Result<LeaseRenewer, ClientError>;

    /// Add the `Vault` connection-settings entry to a template context,
    /// unless token inheritance is disabled.
    async fn inject_child_context(&self, mut data: DataMap) -> DataMap {
        if self.config().no_inherit_token {
            return data;
        }

        let token = self.current_token().await;
        data.insert(
            "Vault".to_owned(),
            Value::Object(self.config().settings_map(&token)),
        );

        data
    }

    /// Environment overrides applied before snapshot rendering, so an
    /// inheriting child sees the derived token instead of the bootstrap
    /// token.
    async fn child_env_overrides(&self) -> Vec<(String, String)> {
        if self.config().no_inherit_token {
            return Vec::new();
        }

        vec![
            ("VAULT_ADDR".to_owned(), self.config().address.clone()),
            ("VAULT_TOKEN".to_owned(), self.current_token().await),
        ]
    }

    /// The client configuration.
    fn config(&self) -> &VaultConfig;
}
