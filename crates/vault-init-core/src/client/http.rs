//! HTTP implementation of the [`VaultClient`] capability interface.
//!
//! A thin `reqwest` wrapper over the Vault HTTP API. Transient failures
//! (connection errors, 429, 5xx) are retried with exponential backoff up to
//! the configured retry budget; everything else surfaces immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{
    LeaseRenewal, LeaseRenewer, RenewerChannels, VaultClient, VaultConfig,
};
use crate::error::ClientError;
use crate::secret::{AuthInfo, DataMap, Secret};

/// Base delay for the retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// The wire envelope Vault wraps every secret response in.
#[derive(Debug, Deserialize)]
struct SecretEnvelope {
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    data: Option<DataMap>,
    #[serde(default)]
    auth: Option<AuthInfo>,
}

impl SecretEnvelope {
    fn into_secret(self, path: &str) -> Secret {
        Secret {
            path: path.to_owned(),
            lease_id: self.lease_id,
            lease_duration: self.lease_duration,
            renewable: self.renewable,
            data: self.data.unwrap_or_default(),
            auth: self.auth,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    initialized: bool,
    #[serde(default)]
    sealed: bool,
    #[serde(default)]
    standby: bool,
    #[serde(default)]
    version: String,
}

/// A request that exhausted its retries or hit a non-retryable status.
#[derive(Debug)]
enum RequestError {
    Transport(reqwest::Error),
    Api { status: u16, message: String },
}

impl RequestError {
    fn reason(&self) -> String {
        match self {
            Self::Transport(err) => err.to_string(),
            Self::Api { status, message } => format!("HTTP {status}: {message}"),
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(_) => None,
            Self::Api { status, .. } => Some(*status),
        }
    }
}

/// HTTP client against a real Vault server.
pub struct HttpVaultClient {
    config: VaultConfig,
    http: reqwest::Client,
    token: Arc<RwLock<String>>,
}

impl HttpVaultClient {
    /// Build a client from the given configuration, wiring up TLS material
    /// from the `VAULT_*` settings.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if TLS material can not be loaded or
    /// the underlying HTTP client can not be constructed.
    pub fn new(config: VaultConfig) -> Result<Self, ClientError> {
        let http = build_http(&config)?;
        let token = Arc::new(RwLock::new(config.token.clone()));

        debug!(address = %config.address, "initialized Vault API client");

        Ok(Self {
            config,
            http,
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.config.address.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Issue one request with retries. Returns the parsed JSON body,
    /// `Ok(None)` for 404 and empty bodies.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>, RequestError> {
        let token = self.token.read().await.clone();
        request_with_token(
            &self.http,
            self.config.max_retries,
            method,
            &self.url(path),
            &token,
            body,
        )
        .await
    }
}

async fn request_with_token(
    http: &reqwest::Client,
    max_retries: u32,
    method: Method,
    url: &str,
    token: &str,
    body: Option<Value>,
) -> Result<Option<Value>, RequestError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        let mut request = http.request(method.clone(), url);
        if !token.is_empty() {
            request = request.header("X-Vault-Token", token);
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let text = response.text().await.map_err(RequestError::Transport)?;
                    if text.is_empty() {
                        return Ok(None);
                    }

                    return serde_json::from_str(&text).map(Some).map_err(|err| {
                        RequestError::Api {
                            status: status.as_u16(),
                            message: format!("unparseable response body: {err}"),
                        }
                    });
                }

                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }

                let message = api_error_message(response).await;
                last_err = Some(RequestError::Api {
                    status: status.as_u16(),
                    message,
                });

                if attempt < max_retries && is_retryable(status) {
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            }
            Err(err) => {
                last_err = Some(RequestError::Transport(err));

                if attempt < max_retries {
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            }
        }

        break;
    }

    Err(last_err.unwrap_or(RequestError::Api {
        status: 0,
        message: "request failed without a response".to_owned(),
    }))
}

/// Extract the `errors` array Vault returns in failure bodies.
async fn api_error_message(response: reqwest::Response) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        errors: Vec<String>,
    }

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .filter(|body| !body.errors.is_empty())
        .map_or_else(|| format!("HTTP {}", status.as_u16()), |body| body.errors.join("; "))
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff(attempt: u32) -> Duration {
    RETRY_BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt))
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn check(&self) -> Result<(), ClientError> {
        let token = self.token.read().await.clone();
        let mut request = self.http.get(self.url("sys/health?standbyok=false"));
        if !token.is_empty() {
            request = request.header("X-Vault-Token", &token);
        }

        // Health status is encoded in both the body and the status code;
        // non-2xx answers still carry a parseable body, so no retries here.
        let response = request.send().await.map_err(ClientError::Transport)?;
        let health: HealthResponse = response.json().await.map_err(ClientError::Transport)?;

        if !health.initialized || health.sealed || health.standby {
            return Err(ClientError::Unhealthy {
                initialized: health.initialized,
                sealed: health.sealed,
                standby: health.standby,
            });
        }

        debug!(
            initialized = health.initialized,
            sealed = health.sealed,
            standby = health.standby,
            version = %health.version,
            "Vault health seems ok"
        );
        Ok(())
    }

    async fn create_child_token(&self, display_name: &str) -> Result<Secret, ClientError> {
        // The initializer already rejects this combination; re-checked here
        // so the client stays safe when embedded on its own.
        if !self.config.token_ttl.is_empty() && !self.config.token_period.is_empty() {
            return Err(ClientError::TokenCreate {
                reason: "token TTL and token period are mutually exclusive; only one may be set"
                    .to_owned(),
            });
        }

        let endpoint = if self.config.orphan_token {
            "auth/token/create-orphan"
        } else {
            "auth/token/create"
        };

        let mut body = serde_json::json!({
            "display_name": display_name,
            "policies": self.config.access_policies,
            "no_parent": self.config.orphan_token,
            "renewable": !self.config.disable_token_renew,
        });
        if !self.config.token_ttl.is_empty() {
            body["ttl"] = Value::String(self.config.token_ttl.clone());
        }
        if !self.config.token_period.is_empty() {
            body["period"] = Value::String(self.config.token_period.clone());
        }

        let response = self
            .request(Method::POST, endpoint, Some(body))
            .await
            .map_err(|err| ClientError::TokenCreate {
                reason: err.reason(),
            })?
            .ok_or_else(|| ClientError::TokenCreate {
                reason: "token creation returned an empty response".to_owned(),
            })?;

        let envelope: SecretEnvelope =
            serde_json::from_value(response).map_err(|err| ClientError::TokenCreate {
                reason: format!("unparseable token response: {err}"),
            })?;

        Ok(envelope.into_secret(endpoint))
    }

    async fn set_token(&self, token: &str) -> Result<(), ClientError> {
        {
            let mut guard = self.token.write().await;
            token.clone_into(&mut guard);
        }

        self.check().await.map_err(|err| match err {
            ClientError::Unhealthy { .. } | ClientError::Transport(_) => err,
            other => ClientError::Auth {
                reason: format!("could not validate auth with new token: {other}"),
            },
        })
    }

    async fn current_token(&self) -> String {
        self.token.read().await.clone()
    }

    async fn fetch_secret(&self, path: &str) -> Result<Option<Secret>, ClientError> {
        let response = self
            .request(Method::GET, path, None)
            .await
            .map_err(|err| match err.status() {
                Some(401 | 403) => ClientError::Auth {
                    reason: err.reason(),
                },
                _ => ClientError::ReadFailed {
                    path: path.to_owned(),
                    reason: err.reason(),
                },
            })?;

        let Some(response) = response else {
            return Ok(None);
        };

        let envelope: SecretEnvelope =
            serde_json::from_value(response).map_err(|err| ClientError::ReadFailed {
                path: path.to_owned(),
                reason: format!("unparseable secret response: {err}"),
            })?;

        Ok(Some(envelope.into_secret(path)))
    }

    async fn revoke_token_accessor(&self, accessor: &str) -> Result<(), ClientError> {
        self.request(
            Method::POST,
            "auth/token/revoke-accessor",
            Some(serde_json::json!({ "accessor": accessor })),
        )
        .await
        .map(|_| ())
        .map_err(|err| ClientError::RevokeFailed {
            target: format!("token accessor `{accessor}`"),
            reason: err.reason(),
        })
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<(), ClientError> {
        self.request(
            Method::PUT,
            "sys/leases/revoke",
            Some(serde_json::json!({ "lease_id": lease_id })),
        )
        .await
        .map(|_| ())
        .map_err(|err| ClientError::RevokeFailed {
            target: format!("lease `{lease_id}`"),
            reason: err.reason(),
        })
    }

    async fn read_logical(&self, path: &str) -> Result<Option<DataMap>, ClientError> {
        Ok(self.fetch_secret(path).await?.map(|secret| secret.data))
    }

    fn new_lease_renewer(&self, secret: &Secret) -> Result<LeaseRenewer, ClientError> {
        let target = RenewTarget::for_secret(secret)?;
        let (channels, renewer) = LeaseRenewer::channel();

        let driver = RenewerDriver {
            http: self.http.clone(),
            base: self.config.address.clone(),
            max_retries: self.config.max_retries,
            client_token: Arc::clone(&self.token),
            path: secret.path.clone(),
            lease_duration: secret.lease_duration.max(
                secret
                    .auth
                    .as_ref()
                    .map(|auth| auth.lease_duration)
                    .unwrap_or_default(),
            ),
            target,
        };
        tokio::spawn(driver.run(channels));

        Ok(renewer)
    }

    fn config(&self) -> &VaultConfig {
        &self.config
    }
}

/// What a renewer renews: a token (via `renew-self` with that token) or a
/// lease (via the lease API with the client's current token).
enum RenewTarget {
    Token { token: String },
    Lease { lease_id: String },
}

impl RenewTarget {
    fn for_secret(secret: &Secret) -> Result<Self, ClientError> {
        if let Some(auth) = &secret.auth {
            return Ok(Self::Token {
                token: auth.client_token.clone(),
            });
        }

        if !secret.lease_id.is_empty() {
            return Ok(Self::Lease {
                lease_id: secret.lease_id.clone(),
            });
        }

        Err(ClientError::RenewerCreate {
            path: secret.path.clone(),
            reason: "secret has neither an auth envelope nor a lease".to_owned(),
        })
    }
}

/// Background task driving periodic renewal for one lease or token.
struct RenewerDriver {
    http: reqwest::Client,
    base: String,
    max_retries: u32,
    client_token: Arc<RwLock<String>>,
    path: String,
    lease_duration: u64,
    target: RenewTarget,
}

impl RenewerDriver {
    async fn run(mut self, channels: RenewerChannels) {
        let RenewerChannels {
            renew_tx,
            done_tx,
            stop,
        } = channels;

        info!(path = %self.path, "starting lease renewer");

        let outcome = self.renew_loop(&renew_tx, &stop).await;
        if let Some(err) = &outcome {
            warn!(path = %self.path, error = %err, "lease renewer stopping after error");
        } else {
            debug!(path = %self.path, "lease renewer stopped cleanly");
        }

        let _ = done_tx.send(outcome);
    }

    async fn renew_loop(
        &mut self,
        renew_tx: &tokio::sync::mpsc::Sender<LeaseRenewal>,
        stop: &CancellationToken,
    ) -> Option<ClientError> {
        loop {
            let wait = renew_wait(self.lease_duration);

            tokio::select! {
                () = stop.cancelled() => return None,
                () = tokio::time::sleep(wait) => {
                    match self.renew_once().await {
                        Ok(renewal) => {
                            self.lease_duration = renewal.lease_duration;
                            if renew_tx.send(renewal).await.is_err() {
                                // Consumer went away; nothing left to update.
                                return None;
                            }
                        }
                        Err(err) => return Some(err),
                    }
                }
            }
        }
    }

    async fn renew_once(&self) -> Result<LeaseRenewal, ClientError> {
        let (url, token, body) = match &self.target {
            RenewTarget::Token { token } => (
                format!("{}/v1/auth/token/renew-self", self.base.trim_end_matches('/')),
                token.clone(),
                None,
            ),
            RenewTarget::Lease { lease_id } => (
                format!("{}/v1/sys/leases/renew", self.base.trim_end_matches('/')),
                self.client_token.read().await.clone(),
                Some(serde_json::json!({ "lease_id": lease_id })),
            ),
        };

        let response = request_with_token(
            &self.http,
            self.max_retries,
            Method::PUT,
            &url,
            &token,
            body,
        )
        .await
        .map_err(|err| ClientError::RenewerCreate {
            path: self.path.clone(),
            reason: format!("renewal failed: {}", err.reason()),
        })?
        .ok_or_else(|| ClientError::RenewerCreate {
            path: self.path.clone(),
            reason: "renewal returned an empty response".to_owned(),
        })?;

        let envelope: SecretEnvelope =
            serde_json::from_value(response).map_err(|err| ClientError::RenewerCreate {
                path: self.path.clone(),
                reason: format!("unparseable renewal response: {err}"),
            })?;

        let lease_duration = envelope
            .auth
            .as_ref()
            .map_or(envelope.lease_duration, |auth| auth.lease_duration);

        Ok(LeaseRenewal {
            lease_id: envelope.lease_id,
            lease_duration,
            renewable: envelope.renewable
                || envelope.auth.as_ref().is_some_and(|auth| auth.renewable),
            auth: envelope.auth,
            data: envelope.data,
        })
    }
}

/// Renew at half the lease duration, but never busy-loop.
fn renew_wait(lease_duration: u64) -> Duration {
    Duration::from_secs((lease_duration / 2).max(1))
}

fn build_http(config: &VaultConfig) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(concat!("vault-init/", env!("CARGO_PKG_VERSION")));

    if !config.tls.ca_cert.is_empty() {
        builder = builder.add_root_certificate(load_certificate(&config.tls.ca_cert)?);
    }

    if !config.tls.ca_path.is_empty() {
        for entry in std::fs::read_dir(&config.tls.ca_path).map_err(|err| ClientError::Config {
            reason: format!("could not read CA path `{}`: {err}", config.tls.ca_path),
        })? {
            let entry = entry.map_err(|err| ClientError::Config {
                reason: format!("could not read CA path `{}`: {err}", config.tls.ca_path),
            })?;
            if entry.path().extension().is_some_and(|ext| ext == "pem") {
                builder =
                    builder.add_root_certificate(load_certificate(&entry.path().to_string_lossy())?);
            }
        }
    }

    if !config.tls.client_cert.is_empty() && !config.tls.client_key.is_empty() {
        let mut pem = read_pem(&config.tls.client_cert)?;
        pem.extend_from_slice(&read_pem(&config.tls.client_key)?);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|err| ClientError::Config {
            reason: format!("could not load client certificate: {err}"),
        })?;
        builder = builder.identity(identity);
    }

    if config.tls.skip_verify {
        warn!("TLS certificate verification is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(|err| ClientError::Config {
        reason: format!("could not build HTTP client: {err}"),
    })
}

fn read_pem(path: &str) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|err| ClientError::Config {
        reason: format!("could not read TLS material `{path}`: {err}"),
    })
}

fn load_certificate(path: &str) -> Result<reqwest::Certificate, ClientError> {
    reqwest::Certificate::from_pem(&read_pem(path)?).map_err(|err| ClientError::Config {
        reason: format!("could not parse CA certificate `{path}`: {err}"),
    })
}
