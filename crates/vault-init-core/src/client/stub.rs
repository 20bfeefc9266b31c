//! In-memory recording stub of the [`VaultClient`] interface.
//!
//! Serves scripted secrets per path and records every call the supervision
//! machinery makes: fetch counts, token creations, revocations, renewer
//! starts. The scenario tests assert against these recordings; embedders can
//! use it to exercise the full loop without a Vault server.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::warn;

use crate::client::{LeaseRenewer, VaultClient, VaultConfig};
use crate::error::ClientError;
use crate::secret::{AuthInfo, DataMap, Secret};

/// One recorded child-token creation.
#[derive(Debug, Clone)]
pub struct TokenCreation {
    pub display_name: String,
    pub orphan: bool,
    pub no_parent: bool,
    pub renewable: bool,
    pub ttl: String,
    pub period: String,
}

#[derive(Default)]
struct Recording {
    fetch_counts: HashMap<String, u32>,
    token_creations: Vec<TokenCreation>,
    revoked_accessors: Vec<String>,
    revoked_leases: Vec<String>,
    renewers_started: HashMap<String, u32>,
}

/// Scripted, recording client. All methods succeed unless a failure is
/// scripted via [`fail_checks`](StubVaultClient::fail_checks).
pub struct StubVaultClient {
    config: VaultConfig,
    token: RwLock<String>,
    /// Per path: the sequence of secrets to serve; the last one repeats.
    secrets: Mutex<HashMap<String, Vec<Secret>>>,
    child_token: Mutex<Option<Secret>>,
    recording: Mutex<Recording>,
    healthy: RwLock<bool>,
}

impl StubVaultClient {
    #[must_use]
    pub fn new(config: VaultConfig) -> Self {
        let token = config.token.clone();
        Self {
            config,
            token: RwLock::new(token),
            secrets: Mutex::new(HashMap::new()),
            child_token: Mutex::new(None),
            recording: Mutex::new(Recording::default()),
            healthy: RwLock::new(true),
        }
    }

    /// Script a secret version for `path`. Successive fetches serve pushed
    /// versions in order; the final version repeats forever.
    pub fn push_secret(&self, path: &str, secret: Secret) {
        lock(&self.secrets)
            .entry(path.to_owned())
            .or_default()
            .push(secret);
    }

    /// Script the secret returned by token creation. When unset, a
    /// synthetic token secret is served.
    pub fn set_child_token(&self, secret: Secret) {
        *lock(&self.child_token) = Some(secret);
    }

    /// Make all subsequent health checks fail.
    pub fn fail_checks(&self) {
        *read_write(&self.healthy) = false;
    }

    /// How many times `path` was fetched.
    #[must_use]
    pub fn fetch_count(&self, path: &str) -> u32 {
        lock(&self.recording)
            .fetch_counts
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// All recorded token creations, in order.
    #[must_use]
    pub fn token_creations(&self) -> Vec<TokenCreation> {
        lock(&self.recording).token_creations.clone()
    }

    /// All revoked token accessors, in order.
    #[must_use]
    pub fn revoked_accessors(&self) -> Vec<String> {
        lock(&self.recording).revoked_accessors.clone()
    }

    /// All revoked lease IDs, in order.
    #[must_use]
    pub fn revoked_leases(&self) -> Vec<String> {
        lock(&self.recording).revoked_leases.clone()
    }

    /// How many renewers were started for `path`.
    #[must_use]
    pub fn renewers_started(&self, path: &str) -> u32 {
        lock(&self.recording)
            .renewers_started
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    fn synthetic_child_token(&self) -> Secret {
        Secret {
            path: "auth/token/create".to_owned(),
            auth: Some(AuthInfo {
                client_token: "stub-child-token".to_owned(),
                accessor: "stub-child-accessor".to_owned(),
                policies: self.config.access_policies.clone(),
                lease_duration: 3600,
                renewable: !self.config.disable_token_renew,
            }),
            ..Secret::default()
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl VaultClient for StubVaultClient {
    async fn check(&self) -> Result<(), ClientError> {
        if *read(&self.healthy) {
            Ok(())
        } else {
            Err(ClientError::Unhealthy {
                initialized: true,
                sealed: true,
                standby: false,
            })
        }
    }

    async fn create_child_token(&self, display_name: &str) -> Result<Secret, ClientError> {
        lock(&self.recording).token_creations.push(TokenCreation {
            display_name: display_name.to_owned(),
            orphan: self.config.orphan_token,
            no_parent: self.config.orphan_token,
            renewable: !self.config.disable_token_renew,
            ttl: self.config.token_ttl.clone(),
            period: self.config.token_period.clone(),
        });

        Ok(lock(&self.child_token)
            .clone()
            .unwrap_or_else(|| self.synthetic_child_token()))
    }

    async fn set_token(&self, token: &str) -> Result<(), ClientError> {
        {
            let mut guard = read_write(&self.token);
            token.clone_into(&mut guard);
        }

        self.check().await
    }

    async fn current_token(&self) -> String {
        read(&self.token).clone()
    }

    async fn fetch_secret(&self, path: &str) -> Result<Option<Secret>, ClientError> {
        let serial = {
            let mut recording = lock(&self.recording);
            let count = recording.fetch_counts.entry(path.to_owned()).or_default();
            let serial = *count;
            *count = count.saturating_add(1);
            serial
        };

        let secrets = lock(&self.secrets);
        let Some(versions) = secrets.get(path) else {
            warn!(path = %path, "stub has no secret scripted for path");
            return Ok(None);
        };

        let index = (serial as usize).min(versions.len().saturating_sub(1));
        Ok(versions.get(index).cloned())
    }

    async fn revoke_token_accessor(&self, accessor: &str) -> Result<(), ClientError> {
        lock(&self.recording)
            .revoked_accessors
            .push(accessor.to_owned());
        Ok(())
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<(), ClientError> {
        lock(&self.recording).revoked_leases.push(lease_id.to_owned());
        Ok(())
    }

    async fn read_logical(&self, path: &str) -> Result<Option<DataMap>, ClientError> {
        Ok(self.fetch_secret(path).await?.map(|secret| secret.data))
    }

    fn new_lease_renewer(&self, secret: &Secret) -> Result<LeaseRenewer, ClientError> {
        {
            let mut recording = lock(&self.recording);
            let count = recording
                .renewers_started
                .entry(secret.path.clone())
                .or_default();
            *count = count.saturating_add(1);
        }

        let (channels, renewer) = LeaseRenewer::channel();
        tokio::spawn(async move {
            // Idle driver: renewals are never published, the stop signal is
            // answered with a clean `done`.
            channels.stop.cancelled().await;
            let _ = channels.done_tx.send(None);
            drop(channels.renew_tx);
        });

        Ok(renewer)
    }

    fn config(&self) -> &VaultConfig {
        &self.config
    }
}
