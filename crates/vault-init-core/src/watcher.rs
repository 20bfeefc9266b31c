//! The secret watcher: publishes rendered environment snapshots whenever the
//! secret set changes meaningfully.
//!
//! On start it fetches every configured path, starts renewers for the
//! renewable secrets, and publishes the initial snapshot (the supervisor
//! uses it for the first spawn). Afterwards it re-checks only non-renewable
//! secrets every refresh tick — renewable ones are kept fresh by their
//! renewers — and republishes iff a newer version was stored.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::VaultClient;
use crate::error::WatchError;
use crate::renewer::{RenewerHandle, start_secret_renewer};
use crate::secret::{DataMap, SharedSecret, deep_merge};
use crate::template::render_environment;

/// Periodic consistency loop over the configured secret set.
pub struct Watcher {
    client: Arc<dyn VaultClient>,
    refresh_duration: Duration,
    /// The inherited environment snapshots are rendered from. Injected so
    /// tests never depend on the process environment.
    base_env: Vec<(String, String)>,
}

impl Watcher {
    #[must_use]
    pub fn new(
        client: Arc<dyn VaultClient>,
        refresh_duration: Duration,
        base_env: Vec<(String, String)>,
    ) -> Self {
        Self {
            client,
            refresh_duration,
            base_env,
        }
    }

    /// Run the watcher until cancelled, publishing snapshots on `update_tx`.
    ///
    /// # Errors
    ///
    /// Returns a [`WatchError`] if the initial fetch, renewer starts, or
    /// initial snapshot fail — all fatal at startup. Later per-secret fetch
    /// failures are logged and retried on the next tick.
    pub async fn watch(
        self,
        update_tx: mpsc::Sender<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<(), WatchError> {
        info!(
            interval_secs = self.refresh_duration.as_secs(),
            "watching secrets for updates"
        );

        let secrets: Vec<SharedSecret> = self
            .client
            .fetch_secrets()
            .await
            .map_err(WatchError::InitialFetch)?
            .into_iter()
            .map(|secret| Arc::new(tokio::sync::RwLock::new(secret)))
            .collect();

        let mut renewers = Vec::new();
        for secret in &secrets {
            if let Some(handle) = start_secret_renewer(&self.client, Arc::clone(secret))
                .await
                .map_err(WatchError::InitialRenewer)?
            {
                renewers.push(handle);
            }
        }

        // The initial publication; the supervisor spawns the child from it.
        self.send_snapshot(&update_tx, &secrets).await?;

        let start = tokio::time::Instant::now() + self.refresh_duration;
        let mut ticker = tokio::time::interval_at(start, self.refresh_duration);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("secret watcher exiting");
                    break;
                }
                _ = ticker.tick() => {
                    if !self.check_secrets(&secrets).await {
                        continue;
                    }

                    match self.send_snapshot(&update_tx, &secrets).await {
                        Ok(()) => debug!("sent secrets update to supervisor"),
                        Err(WatchError::ChannelClosed) => {
                            info!("supervisor went away, secret watcher exiting");
                            break;
                        }
                        Err(err) => error!(error = %err, "could not send secrets update"),
                    }
                }
            }
        }

        self.teardown(secrets, renewers).await;
        Ok(())
    }

    /// Re-fetch every non-renewable secret and apply version updates.
    /// Returns whether any secret changed.
    async fn check_secrets(&self, secrets: &[SharedSecret]) -> bool {
        debug!("checking secret versions");
        let mut updated = false;

        for secret in secrets {
            let (path, renewable) = {
                let guard = secret.read().await;
                (guard.path.clone(), guard.is_renewable())
            };

            if renewable {
                debug!(path = %path, "skipping secret as it is renewable");
                continue;
            }

            let next = match self.client.fetch_secret(&path).await {
                Ok(Some(next)) => next,
                Ok(None) => {
                    warn!(path = %path, "secret is null, skipping update check");
                    continue;
                }
                Err(err) => {
                    error!(path = %path, error = %err, "could not fetch secret for update check");
                    continue;
                }
            };

            if secret.write().await.update(next) {
                debug!(path = %path, "update found for secret");
                updated = true;
            }
        }

        updated
    }

    /// Render the current secret set into an environment snapshot and
    /// publish it. Blocks while the supervisor is still consuming the
    /// previous snapshot.
    async fn send_snapshot(
        &self,
        update_tx: &mpsc::Sender<Vec<String>>,
        secrets: &[SharedSecret],
    ) -> Result<(), WatchError> {
        let mut data = DataMap::new();
        for secret in secrets {
            let guard = secret.read().await;
            deep_merge(&mut data, guard.data_map());
        }

        let data = self.client.inject_child_context(data).await;
        let overrides = self.client.child_env_overrides().await;
        let snapshot = render_environment(
            &self.base_env,
            &overrides,
            self.client.config().no_inherit_token,
            &data,
        )?;

        update_tx
            .send(snapshot)
            .await
            .map_err(|_| WatchError::ChannelClosed)
    }

    /// Stop the per-secret renewers, then revoke leased and auth secrets.
    async fn teardown(&self, secrets: Vec<SharedSecret>, renewers: Vec<RenewerHandle>) {
        for renewer in renewers {
            renewer.stop().await;
        }

        for secret in secrets {
            let guard = secret.read().await;
            if guard.auth.is_none() && guard.lease_id.is_empty() {
                continue;
            }

            if let Err(err) = guard.revoke(self.client.as_ref()).await {
                warn!(path = %guard.path, error = %err, "could not revoke secret during shutdown");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::VaultConfig;
    use crate::client::stub::StubVaultClient;
    use crate::config::Config;
    use crate::secret::Secret;
    use serde_json::json;

    const REFRESH: Duration = Duration::from_millis(25);

    fn stub_with_paths(paths: &[&str]) -> Arc<StubVaultClient> {
        let config = Config {
            paths: paths.iter().map(|&path| path.to_owned()).collect(),
            vault_token: "bootstrap".to_owned(),
            ..Config::default()
        };
        Arc::new(StubVaultClient::new(VaultConfig::from_config_and_env(
            &config,
        )))
    }

    fn versioned_secret(path: &str, version: u64, password: &str) -> Secret {
        let data = match json!({
            "data": { "password": password },
            "metadata": { "version": version },
        }) {
            serde_json::Value::Object(map) => map,
            _ => DataMap::new(),
        };
        Secret::new(path, data)
    }

    fn base_env() -> Vec<(String, String)> {
        vec![
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            (
                "APP_PASSWORD".to_owned(),
                "{{ kv.app.data.password }}".to_owned(),
            ),
            ("INIT_PATHS".to_owned(), "kv/app".to_owned()),
        ]
    }

    fn spawn_watcher(
        client: &Arc<StubVaultClient>,
        cancel: &CancellationToken,
    ) -> mpsc::Receiver<Vec<String>> {
        let watcher = Watcher::new(
            Arc::clone(client) as Arc<dyn VaultClient>,
            REFRESH,
            base_env(),
        );
        let (update_tx, update_rx) = mpsc::channel(1);
        tokio::spawn(watcher.watch(update_tx, cancel.clone()));
        update_rx
    }

    #[tokio::test]
    async fn initial_snapshot_is_published_and_filtered() {
        let client = stub_with_paths(&["kv/app"]);
        client.push_secret("kv/app", versioned_secret("kv/app", 1, "hunter2"));

        let cancel = CancellationToken::new();
        let mut update_rx = spawn_watcher(&client, &cancel);

        let snapshot = update_rx.recv().await.unwrap();
        assert!(snapshot.contains(&"APP_PASSWORD=hunter2".to_owned()));
        assert!(snapshot.contains(&"PATH=/usr/bin".to_owned()));
        assert!(!snapshot.iter().any(|entry| entry.starts_with("INIT_")));

        cancel.cancel();
    }

    #[tokio::test]
    async fn version_change_publishes_a_new_snapshot() {
        let client = stub_with_paths(&["kv/app"]);
        client.push_secret("kv/app", versioned_secret("kv/app", 1, "old"));
        client.push_secret("kv/app", versioned_secret("kv/app", 2, "new"));

        let cancel = CancellationToken::new();
        let mut update_rx = spawn_watcher(&client, &cancel);

        let first = update_rx.recv().await.unwrap();
        assert!(first.contains(&"APP_PASSWORD=old".to_owned()));

        let second = update_rx.recv().await.unwrap();
        assert!(second.contains(&"APP_PASSWORD=new".to_owned()));

        // No upstream change after version 2: no further snapshots.
        tokio::time::sleep(REFRESH * 4).await;
        assert!(update_rx.try_recv().is_err());

        cancel.cancel();
    }

    #[tokio::test]
    async fn renewable_secret_is_not_polled() {
        let client = stub_with_paths(&["db/creds"]);
        client.push_secret(
            "db/creds",
            Secret {
                path: "db/creds".to_owned(),
                lease_id: "x".to_owned(),
                lease_duration: 3600,
                renewable: true,
                ..Secret::default()
            },
        );

        let cancel = CancellationToken::new();
        let mut update_rx = spawn_watcher(&client, &cancel);
        let _initial = update_rx.recv().await.unwrap();

        // Let several refresh ticks pass.
        tokio::time::sleep(REFRESH * 6).await;

        assert_eq!(client.fetch_count("db/creds"), 1);
        assert_eq!(client.renewers_started("db/creds"), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn no_inherit_token_filters_vault_keys() {
        let config = Config {
            paths: vec![],
            no_inherit_token: true,
            vault_token: "bootstrap".to_owned(),
            ..Config::default()
        };
        let client = Arc::new(StubVaultClient::new(VaultConfig::from_config_and_env(
            &config,
        )));

        let mut env = base_env();
        env.retain(|(key, _)| !key.starts_with("APP_"));
        env.push(("VAULT_ADDR".to_owned(), "http://x".to_owned()));
        env.push(("VAULT_TOKEN".to_owned(), "bootstrap".to_owned()));

        let watcher = Watcher::new(Arc::clone(&client) as Arc<dyn VaultClient>, REFRESH, env);
        let (update_tx, mut update_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        tokio::spawn(watcher.watch(update_tx, cancel.clone()));

        let snapshot = update_rx.recv().await.unwrap();
        assert!(!snapshot.iter().any(|entry| entry.starts_with("VAULT_")));

        cancel.cancel();
    }

    #[tokio::test]
    async fn leased_secret_is_revoked_on_shutdown() {
        let client = stub_with_paths(&["db/creds"]);
        client.push_secret(
            "db/creds",
            Secret {
                path: "db/creds".to_owned(),
                lease_id: "lease-x".to_owned(),
                lease_duration: 3600,
                renewable: true,
                ..Secret::default()
            },
        );

        let watcher = Watcher::new(
            Arc::clone(&client) as Arc<dyn VaultClient>,
            REFRESH,
            base_env(),
        );
        let (update_tx, mut update_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.watch(update_tx, cancel.clone()));

        let _initial = update_rx.recv().await.unwrap();
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(client.revoked_leases(), vec!["lease-x".to_owned()]);
    }
}
