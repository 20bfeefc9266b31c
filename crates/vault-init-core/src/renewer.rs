//! Renewer coordination for renewable secrets.
//!
//! The store-side renewer driver owns its renewal loop and publishes on two
//! channels: `renew` (periodic, a fresh lease/auth envelope) and `done`
//! (terminal, carrying an error when the loop failed). A consumer task owns
//! the shared [`Secret`] and applies each renewal to it, so no back-reference
//! between secret and renewer exists.
//!
//! Ordering guarantee: [`RenewerHandle::stop`] returns only after the driver
//! has emitted `done` and the consumer has observed it, so a stopped secret
//! is never still being renewed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::{LeaseRenewer, VaultClient};
use crate::error::ClientError;
use crate::secret::SharedSecret;

/// Handle over a running renewer/consumer pair for one secret.
pub struct RenewerHandle {
    stop: CancellationToken,
    consumer: JoinHandle<()>,
}

impl RenewerHandle {
    /// Signal the renewer to stop and wait until its terminal `done` has
    /// been consumed.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.consumer.await {
            warn!(error = %err, "renewer consumer task failed");
        }
    }
}

impl std::fmt::Debug for RenewerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewerHandle").finish_non_exhaustive()
    }
}

/// Start a renewer for `secret` if it is renewable; non-renewable secrets
/// are left to the watcher's version polling and yield `Ok(None)`.
///
/// # Errors
///
/// Returns [`ClientError::RenewerCreate`] if the client can not construct a
/// renewer for the secret.
pub async fn start_secret_renewer(
    client: &Arc<dyn VaultClient>,
    secret: SharedSecret,
) -> Result<Option<RenewerHandle>, ClientError> {
    let (renewable, path) = {
        let guard = secret.read().await;
        (guard.is_renewable(), guard.path.clone())
    };

    if !renewable {
        debug!(path = %path, "secret is not renewable; skipping renewer");
        return Ok(None);
    }

    let renewer = {
        let guard = secret.read().await;
        client.new_lease_renewer(&guard)?
    };

    let stop = renewer.stop_token();
    let consumer = tokio::spawn(consume_renewals(renewer, secret, path));

    Ok(Some(RenewerHandle { stop, consumer }))
}

/// Apply renewals to the owned secret until the driver signals `done`.
async fn consume_renewals(mut renewer: LeaseRenewer, secret: SharedSecret, path: String) {
    let mut renew_open = true;

    loop {
        // Biased so buffered renewals are applied before a terminal `done`
        // is observed.
        tokio::select! {
            biased;
            renewal = renewer.renew_rx.recv(), if renew_open => {
                match renewal {
                    Some(renewal) => {
                        secret.write().await.apply_renewal(&renewal);
                        debug!(path = %path, "renewer updated secret");
                    }
                    None => renew_open = false,
                }
            }
            done = &mut renewer.done_rx => {
                match done {
                    Ok(Some(err)) => {
                        error!(path = %path, error = %err, "renewer finished with an error");
                    }
                    Ok(None) => {
                        debug!(path = %path, "renewer finished cleanly");
                    }
                    Err(_) => {
                        warn!(path = %path, "renewer driver dropped without signalling done");
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::stub::StubVaultClient;
    use crate::client::{LeaseRenewal, VaultConfig};
    use crate::secret::{DataMap, Secret};
    use tokio::sync::RwLock;

    fn stub_client() -> Arc<dyn VaultClient> {
        Arc::new(StubVaultClient::new(VaultConfig::from_config_and_env(
            &crate::config::Config::default(),
        )))
    }

    #[tokio::test]
    async fn non_renewable_secret_starts_no_renewer() {
        let client = stub_client();
        let secret = Arc::new(RwLock::new(Secret::new("kv/app", DataMap::new())));

        let handle = start_secret_renewer(&client, secret).await.unwrap();
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn renewable_secret_starts_and_stops_cleanly() {
        let client = stub_client();
        let secret = Arc::new(RwLock::new(Secret {
            path: "db/creds".to_owned(),
            lease_id: "lease-1".to_owned(),
            lease_duration: 60,
            renewable: true,
            ..Secret::default()
        }));

        let handle = start_secret_renewer(&client, Arc::clone(&secret))
            .await
            .unwrap()
            .unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn renewal_messages_update_the_secret() {
        let secret = Arc::new(RwLock::new(Secret {
            path: "db/creds".to_owned(),
            lease_id: "lease-1".to_owned(),
            lease_duration: 60,
            renewable: true,
            ..Secret::default()
        }));

        let (channels, renewer) = LeaseRenewer::channel();
        let consumer = tokio::spawn(consume_renewals(
            renewer,
            Arc::clone(&secret),
            "db/creds".to_owned(),
        ));

        channels
            .renew_tx
            .send(LeaseRenewal {
                lease_id: "lease-2".to_owned(),
                lease_duration: 120,
                renewable: true,
                auth: None,
                data: None,
            })
            .await
            .unwrap();
        channels.done_tx.send(None).unwrap();
        consumer.await.unwrap();

        let guard = secret.read().await;
        assert_eq!(guard.lease_id, "lease-2");
        assert_eq!(guard.lease_duration, 120);
    }
}
