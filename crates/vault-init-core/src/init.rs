//! Top-level composition: wire the client, watcher, and supervisor together.
//!
//! Startup sequence: validate configuration, construct the client, health
//! check, derive the child token, downgrade the client to it, start the
//! token renewer, start the watcher, hand its snapshot channel to the
//! supervisor, and block until the supervisor exits. Teardown revokes the
//! derived token best-effort.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::http::HttpVaultClient;
use crate::client::{VaultClient, VaultConfig};
use crate::config::Config;
use crate::error::{ClientError, InitError};
use crate::renewer::start_secret_renewer;
use crate::supervise::{Supervisor, SupervisorConfig};
use crate::watcher::Watcher;

/// Validate the configuration and run against a real Vault server until
/// `shutdown` fires or the supervisor exits on its own.
///
/// # Errors
///
/// Returns an [`InitError`] on validation failure, any startup failure, or
/// an unrecoverable supervisor error.
pub async fn run(mut config: Config, shutdown: CancellationToken) -> Result<(), InitError> {
    config.validate()?;

    let vault_config = VaultConfig::from_config_and_env(&config);
    let client: Arc<dyn VaultClient> =
        Arc::new(HttpVaultClient::new(vault_config).map_err(InitError::Client)?);

    run_with_client(config, client, std::env::vars().collect(), shutdown).await
}

/// Run the full startup/supervision/teardown sequence with an
/// already-constructed client. `base_env` is the inherited environment
/// snapshots are rendered from; production passes the process environment.
///
/// The configuration is expected to be validated.
///
/// # Errors
///
/// Returns an [`InitError`] on any startup failure or an unrecoverable
/// supervisor error.
pub async fn run_with_client(
    config: Config,
    client: Arc<dyn VaultClient>,
    base_env: Vec<(String, String)>,
    shutdown: CancellationToken,
) -> Result<(), InitError> {
    client.check().await.map_err(InitError::Check)?;

    let display_name = format!("vault-init child of {}", config.command_string());
    let token_secret = client
        .create_child_token(&display_name)
        .await
        .map_err(InitError::TokenCreate)?;

    let Some(auth) = token_secret.auth.clone() else {
        return Err(InitError::TokenCreate(ClientError::TokenCreate {
            reason: "token response carried no auth info".to_owned(),
        }));
    };

    // From here on every operation — and the child, if inheriting — uses
    // the derived token instead of the bootstrap token.
    info!(accessor = %auth.accessor, "downgrading Vault client to child token");
    client
        .set_token(&auth.client_token)
        .await
        .map_err(InitError::Downgrade)?;

    let token_secret = Arc::new(RwLock::new(token_secret));
    let token_renewer = start_secret_renewer(&client, Arc::clone(&token_secret))
        .await
        .map_err(InitError::TokenRenewer)?;

    let (update_tx, update_rx) = mpsc::channel(1);
    let watcher = Watcher::new(Arc::clone(&client), config.refresh_duration, base_env);
    let watcher_cancel = shutdown.child_token();
    let watcher_task = tokio::spawn(watcher.watch(update_tx, watcher_cancel.clone()));

    let supervisor = Supervisor::new(SupervisorConfig {
        command: config.command.clone(),
        one_shot: config.one_shot,
        no_reaper: config.no_reaper,
        stdout_sinks: config.forwarder_stdout_sinks.clone(),
        stderr_sinks: config.forwarder_stderr_sinks.clone(),
    });

    let supervise_result = supervisor.start(update_rx, shutdown.clone()).await;

    // Stop the watcher; it stops the per-secret renewers and revokes leased
    // secrets on the way out.
    watcher_cancel.cancel();
    let watch_result = match watcher_task.await {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, "watcher task failed");
            Ok(())
        }
    };

    if let Some(renewer) = token_renewer {
        renewer.stop().await;
    }

    info!("shutting down");
    if let Err(err) = client.revoke_token_accessor(&auth.accessor).await {
        warn!(error = %err, "could not revoke child token");
    }

    // A watcher startup failure explains a supervisor exit; report it first.
    watch_result?;
    let _child_exit = supervise_result?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::stub::StubVaultClient;

    fn one_shot_config(command: Vec<&str>) -> Config {
        Config {
            command: command.into_iter().map(str::to_owned).collect(),
            one_shot: true,
            no_reaper: true,
            vault_token: "bootstrap".to_owned(),
            ..Config::default()
        }
    }

    fn stub_for(config: &Config) -> Arc<StubVaultClient> {
        Arc::new(StubVaultClient::new(VaultConfig::from_config_and_env(
            config,
        )))
    }

    fn plain_env() -> Vec<(String, String)> {
        vec![("PATH".to_owned(), "/usr/bin:/bin".to_owned())]
    }

    #[tokio::test]
    async fn basic_one_shot_run_derives_and_revokes_the_token() {
        let config = one_shot_config(vec!["/bin/echo", "hi"]);
        let client = stub_for(&config);

        run_with_client(
            config,
            Arc::clone(&client) as Arc<dyn VaultClient>,
            plain_env(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let creations = client.token_creations();
        assert_eq!(creations.len(), 1);
        assert!(creations[0].display_name.contains("/bin/echo hi"));

        // Exactly one revocation of the derived token.
        assert_eq!(
            client.revoked_accessors(),
            vec!["stub-child-accessor".to_owned()]
        );
        assert_eq!(client.current_token().await, "stub-child-token");
    }

    #[tokio::test]
    async fn orphan_token_uses_the_orphan_entry_point() {
        let mut config = one_shot_config(vec!["/bin/echo", "hi"]);
        config.orphan_token = true;
        let client = stub_for(&config);

        run_with_client(
            config,
            Arc::clone(&client) as Arc<dyn VaultClient>,
            plain_env(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let creations = client.token_creations();
        assert_eq!(creations.len(), 1);
        assert!(creations[0].orphan);
        assert!(creations[0].no_parent);
    }

    #[tokio::test]
    async fn unhealthy_store_fails_startup() {
        let config = one_shot_config(vec!["/bin/echo", "hi"]);
        let client = stub_for(&config);
        client.fail_checks();

        let result = run_with_client(
            config,
            Arc::clone(&client) as Arc<dyn VaultClient>,
            plain_env(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(InitError::Check(_))));
    }

    #[tokio::test]
    async fn child_sees_the_derived_token_not_the_bootstrap_token() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("token");
        let script = format!("echo \"$VAULT_TOKEN\" > {}", marker.to_string_lossy());

        let config = one_shot_config(vec!["/bin/sh", "-c", &script]);
        let client = stub_for(&config);

        let mut env = plain_env();
        env.push(("VAULT_TOKEN".to_owned(), "bootstrap".to_owned()));

        run_with_client(
            config,
            Arc::clone(&client) as Arc<dyn VaultClient>,
            env,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), "stub-child-token");
    }

    #[tokio::test]
    async fn renewable_token_starts_exactly_one_renewer() {
        let config = one_shot_config(vec!["/bin/echo", "hi"]);
        let client = stub_for(&config);

        run_with_client(
            config,
            Arc::clone(&client) as Arc<dyn VaultClient>,
            plain_env(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // The synthetic child token is renewable; its renewer starts once.
        assert_eq!(client.renewers_started("auth/token/create"), 1);
    }
}
