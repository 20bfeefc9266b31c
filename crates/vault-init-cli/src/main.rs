//! `vault-init` — launch and supervise a process with secrets injected from
//! Vault.
//!
//! This binary owns the flag/environment surface and the log formatter
//! selection; everything else lives in `vault-init-core`.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vault_init_core::config::{Config, LogFormat};
use vault_init_core::error::InitError;
use vault_init_core::init;

/// Launch and supervise a process with secrets injected from Vault.
#[derive(Debug, Parser)]
#[command(
    name = "vault-init",
    version,
    about = "vault-init — launch and supervise a process with secrets injected from Vault",
    long_about = None,
    after_help = "Examples:\n  \
        vault-init -p kv/myapp -- /usr/local/bin/myapp --port 8080\n  \
        vault-init -A myapp-read --orphan-token --one-shot -- /bin/run-migration"
)]
struct Args {
    /// The child command and arguments, after `--`.
    #[arg(last = true)]
    command: Vec<String>,

    /// Access policies to create the child Vault token with.
    #[arg(
        short = 'A',
        long = "access-policy",
        env = "INIT_ACCESS_POLICIES",
        value_delimiter = ','
    )]
    access_policies: Vec<String>,

    /// Secret path to load into the template context.
    #[arg(short = 'p', long = "path", env = "INIT_PATHS", value_delimiter = ',')]
    paths: Vec<String>,

    /// Create the child token independent of the parent token.
    #[arg(long = "orphan-token", env = "INIT_ORPHAN_TOKEN")]
    orphan_token: bool,

    /// Make the child token unable to be renewed.
    #[arg(long = "disable-token-renew", env = "INIT_DISABLE_TOKEN_RENEW")]
    disable_token_renew: bool,

    /// Do not pass the Vault address, TLS settings, or token down to the
    /// spawned child.
    #[arg(long = "no-inherit-token", env = "INIT_NO_INHERIT_TOKEN")]
    no_inherit_token: bool,

    /// Disable the subprocess reaper.
    #[arg(long = "without-reaper", env = "INIT_NO_REAPER")]
    no_reaper: bool,

    /// Do not restart when the child process exits.
    #[arg(short = 'O', long = "one-shot", env = "INIT_ONE_SHOT")]
    one_shot: bool,

    /// How frequently secrets should be checked for version changes.
    #[arg(
        long = "refresh-duration",
        env = "INIT_REFRESH_DURATION",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    refresh_duration: Duration,

    /// TTL of the child token; mutually exclusive with --token-period.
    #[arg(long = "token-ttl", env = "INIT_TOKEN_TTL", default_value = "")]
    token_ttl: String,

    /// Renewal period of the child token; creates a periodic token.
    #[arg(long = "token-period", env = "INIT_TOKEN_PERIOD", default_value = "")]
    token_period: String,

    /// Log output format [default, plain, json].
    #[arg(long = "log-format", env = "INIT_LOG_FORMAT", default_value = "default")]
    log_format: LogFormat,

    /// Address to expose telemetry on. Disabled if blank.
    #[arg(long = "telemetry-address", env = "INIT_TELEMETRY_ADDR", default_value = "")]
    telemetry_address: String,

    /// Enable verbose debug logging.
    #[arg(short = 'v', long = "verbose", env = "INIT_VERBOSE")]
    verbose: bool,

    /// Enable super verbose trace logging, which may print sensitive data
    /// to the terminal.
    #[arg(short = 'D', long = "debug", env = "INIT_DEBUG")]
    debug: bool,

    /// Address to use to connect to Vault.
    #[arg(
        long = "vault-address",
        env = "VAULT_ADDR",
        default_value = "http://127.0.0.1:8200"
    )]
    vault_address: String,

    /// Token to use to authenticate to Vault.
    #[arg(long = "vault-token", env = "VAULT_TOKEN", hide_env_values = true)]
    vault_token: Option<String>,

    /// File containing the token to use to authenticate to Vault.
    #[arg(long = "vault-token-file", env = "VAULT_TOKEN_FILE")]
    vault_token_file: Option<String>,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            command: self.command,
            access_policies: self.access_policies,
            paths: self.paths,
            orphan_token: self.orphan_token,
            disable_token_renew: self.disable_token_renew,
            no_inherit_token: self.no_inherit_token,
            no_reaper: self.no_reaper,
            one_shot: self.one_shot,
            refresh_duration: self.refresh_duration,
            token_ttl: self.token_ttl,
            token_period: self.token_period,
            log_format: self.log_format,
            telemetry_address: self.telemetry_address,
            verbose: self.verbose,
            debug: self.debug,
            vault_address: self.vault_address,
            vault_token: self.vault_token.unwrap_or_default(),
            vault_token_file: self.vault_token_file.unwrap_or_default(),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Args::parse().into_config();

    init_logging(&config);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match init::run(config, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let config_error = matches!(err, InitError::Config(_));
            error!("{:#}", anyhow::Error::new(err));

            if config_error {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Configure the log formatter before anything else runs.
fn init_logging(config: &Config) {
    let default_level = if config.debug {
        "trace"
    } else if config.verbose {
        "debug"
    } else {
        "info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.log_format {
        LogFormat::Default => builder.init(),
        LogFormat::Plain => builder.with_ansi(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for SIGINT or SIGTERM, then cancel the supervisor.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping supervisor");
    shutdown.cancel();
}
