//! Top-level configuration for `vault-init`.
//!
//! Populated by the CLI (or an embedding application) and validated once
//! before anything touches the network. Immutable afterwards.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ConfigError;

/// Default interval at which non-renewable secrets are re-checked.
pub const DEFAULT_REFRESH_DURATION: Duration = Duration::from_secs(15);

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, colored when attached to a TTY.
    #[default]
    Default,
    /// Human-readable, no color, no sorting.
    Plain,
    /// One structured JSON object per line, with timestamp.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "default" => Ok(Self::Default),
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnknownLogFormat(other.to_owned())),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Plain => f.write_str("plain"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Configuration for `vault-init` as a whole.
#[derive(Debug, Clone)]
pub struct Config {
    /// Argv of the child process. Required, non-empty.
    pub command: Vec<String>,

    /// Policies the child's Vault token is created with.
    pub access_policies: Vec<String>,
    /// Secret paths loaded into the template context.
    pub paths: Vec<String>,
    /// Create the child token without a parent relationship.
    pub orphan_token: bool,
    /// Create the child token non-renewable.
    pub disable_token_renew: bool,
    /// Withhold the Vault address/TLS/token environment from the child.
    pub no_inherit_token: bool,
    /// Do not start the zombie reaper.
    pub no_reaper: bool,
    /// Exit instead of restarting when the child exits.
    pub one_shot: bool,
    /// How frequently non-renewable secrets are checked for new versions.
    pub refresh_duration: Duration,
    /// TTL of the child token; mutually exclusive with `token_period`.
    pub token_ttl: String,
    /// Renewal period of the child token; creates a periodic token.
    pub token_period: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Address to expose telemetry on. Disabled when blank.
    pub telemetry_address: String,
    /// Enable debug-level logging.
    pub verbose: bool,
    /// Enable trace-level logging, which may print sensitive data.
    pub debug: bool,

    /// Vault server address.
    pub vault_address: String,
    /// Bootstrap token.
    pub vault_token: String,
    /// File containing the bootstrap token.
    pub vault_token_file: String,

    /// Extra sinks receiving the child's stdout lines.
    pub forwarder_stdout_sinks: Vec<mpsc::Sender<String>>,
    /// Extra sinks receiving the child's stderr lines.
    pub forwarder_stderr_sinks: Vec<mpsc::Sender<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            access_policies: Vec::new(),
            paths: Vec::new(),
            orphan_token: false,
            disable_token_renew: false,
            no_inherit_token: false,
            no_reaper: false,
            one_shot: false,
            refresh_duration: DEFAULT_REFRESH_DURATION,
            token_ttl: String::new(),
            token_period: String::new(),
            log_format: LogFormat::default(),
            telemetry_address: String::new(),
            verbose: false,
            debug: false,
            vault_address: crate::client::DEFAULT_VAULT_ADDR.to_owned(),
            vault_token: String::new(),
            vault_token_file: String::new(),
            forwarder_stdout_sinks: Vec::new(),
            forwarder_stderr_sinks: Vec::new(),
        }
    }
}

impl Config {
    /// The child command as a display string.
    #[must_use]
    pub fn command_string(&self) -> String {
        self.command.join(" ")
    }

    /// Validate the configuration and resolve the bootstrap token.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on a missing command, conflicting token
    /// TTL/period, a missing or unreadable token source, or an invalid
    /// telemetry address.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }

        if !self.token_ttl.is_empty() && !self.token_period.is_empty() {
            return Err(ConfigError::TtlPeriodConflict);
        }

        if self.vault_token.is_empty() && self.vault_token_file.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if !self.vault_token.is_empty() && !self.vault_token_file.is_empty() {
            warn!("both an inline token and a token file are set, ignoring the token file");
            self.vault_token_file.clear();
        }

        if !self.vault_token_file.is_empty() {
            let content = std::fs::read_to_string(&self.vault_token_file).map_err(|source| {
                ConfigError::TokenFile {
                    path: self.vault_token_file.clone(),
                    source,
                }
            })?;
            self.vault_token = content.trim().to_owned();
        }

        if !self.telemetry_address.is_empty() {
            self.telemetry_address
                .parse::<std::net::SocketAddr>()
                .map_err(|source| ConfigError::TelemetryAddress {
                    addr: self.telemetry_address.clone(),
                    source,
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            command: vec!["/bin/echo".to_owned(), "hi".to_owned()],
            vault_token: "bootstrap".to_owned(),
            ..Config::default()
        }
    }

    #[test]
    fn default_refresh_duration_is_fifteen_seconds() {
        assert_eq!(Config::default().refresh_duration, Duration::from_secs(15));
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut config = valid_config();
        config.command.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCommand)
        ));
    }

    #[test]
    fn ttl_and_period_are_mutually_exclusive() {
        let mut config = valid_config();
        config.token_ttl = "1h".to_owned();
        config.token_period = "30m".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TtlPeriodConflict)
        ));
    }

    #[test]
    fn missing_token_is_rejected() {
        let mut config = valid_config();
        config.vault_token.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn inline_token_wins_over_token_file() {
        let mut config = valid_config();
        config.vault_token_file = "/nonexistent/token".to_owned();

        config.validate().unwrap();
        assert_eq!(config.vault_token, "bootstrap");
        assert!(config.vault_token_file.is_empty());
    }

    #[test]
    fn token_file_is_read_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  s.filetoken  ").unwrap();

        let mut config = valid_config();
        config.vault_token.clear();
        config.vault_token_file = file.path().to_string_lossy().into_owned();

        config.validate().unwrap();
        assert_eq!(config.vault_token, "s.filetoken");
    }

    #[test]
    fn unreadable_token_file_is_an_error() {
        let mut config = valid_config();
        config.vault_token.clear();
        config.vault_token_file = "/nonexistent/token".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TokenFile { .. })
        ));
    }

    #[test]
    fn telemetry_address_must_parse() {
        let mut config = valid_config();
        config.telemetry_address = "not-an-address".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TelemetryAddress { .. })
        ));

        config.telemetry_address = "127.0.0.1:9100".to_owned();
        config.validate().unwrap();
    }

    #[test]
    fn log_format_parses_known_names() {
        assert_eq!("default".parse::<LogFormat>().unwrap(), LogFormat::Default);
        assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("noop".parse::<LogFormat>().is_err());
    }
}
