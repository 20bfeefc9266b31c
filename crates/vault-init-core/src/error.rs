//! Error types for `vault-init-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Variants never include token or secret material — only paths,
//! accessors, and operation descriptions.

/// Errors from configuration validation. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No child command was supplied.
    #[error("no command specified — pass the child argv after `--`")]
    MissingCommand,

    /// Both a token TTL and a token period were configured.
    #[error("token TTL and token period are mutually exclusive; only one may be set")]
    TtlPeriodConflict,

    /// Neither an inline token nor a token file was supplied.
    #[error("no Vault token available — set VAULT_TOKEN or VAULT_TOKEN_FILE")]
    MissingToken,

    /// The token file could not be read.
    #[error("could not read token file `{path}`")]
    TokenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The log format name was not recognized.
    #[error("unknown log format `{0}` (expected one of: default, plain, json)")]
    UnknownLogFormat(String),

    /// The telemetry listen address did not parse.
    #[error("invalid telemetry address `{addr}`")]
    TelemetryAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Errors from the Vault client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The Vault server could not be reached at all.
    #[error("could not reach Vault")]
    Transport(#[from] reqwest::Error),

    /// Vault answered but is not in a serving state.
    #[error("Vault is not healthy: initialized={initialized} sealed={sealed} standby={standby}")]
    Unhealthy {
        initialized: bool,
        sealed: bool,
        standby: bool,
    },

    /// The token was rejected or has insufficient capabilities.
    #[error("Vault authentication failed: {reason}")]
    Auth { reason: String },

    /// Child token derivation failed.
    #[error("could not create child token: {reason}")]
    TokenCreate { reason: String },

    /// A secret read failed.
    #[error("could not read secret at path `{path}`: {reason}")]
    ReadFailed { path: String, reason: String },

    /// A token-accessor or lease revocation failed.
    #[error("could not revoke {target}: {reason}")]
    RevokeFailed { target: String, reason: String },

    /// A lease renewer could not be constructed.
    #[error("could not create renewer for secret at `{path}`: {reason}")]
    RenewerCreate { path: String, reason: String },

    /// The client configuration is unusable (bad address, TLS material, ...).
    #[error("invalid Vault client configuration: {reason}")]
    Config { reason: String },
}

/// Errors from environment variable templates.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The template body for an environment variable did not parse.
    #[error("could not parse template for environment variable `{key}`")]
    Parse {
        key: String,
        #[source]
        source: Box<handlebars::TemplateError>,
    },

    /// Rendering failed, most commonly on a reference to a missing key.
    #[error("could not render template for environment variable `{key}`")]
    Render {
        key: String,
        #[source]
        source: Box<handlebars::RenderError>,
    },
}

/// Errors from spawning a child process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The program is not on `$PATH` and is not an absolute path.
    #[error("could not find program `{program}` in $PATH")]
    ProgramNotFound {
        program: String,
        #[source]
        source: which::Error,
    },

    /// A stdio pipe for the child could not be acquired after spawn.
    #[error("could not set up stdio pipes for child process")]
    PipeSetup,

    /// The OS refused to start the child.
    #[error("could not start child process `{program}`")]
    StartFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the supervisor loop.
#[derive(Debug, thiserror::Error)]
pub enum SuperviseError {
    /// Supervision was requested with an empty argv.
    #[error("no command configured for supervision")]
    EmptyCommand,

    /// The initial spawn of the child failed. Restart-time spawn failures
    /// are retried instead of surfacing here.
    #[error("could not spawn child process")]
    Spawn(#[from] SpawnError),
}

/// Errors from the secret watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The initial fetch of the configured secret set failed.
    #[error("could not collect secrets while starting watcher")]
    InitialFetch(#[source] ClientError),

    /// A renewer for one of the initially fetched secrets could not start.
    #[error("could not start renewer while starting watcher")]
    InitialRenewer(#[source] ClientError),

    /// An environment snapshot could not be rendered.
    #[error("could not render environment snapshot")]
    Render(#[from] TemplateError),

    /// The supervisor went away; there is nobody left to publish to.
    #[error("environment snapshot channel closed")]
    ChannelClosed,
}

/// Errors from the top-level initializer composition.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// Configuration validation failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The Vault client could not be constructed.
    #[error("could not initialize Vault client")]
    Client(#[source] ClientError),

    /// The startup health check against Vault failed.
    #[error("could not communicate with Vault")]
    Check(#[source] ClientError),

    /// The child token could not be derived.
    #[error("could not create child token")]
    TokenCreate(#[source] ClientError),

    /// The client could not be downgraded to the child token.
    #[error("could not downgrade to child token")]
    Downgrade(#[source] ClientError),

    /// The renewer for the child token could not be started.
    #[error("could not start child token renewer")]
    TokenRenewer(#[source] ClientError),

    /// The watcher failed during startup.
    #[error("secret watcher failed")]
    Watch(#[from] WatchError),

    /// The supervisor failed.
    #[error("supervisor failed")]
    Supervise(#[from] SuperviseError),
}
