//! Live runtime configuration.
//!
//! Configuration is loaded from environment variables. Secrets are held in
//! `SecretString` and redacted in Debug output.

use common::jwt::MAX_CLOCK_SKEW;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default client-facing bind address (WebSocket + recording upload).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default clock skew tolerance for identity token `iat`, in seconds.
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 300;

/// Default maximum chat message length, in characters.
pub const DEFAULT_CHAT_MAX_LENGTH: usize = 2000;

/// Minimum multipart part size for recordings (5 MiB).
pub const DEFAULT_RECORDING_MIN_PART_BYTES: usize = 5 * 1024 * 1024;

/// Idle time after which an unfinished upload is aborted.
pub const DEFAULT_RECORDING_STALE_SECONDS: u64 = 3600;

/// Interval between recording staleness sweeps.
pub const DEFAULT_RECORDING_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// Maximum accepted size of one recording chunk (16 MiB).
pub const DEFAULT_RECORDING_MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;

/// Default local object storage root.
pub const DEFAULT_STORAGE_ROOT: &str = "./recordings";

/// Default public URL prefix for completed recordings.
pub const DEFAULT_STORAGE_PUBLIC_URL: &str = "http://localhost:8080/recordings";

/// Default buffer of the side-effect dispatcher mailbox.
pub const DEFAULT_DISPATCH_BUFFER: usize = 1024;

/// What happens to a participant's media flags when they rejoin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejoinMediaPolicy {
    /// Start the new attendance cycle with default media flags.
    #[default]
    Reset,
    /// Carry audio/video flags over from the previous cycle.
    Preserve,
}

impl RejoinMediaPolicy {
    #[must_use]
    pub const fn resets(self) -> bool {
        matches!(self, RejoinMediaPolicy::Reset)
    }
}

impl FromStr for RejoinMediaPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reset" => Ok(RejoinMediaPolicy::Reset),
            "preserve" => Ok(RejoinMediaPolicy::Preserve),
            other => Err(ConfigError::InvalidValue(format!(
                "RT_REJOIN_MEDIA_POLICY must be 'reset' or 'preserve', got '{other}'"
            ))),
        }
    }
}

/// Live runtime configuration.
#[derive(Clone)]
pub struct Config {
    /// HMAC secret for identity tokens.
    pub identity_token_secret: SecretString,

    /// Postgres URL. The in-memory store is used when unset.
    pub database_url: Option<SecretString>,

    pub bind_address: String,

    pub health_bind_address: String,

    /// Clock skew tolerance for token `iat` (seconds, capped at 600).
    pub clock_skew_seconds: u64,

    pub chat_max_length: usize,

    pub rejoin_media_policy: RejoinMediaPolicy,

    pub recording_min_part_bytes: usize,

    pub recording_stale_seconds: u64,

    pub recording_sweep_interval_seconds: u64,

    pub recording_max_chunk_bytes: usize,

    /// Directory the filesystem object storage writes into.
    pub storage_root: String,

    /// URL prefix joined with the object key to form a recording URL.
    pub storage_public_url: String,

    pub dispatch_buffer: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("identity_token_secret", &"[REDACTED]")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("clock_skew_seconds", &self.clock_skew_seconds)
            .field("chat_max_length", &self.chat_max_length)
            .field("rejoin_media_policy", &self.rejoin_media_policy)
            .field("recording_min_part_bytes", &self.recording_min_part_bytes)
            .field("recording_stale_seconds", &self.recording_stale_seconds)
            .field(
                "recording_sweep_interval_seconds",
                &self.recording_sweep_interval_seconds,
            )
            .field("recording_max_chunk_bytes", &self.recording_max_chunk_bytes)
            .field("storage_root", &self.storage_root)
            .field("storage_public_url", &self.storage_public_url)
            .field("dispatch_buffer", &self.dispatch_buffer)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, failing on present-but-invalid values.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{name} has invalid value '{raw}'"))
        }),
        None => Ok(default),
    }
}

fn positive<T: PartialOrd + Default>(name: &str, value: T) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than zero"
        )))
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value
    /// cannot be parsed.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let secret = vars
            .get("IDENTITY_TOKEN_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("IDENTITY_TOKEN_SECRET".to_string()))?;
        if secret.is_empty() {
            return Err(ConfigError::InvalidValue(
                "IDENTITY_TOKEN_SECRET must not be empty".to_string(),
            ));
        }
        let identity_token_secret = SecretString::from(secret.clone());

        let database_url = vars
            .get("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .map(|url| SecretString::from(url.clone()));

        let bind_address = vars
            .get("RT_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RT_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let clock_skew_seconds =
            parse_var(vars, "RT_CLOCK_SKEW_SECONDS", DEFAULT_CLOCK_SKEW_SECONDS)?;
        let max_skew = MAX_CLOCK_SKEW.as_secs();
        if clock_skew_seconds > max_skew {
            return Err(ConfigError::InvalidValue(format!(
                "RT_CLOCK_SKEW_SECONDS must be at most {max_skew}, got {clock_skew_seconds}"
            )));
        }

        let chat_max_length = positive(
            "RT_CHAT_MAX_LENGTH",
            parse_var(vars, "RT_CHAT_MAX_LENGTH", DEFAULT_CHAT_MAX_LENGTH)?,
        )?;

        let rejoin_media_policy =
            parse_var(vars, "RT_REJOIN_MEDIA_POLICY", RejoinMediaPolicy::default())?;

        let recording_min_part_bytes = positive(
            "RT_RECORDING_MIN_PART_BYTES",
            parse_var(
                vars,
                "RT_RECORDING_MIN_PART_BYTES",
                DEFAULT_RECORDING_MIN_PART_BYTES,
            )?,
        )?;

        let recording_stale_seconds = positive(
            "RT_RECORDING_STALE_SECONDS",
            parse_var(
                vars,
                "RT_RECORDING_STALE_SECONDS",
                DEFAULT_RECORDING_STALE_SECONDS,
            )?,
        )?;

        let recording_sweep_interval_seconds = positive(
            "RT_RECORDING_SWEEP_INTERVAL_SECONDS",
            parse_var(
                vars,
                "RT_RECORDING_SWEEP_INTERVAL_SECONDS",
                DEFAULT_RECORDING_SWEEP_INTERVAL_SECONDS,
            )?,
        )?;

        let recording_max_chunk_bytes = positive(
            "RT_RECORDING_MAX_CHUNK_BYTES",
            parse_var(
                vars,
                "RT_RECORDING_MAX_CHUNK_BYTES",
                DEFAULT_RECORDING_MAX_CHUNK_BYTES,
            )?,
        )?;

        let storage_root = vars
            .get("RT_STORAGE_ROOT")
            .cloned()
            .unwrap_or_else(|| DEFAULT_STORAGE_ROOT.to_string());

        let storage_public_url = vars
            .get("RT_STORAGE_PUBLIC_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_STORAGE_PUBLIC_URL.to_string());

        let dispatch_buffer = positive(
            "RT_DISPATCH_BUFFER",
            parse_var(vars, "RT_DISPATCH_BUFFER", DEFAULT_DISPATCH_BUFFER)?,
        )?;

        Ok(Config {
            identity_token_secret,
            database_url,
            bind_address,
            health_bind_address,
            clock_skew_seconds,
            chat_max_length,
            rejoin_media_policy,
            recording_min_part_bytes,
            recording_stale_seconds,
            recording_sweep_interval_seconds,
            recording_max_chunk_bytes,
            storage_root,
            storage_public_url,
            dispatch_buffer,
        })
    }
}
