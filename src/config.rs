//! Backend configuration and connection parameters.
//!
//! Each external backend has its own config type. The core contract
//! (`publish`/`subscribe`/`close`/`ping`) never sees these; they are consumed
//! by the backend constructors only.
//!
//! Configs can be built three ways:
//! - builder-style setters (`RedisConfig::new("localhost:6379").with_default_channel(..)`)
//! - deserialized from any serde format (durations are milliseconds)
//! - read from prefixed environment variables via `from_env(prefix)`,
//!   where each flag is looked up as `{PREFIX}_{FLAG}` (or bare `{FLAG}`
//!   when the prefix is empty)

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result, RetryConfig};

/// Worker count used when a caller passes 0 to `publish`.
pub const DEFAULT_WORKERS: usize = 1;

/// Capacity of every subscription mailbox.
pub const MAILBOX_CAPACITY: usize = 100;

/// Default overall budget for establishing a backend connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Redis channel-store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Server address, either `host:port` or a full `redis://` URL.
    pub address: String,

    /// Optional server password.
    pub password: Option<String>,

    /// Database number.
    pub db: i64,

    /// Channel used when `publish`/`subscribe` receive an empty topic.
    pub default_channel: Option<String>,

    /// Overall budget for the construction-time liveness probe.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Backoff between liveness probes.
    pub retry: RetryConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: "localhost:6379".to_string(),
            password: None,
            db: 0,
            default_channel: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

impl RedisConfig {
    /// Create a config for the given server address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Read `{PREFIX}_REDIS_ADDRESS`, `{PREFIX}_REDIS_PASSWORD`,
    /// `{PREFIX}_REDIS_DB` and `{PREFIX}_DEFAULT_CHANNEL`.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env(prefix: &str) -> Result<Self> {
        // ---
        let mut config = Self::default();

        if let Some(address) = env_flag(prefix, "REDIS_ADDRESS") {
            config.address = address;
        }
        config.password = env_flag(prefix, "REDIS_PASSWORD").filter(|p| !p.is_empty());
        if let Some(db) = env_flag(prefix, "REDIS_DB") {
            config.db = db.parse().map_err(|err| {
                Error::Config(format!("{}: invalid number {db:?}: {err}", flag_name(prefix, "REDIS_DB")))
            })?;
        }
        config.default_channel = env_flag(prefix, "DEFAULT_CHANNEL").filter(|c| !c.is_empty());

        Ok(config)
    }

    /// Set the default channel.
    pub fn with_default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = Some(channel.into());
        self
    }

    /// Set the server password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database number.
    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Set the connection budget.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the probe backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Validate and render the connection URL understood by the redis client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the address is empty.
    pub fn connection_url(&self) -> Result<String> {
        // ---
        let address = self.address.trim();
        if address.is_empty() {
            return Err(Error::Config("redis address is required".into()));
        }

        if address.starts_with("redis://") || address.starts_with("rediss://") {
            return Ok(address.to_string());
        }

        let auth = match &self.password {
            Some(password) => format!(":{}@", urlencoding::encode(password)),
            None => String::new(),
        };
        Ok(format!("redis://{auth}{address}/{}", self.db))
    }
}

/// Managed cloud (Google Cloud Pub/Sub) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Project hosting the topics and subscriptions.
    pub project_id: String,

    /// Service account key file; ambient credentials are used when absent.
    pub credentials_file: Option<PathBuf>,

    /// Topic used when `publish` receives an empty topic.
    pub default_topic: Option<String>,

    /// Subscription used when `subscribe` receives an empty name.
    pub default_subscription: Option<String>,

    /// Overall budget for client construction.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Backoff between construction attempts.
    pub retry: RetryConfig,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            credentials_file: None,
            default_topic: None,
            default_subscription: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

impl CloudConfig {
    /// Create a config for the given project.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Read `{PREFIX}_PROJECT_ID`, `{PREFIX}_CREDENTIALS_FILE`,
    /// `{PREFIX}_DEFAULT_TOPIC` and `{PREFIX}_DEFAULT_SUBSCRIPTION`.
    pub fn from_env(prefix: &str) -> Self {
        // ---
        Self {
            project_id: env_flag(prefix, "PROJECT_ID").unwrap_or_default(),
            credentials_file: env_flag(prefix, "CREDENTIALS_FILE")
                .filter(|f| !f.is_empty())
                .map(PathBuf::from),
            default_topic: env_flag(prefix, "DEFAULT_TOPIC").filter(|t| !t.is_empty()),
            default_subscription: env_flag(prefix, "DEFAULT_SUBSCRIPTION").filter(|s| !s.is_empty()),
            ..Self::default()
        }
    }

    /// Set the default topic.
    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    /// Set the default subscription.
    pub fn with_default_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.default_subscription = Some(subscription.into());
        self
    }

    /// Use an explicit service account key file.
    pub fn with_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    /// Set the connection budget.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the construction backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] when the project id is empty.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::Config("project id is required".into()));
        }
        Ok(())
    }
}

fn flag_name(prefix: &str, flag: &str) -> String {
    let prefix = prefix.trim_end_matches('_');
    if prefix.is_empty() {
        flag.to_string()
    } else {
        format!("{}_{flag}", prefix.to_ascii_uppercase().replace('-', "_"))
    }
}

fn env_flag(prefix: &str, flag: &str) -> Option<String> {
    std::env::var(flag_name(prefix, flag)).ok()
}

/// Serde adapter: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
