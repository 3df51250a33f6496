//! Broker builder for creating backend instances.
//!
//! Provides a fluent builder API for constructing a [`PubSubPtr`] with clear
//! separation between backend selection and backend options.

use std::time::Duration;

use crate::{
    // ---
    create_gcp_pubsub,
    create_memory_pubsub,
    create_redis_pubsub,
    BackendKind,
    CloudConfig,
    Error,
    Message,
    PubSubPtr,
    RedisConfig,
    Result,
    RetryConfig,
};

/// Builder for creating broker instances.
///
/// The backend is chosen from the URI scheme, or explicitly with
/// [`backend`](Self::backend):
///
/// | URI                     | backend                         |
/// |-------------------------|---------------------------------|
/// | `memory://`             | in-process                      |
/// | `redis://host:port/db`  | channel store (feature `redis`) |
/// | `gcp://project-id`      | managed cloud (feature `gcp`)   |
///
/// # Examples
///
/// ## In-process
/// ```
/// use mom_pubsub::PubSubBuilder;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mom_pubsub::Result<()> {
/// let pubsub = PubSubBuilder::new()
///     .uri("memory://")
///     .default_topic("events")
///     .build::<String>()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Redis
/// ```no_run
/// use mom_pubsub::PubSubBuilder;
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let pubsub = PubSubBuilder::new()
///     .uri("redis://localhost:6379/0")
///     .default_topic("events")
///     .build::<String>()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct PubSubBuilder {
    uri: Option<String>,
    backend: Option<BackendKind>,
    default_topic: Option<String>,
    default_subscription: Option<String>,
    credentials_file: Option<std::path::PathBuf>,
    connect_timeout: Option<Duration>,
    retry: Option<RetryConfig>,
}

impl PubSubBuilder {
    /// Create a new broker builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend URI.
    ///
    /// Examples:
    /// - `"memory://"`
    /// - `"redis://:secret@localhost:6379/0"`
    /// - `"gcp://my-project"`
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the backend explicitly instead of inferring it from the URI scheme.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Topic (Redis: channel) used when `publish`/`subscribe` get an empty name.
    pub fn default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    /// Cloud subscription used when `subscribe` gets an empty name.
    pub fn default_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.default_subscription = Some(subscription.into());
        self
    }

    /// Cloud service account key file.
    pub fn credentials_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    /// Overall budget for reaching an external backend.
    ///
    /// If not specified, uses [`DEFAULT_CONNECT_TIMEOUT`](crate::DEFAULT_CONNECT_TIMEOUT).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Backoff used while waiting for an external backend to come up.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build the broker (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Neither `uri` nor `backend` is set
    /// - The URI scheme is unknown or contradicts `backend`
    /// - The selected backend's feature is not enabled
    /// - Backend creation fails
    pub async fn build<T: Message>(self) -> Result<PubSubPtr<T>> {
        // ---
        let uri = self.uri.clone().unwrap_or_default();
        let from_scheme = scheme_backend(&uri)?;

        let backend = match (self.backend, from_scheme) {
            (Some(explicit), Some(inferred)) if explicit != inferred => {
                return Err(Error::Config(format!(
                    "uri {uri} selects the {inferred} backend, but {explicit} was requested"
                )));
            }
            (Some(explicit), _) => explicit,
            (None, Some(inferred)) => inferred,
            (None, None) => return Err(Error::Config("uri or backend is required".into())),
        };

        match backend {
            BackendKind::Memory => Ok(create_memory_pubsub(self.default_topic)),
            BackendKind::Channel => create_redis_pubsub(&self.redis_config(&uri)).await,
            BackendKind::Cloud => create_gcp_pubsub(&self.cloud_config(&uri)).await,
        }
    }

    fn redis_config(&self, uri: &str) -> RedisConfig {
        // ---
        let mut config = match uri {
            "" => RedisConfig::default(),
            uri => RedisConfig::new(uri),
        };
        config.default_channel = self.default_topic.clone();
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(retry) = &self.retry {
            config.retry = retry.clone();
        }
        config
    }

    fn cloud_config(&self, uri: &str) -> CloudConfig {
        // ---
        let project = uri.split_once("://").map_or("", |(_, rest)| rest).trim_end_matches('/');
        let mut config = CloudConfig::new(project);
        config.default_topic = self.default_topic.clone();
        config.default_subscription = self.default_subscription.clone();
        config.credentials_file = self.credentials_file.clone();
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(retry) = &self.retry {
            config.retry = retry.clone();
        }
        config
    }
}

/// Backend implied by a URI scheme, if any.
fn scheme_backend(uri: &str) -> Result<Option<BackendKind>> {
    // ---
    if uri.is_empty() {
        return Ok(None);
    }

    let Some((scheme, _)) = uri.split_once("://") else {
        return Err(Error::Config(format!("uri {uri} has no scheme")));
    };

    match scheme {
        "memory" | "mem" => Ok(Some(BackendKind::Memory)),
        "redis" | "rediss" => Ok(Some(BackendKind::Channel)),
        "gcp" | "pubsub" => Ok(Some(BackendKind::Cloud)),
        other => Err(Error::Config(format!(
            "unrecognized uri scheme: {other}, valid values: memory, redis, gcp"
        ))),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::CancellationToken;

    #[test]
    fn schemes_map_to_backends() {
        assert_eq!(scheme_backend("memory://").unwrap(), Some(BackendKind::Memory));
        assert_eq!(scheme_backend("redis://localhost:6379/0").unwrap(), Some(BackendKind::Channel));
        assert_eq!(scheme_backend("gcp://demo").unwrap(), Some(BackendKind::Cloud));
        assert_eq!(scheme_backend("").unwrap(), None);
        assert!(matches!(scheme_backend("amqp://x"), Err(Error::Config(_))));
        assert!(matches!(scheme_backend("localhost"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn memory_backend_is_usable() {
        let ctx = CancellationToken::new();
        let pubsub = PubSubBuilder::new()
            .uri("memory://")
            .default_topic("events")
            .build::<u32>()
            .await
            .unwrap();
        assert_eq!(pubsub.backend(), BackendKind::Memory);

        let sub = pubsub.subscribe(&ctx, "").await.unwrap();
        assert_eq!(sub.name(), "events");
        pubsub.ping(&ctx, Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_backend_without_uri() {
        let pubsub = PubSubBuilder::new().backend(BackendKind::Memory).build::<u32>().await.unwrap();
        assert_eq!(pubsub.backend(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn conflicting_selection_is_rejected() {
        let result = PubSubBuilder::new()
            .uri("memory://")
            .backend(BackendKind::Cloud)
            .build::<u32>()
            .await;
        assert!(matches!(result, Err(Error::Config(_))));

        let result = PubSubBuilder::new().build::<u32>().await;
        assert!(matches!(result, Err(Error::Config(ref msg)) if msg == "uri or backend is required"));
    }

    #[tokio::test]
    async fn cloud_without_project_is_config_error() {
        let result = PubSubBuilder::new().uri("gcp://").build::<u32>().await;
        assert!(matches!(result, Err(Error::Config(ref msg)) if msg == "project id is required"));
    }

    #[test]
    fn redis_config_carries_options() {
        let builder = PubSubBuilder::new()
            .default_topic("ch")
            .connect_timeout(Duration::from_secs(2))
            .retry(RetryConfig::none());
        let config = builder.redis_config("redis://localhost:6379/1");

        assert_eq!(config.default_channel.as_deref(), Some("ch"));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, 0);
        assert_eq!(config.connection_url().unwrap(), "redis://localhost:6379/1");
    }
}
