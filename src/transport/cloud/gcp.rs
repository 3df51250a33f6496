//! Google Cloud Pub/Sub binding for the managed-cloud adapter.
//!
//! ## Clients
//!
//! - One `Client` per broker, authenticated from the configured service
//!   account file or from ambient credentials.
//! - One `Publisher` per topic, created on first use and cached. Publishers
//!   batch internally; `close()` shuts every one down, which flushes what
//!   is still queued. Once closed the cache refuses new publishers, so a
//!   publish racing with `close()` fails instead of leaking one.
//! - One streaming pull per subscription, forwarded into a bounded channel
//!   by a dedicated task until its cancellation token fires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use google_cloud_pubsub::subscriber::ReceivedMessage;

use super::{CloudClient, CloudDelivery};
use crate::{
    //
    lock_ignore_poison,
    log_debug,
    log_info,
    log_warn,
    retry_with_backoff,
    Acknowledger,
    CloudConfig,
    Error,
    Result,
    MAILBOX_CAPACITY,
};

/// [`CloudClient`] backed by Google Cloud Pub/Sub.
pub struct GcpCloudClient {
    // ---
    project_id: String, // for logging only
    client: Client,
    publishers: TopicCache<Publisher>,
}

/// Per-topic cache that stops handing out entries once drained.
struct TopicCache<P> {
    entries: Mutex<Option<HashMap<String, P>>>,
}

impl<P: Clone> TopicCache<P> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Some(HashMap::new())),
        }
    }

    fn get_or_insert_with(&self, topic: &str, create: impl FnOnce() -> P) -> Result<P> {
        let mut entries = lock_ignore_poison(&self.entries);
        let entries = entries.as_mut().ok_or(Error::Closed)?;
        Ok(entries.entry(topic.to_string()).or_insert_with(create).clone())
    }

    /// Take every cached entry and refuse further inserts.
    fn close(&self) -> Vec<P> {
        lock_ignore_poison(&self.entries)
            .take()
            .map(|entries| entries.into_values().collect())
            .unwrap_or_default()
    }
}

impl GcpCloudClient {
    // ---
    /// Authenticate, connect, and probe the service.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the project id is missing or the credentials
    ///   file cannot be read
    /// - [`Error::Connection`] if the service cannot be reached within
    ///   `connect_timeout`
    pub async fn connect(config: &CloudConfig) -> Result<Self> {
        // ---
        config.validate()?;

        let mut client_config = match &config.credentials_file {
            Some(path) => {
                let credentials = CredentialsFile::new_from_file(path.to_string_lossy().into_owned())
                    .await
                    .map_err(|err| {
                        Error::Config(format!("gcp: cannot read credentials {}: {err}", path.display()))
                    })?;
                ClientConfig::default()
                    .with_credentials(credentials)
                    .await
                    .map_err(|err| Error::Config(format!("gcp: invalid credentials: {err}")))?
            }
            None => ClientConfig::default()
                .with_auth()
                .await
                .map_err(|err| Error::Config(format!("gcp: no ambient credentials: {err}")))?,
        };
        client_config.project_id = Some(config.project_id.clone());

        let client = Client::new(client_config)
            .await
            .map_err(|err| Error::Connection(format!("gcp: client setup failed: {err}")))?;

        let probe = || list_topics(&client);
        tokio::time::timeout(
            config.connect_timeout,
            retry_with_backoff(Some(&config.retry), probe),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "gcp: project {} unreachable within {:?}",
                config.project_id, config.connect_timeout
            ))
        })??;

        log_info!("gcp: connected to project {}", config.project_id);

        Ok(Self {
            project_id: config.project_id.clone(),
            client,
            publishers: TopicCache::new(),
        })
    }

    fn publisher(&self, topic: &str) -> Result<Publisher> {
        self.publishers
            .get_or_insert_with(topic, || self.client.topic(topic).new_publisher(None))
    }
}

async fn list_topics(client: &Client) -> Result<()> {
    client
        .get_topics(None)
        .await
        .map(|_topics| ())
        .map_err(|status| Error::Connection(format!("gcp: probe failed: {status}")))
}

struct GcpAck(ReceivedMessage);

#[async_trait::async_trait]
impl Acknowledger for GcpAck {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack()
            .await
            .map_err(|status| Error::Backend(format!("gcp: ack failed: {status}")))
    }

    async fn nack(&self) -> Result<()> {
        self.0
            .nack()
            .await
            .map_err(|status| Error::Backend(format!("gcp: nack failed: {status}")))
    }

    fn redelivers(&self) -> bool {
        true
    }
}

#[async_trait::async_trait]
impl CloudClient for GcpCloudClient {
    // ---
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<String> {
        // ---
        let message = PubsubMessage {
            data: payload.to_vec(),
            ..Default::default()
        };

        self.publisher(topic)?
            .publish(message)
            .await
            .get()
            .await
            .map_err(|status| Error::Backend(format!("gcp: publish to {topic} failed: {status}")))
    }

    async fn receive(
        &self,
        subscription: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<CloudDelivery>> {
        // ---
        let mut stream = self
            .client
            .subscription(subscription)
            .subscribe(None)
            .await
            .map_err(|status| {
                Error::Connection(format!("gcp: cannot pull from {subscription}: {status}"))
            })?;

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let name = subscription.to_string();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(received) => received,
                        None => {
                            log_warn!("gcp: pull stream for {name} ended");
                            break;
                        }
                    },
                };

                let delivery = CloudDelivery {
                    data: Bytes::from(received.message.data.clone()),
                    ack: Arc::new(GcpAck(received)),
                };

                if let Err(returned) = tx.send(delivery).await {
                    let _ = returned.0.ack.nack().await;
                    break;
                }
            }
            log_debug!("gcp: stopped pulling from {name}");
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        list_topics(&self.client).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        for mut publisher in self.publishers.close() {
            publisher.shutdown().await;
        }

        log_debug!("gcp: closed clients for project {}", self.project_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn topic_cache_reuses_entries() {
        let cache = TopicCache::new();
        let created = AtomicUsize::new(0);
        let make = || created.fetch_add(1, Ordering::SeqCst);

        assert_eq!(cache.get_or_insert_with("a", make).unwrap(), 0);
        assert_eq!(cache.get_or_insert_with("a", make).unwrap(), 0);
        assert_eq!(cache.get_or_insert_with("b", make).unwrap(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn closed_topic_cache_refuses_new_entries() {
        let cache = TopicCache::new();
        cache.get_or_insert_with("a", || 7u32).unwrap();

        let mut drained = cache.close();
        drained.sort_unstable();
        assert_eq!(drained, vec![7]);

        // A publish that lost the race with close must not create a publisher.
        let mut created = false;
        let late = cache.get_or_insert_with("b", || {
            created = true;
            8
        });
        assert!(matches!(late, Err(Error::Closed)));
        assert!(!created);
        assert!(cache.close().is_empty());
    }
}
