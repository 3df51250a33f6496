//! Redis Pub/Sub binding for the channel-store adapter.
//!
//! ## Connections
//!
//! Redis mandates a dedicated connection for Pub/Sub; a connection in
//! Pub/Sub mode cannot issue regular commands like `PUBLISH`. The store
//! therefore keeps:
//!
//! - one `MultiplexedConnection`, shared by every `PUBLISH` and `PING`
//! - one `aio::PubSub` connection per subscription, split into sink
//!   (subscribe/unsubscribe) and stream (incoming messages)
//!
//! `PubSubSink::subscribe()` resolves only after the server confirmed the
//! subscription, so a returned feed never misses a message published after
//! `subscribe` returned.
//!
//! `close()` drops the shared connection; later `PUBLISH`, `PING` and
//! `SUBSCRIBE` calls fail with [`Error::Closed`].
//!
//! ## Startup
//!
//! Construction retries `PING` with jittered backoff until it succeeds or
//! `connect_timeout` runs out, so a store that is still starting up is
//! tolerated.

use std::sync::Mutex;

use bytes::Bytes;
use futures_util::StreamExt;

use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};

use super::{ChannelFeed, ChannelStore};
use crate::{
    //
    lock_ignore_poison,
    log_debug,
    log_info,
    retry_with_backoff,
    Error,
    RedisConfig,
    Result,
};

/// [`ChannelStore`] backed by a Redis server.
pub struct RedisChannelStore {
    // ---
    address: String, // for logging only, never carries the password
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisChannelStore {
    // ---
    /// Open a client and wait for the server to answer `PING`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the address is missing or not a valid URL
    /// - [`Error::Connection`] if no `PING` succeeds within `connect_timeout`
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        // ---
        let url = config.connection_url()?;
        let address = config.address.clone();

        let client = redis::Client::open(url.as_str())
            .map_err(|err| Error::Config(format!("redis: invalid address {address}: {err}")))?;

        let attempt = || {
            let client = client.clone();
            async move {
                let mut conn = client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|err| Error::Connection(format!("redis: connect failed: {err}")))?;
                ping(&mut conn).await?;
                Ok(conn)
            }
        };

        let conn = tokio::time::timeout(
            config.connect_timeout,
            retry_with_backoff(Some(&config.retry), attempt),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "redis: no PING reply from {address} within {:?}",
                config.connect_timeout
            ))
        })??;

        log_info!("redis: connected to {address}");

        Ok(Self {
            address,
            client,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Handle on the shared connection, or [`Error::Closed`] after `close()`.
    fn connection(&self) -> Result<MultiplexedConnection> {
        lock_ignore_poison(&self.conn).clone().ok_or(Error::Closed)
    }
}

async fn ping(conn: &mut MultiplexedConnection) -> Result<()> {
    redis::cmd("PING")
        .query_async::<String>(conn)
        .await
        .map(|_| ())
        .map_err(|err| Error::Connection(format!("redis: PING failed: {err}")))
}

#[async_trait::async_trait]
impl ChannelStore for RedisChannelStore {
    // ---
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        // ---
        let mut conn = self.connection()?;

        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_ref())
            .query_async::<i64>(&mut conn)
            .await
            .map(|_receivers| ())
            .map_err(|err| Error::Backend(format!("redis: publish to {channel} failed: {err}")))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChannelFeed>> {
        // ---
        if lock_ignore_poison(&self.conn).is_none() {
            return Err(Error::Closed);
        }

        let (mut sink, stream) = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| {
                Error::Connection(format!(
                    "redis: failed to open pubsub connection to {}: {err}",
                    self.address
                ))
            })?
            .split();

        sink.subscribe(channel)
            .await
            .map_err(|err| Error::Connection(format!("redis: subscribe to {channel} failed: {err}")))?;

        log_debug!("redis: subscribed to {channel}");

        Ok(Box::new(RedisFeed {
            channel: channel.to_string(),
            sink,
            stream,
        }))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection()?;
        ping(&mut conn).await
    }

    /// Release the shared connection. Clones held by in-flight commands
    /// keep the socket open until they finish.
    async fn close(&self) -> Result<()> {
        if lock_ignore_poison(&self.conn).take().is_some() {
            log_debug!("redis: closed connection to {}", self.address);
        }
        Ok(())
    }
}

struct RedisFeed {
    channel: String,
    sink: PubSubSink,
    stream: PubSubStream,
}

#[async_trait::async_trait]
impl ChannelFeed for RedisFeed {
    // ---
    async fn next_payload(&mut self) -> Option<Bytes> {
        let msg = self.stream.next().await?;
        Some(Bytes::copy_from_slice(msg.get_payload_bytes()))
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.sink
            .unsubscribe(&self.channel)
            .await
            .map_err(|err| Error::Backend(format!("redis: unsubscribe from {} failed: {err}", self.channel)))
    }
}
