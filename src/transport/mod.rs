//! Backend implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `PubSub` trait. External client libraries are hidden behind feature
//! flags and reached only through the capability traits of the channel and
//! cloud adapters.
//!
//! Domain code must not depend on backend-specific types.

mod channel;
mod cloud;
mod memory;
mod pool;
mod tasks;

pub use memory::{create_memory_pubsub, InMemoryPubSub};

pub use channel::{ChannelFeed, ChannelPubSub, ChannelStore, ChannelStorePtr};

pub use cloud::{CloudClient, CloudClientPtr, CloudDelivery, CloudPubSub};

pub use channel::create_redis_pubsub;

pub use cloud::create_gcp_pubsub;

#[cfg(feature = "redis")]
pub use channel::RedisChannelStore;

#[cfg(feature = "gcp")]
pub use cloud::GcpCloudClient;
