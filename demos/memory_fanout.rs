//! Sensor fan-out example using the in-process broker.
//!
//! One producer streams sensor readings onto a topic; three consumers each
//! receive every reading. Swap the URI for `redis://localhost:6379/0` (with
//! feature `redis`) to run the same flow over Redis.
//!
//! Run with: cargo run --example memory_fanout

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::panic_in_result_fn
)]

use std::time::Duration;

use mom_pubsub::{CancellationToken, Error, PubSubBuilder, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SensorReading {
    sensor: String,
    value: f32,
    unit: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let ctx = CancellationToken::new();
    let pubsub = PubSubBuilder::new()
        .uri("memory://")
        .default_topic("sensors/env")
        .build::<SensorReading>()
        .await?;

    // Subscribe before publishing; earlier messages are not replayed.
    let mut consumers = Vec::new();
    for name in ["dashboard", "archiver", "alerts"] {
        let sub = pubsub.subscribe(&ctx, "").await?;
        let ctx = ctx.clone();

        consumers.push(tokio::spawn(async move {
            let mut received = 0;
            loop {
                match sub.pop(&ctx, Duration::from_millis(200)).await {
                    Ok(envelope) => {
                        let reading = envelope.data();
                        println!("{name:>9}: {} = {} {}", reading.sensor, reading.value, reading.unit);
                        envelope.ack(&ctx).await?;
                        received += 1;
                    }
                    Err(Error::Timeout) => break,
                    Err(err) => return Err(err),
                }
            }
            sub.close().await;
            Ok::<_, Error>((name, received))
        }));
    }

    let (tx, rx) = mpsc::channel(8);
    let publisher = {
        let pubsub = pubsub.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { pubsub.publish(&ctx, "", rx, 1).await })
    };

    for i in 0..5 {
        let reading = SensorReading {
            sensor: "temperature".to_string(),
            value: 21.5 + i as f32 * 0.1,
            unit: "C".to_string(),
        };
        tx.send(reading).await.expect("publisher stopped early");
    }
    drop(tx);

    publisher.await.expect("publisher panicked")?;

    for consumer in consumers {
        let (name, received) = consumer.await.expect("consumer panicked")?;
        println!("{name} received {received} readings");
    }

    // Clean shutdown
    pubsub.close().await?;
    Ok(())
}
