// tests/memory_pubsub.rs

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use mom_pubsub::{
    // ---
    CancellationToken,
    Error,
    InMemoryPubSub,
    MAILBOX_CAPACITY,
    PubSub,
    PubSubBuilder,
    Publisher,
    Subscriber,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct TestMessage {
    content: String,
}

fn msg(content: impl Into<String>) -> TestMessage {
    TestMessage {
        content: content.into(),
    }
}

/// Producer channel pre-filled with `messages` and already closed.
async fn producer(messages: Vec<TestMessage>) -> mpsc::Receiver<TestMessage> {
    let (tx, rx) = mpsc::channel(messages.len().max(1));
    for m in messages {
        tx.send(m).await.expect("producer channel closed");
    }
    rx
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn single_subscriber_receives_in_publish_order() {
    // ---
    // Arrange
    // ---
    init_logging();
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();

    let sub = broker.subscribe(&ctx, "test-topic").await.expect("subscribe failed");

    let messages: Vec<_> = (1..=5).map(|i| msg(format!("Message {i}"))).collect();
    let input = producer(messages.clone()).await;

    // ---
    // Act
    // ---
    broker.publish(&ctx, "test-topic", input, 1).await.expect("publish failed");

    // ---
    // Assert
    // ---
    for expected in &messages {
        let envelope = timeout(Duration::from_secs(1), sub.bpop(&ctx))
            .await
            .expect("timed out waiting for message")
            .expect("bpop failed");
        assert_eq!(envelope.data(), expected);
        envelope.ack(&ctx).await.expect("ack failed");
    }
}

#[tokio::test]
async fn every_subscriber_receives_every_message_in_order() {
    // ---
    // Arrange
    // ---
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();

    let mut subs = Vec::new();
    for _ in 0..3 {
        subs.push(
            broker
                .subscribe(&ctx, "multi-subscriber-topic")
                .await
                .expect("subscribe failed"),
        );
    }

    let messages: Vec<_> = (1..=10).map(|i| msg(format!("Msg {i}"))).collect();
    let input = producer(messages.clone()).await;

    // ---
    // Act
    // ---
    broker
        .publish(&ctx, "multi-subscriber-topic", input, 1)
        .await
        .expect("publish failed");

    // ---
    // Assert
    // ---
    for sub in &subs {
        for expected in &messages {
            let envelope = sub
                .pop(&ctx, Duration::from_secs(1))
                .await
                .expect("pop failed");
            assert_eq!(envelope.into_data(), *expected);
        }
    }
}

#[tokio::test]
async fn subscribe_after_close_fails_without_hanging() {
    // ---
    // Arrange
    // ---
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();
    let _sub = broker.subscribe(&ctx, "closing-topic").await.expect("subscribe failed");

    // ---
    // Act
    // ---
    broker.close().await.expect("close failed");

    let result = timeout(Duration::from_secs(1), broker.subscribe(&ctx, "closing-topic"))
        .await
        .expect("subscribe hung after close");

    // ---
    // Assert
    // ---
    assert!(matches!(result, Err(Error::Closed)));
    assert_eq!(broker.subscriber_count("closing-topic"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_lose_nothing() {
    // ---
    // Arrange
    // ---
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();
    let sub = broker.subscribe(&ctx, "fan-in").await.expect("subscribe failed");

    let (tx, rx) = mpsc::channel(16);
    let feeder = tokio::spawn(async move {
        for i in 0..100 {
            tx.send(msg(format!("m{i}"))).await.expect("producer channel closed");
        }
    });

    // ---
    // Act
    // ---
    let publisher = {
        let broker = broker.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { broker.publish(&ctx, "fan-in", rx, 10).await })
    };

    let mut seen = HashSet::new();
    for _ in 0..100 {
        let envelope = sub
            .pop(&ctx, Duration::from_secs(2))
            .await
            .expect("message lost under concurrent publish");
        seen.insert(envelope.into_data());
    }

    // ---
    // Assert
    // ---
    feeder.await.expect("feeder panicked");
    publisher.await.expect("publisher panicked").expect("publish failed");
    assert_eq!(seen.len(), 100);
    assert!(matches!(
        sub.pop(&ctx, Duration::from_millis(50)).await,
        Err(Error::Timeout)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_concurrent_close_is_safe() {
    // ---
    // Arrange
    // ---
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();
    let sub = Arc::new(broker.subscribe(&ctx, "t").await.expect("subscribe failed"));

    broker
        .publish(&ctx, "t", producer(vec![msg("buffered")]).await, 1)
        .await
        .expect("publish failed");

    // ---
    // Act
    // ---
    let mut closers = Vec::new();
    for _ in 0..4 {
        let sub = sub.clone();
        closers.push(tokio::spawn(async move { sub.close().await }));
    }
    for _ in 0..4 {
        let broker = broker.clone();
        closers.push(tokio::spawn(async move {
            broker.close().await.expect("broker close failed");
        }));
    }
    for closer in closers {
        closer.await.expect("close panicked");
    }

    // ---
    // Assert
    // ---
    assert!(sub.is_closed());
    assert_eq!(sub.bpop(&ctx).await.expect("buffered message lost").data().content, "buffered");
    assert!(matches!(sub.bpop(&ctx).await, Err(Error::SubscriptionClosed)));
}

#[tokio::test]
async fn close_waits_for_in_flight_dispatch() {
    // ---
    // Arrange
    // ---
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();
    let sub = Arc::new(broker.subscribe(&ctx, "t").await.expect("subscribe failed"));

    // One more than the mailbox holds, so the single worker blocks mid fan-out.
    let total = MAILBOX_CAPACITY + 1;
    let messages = (0..total).map(|i| msg(format!("m{i}"))).collect();
    let input = producer(messages).await;

    let publisher = {
        let broker = broker.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { broker.publish(&ctx, "t", input, 1).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // ---
    // Act
    // ---
    let mut closer = {
        let sub = sub.clone();
        tokio::spawn(async move { sub.close().await })
    };

    // ---
    // Assert
    // ---
    assert!(
        timeout(Duration::from_millis(100), &mut closer).await.is_err(),
        "close finished while a dispatch to it was still in flight"
    );
    assert!(!sub.is_closed());

    // Freeing one slot lets the blocked dispatch finish, which releases close.
    let first = sub.bpop(&ctx).await.expect("first message lost");
    assert_eq!(first.data().content, "m0");

    timeout(Duration::from_secs(1), closer)
        .await
        .expect("close stayed blocked after dispatch finished")
        .expect("close panicked");
    timeout(Duration::from_secs(1), publisher)
        .await
        .expect("publish stayed blocked")
        .expect("publish panicked")
        .expect("publish failed");

    let mut received = 1;
    loop {
        match sub.bpop(&ctx).await {
            Ok(_) => received += 1,
            Err(Error::SubscriptionClosed) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(received, total);
    assert!(sub.is_closed());
    assert!(matches!(sub.bpop(&ctx).await, Err(Error::SubscriptionClosed)));
}

#[tokio::test]
async fn bpop_honours_cancelled_context() {
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();
    let sub = broker.subscribe(&ctx, "idle").await.expect("subscribe failed");

    let cancelled = CancellationToken::new();
    cancelled.cancel();

    let result = timeout(Duration::from_millis(100), sub.bpop(&cancelled))
        .await
        .expect("bpop blocked on a cancelled context");
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn pop_times_out_on_idle_topic() {
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();
    let sub = broker.subscribe(&ctx, "idle").await.expect("subscribe failed");

    let result = sub.pop(&ctx, Duration::from_millis(250)).await;
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn publish_after_close_is_rejected() {
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();
    broker.close().await.expect("close failed");

    let result = broker
        .publish(&ctx, "t", producer(vec![msg("late")]).await, 1)
        .await;
    assert!(matches!(result, Err(Error::Closed)));
    assert_eq!(broker.topic_count(), 0);
}

#[tokio::test]
async fn messages_before_subscribe_are_not_delivered() {
    let ctx = CancellationToken::new();
    let broker = InMemoryPubSub::<TestMessage>::new();

    broker
        .publish(&ctx, "late", producer(vec![msg("early")]).await, 1)
        .await
        .expect("publish failed");

    let sub = broker.subscribe(&ctx, "late").await.expect("subscribe failed");
    broker
        .publish(&ctx, "late", producer(vec![msg("on time")]).await, 1)
        .await
        .expect("publish failed");

    let envelope = sub.pop(&ctx, Duration::from_secs(1)).await.expect("pop failed");
    assert_eq!(envelope.data().content, "on time");
}

#[tokio::test]
async fn builder_memory_broker_through_trait_object() {
    let ctx = CancellationToken::new();
    let pubsub = PubSubBuilder::new()
        .uri("memory://")
        .build::<TestMessage>()
        .await
        .expect("build failed");

    let sub = pubsub.subscribe(&ctx, "dyn").await.expect("subscribe failed");

    let publisher = {
        let pubsub = pubsub.clone();
        let ctx = ctx.clone();
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move { pubsub.publish(&ctx, "dyn", rx, 0).await });
        tx.send(msg("streamed")).await.expect("producer channel closed");
        drop(tx);
        handle
    };

    let envelope = sub.pop(&ctx, Duration::from_secs(1)).await.expect("pop failed");
    assert_eq!(envelope.data().content, "streamed");
    assert!(!envelope.redelivers());

    publisher.await.expect("publisher panicked").expect("publish failed");
    pubsub.close().await.expect("close failed");
}
