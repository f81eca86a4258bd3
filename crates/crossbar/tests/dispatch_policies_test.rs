//! Integration tests for the non-broadcast dispatch policies.

use crossbar::{
    channel, Ident, KeepLatestPolicy, RandomPolicy, Router, RouterConfig, TimeoutDropPolicy,
    TimeoutEvent, TimeoutReportPolicy, TryRecvError,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

#[tokio::test]
async fn test_timeout_drop_skips_slow_receiver() {
    let router = Router::new(RouterConfig {
        dispatch_policy: Arc::new(TimeoutDropPolicy::new(Duration::from_millis(50))),
        ..RouterConfig::default()
    });
    let (tx, rx) = channel::<u32>(8);
    router
        .attach_send(Ident::str("slow"), rx, None)
        .expect("attach sender");
    let (user_tx, user_rx) = channel::<u32>(1);
    router
        .attach_recv(Ident::str("slow"), user_tx, None)
        .expect("attach receiver");

    for i in 1..=3 {
        tx.send(i).await.expect("send");
    }
    tx.close();
    sleep(Duration::from_millis(500)).await;

    // The receiver never consumed: only the first value fit, the rest
    // timed out and were dropped.
    assert_eq!(user_rx.try_recv(), Ok(1));
    assert!(matches!(
        user_rx.try_recv(),
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed)
    ));
}

#[tokio::test]
async fn test_keep_latest_replaces_oldest() {
    let router = Router::new(RouterConfig {
        dispatch_policy: Arc::new(KeepLatestPolicy::new(Duration::from_millis(50))),
        ..RouterConfig::default()
    });
    let (tx, rx) = channel::<u32>(8);
    router
        .attach_send(Ident::str("latest"), rx, None)
        .expect("attach sender");
    let (user_tx, user_rx) = channel::<u32>(1);
    router
        .attach_recv(Ident::str("latest"), user_tx, None)
        .expect("attach receiver");

    for i in 1..=3 {
        tx.send(i).await.expect("send");
    }
    tx.close();
    sleep(Duration::from_millis(500)).await;

    // Older values were popped to make room; only the newest survives.
    assert_eq!(user_rx.try_recv(), Ok(3));
}

#[tokio::test]
async fn test_timeout_report_publishes_events() {
    let (events_tx, events_rx) = channel::<TimeoutEvent>(4);
    let router = Router::new(RouterConfig {
        dispatch_policy: Arc::new(TimeoutReportPolicy::new(
            Duration::from_millis(50),
            events_tx,
        )),
        ..RouterConfig::default()
    });
    let (tx, rx) = channel::<u32>(8);
    router
        .attach_send(Ident::str("report"), rx, None)
        .expect("attach sender");
    let (user_tx, user_rx) = channel::<u32>(1);
    let _keep = user_rx;
    router
        .attach_recv(Ident::str("report"), user_tx, None)
        .expect("attach receiver");

    tx.send(1).await.expect("send");
    tx.send(2).await.expect("send");
    tx.close();

    let event = timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("timeout event in time")
        .expect("timeout event");
    assert_eq!(event.id, Ident::str("report"));
    assert_eq!(event.value.downcast_ref::<u32>(), Some(&2));
}

#[tokio::test]
async fn test_random_partitions_across_receivers() {
    let router = Router::new(RouterConfig {
        dispatch_policy: Arc::new(RandomPolicy),
        ..RouterConfig::default()
    });
    let (tx, rx) = channel::<u32>(8);
    router
        .attach_send(Ident::str("lottery"), rx, None)
        .expect("attach sender");
    let mut queues = Vec::new();
    for _ in 0..2 {
        let (user_tx, user_rx) = channel::<u32>(32);
        router
            .attach_recv(Ident::str("lottery"), user_tx, None)
            .expect("attach receiver");
        queues.push(user_rx);
    }

    for i in 1..=20 {
        tx.send(i).await.expect("send");
    }
    tx.close();

    let mut all = Vec::new();
    for rx in queues {
        let drained = timeout(Duration::from_secs(2), async {
            let mut seen = Vec::new();
            while let Some(v) = rx.recv().await {
                seen.push(v);
            }
            seen
        })
        .await
        .expect("drained in time");
        all.extend(drained);
    }
    all.sort_unstable();
    assert_eq!(all, (1..=20).collect::<Vec<_>>());
}
