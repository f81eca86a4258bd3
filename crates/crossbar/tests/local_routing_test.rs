//! Integration tests for routing within one process.

use crossbar::{
    channel, BindEvent, BindEventKind, Error, Ident, Receiver, RoundRobinPolicy, Router,
    RouterConfig,
};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Ball {
    hit: String,
    count: u32,
}

async fn drain<T: Clone + Send + 'static>(rx: Receiver<T>) -> Vec<T> {
    let mut seen = Vec::new();
    while let Some(v) = rx.recv().await {
        seen.push(v);
    }
    seen
}

#[tokio::test]
async fn test_local_ping_pong() {
    let _ = tracing_subscriber::fmt::try_init();
    let router = Router::new(RouterConfig::named("pingpong"));

    // Pinger sends on "ping" and listens on "pong".
    let (ping_tx, ping_rx) = channel::<Ball>(4);
    let (pong_user_tx, pong_user_rx) = channel::<Ball>(4);
    router
        .attach_send(Ident::str("ping"), ping_rx, None)
        .expect("attach ping sender");
    router
        .attach_recv(Ident::str("pong"), pong_user_tx, None)
        .expect("attach pong receiver");

    // Ponger sends on "pong" and listens on "ping", waiting for the
    // pinger to bind before serving.
    let (pong_tx, pong_rx) = channel::<Ball>(4);
    let (ping_user_tx, ping_user_rx) = channel::<Ball>(4);
    let (bind_tx, bind_rx) = channel::<BindEvent>(1);
    router
        .attach_send(Ident::str("pong"), pong_rx, Some(bind_tx))
        .expect("attach pong sender");
    router
        .attach_recv(Ident::str("ping"), ping_user_tx, None)
        .expect("attach ping receiver");

    let bound = timeout(Duration::from_secs(1), bind_rx.recv())
        .await
        .expect("bind event in time")
        .expect("bind event");
    assert!(bound.count > 0);

    let pinger = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(ball) = pong_user_rx.recv().await {
            seen.push(ball.count);
            if ball.count > 10 {
                break;
            }
            ping_tx
                .send(Ball {
                    hit: "from pinger".to_string(),
                    count: ball.count + 1,
                })
                .await
                .expect("ping send");
        }
        ping_tx.close();
        seen
    });
    let ponger = tokio::spawn(async move {
        pong_tx
            .send(Ball {
                hit: "from ponger".to_string(),
                count: 0,
            })
            .await
            .expect("serve");
        let mut seen = Vec::new();
        while let Some(ball) = ping_user_rx.recv().await {
            seen.push(ball.count);
            if ball.count > 10 {
                break;
            }
            pong_tx
                .send(Ball {
                    hit: "from ponger".to_string(),
                    count: ball.count + 1,
                })
                .await
                .expect("pong send");
        }
        pong_tx.close();
        seen
    });

    let ping_counts = timeout(Duration::from_secs(5), pinger)
        .await
        .expect("pinger finished")
        .expect("pinger join");
    let pong_counts = timeout(Duration::from_secs(5), ponger)
        .await
        .expect("ponger finished")
        .expect("ponger join");

    assert_eq!(ping_counts, vec![0, 2, 4, 6, 8, 10]);
    assert_eq!(pong_counts, vec![1, 3, 5, 7, 9, 11]);
}

#[tokio::test]
async fn test_broadcast_reaches_every_open_receiver() {
    let router = Router::new(RouterConfig::default());
    let (tx, rx) = channel::<u32>(8);
    router
        .attach_send(Ident::str("fanout"), rx, None)
        .expect("attach sender");

    let mut queues = Vec::new();
    for _ in 0..3 {
        let (user_tx, user_rx) = channel::<u32>(16);
        router
            .attach_recv(Ident::str("fanout"), user_tx, None)
            .expect("attach receiver");
        queues.push(user_rx);
    }
    // One consumer walks away; the others must still see everything.
    queues.pop().expect("queue").close();

    for i in 1..=5 {
        tx.send(i).await.expect("send");
    }
    tx.close();

    for rx in queues {
        let got = timeout(Duration::from_secs(2), drain(rx))
            .await
            .expect("drained in time");
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
    }
}

#[tokio::test]
async fn test_round_robin_partitions_messages() {
    let router = Router::new(RouterConfig {
        dispatch_policy: Arc::new(RoundRobinPolicy),
        ..RouterConfig::default()
    });
    let (tx, rx) = channel::<u32>(16);
    router
        .attach_send(Ident::str("work"), rx, None)
        .expect("attach sender");
    let mut queues = Vec::new();
    for _ in 0..3 {
        let (user_tx, user_rx) = channel::<u32>(16);
        router
            .attach_recv(Ident::str("work"), user_tx, None)
            .expect("attach receiver");
        queues.push(user_rx);
    }

    for i in 1..=9 {
        tx.send(i).await.expect("send");
    }
    tx.close();

    let mut all = Vec::new();
    for rx in queues {
        let got = timeout(Duration::from_secs(2), drain(rx))
            .await
            .expect("drained in time");
        assert_eq!(got.len(), 3, "rotation must hand each receiver a third");
        assert!(got.windows(2).all(|w| w[0] < w[1]), "per-receiver order");
        all.extend(got);
    }
    all.sort_unstable();
    assert_eq!(all, (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_fifo_per_identifier() {
    let router = Router::new(RouterConfig::default());
    let (tx, rx) = channel::<u32>(4);
    let (user_tx, user_rx) = channel::<u32>(128);
    router
        .attach_send(Ident::str("seq"), rx, None)
        .expect("attach sender");
    router
        .attach_recv(Ident::str("seq"), user_tx, None)
        .expect("attach receiver");

    let producer = tokio::spawn(async move {
        for i in 0..100 {
            tx.send(i).await.expect("send");
        }
        tx.close();
    });
    let got = timeout(Duration::from_secs(5), drain(user_rx))
        .await
        .expect("drained in time");
    producer.await.expect("producer");
    assert_eq!(got, (0..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_keep_latest_bind_events() {
    let router = Router::new(RouterConfig::default());
    let (tx, rx) = channel::<u32>(4);
    let (bind_tx, bind_rx) = channel::<BindEvent>(1);
    let _keep = tx;
    router
        .attach_send(Ident::str("status"), rx, Some(bind_tx))
        .expect("attach sender");

    for _ in 0..5 {
        let (user_tx, _user_rx) = channel::<u32>(4);
        router
            .attach_recv(Ident::str("status"), user_tx, None)
            .expect("attach receiver");
    }

    // The one-slot queue holds only the most recent transition.
    let last = bind_rx.try_recv().expect("latest bind event");
    assert_eq!(last.kind, BindEventKind::PeerAttach);
    assert_eq!(last.count, 5);
}

#[tokio::test]
async fn test_attach_detach_restores_bindings() {
    let router = Router::new(RouterConfig::default());
    let (tx, rx) = channel::<u32>(4);
    let _keep = tx;
    let sender = router
        .attach_send(Ident::str("tmp"), rx, None)
        .expect("attach sender");
    assert_eq!(sender.num_peers(), 0);

    let (user_tx, _user_rx) = channel::<u32>(4);
    let receiver = router
        .attach_recv(Ident::str("tmp"), user_tx, None)
        .expect("attach receiver");
    assert_eq!(sender.num_peers(), 1);
    assert_eq!(receiver.num_peers(), 1);

    receiver.detach();
    receiver.detach();
    assert_eq!(sender.num_peers(), 0);

    // The slot is free again: the same attachment succeeds afresh.
    let (user_tx, _user_rx) = channel::<u32>(4);
    let receiver = router
        .attach_recv(Ident::str("tmp"), user_tx, None)
        .expect("re-attach receiver");
    assert_eq!(sender.num_peers(), 1);
    receiver.detach();
}

#[tokio::test]
async fn test_end_of_data_emitted_once() {
    let router = Router::new(RouterConfig::default());
    let (user_tx, _user_rx) = channel::<u32>(4);
    let (bind_tx, bind_rx) = channel::<BindEvent>(8);
    router
        .attach_recv(Ident::str("feed"), user_tx, Some(bind_tx))
        .expect("attach receiver");

    let (tx, rx) = channel::<u32>(4);
    let _keep = tx;
    let sender = router
        .attach_send(Ident::str("feed"), rx, None)
        .expect("attach sender");
    sender.detach();

    let mut events = Vec::new();
    while let Ok(event) = bind_rx.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            BindEvent {
                kind: BindEventKind::PeerAttach,
                count: 1
            },
            BindEvent {
                kind: BindEventKind::PeerDetach,
                count: 0
            },
            BindEvent {
                kind: BindEventKind::EndOfData,
                count: 0
            },
        ]
    );
}

#[tokio::test]
async fn test_receiver_queue_closes_when_last_sender_leaves() {
    let router = Router::new(RouterConfig::default());
    let (user_tx, user_rx) = channel::<u32>(4);
    router
        .attach_recv(Ident::str("feed"), user_tx, None)
        .expect("attach receiver");

    let (tx, rx) = channel::<u32>(4);
    router
        .attach_send(Ident::str("feed"), rx, None)
        .expect("attach sender");
    tx.send(7).await.expect("send");
    tx.close();

    // The consumer sees the last value, then end-of-stream.
    let got = timeout(Duration::from_secs(2), drain(user_rx))
        .await
        .expect("closed in time");
    assert_eq!(got, vec![7]);
}

#[tokio::test]
async fn test_duplicate_sender_rejected() {
    let router = Router::new(RouterConfig::default());
    let (tx, rx) = channel::<u64>(4);
    let _keep = tx;
    router
        .attach_send(Ident::str("only-one"), rx, None)
        .expect("first attach");

    let (tx2, rx2) = channel::<u64>(4);
    let _keep2 = tx2;
    match router.attach_send(Ident::str("only-one"), rx2, None) {
        Err(Error::DuplicateId(_)) => {}
        other => panic!("expected DuplicateId, got {other:?}"),
    }
}

#[tokio::test]
async fn test_element_type_mismatch_rejected() {
    let router = Router::new(RouterConfig::default());
    let (tx, rx) = channel::<u64>(4);
    let _keep = tx;
    router
        .attach_send(Ident::str("mixed"), rx, None)
        .expect("attach sender");

    let (user_tx, _user_rx) = channel::<String>(4);
    match router.attach_recv(Ident::str("mixed"), user_tx, None) {
        Err(Error::TypeMismatch { .. }) => {}
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_scope_must_agree_for_binding() {
    use crossbar::Scope;

    let router = Router::new(RouterConfig::default());
    let (tx, rx) = channel::<u32>(4);
    let _keep = tx;
    let sender = router
        .attach_send(Ident::str("scoped").with_scope(Scope::Local), rx, None)
        .expect("attach sender");

    let (user_tx, _user_rx) = channel::<u32>(4);
    router
        .attach_recv(Ident::str("scoped"), user_tx, None)
        .expect("attach global receiver");
    assert_eq!(sender.num_peers(), 0, "global receiver must not bind local sender");

    let (user_tx, _user_rx) = channel::<u32>(4);
    router
        .attach_recv(Ident::str("scoped").with_scope(Scope::Local), user_tx, None)
        .expect("attach local receiver");
    assert_eq!(sender.num_peers(), 1);
}
