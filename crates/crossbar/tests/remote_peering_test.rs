//! Integration tests for two routers peered over an in-memory byte pair.

use crossbar::{
    channel, BindEvent, BindEventKind, ConnEvent, ConnectOptions, Error, Ident, Membership,
    Receiver, Router, RouterConfig, Scope, SysIdx, WireFormat,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Reading {
    seq: u32,
    label: String,
}

fn reading(seq: u32) -> Reading {
    Reading {
        seq,
        label: format!("reading-{seq}"),
    }
}

fn peered(
    format: WireFormat,
    options: ConnectOptions,
) -> (Router, Router, crossbar::Peer, crossbar::Peer) {
    let alpha = Router::new(RouterConfig::named("alpha"));
    let beta = Router::new(RouterConfig::named("beta"));
    let (alpha_io, beta_io) = tokio::io::duplex(64 * 1024);
    let peer_a = alpha
        .connect_remote(alpha_io, format, options.clone())
        .expect("connect alpha");
    let peer_b = beta
        .connect_remote(beta_io, format, options)
        .expect("connect beta");
    (alpha, beta, peer_a, peer_b)
}

async fn wait_bind(bind_rx: &Receiver<BindEvent>, kind: BindEventKind, count: usize) {
    timeout(Duration::from_secs(3), async {
        loop {
            let event = bind_rx.recv().await.expect("bind queue open");
            if event.kind == kind && event.count == count {
                return;
            }
        }
    })
    .await
    .expect("bind transition in time");
}

#[tokio::test]
async fn test_namespace_mirroring_and_ordered_delivery() {
    let _ = tracing_subscriber::fmt::try_init();
    let (alpha, beta, _pa, _pb) = peered(WireFormat::Cbor, ConnectOptions::default());

    let (tx, rx) = channel::<Reading>(8);
    let (bind_tx, bind_rx) = channel::<BindEvent>(4);
    alpha
        .attach_send(Ident::str("t"), rx, Some(bind_tx))
        .expect("attach sender");

    let (user_tx, user_rx) = channel::<Reading>(32);
    let receiver = beta
        .attach_recv(Ident::str("t"), user_tx, None)
        .expect("attach receiver");

    // The subscription crosses to alpha, which attaches an export stub
    // and binds it to the publisher.
    wait_bind(&bind_rx, BindEventKind::PeerAttach, 1).await;

    for seq in 0..10 {
        tx.send(reading(seq)).await.expect("send");
    }
    for seq in 0..10 {
        let got = timeout(Duration::from_secs(3), user_rx.recv())
            .await
            .expect("value in time")
            .expect("value");
        assert_eq!(got, reading(seq), "per-identifier order crosses the wire");
    }

    // Withdrawing the subscription reaches back across: the publisher
    // observes its last peer leaving.
    receiver.detach();
    wait_bind(&bind_rx, BindEventKind::PeerDetach, 0).await;

    alpha.close();
    beta.close();
}

#[tokio::test]
async fn test_late_publisher_serves_waiting_subscription() {
    let (alpha, beta, _pa, _pb) = peered(WireFormat::Cbor, ConnectOptions::default());

    // Subscribe on beta before alpha publishes anything.
    let (user_tx, user_rx) = channel::<Reading>(8);
    beta.attach_recv(Ident::str("late"), user_tx, None)
        .expect("attach receiver");
    sleep(Duration::from_millis(50)).await;

    let (tx, rx) = channel::<Reading>(8);
    alpha
        .attach_send(Ident::str("late"), rx, None)
        .expect("attach sender");
    tx.send(reading(1)).await.expect("send");

    let got = timeout(Duration::from_secs(3), user_rx.recv())
        .await
        .expect("value in time")
        .expect("value");
    assert_eq!(got, reading(1));

    alpha.close();
    beta.close();
}

#[tokio::test]
async fn test_flow_controlled_stream_is_lossless() {
    let options = ConnectOptions {
        flow_credit: Some(2),
        ..ConnectOptions::default()
    };
    let (alpha, beta, _pa, _pb) = peered(WireFormat::Cbor, options);

    let (tx, rx) = channel::<Reading>(4);
    let (bind_tx, bind_rx) = channel::<BindEvent>(1);
    alpha
        .attach_send(Ident::str("f"), rx, Some(bind_tx))
        .expect("attach sender");
    let (user_tx, user_rx) = channel::<Reading>(4);
    beta.attach_recv(Ident::str("f"), user_tx, None)
        .expect("attach receiver");
    wait_bind(&bind_rx, BindEventKind::PeerAttach, 1).await;

    let producer = tokio::spawn(async move {
        for seq in 0..20 {
            tx.send(reading(seq)).await.expect("send");
        }
        tx.close();
    });

    // A deliberately slow consumer: credit pauses the producer side
    // instead of losing values.
    let mut seen = Vec::new();
    while let Some(got) = timeout(Duration::from_secs(5), user_rx.recv())
        .await
        .expect("value in time")
    {
        seen.push(got.seq);
        sleep(Duration::from_millis(10)).await;
    }
    producer.await.expect("producer");
    assert_eq!(seen, (0..20).collect::<Vec<_>>());

    alpha.close();
    beta.close();
}

#[tokio::test]
async fn test_async_mode_with_json_format() {
    let options = ConnectOptions {
        async_mode: true,
        ..ConnectOptions::default()
    };
    let (alpha, beta, _pa, _pb) = peered(WireFormat::Json, options);

    let (tx, rx) = channel::<Reading>(8);
    let (bind_tx, bind_rx) = channel::<BindEvent>(1);
    alpha
        .attach_send(Ident::str("j"), rx, Some(bind_tx))
        .expect("attach sender");
    let (user_tx, user_rx) = channel::<Reading>(16);
    beta.attach_recv(Ident::str("j"), user_tx, None)
        .expect("attach receiver");
    wait_bind(&bind_rx, BindEventKind::PeerAttach, 1).await;

    for seq in 0..5 {
        tx.send(reading(seq)).await.expect("send");
    }
    for seq in 0..5 {
        let got = timeout(Duration::from_secs(3), user_rx.recv())
            .await
            .expect("value in time")
            .expect("value");
        assert_eq!(got.seq, seq);
    }

    alpha.close();
    beta.close();
}

/// Pipe two duplex ends through relay tasks so the transport can be killed
/// mid-stream from the outside.
fn relayed_transport() -> (DuplexStream, DuplexStream, JoinHandle<()>, JoinHandle<()>) {
    let (alpha_io, alpha_far) = tokio::io::duplex(64 * 1024);
    let (beta_io, beta_far) = tokio::io::duplex(64 * 1024);
    let (mut alpha_read, mut alpha_write) = tokio::io::split(alpha_far);
    let (mut beta_read, mut beta_write) = tokio::io::split(beta_far);
    let forward = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut alpha_read, &mut beta_write).await;
    });
    let backward = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut beta_read, &mut alpha_write).await;
    });
    (alpha_io, beta_io, forward, backward)
}

#[tokio::test]
async fn test_transport_failure_disconnects_both_sides() {
    let _ = tracing_subscriber::fmt::try_init();
    let alpha = Router::new(RouterConfig::named("alpha"));
    let beta = Router::new(RouterConfig::named("beta"));
    let (alpha_io, beta_io, forward, backward) = relayed_transport();
    alpha
        .connect_remote(alpha_io, WireFormat::Cbor, ConnectOptions::default())
        .expect("connect alpha");
    beta.connect_remote(beta_io, WireFormat::Cbor, ConnectOptions::default())
        .expect("connect beta");

    // Watch connection lifecycle on both routers.
    let (alpha_ev_tx, alpha_ev_rx) = channel::<ConnEvent>(8);
    alpha
        .attach_recv(
            Ident::sys(SysIdx::Disconn, Scope::Local, Membership::Local),
            alpha_ev_tx,
            None,
        )
        .expect("subscribe alpha disconn");
    let (beta_ev_tx, beta_ev_rx) = channel::<ConnEvent>(8);
    beta.attach_recv(
        Ident::sys(SysIdx::Disconn, Scope::Local, Membership::Local),
        beta_ev_tx,
        None,
    )
    .expect("subscribe beta disconn");

    let (tx, rx) = channel::<Reading>(8);
    let (bind_tx, bind_rx) = channel::<BindEvent>(4);
    alpha
        .attach_send(Ident::str("x"), rx, Some(bind_tx))
        .expect("attach sender");
    let (user_tx, user_rx) = channel::<Reading>(8);
    beta.attach_recv(Ident::str("x"), user_tx, None)
        .expect("attach receiver");
    wait_bind(&bind_rx, BindEventKind::PeerAttach, 1).await;

    tx.send(reading(0)).await.expect("send");
    let got = timeout(Duration::from_secs(3), user_rx.recv())
        .await
        .expect("value in time")
        .expect("value");
    assert_eq!(got, reading(0));

    // Kill the transport mid-stream.
    forward.abort();
    backward.abort();

    let alpha_event = timeout(Duration::from_secs(3), alpha_ev_rx.recv())
        .await
        .expect("alpha disconn in time")
        .expect("alpha disconn");
    assert_eq!(alpha_event.peer, "beta");
    let beta_event = timeout(Duration::from_secs(3), beta_ev_rx.recv())
        .await
        .expect("beta disconn in time")
        .expect("beta disconn");
    assert_eq!(beta_event.peer, "alpha");

    // The publisher loses its mirrored peer and the subscriber's queue
    // reports end-of-stream.
    wait_bind(&bind_rx, BindEventKind::PeerDetach, 0).await;
    let end = timeout(Duration::from_secs(3), user_rx.recv())
        .await
        .expect("closed in time");
    assert_eq!(end, None);

    // Shutting the router down closes the publisher's queue outright; a
    // subsequent send reports the closed channel.
    alpha.close();
    assert!(matches!(
        tx.send(reading(1)).await,
        Err(Error::ClosedChannel)
    ));
    beta.close();
}

#[tokio::test]
async fn test_router_close_rejects_further_work() {
    let (alpha, beta, _pa, peer_b) = peered(WireFormat::Cbor, ConnectOptions::default());
    alpha.close();

    let (tx, rx) = channel::<Reading>(4);
    let _keep = tx;
    match alpha.attach_send(Ident::str("gone"), rx, None) {
        Err(Error::ClosedChannel) => {}
        other => panic!("expected ClosedChannel, got {other:?}"),
    }

    // The peer learns about the shutdown.
    timeout(Duration::from_secs(3), async {
        while !peer_b.is_closed() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("beta peer closed in time");

    beta.close();
}
