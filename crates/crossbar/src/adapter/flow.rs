//! Credit-window flow control.
//!
//! A [`FlowSender`]/[`FlowReceiver`] pair implements a simple window
//! protocol for lossless transports: each send consumes one credit, each
//! delivered value returns one through the receiver's ack callback. Credit
//! never exceeds the window the sender was created with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::channel::{Capacity, MsgSink, MsgSource, MsgValue, SinkError, TryRecvError, TrySinkError};
use crate::error::{Error, Result};

struct Window {
    credit: usize,
    cap: usize,
}

/// Sending half of a flow-controlled pair.
///
/// Several flow senders may share one wrapped sink (every export stub of a
/// connection funnels into the same merged queue), so closing a flow
/// sender severs only its own window, never the sink underneath.
pub(crate) struct FlowSender {
    inner: Arc<dyn MsgSink>,
    window: Mutex<Window>,
    available: Notify,
    closed: AtomicBool,
}

impl FlowSender {
    /// Wrap a sink with a credit window.
    ///
    /// Fails with [`Error::InvalidCredit`] for an empty window and with
    /// [`Error::InsufficientBuffer`] when the wrapped queue cannot buffer a
    /// full window.
    pub(crate) fn new(inner: Arc<dyn MsgSink>, credit: usize) -> Result<Arc<Self>> {
        if credit == 0 {
            return Err(Error::InvalidCredit(credit));
        }
        if let Capacity::Bounded(capacity) = inner.capacity() {
            if capacity < credit {
                return Err(Error::InsufficientBuffer { credit, capacity });
            }
        }
        Ok(Arc::new(Self {
            inner,
            window: Mutex::new(Window {
                credit,
                cap: credit,
            }),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Return `n` credits, clamped at the window capacity, and wake a
    /// suspended send. `notify_one` stores a permit, so a send racing
    /// between its credit check and its wait still observes the ack.
    pub(crate) fn ack(&self, n: usize) {
        let mut w = self.window.lock();
        w.credit = (w.credit + n).min(w.cap);
        let available = w.credit > 0;
        drop(w);
        if available {
            self.available.notify_one();
        }
    }

    fn take_credit(&self) -> bool {
        let mut w = self.window.lock();
        if w.credit == 0 {
            return false;
        }
        w.credit -= 1;
        true
    }
}

#[async_trait]
impl MsgSink for FlowSender {
    async fn send(&self, value: MsgValue) -> std::result::Result<(), SinkError> {
        loop {
            if self.is_closed() {
                // Cascade the wake-up so every suspended send observes
                // the close.
                self.available.notify_one();
                return Err(SinkError::Closed);
            }
            if self.take_credit() {
                break;
            }
            self.available.notified().await;
        }
        // Pass the baton when credit remains for another suspended send.
        if self.window.lock().credit > 0 {
            self.available.notify_one();
        }
        self.inner.send(value).await
    }

    fn try_send(&self, value: MsgValue) -> std::result::Result<(), TrySinkError> {
        if self.is_closed() {
            return Err(TrySinkError::Closed);
        }
        if !self.take_credit() {
            return Err(TrySinkError::Full);
        }
        self.inner.try_send(value)
    }

    fn drop_oldest(&self) {
        self.inner.drop_oldest();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Wake suspended senders so they observe the close.
        self.available.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.inner.is_closed()
    }

    /// Consumed credit, i.e. values in flight towards the peer.
    fn len(&self) -> usize {
        let w = self.window.lock();
        w.cap - w.credit
    }

    /// The window itself.
    fn capacity(&self) -> Capacity {
        Capacity::Bounded(self.window.lock().cap)
    }
}

/// Receiving half of a flow-controlled pair: every delivered value invokes
/// the injected ack with one credit. Order-preserving.
pub(crate) struct FlowReceiver {
    inner: Box<dyn MsgSource>,
    ack: Arc<dyn Fn(usize) + Send + Sync>,
}

impl FlowReceiver {
    pub(crate) fn new(inner: Box<dyn MsgSource>, ack: Arc<dyn Fn(usize) + Send + Sync>) -> Self {
        Self { inner, ack }
    }
}

#[async_trait]
impl MsgSource for FlowReceiver {
    async fn recv(&mut self) -> Option<MsgValue> {
        let value = self.inner.recv().await;
        if value.is_some() {
            (self.ack)(1);
        }
        value
    }

    fn try_recv(&mut self) -> std::result::Result<MsgValue, TryRecvError> {
        let value = self.inner.try_recv();
        if value.is_ok() {
            (self.ack)(1);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, TypedSink, TypedSource};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;

    fn flow_pair(queue_cap: usize, credit: usize) -> Result<(Arc<FlowSender>, crate::channel::Receiver<u32>)> {
        let (tx, rx) = channel::<u32>(queue_cap);
        let sender = FlowSender::new(Arc::new(TypedSink::new(tx)), credit)?;
        Ok((sender, rx))
    }

    #[tokio::test]
    async fn test_rejects_zero_credit() {
        assert!(matches!(flow_pair(4, 0), Err(Error::InvalidCredit(0))));
    }

    #[tokio::test]
    async fn test_rejects_undersized_queue() {
        assert!(matches!(
            flow_pair(2, 4),
            Err(Error::InsufficientBuffer {
                credit: 4,
                capacity: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_window_exhaustion_and_ack() {
        let (sender, rx) = flow_pair(2, 2).expect("flow pair");
        sender.try_send(Arc::new(1_u32)).expect("first");
        sender.try_send(Arc::new(2_u32)).expect("second");
        assert_eq!(sender.try_send(Arc::new(3_u32)), Err(TrySinkError::Full));
        assert_eq!(sender.len(), 2);

        // A suspended send completes once one credit comes back.
        let pending = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(Arc::new(3_u32)).await })
        };
        assert_eq!(rx.recv().await, Some(1));
        sender.ack(1);
        timeout(Duration::from_secs(1), pending)
            .await
            .expect("unblocked in time")
            .expect("join")
            .expect("send");
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_five_sends_against_credit_two() {
        let (sender, rx) = flow_pair(4, 2).expect("flow pair");
        let mut pending = Vec::new();
        for i in 0..5_u32 {
            let sender = sender.clone();
            pending.push(tokio::spawn(
                async move { sender.send(Arc::new(i)).await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Two sends hold the window; three are suspended.
        assert_eq!(rx.len(), 2);

        let _ = rx.recv().await;
        sender.ack(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Exactly one suspended send went through.
        assert_eq!(rx.len(), 2);

        for _ in 0..2 {
            let _ = rx.recv().await;
            sender.ack(1);
        }
        for handle in pending {
            timeout(Duration::from_secs(1), handle)
                .await
                .expect("send finished")
                .expect("join")
                .expect("send");
        }
    }

    #[tokio::test]
    async fn test_ack_clamps_at_window() {
        let (sender, _rx) = flow_pair(8, 2).expect("flow pair");
        sender.ack(100);
        sender.try_send(Arc::new(1_u32)).expect("one");
        sender.try_send(Arc::new(2_u32)).expect("two");
        assert_eq!(sender.try_send(Arc::new(3_u32)), Err(TrySinkError::Full));
    }

    #[tokio::test]
    async fn test_receiver_acks_each_value() {
        let (tx, rx) = channel::<u32>(4);
        for i in 0..3_u32 {
            tx.send(i).await.expect("send");
        }
        tx.close();
        let acked = Arc::new(AtomicUsize::new(0));
        let counter = acked.clone();
        let mut source = FlowReceiver::new(
            Box::new(TypedSource::new(rx)),
            Arc::new(move |n| {
                counter.fetch_add(n, Ordering::SeqCst);
            }),
        );
        for i in 0..3_u32 {
            let v = source.recv().await.expect("value");
            assert_eq!(v.downcast_ref::<u32>(), Some(&i));
        }
        assert!(source.recv().await.is_none());
        assert_eq!(acked.load(Ordering::SeqCst), 3);
    }
}
