//! Bounded FIFO queues and their type-erased capability.
//!
//! Queues are the only rendezvous between producers, dispatchers, and
//! consumers. The typed [`Sender`]/[`Receiver`] pair is the user surface;
//! the routing core sees queues only through the erased [`MsgSink`] and
//! [`MsgSource`] capabilities, moving [`MsgValue`]s.
//!
//! Unlike the underlying flume channel, close is explicit and shared: every
//! handle routes sends through one revocable slot, so closing any handle
//! stops all producers while the consumer drains what remains.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// A type-erased message. One dispatched value may be shared by several
/// receiver queues; the typed edge clones it out of the `Arc`.
pub type MsgValue = Arc<dyn Any + Send + Sync>;

/// Reported capacity of a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capacity {
    /// Bounded queue.
    Bounded(usize),
    /// Queue with unlimited buffering.
    Unbounded,
}

/// Error returned by [`Sender::try_send`], handing the value back.
#[derive(Debug)]
pub enum TrySendError<T> {
    /// The queue is full.
    Full(T),
    /// The queue is closed.
    Closed(T),
}

/// Error returned by [`Receiver::try_recv`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryRecvError {
    /// The queue is empty but still open.
    Empty,
    /// The queue is closed and drained.
    Closed,
}

struct ChannelCore<T> {
    tx: RwLock<Option<flume::Sender<T>>>,
    rx: flume::Receiver<T>,
    capacity: Option<usize>,
}

impl<T> ChannelCore<T> {
    fn sender(&self) -> Option<flume::Sender<T>> {
        self.tx.read().clone()
    }

    fn close(&self) {
        self.tx.write().take();
    }

    fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }

    fn capacity(&self) -> Capacity {
        match self.capacity {
            Some(n) => Capacity::Bounded(n),
            None => Capacity::Unbounded,
        }
    }
}

/// Create a bounded queue of the given capacity.
pub fn channel<T: Send + 'static>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = flume::bounded(capacity);
    let core = Arc::new(ChannelCore {
        tx: RwLock::new(Some(tx)),
        rx,
        capacity: Some(capacity),
    });
    (Sender { core: core.clone() }, Receiver { core })
}

/// Create a queue with unlimited buffering.
pub fn unbounded<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = flume::unbounded();
    let core = Arc::new(ChannelCore {
        tx: RwLock::new(Some(tx)),
        rx,
        capacity: None,
    });
    (Sender { core: core.clone() }, Receiver { core })
}

/// Producing end of a queue.
pub struct Sender<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> Sender<T> {
    /// Send a value, suspending while the queue is full.
    pub async fn send(&self, value: T) -> Result<()> {
        let Some(tx) = self.core.sender() else {
            return Err(Error::ClosedChannel);
        };
        tx.send_async(value)
            .await
            .map_err(|_| Error::ClosedChannel)
    }

    /// Send a value without suspending.
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>> {
        let Some(tx) = self.core.sender() else {
            return Err(TrySendError::Closed(value));
        };
        match tx.try_send(value) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(v)) => Err(TrySendError::Full(v)),
            Err(flume::TrySendError::Disconnected(v)) => Err(TrySendError::Closed(v)),
        }
    }

    /// Send in keep-latest mode: when the queue is full, drop the oldest
    /// pending value to make room. Never suspends. A rendezvous queue holds
    /// nothing, so the value is dropped outright there.
    pub fn send_latest(&self, value: T) {
        if self.core.capacity == Some(0) {
            return;
        }
        let mut value = value;
        loop {
            match self.try_send(value) {
                Ok(()) | Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(v)) => {
                    let _ = self.core.rx.try_recv();
                    value = v;
                }
            }
        }
    }

    /// Close the queue. Pending values stay receivable; further sends from
    /// any handle fail. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Number of values currently queued.
    pub fn len(&self) -> usize {
        self.core.rx.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.core.rx.is_empty()
    }

    /// The queue capacity.
    pub fn capacity(&self) -> Capacity {
        self.core.capacity()
    }
}

/// Consuming end of a queue.
pub struct Receiver<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Receive the next value, suspending while the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.core.rx.recv_async().await.ok()
    }

    /// Receive without suspending.
    pub fn try_recv(&self) -> std::result::Result<T, TryRecvError> {
        match self.core.rx.try_recv() {
            Ok(v) => Ok(v),
            Err(flume::TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(flume::TryRecvError::Disconnected) => Err(TryRecvError::Closed),
        }
    }

    /// Close the queue from the consuming side. Producers observe the close
    /// on their next send. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Number of values currently queued.
    pub fn len(&self) -> usize {
        self.core.rx.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.core.rx.is_empty()
    }

    /// The queue capacity.
    pub fn capacity(&self) -> Capacity {
        self.core.capacity()
    }
}

/// Error from an erased sink send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SinkError {
    /// The queue is closed.
    Closed,
    /// The value does not carry this queue's element type.
    Type,
}

/// Error from an erased non-suspending sink send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TrySinkError {
    /// The queue is full.
    Full,
    /// The queue is closed.
    Closed,
    /// The value does not carry this queue's element type.
    Type,
}

/// The sending capability the routing core holds on a queue.
#[async_trait]
pub(crate) trait MsgSink: Send + Sync {
    /// Send, suspending while full.
    async fn send(&self, value: MsgValue) -> std::result::Result<(), SinkError>;

    /// Send without suspending.
    fn try_send(&self, value: MsgValue) -> std::result::Result<(), TrySinkError>;

    /// Discard the oldest queued value, if any.
    fn drop_oldest(&self);

    /// Close the queue.
    fn close(&self);

    /// Whether the queue has been closed.
    fn is_closed(&self) -> bool;

    /// Number of values currently queued.
    fn len(&self) -> usize;

    /// The queue capacity.
    fn capacity(&self) -> Capacity;
}

/// The receiving capability the routing core holds on a queue.
#[async_trait]
pub(crate) trait MsgSource: Send {
    /// Receive the next value; `None` once closed and drained.
    async fn recv(&mut self) -> Option<MsgValue>;

    /// Receive without suspending.
    fn try_recv(&mut self) -> std::result::Result<MsgValue, TryRecvError>;
}

/// Erased sink over a typed queue; clones the value out of the `Arc`.
pub(crate) struct TypedSink<T> {
    sender: Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> TypedSink<T> {
    pub(crate) fn new(sender: Sender<T>) -> Self {
        Self { sender }
    }

    fn downcast(&self, value: &MsgValue) -> Option<T> {
        value.downcast_ref::<T>().cloned()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MsgSink for TypedSink<T> {
    async fn send(&self, value: MsgValue) -> std::result::Result<(), SinkError> {
        let Some(value) = self.downcast(&value) else {
            return Err(SinkError::Type);
        };
        self.sender.send(value).await.map_err(|_| SinkError::Closed)
    }

    fn try_send(&self, value: MsgValue) -> std::result::Result<(), TrySinkError> {
        let Some(value) = self.downcast(&value) else {
            return Err(TrySinkError::Type);
        };
        match self.sender.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TrySinkError::Full),
            Err(TrySendError::Closed(_)) => Err(TrySinkError::Closed),
        }
    }

    fn drop_oldest(&self) {
        let _ = self.sender.core.rx.try_recv();
    }

    fn close(&self) {
        self.sender.close();
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn len(&self) -> usize {
        self.sender.len()
    }

    fn capacity(&self) -> Capacity {
        self.sender.capacity()
    }
}

/// Erased source over a typed queue.
pub(crate) struct TypedSource<T> {
    receiver: Receiver<T>,
}

impl<T: Send + Sync + 'static> TypedSource<T> {
    pub(crate) fn new(receiver: Receiver<T>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> MsgSource for TypedSource<T> {
    async fn recv(&mut self) -> Option<MsgValue> {
        self.receiver.recv().await.map(|v| Arc::new(v) as MsgValue)
    }

    fn try_recv(&mut self) -> std::result::Result<MsgValue, TryRecvError> {
        self.receiver.try_recv().map(|v| Arc::new(v) as MsgValue)
    }
}

/// Sink over a queue that already carries erased values (proxy stubs).
pub(crate) struct ErasedSink {
    sender: Sender<MsgValue>,
}

impl ErasedSink {
    pub(crate) fn new(sender: Sender<MsgValue>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl MsgSink for ErasedSink {
    async fn send(&self, value: MsgValue) -> std::result::Result<(), SinkError> {
        self.sender.send(value).await.map_err(|_| SinkError::Closed)
    }

    fn try_send(&self, value: MsgValue) -> std::result::Result<(), TrySinkError> {
        match self.sender.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TrySinkError::Full),
            Err(TrySendError::Closed(_)) => Err(TrySinkError::Closed),
        }
    }

    fn drop_oldest(&self) {
        let _ = self.sender.core.rx.try_recv();
    }

    fn close(&self) {
        self.sender.close();
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn len(&self) -> usize {
        self.sender.len()
    }

    fn capacity(&self) -> Capacity {
        self.sender.capacity()
    }
}

/// Source over a queue that already carries erased values (proxy stubs).
pub(crate) struct ErasedSource {
    receiver: Receiver<MsgValue>,
}

impl ErasedSource {
    pub(crate) fn new(receiver: Receiver<MsgValue>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl MsgSource for ErasedSource {
    async fn recv(&mut self) -> Option<MsgValue> {
        self.receiver.recv().await
    }

    fn try_recv(&mut self) -> std::result::Result<MsgValue, TryRecvError> {
        self.receiver.try_recv()
    }
}
