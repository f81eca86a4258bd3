//! Dispatch policies.
//!
//! A policy is a factory producing one dispatcher per sender endpoint; the
//! dispatcher decides, for each value pulled off the sender's queue, which
//! bound receivers' queues it is pushed into. Dispatchers run inside the
//! sender's delivery loop against a snapshot of the binding set, so they
//! iterate without locks.

use crate::channel::{MsgValue, Sender};
use crate::endpoint::Outlet;
use crate::id::Ident;

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

/// Outcome of delivering one value to one receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// The value was queued.
    Delivered,
    /// The receiver's queue is full.
    Full,
    /// The delivery attempt timed out.
    Timeout,
    /// The receiver's queue is closed.
    Closed,
}

/// Factory producing a fresh dispatcher per sender endpoint.
pub trait DispatchPolicy: Send + Sync {
    /// Create a dispatcher instance.
    fn new_dispatcher(&self) -> Box<dyn Dispatcher>;
}

/// Per-sender dispatch state.
#[async_trait]
pub trait Dispatcher: Send {
    /// Deliver one value to the bound receivers.
    async fn dispatch(&mut self, value: MsgValue, receivers: &[Outlet]);
}

/// Deliver to every receiver whose queue is open. A failure on one
/// receiver does not abort the others.
#[derive(Clone, Copy, Debug, Default)]
pub struct BroadcastPolicy;

impl DispatchPolicy for BroadcastPolicy {
    fn new_dispatcher(&self) -> Box<dyn Dispatcher> {
        Box::new(Broadcast)
    }
}

struct Broadcast;

#[async_trait]
impl Dispatcher for Broadcast {
    async fn dispatch(&mut self, value: MsgValue, receivers: &[Outlet]) {
        for rc in receivers {
            if !rc.is_closed() {
                let _ = rc.deliver(value.clone()).await;
            }
        }
    }
}

/// Deliver each value to one receiver, rotating through the binding set.
/// Closed receivers are skipped; after one full revolution without an open
/// receiver the value is dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobinPolicy;

impl DispatchPolicy for RoundRobinPolicy {
    fn new_dispatcher(&self) -> Box<dyn Dispatcher> {
        Box::new(RoundRobin { next: 0 })
    }
}

struct RoundRobin {
    next: usize,
}

#[async_trait]
impl Dispatcher for RoundRobin {
    async fn dispatch(&mut self, value: MsgValue, receivers: &[Outlet]) {
        if receivers.is_empty() {
            return;
        }
        self.next %= receivers.len();
        let start = self.next;
        loop {
            let rc = &receivers[self.next];
            self.next = (self.next + 1) % receivers.len();
            if !rc.is_closed() && rc.deliver(value.clone()).await == DeliverOutcome::Delivered {
                return;
            }
            if self.next == start {
                return;
            }
        }
    }
}

/// Deliver each value to one open receiver chosen uniformly at random;
/// drop the value when none is open.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomPolicy;

impl DispatchPolicy for RandomPolicy {
    fn new_dispatcher(&self) -> Box<dyn Dispatcher> {
        Box::new(Random)
    }
}

struct Random;

#[async_trait]
impl Dispatcher for Random {
    async fn dispatch(&mut self, value: MsgValue, receivers: &[Outlet]) {
        let open: Vec<&Outlet> = receivers.iter().filter(|rc| !rc.is_closed()).collect();
        if open.is_empty() {
            return;
        }
        let pick = rand::thread_rng().gen_range(0..open.len());
        let _ = open[pick].deliver(value.clone()).await;
    }
}

/// Broadcast with a per-receiver delivery timeout; a receiver that does not
/// accept in time is skipped for this value.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutDropPolicy {
    timeout: Duration,
}

impl TimeoutDropPolicy {
    /// Policy with the given per-receiver timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DispatchPolicy for TimeoutDropPolicy {
    fn new_dispatcher(&self) -> Box<dyn Dispatcher> {
        Box::new(TimeoutBroadcast {
            timeout: self.timeout,
            on_timeout: OnTimeout::Drop,
        })
    }
}

/// A delivery that timed out under [`TimeoutReportPolicy`].
#[derive(Clone)]
pub struct TimeoutEvent {
    /// When the timeout fired.
    pub at: Instant,
    /// The identifier of the receiver that did not accept in time.
    pub id: Ident,
    /// The value that could not be delivered.
    pub value: MsgValue,
}

impl fmt::Debug for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutEvent")
            .field("at", &self.at)
            .field("id", &self.id)
            .finish()
    }
}

/// Like [`TimeoutDropPolicy`], but each timeout publishes a
/// [`TimeoutEvent`] into the given queue in keep-latest mode, so a lazy
/// listener never stalls dispatch.
pub struct TimeoutReportPolicy {
    timeout: Duration,
    events: Sender<TimeoutEvent>,
}

impl TimeoutReportPolicy {
    /// Policy reporting timeouts into `events`.
    pub fn new(timeout: Duration, events: Sender<TimeoutEvent>) -> Self {
        Self { timeout, events }
    }
}

impl DispatchPolicy for TimeoutReportPolicy {
    fn new_dispatcher(&self) -> Box<dyn Dispatcher> {
        Box::new(TimeoutBroadcast {
            timeout: self.timeout,
            on_timeout: OnTimeout::Report(self.events.clone()),
        })
    }
}

enum OnTimeout {
    Drop,
    Report(Sender<TimeoutEvent>),
}

struct TimeoutBroadcast {
    timeout: Duration,
    on_timeout: OnTimeout,
}

#[async_trait]
impl Dispatcher for TimeoutBroadcast {
    async fn dispatch(&mut self, value: MsgValue, receivers: &[Outlet]) {
        for rc in receivers {
            if rc.is_closed() {
                continue;
            }
            let outcome = rc.deliver_timeout(value.clone(), self.timeout).await;
            if outcome == DeliverOutcome::Timeout {
                if let OnTimeout::Report(events) = &self.on_timeout {
                    events.send_latest(TimeoutEvent {
                        at: Instant::now(),
                        id: rc.id().clone(),
                        value: value.clone(),
                    });
                }
            }
        }
    }
}

/// Broadcast variant for slow receivers: when delivery to a receiver times
/// out, the oldest value is popped from its queue to make room and the
/// delivery is retried, so the receiver always holds the latest values.
#[derive(Clone, Copy, Debug)]
pub struct KeepLatestPolicy {
    timeout: Duration,
}

impl KeepLatestPolicy {
    /// Policy with the given per-receiver timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DispatchPolicy for KeepLatestPolicy {
    fn new_dispatcher(&self) -> Box<dyn Dispatcher> {
        Box::new(KeepLatest {
            timeout: self.timeout,
        })
    }
}

struct KeepLatest {
    timeout: Duration,
}

#[async_trait]
impl Dispatcher for KeepLatest {
    async fn dispatch(&mut self, value: MsgValue, receivers: &[Outlet]) {
        for rc in receivers {
            if rc.is_closed() {
                continue;
            }
            if rc.deliver_timeout(value.clone(), self.timeout).await != DeliverOutcome::Timeout {
                continue;
            }
            loop {
                match rc.try_deliver(value.clone()) {
                    DeliverOutcome::Full => rc.drop_oldest(),
                    _ => break,
                }
            }
        }
    }
}
