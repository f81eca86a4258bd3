//! Attached endpoints and the per-sender delivery loop.
//!
//! An endpoint joins a user queue to the router under one identifier.
//! Sender and receiver endpoints reference each other through binding
//! sets; neither owns the other — the routing table does. Each sender
//! endpoint runs one delivery task that fans values out to the bound
//! receivers through the dispatcher.
//!
//! Locking: every endpoint has a dispatch lock (in-dispatch flag plus the
//! deferred operation buffer) and a binding lock (binding set, bind-event
//! queue), acquired in that order and never held across a suspension
//! point. While a dispatch call is in flight, attach/detach requests are
//! buffered and applied after it returns, so dispatchers iterate a stable
//! snapshot without per-element locks.

use crate::channel::{MsgSink, MsgSource, MsgValue, Sender, SinkError, TrySinkError};
use crate::codec::TypeDescriptor;
use crate::dispatch::{DeliverOutcome, Dispatcher};
use crate::id::Ident;
use crate::router::RouterCore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Direction of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// The endpoint feeds values into the router.
    Sender,
    /// The endpoint receives values from the router.
    Receiver,
}

/// Kind of a [`BindEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindEventKind {
    /// A peer endpoint was bound.
    PeerAttach,
    /// A peer endpoint was unbound.
    PeerDetach,
    /// A receiver endpoint lost its last sender; no further data will
    /// arrive unless a new sender binds.
    EndOfData,
}

/// Status event emitted on an endpoint's bind-event queue. Bind events are
/// status, not a log: they are sent in keep-latest mode, so a slow listener
/// observes the most recent state and may miss intermediate counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindEvent {
    /// What changed.
    pub kind: BindEventKind,
    /// Number of bound peers after the change.
    pub count: usize,
}

struct Op {
    attach: bool,
    peer: Arc<EndpointCore>,
}

#[derive(Default)]
struct DispState {
    in_dispatch: bool,
    op_buf: Vec<Op>,
}

struct BindState {
    bindings: Vec<Arc<EndpointCore>>,
    bind_tx: Option<Sender<BindEvent>>,
}

/// Deferred work a detach produced while binding locks were held.
pub(crate) enum EndAction {
    /// A receiver endpoint lost its last sender and withdraws itself.
    Detach(Arc<EndpointCore>),
}

/// Closes the user queue attached to a sender endpoint. Invoked when the
/// owning router shuts down; racing a close from the user side is fine,
/// queue close is idempotent.
pub(crate) type QueueCloser = Box<dyn Fn() + Send + Sync>;

pub(crate) struct EndpointCore {
    pub(crate) id: Ident,
    pub(crate) kind: EndpointKind,
    pub(crate) descriptor: TypeDescriptor,
    /// Internal endpoints (notifier, proxy stubs) skip namespace
    /// notifications and the duplicate-sender check.
    pub(crate) internal: bool,
    pub(crate) router: Weak<RouterCore>,
    pub(crate) detached: AtomicBool,
    /// Receiver endpoints only: where dispatchers deliver.
    sink: Option<Arc<dyn MsgSink>>,
    /// Sender endpoints only: closes the attached user queue.
    queue_close: Option<QueueCloser>,
    disp: Mutex<DispState>,
    bind: Mutex<BindState>,
    /// One-slot gate parking the delivery loop while the binding set is
    /// empty. May wake spuriously; the loop re-checks.
    gate: Notify,
}

impl EndpointCore {
    pub(crate) fn new(
        id: Ident,
        kind: EndpointKind,
        descriptor: TypeDescriptor,
        internal: bool,
        router: Weak<RouterCore>,
        sink: Option<Arc<dyn MsgSink>>,
        queue_close: Option<QueueCloser>,
        bind_tx: Option<Sender<BindEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            descriptor,
            internal,
            router,
            detached: AtomicBool::new(false),
            sink,
            queue_close,
            disp: Mutex::new(DispState::default()),
            bind: Mutex::new(BindState {
                bindings: Vec::new(),
                bind_tx,
            }),
            gate: Notify::new(),
        })
    }

    /// Number of bound peers, counting operations still deferred behind an
    /// in-flight dispatch.
    pub(crate) fn num_peers(&self) -> usize {
        let d = self.disp.lock();
        let b = self.bind.lock();
        let mut n = b.bindings.len() as isize;
        for op in &d.op_buf {
            n += if op.attach { 1 } else { -1 };
        }
        n.max(0) as usize
    }

    pub(crate) fn peers(&self) -> Vec<Arc<EndpointCore>> {
        self.bind.lock().bindings.clone()
    }

    /// Bind `peer` to this sender endpoint (and symmetrically back).
    /// Deferred through the operation buffer while a dispatch is in flight.
    pub(crate) fn attach_peer(self: &Arc<Self>, peer: &Arc<EndpointCore>) {
        let mut d = self.disp.lock();
        if d.in_dispatch {
            d.op_buf.push(Op {
                attach: true,
                peer: peer.clone(),
            });
            return;
        }
        self.attach_impl(peer.clone());
        peer.attach_impl(self.clone());
    }

    /// Unbind `peer` from this sender endpoint (and symmetrically back).
    /// Returned actions must be executed after all locks are released.
    #[must_use]
    pub(crate) fn detach_peer(self: &Arc<Self>, peer: &Arc<EndpointCore>) -> Vec<EndAction> {
        let mut d = self.disp.lock();
        if d.in_dispatch {
            d.op_buf.push(Op {
                attach: false,
                peer: peer.clone(),
            });
            return Vec::new();
        }
        let mut actions = Vec::new();
        actions.extend(self.detach_impl(peer));
        actions.extend(peer.detach_impl(self));
        actions
    }

    fn attach_impl(self: &Arc<Self>, peer: Arc<EndpointCore>) {
        let mut b = self.bind.lock();
        b.bindings.push(peer);
        let count = b.bindings.len();
        if let Some(tx) = &b.bind_tx {
            tx.send_latest(BindEvent {
                kind: BindEventKind::PeerAttach,
                count,
            });
        }
        if self.kind == EndpointKind::Sender && count == 1 {
            // First receiver bound: release the parked delivery loop.
            self.gate.notify_one();
        }
    }

    fn detach_impl(self: &Arc<Self>, peer: &Arc<EndpointCore>) -> Option<EndAction> {
        let mut b = self.bind.lock();
        let pos = b.bindings.iter().position(|p| Arc::ptr_eq(p, peer))?;
        b.bindings.remove(pos);
        let count = b.bindings.len();
        if let Some(tx) = &b.bind_tx {
            tx.send_latest(BindEvent {
                kind: BindEventKind::PeerDetach,
                count,
            });
        }
        if count > 0 || self.kind == EndpointKind::Sender {
            // A sender with no receivers left simply parks again at the
            // gate; nothing more to do.
            return None;
        }
        match &b.bind_tx {
            Some(tx) => {
                // The user is watching bind status: signal end-of-data and
                // leave the queue open for a potential rebind, unless the
                // endpoint was detached outright.
                tx.send_latest(BindEvent {
                    kind: BindEventKind::EndOfData,
                    count: 0,
                });
                if self.detached.load(Ordering::SeqCst) {
                    self.close_sink();
                }
                None
            }
            None => {
                // Nobody is watching: close the queue so the consumer sees
                // end-of-stream, and withdraw from the routing table.
                self.close_sink();
                if self.detached.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(EndAction::Detach(self.clone()))
                }
            }
        }
    }

    /// Apply operations deferred during a dispatch. Called with the
    /// dispatch lock held so nothing interleaves between the buffered
    /// operations and newly arriving ones.
    fn apply_ops(self: &Arc<Self>, d: &mut DispState) -> Vec<EndAction> {
        let mut actions = Vec::new();
        for op in d.op_buf.drain(..) {
            if op.attach {
                self.attach_impl(op.peer.clone());
                op.peer.attach_impl(self.clone());
            } else {
                actions.extend(self.detach_impl(&op.peer));
                actions.extend(op.peer.detach_impl(self));
            }
        }
        actions
    }

    pub(crate) fn close_sink(&self) {
        if let Some(sink) = &self.sink {
            sink.close();
        }
    }

    /// Close the user queue feeding this sender endpoint, so further sends
    /// fail with `ClosedChannel` and the delivery loop drains out.
    pub(crate) fn close_queue(&self) {
        if let Some(close) = &self.queue_close {
            close();
        }
    }

    pub(crate) fn sink_closed(&self) -> bool {
        match &self.sink {
            Some(sink) => sink.is_closed(),
            None => true,
        }
    }

    /// Wake the delivery loop so it can observe a detach.
    pub(crate) fn wake(&self) {
        self.gate.notify_one();
    }

    pub(crate) fn run_end_actions(actions: Vec<EndAction>) {
        for action in actions {
            match action {
                EndAction::Detach(ep) => {
                    if let Some(router) = ep.router.upgrade() {
                        router.detach_core(&ep);
                    }
                }
            }
        }
    }
}

/// The delivery loop of one sender endpoint.
pub(crate) async fn run_sender_loop(
    core: Arc<EndpointCore>,
    mut source: Box<dyn MsgSource>,
    mut dispatcher: Box<dyn Dispatcher>,
) {
    debug!(id = %core.id, "delivery loop started");
    loop {
        // Park until the binding set is non-empty, so no value is pulled
        // off the queue while there is nobody to deliver it to.
        loop {
            if core.detached.load(Ordering::SeqCst) {
                debug!(id = %core.id, "delivery loop exit: endpoint detached");
                return;
            }
            let wake = core.gate.notified();
            if !core.bind.lock().bindings.is_empty() {
                break;
            }
            wake.await;
        }

        let Some(value) = source.recv().await else {
            // Queue closed and drained: withdraw the endpoint.
            if let Some(router) = core.router.upgrade() {
                router.detach_core(&core);
            }
            debug!(id = %core.id, "delivery loop exit: queue closed");
            return;
        };

        core.disp.lock().in_dispatch = true;
        let snapshot: Vec<Outlet> = core
            .bind
            .lock()
            .bindings
            .iter()
            .cloned()
            .map(Outlet::new)
            .collect();
        dispatcher.dispatch(value, &snapshot).await;
        let actions = {
            let mut d = core.disp.lock();
            d.in_dispatch = false;
            core.apply_ops(&mut d)
        };
        EndpointCore::run_end_actions(actions);
    }
}

/// A bound receiver as seen by a dispatcher.
pub struct Outlet {
    core: Arc<EndpointCore>,
}

impl Outlet {
    pub(crate) fn new(core: Arc<EndpointCore>) -> Self {
        Self { core }
    }

    /// The identifier the receiver is attached under.
    pub fn id(&self) -> &Ident {
        &self.core.id
    }

    /// Whether the receiver's queue is closed.
    pub fn is_closed(&self) -> bool {
        self.core.sink_closed()
    }

    /// Deliver a value, suspending while the receiver's queue is full.
    pub async fn deliver(&self, value: MsgValue) -> DeliverOutcome {
        let Some(sink) = &self.core.sink else {
            return DeliverOutcome::Closed;
        };
        match sink.send(value).await {
            Ok(()) => DeliverOutcome::Delivered,
            Err(SinkError::Closed) => DeliverOutcome::Closed,
            Err(SinkError::Type) => {
                warn!(id = %self.core.id, "dropping value of foreign type");
                DeliverOutcome::Closed
            }
        }
    }

    /// Deliver with a timeout.
    pub async fn deliver_timeout(&self, value: MsgValue, timeout: Duration) -> DeliverOutcome {
        match tokio::time::timeout(timeout, self.deliver(value)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliverOutcome::Timeout,
        }
    }

    /// Deliver without suspending.
    pub fn try_deliver(&self, value: MsgValue) -> DeliverOutcome {
        let Some(sink) = &self.core.sink else {
            return DeliverOutcome::Closed;
        };
        match sink.try_send(value) {
            Ok(()) => DeliverOutcome::Delivered,
            Err(TrySinkError::Full) => DeliverOutcome::Full,
            Err(TrySinkError::Closed) => DeliverOutcome::Closed,
            Err(TrySinkError::Type) => {
                warn!(id = %self.core.id, "dropping value of foreign type");
                DeliverOutcome::Closed
            }
        }
    }

    /// Discard the oldest value queued at the receiver, making room for a
    /// newer one.
    pub fn drop_oldest(&self) {
        if let Some(sink) = &self.core.sink {
            sink.drop_oldest();
        }
    }
}

/// Handle to an attached endpoint.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) core: Arc<EndpointCore>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(core: Arc<EndpointCore>) -> Self {
        Self { core }
    }

    /// The identifier the endpoint is attached under.
    pub fn id(&self) -> &Ident {
        &self.core.id
    }

    /// The endpoint direction.
    pub fn kind(&self) -> EndpointKind {
        self.core.kind
    }

    /// The element type of the attached queue.
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.core.descriptor
    }

    /// Number of currently bound peers.
    pub fn num_peers(&self) -> usize {
        self.core.num_peers()
    }

    /// Remove the endpoint from the router and unbind all peers.
    /// Idempotent.
    pub fn detach(&self) {
        if let Some(router) = self.core.router.upgrade() {
            router.detach_core(&self.core);
        }
    }
}
