//! The router: the public attach/detach/connect surface.
//!
//! A router owns the routing table, the endpoints attached to it, the
//! namespace notifier, and the proxies of its peer connections. Handles
//! share one core; the core owns everything through the table, so endpoint
//! binding sets can hold plain references back without reference cycles.

use crate::channel::{Receiver, Sender, TypedSink, TypedSource};
use crate::channel::{MsgSink, MsgSource};
use crate::codec::{Msg, TypeDescriptor, TypeVtable, WireFormat};
use crate::config::{ConnectOptions, RouterConfig};
use crate::endpoint::{
    run_sender_loop, BindEvent, Endpoint, EndpointCore, EndpointKind, QueueCloser,
};
use crate::error::{Error, Result};
use crate::id::{IdKey, Ident, Membership, Scope, SysIdx};
use crate::msgs::NameInfo;
use crate::notifier::{FaultRaiser, Notifier};
use crate::proxy::{self, Peer};
use crate::table::Table;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// A typed publish/subscribe message router.
///
/// Producers attach the receiving halves of their queues as sender
/// endpoints; consumers attach the sending halves as receiver endpoints.
/// The router binds compatible endpoints and forwards values from each
/// sender to its bound receivers under the configured dispatch policy.
#[derive(Clone)]
pub struct Router {
    core: Arc<RouterCore>,
}

impl Router {
    /// Create a router. Must be called within a Tokio runtime: the
    /// notifier endpoints start their delivery loops immediately.
    pub fn new(mut config: RouterConfig) -> Self {
        config.default_chan_buf_size = config.default_chan_buf_size.max(1);
        let core = Arc::new(RouterCore {
            cfg: config,
            table: Mutex::new(Table::default()),
            types: Mutex::new(HashMap::new()),
            notifier: OnceLock::new(),
            fault: OnceLock::new(),
            peers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let _ = core.notifier.set(Notifier::new(&core));
        let _ = core.fault.set(FaultRaiser::new(&core));
        info!(router = %core.cfg.name, "router created");
        Self { core }
    }

    /// The router configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.core.cfg
    }

    /// Attach the receiving half of a queue as a sender endpoint.
    ///
    /// The endpoint binds against all matching receivers, `Pub`
    /// subscribers are notified, and a delivery loop is started that fans
    /// values out under the router's dispatch policy. Pass a bind-event
    /// queue to observe peer attach/detach transitions.
    pub fn attach_send<T: Msg>(
        &self,
        id: Ident,
        queue: Receiver<T>,
        bind: Option<Sender<BindEvent>>,
    ) -> Result<Endpoint> {
        self.core.register_type::<T>();
        let closer = {
            let queue = queue.clone();
            Box::new(move || queue.close()) as QueueCloser
        };
        let source = Box::new(TypedSource::new(queue));
        self.core
            .attach_sender_core(id, source, TypeDescriptor::of::<T>(), Some(closer), bind, false)
            .map(Endpoint::new)
    }

    /// Attach the sending half of a queue as a receiver endpoint.
    ///
    /// The endpoint binds against all matching senders and `Sub`
    /// subscribers are notified. Without a bind-event queue, the queue is
    /// closed when the endpoint loses its last sender, signalling
    /// end-of-stream to the consumer.
    pub fn attach_recv<T: Msg>(
        &self,
        id: Ident,
        queue: Sender<T>,
        bind: Option<Sender<BindEvent>>,
    ) -> Result<Endpoint> {
        self.core.register_type::<T>();
        let sink = Arc::new(TypedSink::new(queue));
        self.core
            .attach_receiver_core(id, sink, TypeDescriptor::of::<T>(), bind, false)
            .map(Endpoint::new)
    }

    /// Construct a reserved system identifier.
    pub fn sys_id(&self, idx: SysIdx, scope: Scope, membership: Membership) -> Ident {
        Ident::sys(idx, scope, membership)
    }

    /// Connect this router to a remote peer over a bidirectional byte
    /// stream. Starts the per-peer proxy and data stream; the two routers
    /// mirror their global namespaces into each other.
    pub fn connect_remote<S>(
        &self,
        transport: S,
        format: WireFormat,
        options: ConnectOptions,
    ) -> Result<Peer>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(Error::ClosedChannel);
        }
        let peer = proxy::connect(self.core.clone(), transport, format, options)?;
        self.core.peers.lock().push(peer.clone());
        Ok(peer)
    }

    /// Shut down the router: tear down all peer connections, detach every
    /// endpoint, and close receiver queues. Idempotent.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(router = %self.core.cfg.name, "router closing");
        let peers = std::mem::take(&mut *self.core.peers.lock());
        for peer in &peers {
            peer.close();
        }
        let endpoints = self.core.table.lock().drain_all();
        for ep in &endpoints {
            self.core.detach_core(ep);
            match ep.kind {
                EndpointKind::Receiver => ep.close_sink(),
                EndpointKind::Sender => ep.close_queue(),
            }
        }
        if let Some(notifier) = self.core.notifier.get() {
            notifier.close();
        }
        if let Some(fault) = self.core.fault.get() {
            fault.close();
        }
    }
}

pub(crate) struct RouterCore {
    pub(crate) cfg: RouterConfig,
    pub(crate) table: Mutex<Table>,
    types: Mutex<HashMap<TypeDescriptor, Arc<TypeVtable>>>,
    notifier: OnceLock<Notifier>,
    fault: OnceLock<FaultRaiser>,
    peers: Mutex<Vec<Peer>>,
    closed: AtomicBool,
}

impl RouterCore {
    pub(crate) fn register_type<T: Msg>(&self) {
        self.types
            .lock()
            .entry(TypeDescriptor::of::<T>())
            .or_insert_with(TypeVtable::of::<T>);
    }

    pub(crate) fn vtable(&self, descriptor: &TypeDescriptor) -> Option<Arc<TypeVtable>> {
        self.types.lock().get(descriptor).cloned()
    }

    /// Attach a sender endpoint from its erased parts and start its
    /// delivery loop.
    pub(crate) fn attach_sender_core(
        self: &Arc<Self>,
        id: Ident,
        source: Box<dyn MsgSource>,
        descriptor: TypeDescriptor,
        queue_close: Option<QueueCloser>,
        bind: Option<Sender<BindEvent>>,
        internal: bool,
    ) -> Result<Arc<EndpointCore>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClosedChannel);
        }
        let ep = EndpointCore::new(
            id,
            EndpointKind::Sender,
            descriptor,
            internal,
            Arc::downgrade(self),
            None,
            queue_close,
            bind,
        );
        {
            let mut table = self.table.lock();
            let matches = table.attach(&ep)?;
            for receiver in &matches {
                ep.attach_peer(receiver);
            }
        }
        let dispatcher = self.cfg.dispatch_policy.new_dispatcher();
        self.spawn_guarded("delivery-loop", run_sender_loop(ep.clone(), source, dispatcher));
        debug!(router = %self.cfg.name, id = %ep.id, "sender attached");
        if !internal {
            self.notify(SysIdx::Pub, &ep);
        }
        Ok(ep)
    }

    /// Attach a receiver endpoint from its erased parts.
    pub(crate) fn attach_receiver_core(
        self: &Arc<Self>,
        id: Ident,
        sink: Arc<dyn MsgSink>,
        descriptor: TypeDescriptor,
        bind: Option<Sender<BindEvent>>,
        internal: bool,
    ) -> Result<Arc<EndpointCore>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClosedChannel);
        }
        let ep = EndpointCore::new(
            id,
            EndpointKind::Receiver,
            descriptor,
            internal,
            Arc::downgrade(self),
            Some(sink),
            None,
            bind,
        );
        {
            let mut table = self.table.lock();
            let matches = table.attach(&ep)?;
            for sender in &matches {
                sender.attach_peer(&ep);
            }
        }
        debug!(router = %self.cfg.name, id = %ep.id, "receiver attached");
        if !internal {
            self.notify(SysIdx::Sub, &ep);
        }
        Ok(ep)
    }

    /// Typed internal sender attach (notifier, fault raiser, proxy
    /// control endpoints).
    pub(crate) fn attach_send_internal<T: Msg>(
        self: &Arc<Self>,
        id: Ident,
        queue: Receiver<T>,
    ) -> Result<Arc<EndpointCore>> {
        self.register_type::<T>();
        let closer = {
            let queue = queue.clone();
            Box::new(move || queue.close()) as QueueCloser
        };
        let source = Box::new(TypedSource::new(queue));
        self.attach_sender_core(id, source, TypeDescriptor::of::<T>(), Some(closer), None, true)
    }

    /// Typed internal receiver attach (proxy namespace subscriptions).
    pub(crate) fn attach_recv_internal<T: Msg>(
        self: &Arc<Self>,
        id: Ident,
        queue: Sender<T>,
    ) -> Result<Arc<EndpointCore>> {
        self.register_type::<T>();
        let sink = Arc::new(TypedSink::new(queue));
        self.attach_receiver_core(id, sink, TypeDescriptor::of::<T>(), None, true)
    }

    /// Remove an endpoint from the table and unbind all its peers.
    /// Idempotent; safe to call from any task.
    pub(crate) fn detach_core(self: &Arc<Self>, ep: &Arc<EndpointCore>) {
        if ep.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the delivery loop so it observes the detach while parked.
        ep.wake();
        let mut actions = Vec::new();
        {
            let mut table = self.table.lock();
            table.remove(ep);
            for peer in ep.peers() {
                let acts = match ep.kind {
                    EndpointKind::Sender => ep.detach_peer(&peer),
                    EndpointKind::Receiver => peer.detach_peer(ep),
                };
                actions.extend(acts);
            }
        }
        EndpointCore::run_end_actions(actions);
        debug!(router = %self.cfg.name, id = %ep.id, kind = ?ep.kind, "endpoint detached");
        if !ep.internal {
            let idx = match ep.kind {
                EndpointKind::Sender => SysIdx::UnPub,
                EndpointKind::Receiver => SysIdx::UnSub,
            };
            self.notify(idx, ep);
        }
    }

    fn notify(&self, idx: SysIdx, ep: &Arc<EndpointCore>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(notifier) = self.notifier.get() {
            notifier.notify(
                idx,
                NameInfo {
                    id: ep.id.clone(),
                    elem: ep.descriptor.clone(),
                },
            );
        }
    }

    pub(crate) fn raise_fault(&self, source: &str, detail: String) {
        if let Some(fault) = self.fault.get() {
            fault.raise(source, detail);
        }
    }

    /// Spawn a background task whose panic, should one escape, is
    /// reported as a fault instead of silently dying with the task.
    pub(crate) fn spawn_guarded<F>(self: &Arc<Self>, source: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = Arc::downgrade(self);
        tokio::spawn(async move {
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                if let Some(router) = router.upgrade() {
                    router.raise_fault(source, "background task panicked".to_string());
                }
            }
        });
    }

    pub(crate) fn global_sender(&self, key: &IdKey) -> Option<Arc<EndpointCore>> {
        self.table.lock().global_sender(key)
    }

    pub(crate) fn global_receiver(&self, key: &IdKey) -> Option<Arc<EndpointCore>> {
        self.table.lock().global_receiver(key)
    }

    pub(crate) fn global_names(&self, kind: EndpointKind) -> Vec<NameInfo> {
        self.table.lock().global_names(kind)
    }

    pub(crate) fn remove_peer(&self, peer: &Peer) {
        self.peers.lock().retain(|p| !p.same(peer));
    }
}
