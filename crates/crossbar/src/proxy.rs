//! The per-peer control plane.
//!
//! A proxy mirrors namespaces between its router and one remote peer. It
//! watches the local `Pub`/`UnPub`/`Sub`/`UnSub` notifications and forwards
//! the globally-scoped subset; namespace events arriving from the peer
//! create or remove stubs:
//!
//! - an **import stub** is a locally attached sender endpoint mirroring a
//!   remote publisher; the stream's inbound side fills its queue,
//! - an **export stub** is a locally attached receiver endpoint created for
//!   a remote subscription; a forwarder task drains its queue into the
//!   stream's outbound framing.
//!
//! On a flow-controlled connection each export forwarder pushes through a
//! credit window, replenished by `Ready` frames that the peer emits as its
//! import stub delivers. Control channels are wrapped in the unbounded
//! adapter throughout, so namespace traffic never stalls the control loop.

use crate::adapter::{AsyncSink, FlowReceiver, FlowSender};
use crate::channel::{
    channel, unbounded, ErasedSink, ErasedSource, MsgSink, MsgSource, MsgValue, Receiver, Sender,
    TypedSink,
};
use crate::codec::{TypeVtable, WireFormat};
use crate::config::{ConnectOptions, CMD_CHAN_BUF_SIZE};
use crate::endpoint::{EndpointCore, EndpointKind, QueueCloser};
use crate::error::Result;
use crate::id::{IdKey, Ident, Membership, Scope, SysIdx};
use crate::msgs::{ConnEvent, ConnInfo, NameInfo, NameInfoMsg, ReadyInfo};
use crate::router::RouterCore;
use crate::stream::{
    self, FrameBody, StreamShared, WireFrame, WIRE_VERSION,
};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

enum CtrlMsg {
    /// Namespace notification from the local router.
    Local(SysIdx, NameInfoMsg),
    /// Control frame from the remote peer.
    Peer(WireFrame),
    /// Transport or codec failure observed by a stream loop.
    Fail(String),
    /// Local close request.
    Shutdown,
}

struct ImportStub {
    ep: Arc<EndpointCore>,
    tx: Sender<MsgValue>,
}

struct ExportStub {
    ep: Arc<EndpointCore>,
    flow: Option<Arc<FlowSender>>,
}

#[derive(Default)]
struct ProxyState {
    imports: HashMap<IdKey, ImportStub>,
    exports: HashMap<IdKey, ExportStub>,
    /// Local subscriptions announced to the peer; doubles as the decode
    /// registry for inbound application payloads.
    exported_subs: HashMap<IdKey, NameInfo>,
    /// Remote subscriptions, kept so a later local publication can still
    /// serve them.
    remote_subs: HashMap<IdKey, NameInfo>,
    peer_name: Option<String>,
    closed: bool,
}

pub(crate) struct ProxyCore {
    router: Arc<RouterCore>,
    opts: ConnectOptions,
    shared: Arc<StreamShared>,
    ctrl_tx: Sender<CtrlMsg>,
    state: Mutex<ProxyState>,
    /// Effective credit window; `None` on an async-mode connection.
    flow_credit: Option<usize>,
    /// Sender endpoints surfacing `Conn`/`Disconn`/`Error` locally.
    conn_events: Vec<(SysIdx, Arc<EndpointCore>, Arc<dyn MsgSink>)>,
    /// The four local namespace subscriptions.
    sub_endpoints: Vec<Arc<EndpointCore>>,
    sub_queues: Vec<Sender<NameInfoMsg>>,
}

/// Handle to one peer connection.
#[derive(Clone)]
pub struct Peer {
    proxy: Arc<ProxyCore>,
}

impl Peer {
    /// Tear the connection down: a `Disconn` is sent to the peer, stubs
    /// are detached, and both stream loops exit. Idempotent.
    pub fn close(&self) {
        let _ = self.proxy.ctrl_tx.try_send(CtrlMsg::Shutdown);
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.proxy.state.lock().closed
    }

    /// Name the remote router reported in its handshake.
    pub fn peer_name(&self) -> Option<String> {
        self.proxy.state.lock().peer_name.clone()
    }

    pub(crate) fn same(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.proxy, &other.proxy)
    }
}

/// Wire up a proxy and its stream over a byte transport.
pub(crate) fn connect<S>(
    router: Arc<RouterCore>,
    transport: S,
    format: WireFormat,
    opts: ConnectOptions,
) -> Result<Peer>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let buf = router.cfg.default_chan_buf_size;
    let flow_credit = if opts.async_mode {
        None
    } else {
        Some(opts.flow_credit.unwrap_or(buf).max(1))
    };

    // Merged output queue behind the one shared unbounded adapter, so the
    // whole connection runs a single drain task.
    let (out_tx, out_rx) = channel(buf + CMD_CHAN_BUF_SIZE);
    let out: Arc<dyn MsgSink> = Arc::new(AsyncSink::new(Arc::new(TypedSink::new(out_tx))));
    let shared = StreamShared::new(format, out);

    let (ctrl_tx, ctrl_rx) = unbounded::<CtrlMsg>();

    // Connection lifecycle endpoints, async-wrapped like all sys channels.
    let mut conn_events = Vec::new();
    for idx in [SysIdx::Conn, SysIdx::Disconn, SysIdx::Error] {
        let (tx, rx) = channel::<ConnEvent>(CMD_CHAN_BUF_SIZE);
        let ep = router.attach_send_internal(
            Ident::sys(idx, Scope::Local, Membership::Local),
            rx,
        )?;
        let sink: Arc<dyn MsgSink> = Arc::new(AsyncSink::new(Arc::new(TypedSink::new(tx))));
        conn_events.push((idx, ep, sink));
    }

    // Local namespace subscriptions, forwarded into the control loop.
    let mut sub_endpoints = Vec::new();
    let mut sub_queues = Vec::new();
    for idx in [SysIdx::Pub, SysIdx::UnPub, SysIdx::Sub, SysIdx::UnSub] {
        let (tx, rx) = channel::<NameInfoMsg>(CMD_CHAN_BUF_SIZE);
        let ep = router.attach_recv_internal(
            Ident::sys(idx, Scope::Global, Membership::Local),
            tx.clone(),
        )?;
        let ctrl = ctrl_tx.clone();
        router.spawn_guarded("proxy-namespace", async move {
            while let Some(msg) = rx.recv().await {
                if ctrl.try_send(CtrlMsg::Local(idx, msg)).is_err() {
                    break;
                }
            }
        });
        sub_endpoints.push(ep);
        sub_queues.push(tx);
    }

    let proxy = Arc::new(ProxyCore {
        router,
        opts,
        shared: shared.clone(),
        ctrl_tx,
        state: Mutex::new(ProxyState::default()),
        flow_credit,
        conn_events,
        sub_endpoints,
        sub_queues,
    });

    let (read_half, write_half) = tokio::io::split(transport);
    let framed_read = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let framed_write = FramedWrite::new(write_half, LengthDelimitedCodec::new());
    proxy.router.spawn_guarded(
        "stream-outbound",
        stream::outbound_loop(shared.clone(), proxy.clone(), out_rx, framed_write),
    );
    proxy.router.spawn_guarded(
        "stream-inbound",
        stream::inbound_loop(shared, proxy.clone(), framed_read),
    );
    proxy
        .router
        .spawn_guarded("proxy-ctrl", ctrl_loop(proxy.clone(), ctrl_rx));

    proxy.send_handshake();
    info!(peer = %proxy.label(), "peer connection started");
    Ok(Peer { proxy })
}

async fn ctrl_loop(proxy: Arc<ProxyCore>, ctrl_rx: Receiver<CtrlMsg>) {
    while let Some(msg) = ctrl_rx.recv().await {
        match msg {
            CtrlMsg::Local(idx, msg) => proxy.handle_local(idx, msg),
            CtrlMsg::Peer(frame) => proxy.handle_peer(frame),
            CtrlMsg::Fail(detail) => {
                proxy.emit_conn_event(
                    SysIdx::Error,
                    ConnEvent {
                        peer: proxy.state.lock().peer_name.clone().unwrap_or_default(),
                        error: Some(detail.clone()),
                    },
                );
                proxy.teardown(true, Some(detail));
                break;
            }
            CtrlMsg::Shutdown => {
                proxy.teardown(true, None);
                break;
            }
        }
        if proxy.state.lock().closed {
            break;
        }
    }
}

impl ProxyCore {
    pub(crate) fn label(&self) -> String {
        match self.state.lock().peer_name.as_deref() {
            Some(peer) => format!("{}->{}", self.router.cfg.name, peer),
            None => self.router.cfg.name.clone(),
        }
    }

    pub(crate) fn raise_fault(&self, source: &str, detail: String) {
        self.router.raise_fault(source, detail);
    }

    /// Report a transport or codec failure from a stream loop. The
    /// failure is surfaced once through the control path, which emits the
    /// local `Error`/`Disconn` events and tears the connection down.
    pub(crate) fn transport_failed(&self, source: &str, detail: String) {
        self.raise_fault(source, detail.clone());
        let _ = self.ctrl_tx.try_send(CtrlMsg::Fail(detail));
    }

    fn outward(&self, id: Ident) -> Ident {
        match (&self.opts.translator, id.sys_index()) {
            (Some(t), None) => t.outward(id),
            _ => id,
        }
    }

    fn inward(&self, id: Ident) -> Ident {
        match (&self.opts.translator, id.sys_index()) {
            (Some(t), None) => t.inward(id),
            _ => id,
        }
    }

    fn send_handshake(&self) {
        self.shared.send_ctrl(WireFrame {
            id: Ident::sys(SysIdx::Conn, Scope::Global, Membership::Local),
            body: FrameBody::Conn(ConnInfo {
                router: self.router.cfg.name.clone(),
                version: WIRE_VERSION,
                error: None,
            }),
        });
        let pubs = self.router.global_names(EndpointKind::Sender);
        if !pubs.is_empty() {
            self.send_names(SysIdx::Pub, pubs);
        }
        let subs = self.router.global_names(EndpointKind::Receiver);
        if !subs.is_empty() {
            let mut st = self.state.lock();
            for sub in &subs {
                st.exported_subs.insert(sub.id.key(), sub.clone());
            }
            drop(st);
            self.send_names(SysIdx::Sub, subs);
        }
    }

    fn send_names(&self, idx: SysIdx, infos: Vec<NameInfo>) {
        let infos = infos
            .into_iter()
            .map(|info| NameInfo {
                id: self.outward(info.id),
                elem: info.elem,
            })
            .collect();
        self.shared.send_ctrl(WireFrame {
            id: Ident::sys(idx, Scope::Global, Membership::Local),
            body: FrameBody::Names(infos),
        });
    }

    /// Apply one local namespace notification.
    fn handle_local(self: &Arc<Self>, idx: SysIdx, msg: NameInfoMsg) {
        for info in msg.info {
            if info.id.scope() != Scope::Global
                || info.id.membership() != Membership::Local
                || info.id.sys_index().is_some()
            {
                continue;
            }
            let key = info.id.key();
            match idx {
                SysIdx::Pub => {
                    // A remote subscription may have been waiting for
                    // this name to appear.
                    let pending = self.state.lock().remote_subs.get(&key).cloned();
                    if let Some(sub) = pending {
                        self.export_add(sub);
                    }
                    self.send_names(SysIdx::Pub, vec![info]);
                }
                SysIdx::UnPub => self.send_names(SysIdx::UnPub, vec![info]),
                SysIdx::Sub => {
                    self.state.lock().exported_subs.insert(key, info.clone());
                    self.send_names(SysIdx::Sub, vec![info]);
                }
                SysIdx::UnSub => {
                    // Another local subscriber may still be listening on
                    // the same identifier.
                    if self.router.global_receiver(&key).is_some() {
                        continue;
                    }
                    self.state.lock().exported_subs.remove(&key);
                    self.send_names(SysIdx::UnSub, vec![info]);
                }
                _ => {}
            }
        }
    }

    /// Apply one control frame from the peer (identifiers already
    /// translated inward).
    fn handle_peer(self: &Arc<Self>, frame: WireFrame) {
        match frame.body {
            FrameBody::Conn(conn) => match frame.id.sys_index() {
                Some(SysIdx::Conn) => self.handle_peer_conn(conn),
                Some(SysIdx::Disconn) => {
                    self.teardown(false, conn.error);
                }
                Some(SysIdx::Error) => {
                    warn!(peer = %self.label(), error = ?conn.error, "peer reported error");
                    self.emit_conn_event(
                        SysIdx::Error,
                        ConnEvent {
                            peer: conn.router,
                            error: conn.error,
                        },
                    );
                }
                _ => warn!("connection payload on non-connection identifier"),
            },
            FrameBody::Names(infos) => match frame.id.sys_index() {
                Some(SysIdx::Sub) => {
                    for info in infos {
                        self.export_add(info);
                    }
                }
                Some(SysIdx::UnSub) => {
                    for info in infos {
                        self.export_remove(&info.id);
                    }
                }
                _ => warn!("namespace payload on non-namespace identifier"),
            },
            FrameBody::Ready(grants) => {
                let st = self.state.lock();
                for grant in grants {
                    if let Some(stub) = st.exports.get(&grant.id.key()) {
                        if let Some(flow) = &stub.flow {
                            flow.ack(grant.credit);
                        }
                    }
                }
            }
            FrameBody::Close | FrameBody::App(_) => {
                warn!("data frame routed onto the control path");
            }
        }
    }

    fn handle_peer_conn(self: &Arc<Self>, conn: ConnInfo) {
        if conn.version != WIRE_VERSION {
            let detail = format!(
                "wire version mismatch: ours {WIRE_VERSION}, peer {}",
                conn.version
            );
            warn!(peer = %conn.router, "{detail}");
            self.shared.send_ctrl(WireFrame {
                id: Ident::sys(SysIdx::Error, Scope::Global, Membership::Local),
                body: FrameBody::Conn(ConnInfo {
                    router: self.router.cfg.name.clone(),
                    version: WIRE_VERSION,
                    error: Some(detail.clone()),
                }),
            });
            self.teardown(true, Some(detail));
            return;
        }
        info!(peer = %conn.router, "peer connected");
        self.state.lock().peer_name = Some(conn.router.clone());
        self.emit_conn_event(
            SysIdx::Conn,
            ConnEvent {
                peer: conn.router,
                error: None,
            },
        );
    }

    /// Frames read off the transport land here, on the inbound task.
    pub(crate) async fn handle_inbound(&self, frame: WireFrame) {
        let frame = WireFrame {
            id: self.inward(frame.id),
            body: match frame.body {
                FrameBody::Names(infos) => FrameBody::Names(
                    infos
                        .into_iter()
                        .map(|info| NameInfo {
                            id: self.inward(info.id),
                            elem: info.elem,
                        })
                        .collect(),
                ),
                FrameBody::Ready(grants) => FrameBody::Ready(
                    grants
                        .into_iter()
                        .map(|grant| ReadyInfo {
                            id: self.inward(grant.id),
                            credit: grant.credit,
                        })
                        .collect(),
                ),
                body => body,
            },
        };
        let WireFrame { id, body } = frame;
        match body {
            FrameBody::App(payload) => self.deliver_import(&id, &payload).await,
            FrameBody::Close => self.close_import(&id),
            // Import stubs are inbound-side state: applying remote
            // publications here keeps them ordered with the application
            // frames that follow (a publication always precedes its data).
            FrameBody::Names(infos) if id.sys_index() == Some(SysIdx::Pub) => {
                for info in infos {
                    self.import_add(info);
                }
            }
            FrameBody::Names(infos) if id.sys_index() == Some(SysIdx::UnPub) => {
                for info in infos {
                    self.import_remove(&info.id);
                }
            }
            body => {
                let _ = self.ctrl_tx.try_send(CtrlMsg::Peer(WireFrame { id, body }));
            }
        }
    }

    /// Deliver one inbound application payload through the import stub.
    async fn deliver_import(&self, id: &Ident, payload: &[u8]) {
        let key = id.key();
        let looked_up = {
            let st = self.state.lock();
            let Some(stub) = st.imports.get(&key) else {
                debug!(%id, "dropping payload for unknown import");
                return;
            };
            // Payload type comes from the subscription this side exported.
            let Some(sub) = st.exported_subs.get(&key) else {
                debug!(%id, "dropping payload without a local subscription");
                return;
            };
            self.router
                .vtable(&sub.elem)
                .map(|vt| (stub.tx.clone(), stub.ep.clone(), vt))
        };
        let Some((tx, ep, vtable)) = looked_up else {
            debug!(%id, "dropping payload with unregistered element type");
            return;
        };
        if self.flow_credit.is_none() && ep.num_peers() == 0 {
            // No flow window to preserve on an async connection; drop
            // rather than buffer without bound.
            return;
        }
        match (vtable.decode)(self.shared.format, payload) {
            Ok(value) => {
                let _ = tx.send(value).await;
            }
            Err(e) => self.transport_failed("stream-inbound", e.to_string()),
        }
    }

    /// Attach an import stub for a remote publication.
    fn import_add(&self, info: NameInfo) {
        let key = info.id.key();
        {
            let st = self.state.lock();
            if st.closed || st.imports.contains_key(&key) {
                return;
            }
        }
        let buf = self.router.cfg.default_chan_buf_size;
        let (tx, rx) = match self.flow_credit {
            // The queue must hold a full credit window.
            Some(credit) => channel::<MsgValue>(buf.max(credit)),
            None => unbounded::<MsgValue>(),
        };
        let source: Box<dyn MsgSource> = match self.flow_credit {
            Some(_) => {
                let shared = self.shared.clone();
                let wire_id = self.outward(info.id.clone());
                // Each delivered value returns one credit to the peer.
                Box::new(FlowReceiver::new(
                    Box::new(ErasedSource::new(rx)),
                    Arc::new(move |n| {
                        shared.send_ctrl(WireFrame {
                            id: Ident::sys(SysIdx::Ready, Scope::Global, Membership::Local),
                            body: FrameBody::Ready(vec![ReadyInfo {
                                id: wire_id.clone(),
                                credit: n,
                            }]),
                        });
                    }),
                ))
            }
            None => Box::new(ErasedSource::new(rx)),
        };
        let stub_id = info.id.with_membership(Membership::Remote);
        let closer = {
            let tx = tx.clone();
            Box::new(move || tx.close()) as QueueCloser
        };
        match self
            .router
            .attach_sender_core(stub_id, source, info.elem.clone(), Some(closer), None, true)
        {
            Ok(ep) => {
                debug!(peer = %self.label(), id = %info.id, "import stub attached");
                self.state.lock().imports.insert(key, ImportStub { ep, tx });
            }
            Err(e) => {
                warn!(peer = %self.label(), id = %info.id, error = %e, "import stub rejected");
                self.raise_fault("proxy-import", e.to_string());
                self.emit_conn_event(
                    SysIdx::Error,
                    ConnEvent {
                        peer: self.state.lock().peer_name.clone().unwrap_or_default(),
                        error: Some(e.to_string()),
                    },
                );
            }
        }
    }

    fn import_remove(&self, id: &Ident) {
        let stub = self.state.lock().imports.remove(&id.key());
        if let Some(stub) = stub {
            debug!(peer = %self.label(), %id, "import stub removed");
            stub.tx.close();
            self.router.detach_core(&stub.ep);
        }
    }

    fn close_import(&self, id: &Ident) {
        // Peer-side close marker: end the stub's queue so bound receivers
        // observe end-of-stream, then withdraw it.
        self.import_remove(id);
    }

    /// Attach an export stub and its forwarder for a remote subscription.
    fn export_add(self: &Arc<Self>, info: NameInfo) {
        let key = info.id.key();
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.remote_subs.insert(key.clone(), info.clone());
            if st.exports.contains_key(&key) {
                return;
            }
        }
        let Some(local_sender) = self.router.global_sender(&key) else {
            debug!(peer = %self.label(), id = %info.id, "remote subscription waits for a local publisher");
            return;
        };
        if local_sender.descriptor != info.elem {
            let detail = format!(
                "remote subscription on {} expects {}, local publisher sends {}",
                info.id, info.elem, local_sender.descriptor
            );
            warn!(peer = %self.label(), "{detail}");
            self.shared.send_ctrl(WireFrame {
                id: Ident::sys(SysIdx::Error, Scope::Global, Membership::Local),
                body: FrameBody::Conn(ConnInfo {
                    router: self.router.cfg.name.clone(),
                    version: WIRE_VERSION,
                    error: Some(detail),
                }),
            });
            return;
        }
        let Some(vtable) = self.router.vtable(&info.elem) else {
            warn!(peer = %self.label(), id = %info.id, "no codec registered for export");
            return;
        };
        let buf = self.router.cfg.default_chan_buf_size;
        let (tx, rx) = match self.flow_credit {
            Some(_) => channel::<MsgValue>(buf),
            None => unbounded::<MsgValue>(),
        };
        let sink: Arc<dyn MsgSink> = Arc::new(ErasedSink::new(tx));
        let stub_id = info.id.with_membership(Membership::Remote);
        let ep = match self
            .router
            .attach_receiver_core(stub_id, sink, info.elem.clone(), None, true)
        {
            Ok(ep) => ep,
            Err(e) => {
                warn!(peer = %self.label(), id = %info.id, error = %e, "export stub rejected");
                self.raise_fault("proxy-export", e.to_string());
                return;
            }
        };
        let flow = match self.flow_credit {
            Some(credit) => match FlowSender::new(self.shared.out.clone(), credit) {
                Ok(flow) => Some(flow),
                Err(e) => {
                    self.raise_fault("proxy-export", e.to_string());
                    self.router.detach_core(&ep);
                    return;
                }
            },
            None => None,
        };
        debug!(peer = %self.label(), id = %info.id, "export stub attached");
        self.state.lock().exports.insert(
            key.clone(),
            ExportStub {
                ep,
                flow: flow.clone(),
            },
        );
        self.shared.sender_opened();
        let proxy = self.clone();
        let wire_id = self.outward(info.id);
        self.router.spawn_guarded(
            "proxy-export",
            export_forwarder(proxy, key, wire_id, rx, vtable, flow),
        );
    }

    fn export_remove(&self, id: &Ident) {
        let key = id.key();
        let stub = {
            let mut st = self.state.lock();
            st.remote_subs.remove(&key);
            st.exports.remove(&key)
        };
        if let Some(stub) = stub {
            debug!(peer = %self.label(), %id, "export stub removed");
            if let Some(flow) = &stub.flow {
                flow.close();
            }
            stub.ep.close_sink();
            self.router.detach_core(&stub.ep);
        }
    }

    fn remove_export(&self, key: &IdKey) {
        let stub = self.state.lock().exports.remove(key);
        if let Some(stub) = stub {
            if let Some(flow) = &stub.flow {
                flow.close();
            }
            stub.ep.close_sink();
            self.router.detach_core(&stub.ep);
        }
    }

    fn emit_conn_event(&self, idx: SysIdx, event: ConnEvent) {
        if let Some((_, _, sink)) = self.conn_events.iter().find(|(i, _, _)| *i == idx) {
            let _ = sink.try_send(Arc::new(event));
        }
    }

    /// Tear the connection down. `notify_peer` is false when the peer
    /// initiated the close (its stream is already gone). Idempotent.
    fn teardown(self: &Arc<Self>, notify_peer: bool, error: Option<String>) {
        let peer_name = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.peer_name.clone().unwrap_or_default()
        };
        info!(peer = %self.label(), notify_peer, "peer teardown");
        self.shared.begin_close();
        if notify_peer {
            self.shared.send_ctrl(WireFrame {
                id: Ident::sys(SysIdx::Disconn, Scope::Global, Membership::Local),
                body: FrameBody::Conn(ConnInfo {
                    router: self.router.cfg.name.clone(),
                    version: WIRE_VERSION,
                    error: error.clone(),
                }),
            });
        }
        self.emit_conn_event(
            SysIdx::Disconn,
            ConnEvent {
                peer: peer_name,
                error,
            },
        );

        // Stop watching the local namespace.
        for queue in &self.sub_queues {
            queue.close();
        }
        for ep in &self.sub_endpoints {
            self.router.detach_core(ep);
        }

        // Retire the stubs. Closing an import queue ends its delivery
        // loop; closing an export queue ends its forwarder, which emits
        // the close marker the outbound loop drains before exiting.
        let (imports, exports) = {
            let mut st = self.state.lock();
            (
                st.imports.drain().collect::<Vec<_>>(),
                st.exports.drain().collect::<Vec<_>>(),
            )
        };
        for (_, stub) in imports {
            stub.tx.close();
            self.router.detach_core(&stub.ep);
        }
        for (_, stub) in exports {
            if let Some(flow) = &stub.flow {
                flow.close();
            }
            stub.ep.close_sink();
            self.router.detach_core(&stub.ep);
        }

        // Let queued lifecycle events drain to their subscribers. A bound
        // endpoint keeps delivering until its queue is observed closed and
        // then withdraws itself; an unbound one has nothing to deliver and
        // is detached so its parked loop exits.
        for (_, ep, sink) in &self.conn_events {
            sink.close();
            if ep.num_peers() == 0 {
                self.router.detach_core(ep);
            }
        }

        // Deferred close: the outbound loop drains everything queued,
        // including the disconnect and the close markers, then exits and
        // releases the transport.
        self.shared.out.close();
        self.shared.interrupt_inbound();
        self.router.remove_peer(&Peer {
            proxy: self.clone(),
        });
    }
}

/// Drain one export stub into the merged output queue.
async fn export_forwarder(
    proxy: Arc<ProxyCore>,
    key: IdKey,
    wire_id: Ident,
    rx: Receiver<MsgValue>,
    vtable: Arc<TypeVtable>,
    flow: Option<Arc<FlowSender>>,
) {
    debug!(peer = %proxy.label(), id = %wire_id, "export forwarder start");
    while let Some(value) = rx.recv().await {
        let payload = match (vtable.encode)(proxy.shared.format, &value) {
            Ok(payload) => payload,
            Err(e) => {
                proxy.raise_fault("proxy-export", e.to_string());
                continue;
            }
        };
        let frame: MsgValue = Arc::new(stream::OutMsg::Frame(WireFrame {
            id: wire_id.clone(),
            body: FrameBody::App(payload),
        }));
        let sent = match &flow {
            Some(flow) => flow.send(frame).await.is_ok(),
            None => proxy.shared.out.send(frame).await.is_ok(),
        };
        if !sent {
            break;
        }
    }
    debug!(peer = %proxy.label(), id = %wire_id, "export forwarder exit");
    proxy.shared.sender_closed(wire_id);
    proxy.remove_export(&key);
}
