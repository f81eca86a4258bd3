//! The data plane of one peer connection.
//!
//! A stream owns the two halves of a byte transport behind length-prefixed
//! framing. The outbound loop drains one merged output queue shared by
//! every export forwarder and the control plane; the inbound loop decodes
//! frames and hands them to the proxy. Application payloads ride inside
//! frames as pre-encoded bytes, so a frame for an identifier nobody
//! subscribes to is dropped without decoding its payload.

use crate::channel::{MsgSink, Receiver as ChanReceiver};
use crate::codec::WireFormat;
use crate::error::{Error, Result};
use crate::id::Ident;
use crate::msgs::{ConnInfo, NameInfo, ReadyInfo};
use crate::proxy::ProxyCore;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Version carried in connection handshakes; peers must agree.
pub(crate) const WIRE_VERSION: u32 = 1;

/// One frame on the wire: an identifier plus its payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct WireFrame {
    pub(crate) id: Ident,
    pub(crate) body: FrameBody,
}

/// Payload of a wire frame. Control payloads are encoded structurally;
/// application payloads are opaque bytes in the element type registered
/// for the frame identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum FrameBody {
    /// Peer-side close marker for the frame identifier.
    Close,
    /// Namespace announcement (`Pub`/`UnPub`/`Sub`/`UnSub`).
    Names(Vec<NameInfo>),
    /// Flow-control credit grants.
    Ready(Vec<ReadyInfo>),
    /// Connection lifecycle (`Conn`/`Disconn`/`Error`).
    Conn(ConnInfo),
    /// Application value, pre-encoded in the connection's wire format.
    App(Bytes),
}

/// Item on the merged output queue.
#[derive(Clone, Debug)]
pub(crate) enum OutMsg {
    /// A ready-made frame.
    Frame(WireFrame),
    /// A local export forwarder ended: emit a close marker for the
    /// identifier and retire one outstanding sender.
    SenderClosed(Ident),
}

pub(crate) fn encode_frame(format: WireFormat, frame: &WireFrame) -> Result<Bytes> {
    match format {
        WireFormat::Cbor => {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(frame, &mut buf)
                .map_err(|e| Error::Marshal(e.to_string()))?;
            Ok(Bytes::from(buf))
        }
        WireFormat::Json => serde_json::to_vec(frame)
            .map(Bytes::from)
            .map_err(|e| Error::Marshal(e.to_string())),
    }
}

pub(crate) fn decode_frame(format: WireFormat, bytes: &[u8]) -> Result<WireFrame> {
    match format {
        WireFormat::Cbor => {
            ciborium::de::from_reader(bytes).map_err(|e| Error::Demarshal(e.to_string()))
        }
        WireFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| Error::Demarshal(e.to_string()))
        }
    }
}

/// State shared between the proxy and the two stream loops.
pub(crate) struct StreamShared {
    pub(crate) format: WireFormat,
    /// The merged output queue behind the shared unbounded adapter; every
    /// producer on this connection funnels through it, so control traffic
    /// never suspends.
    pub(crate) out: Arc<dyn MsgSink>,
    /// Live export forwarders still feeding the output queue.
    num_senders: AtomicUsize,
    /// Set once teardown begins.
    closing: AtomicBool,
    shutdown: Notify,
}

impl StreamShared {
    pub(crate) fn new(format: WireFormat, out: Arc<dyn MsgSink>) -> Arc<Self> {
        Arc::new(Self {
            format,
            out,
            num_senders: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Queue a control frame; never suspends and tolerates a closed queue
    /// during teardown.
    pub(crate) fn send_ctrl(&self, frame: WireFrame) {
        let _ = self.out.try_send(Arc::new(OutMsg::Frame(frame)));
    }

    pub(crate) fn sender_opened(&self) {
        self.num_senders.fetch_add(1, Ordering::SeqCst);
    }

    /// Queue the close marker for a finished export forwarder.
    pub(crate) fn sender_closed(&self, id: Ident) {
        let _ = self.out.try_send(Arc::new(OutMsg::SenderClosed(id)));
    }

    pub(crate) fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Force the inbound loop out of its read.
    pub(crate) fn interrupt_inbound(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Drain the merged output queue onto the transport.
pub(crate) async fn outbound_loop<W>(
    shared: Arc<StreamShared>,
    proxy: Arc<ProxyCore>,
    out_rx: ChanReceiver<OutMsg>,
    mut framed: FramedWrite<W, LengthDelimitedCodec>,
) where
    W: AsyncWrite + Unpin + Send,
{
    debug!(peer = %proxy.label(), "stream outbound loop start");
    while let Some(msg) = out_rx.recv().await {
        let (frame, retire) = match msg {
            OutMsg::Frame(frame) => (frame, false),
            OutMsg::SenderClosed(id) => (
                WireFrame {
                    id,
                    body: FrameBody::Close,
                },
                true,
            ),
        };
        let bytes = match encode_frame(shared.format, &frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                proxy.raise_fault("stream-outbound", e.to_string());
                continue;
            }
        };
        if let Err(e) = framed.send(bytes).await {
            warn!(peer = %proxy.label(), error = %e, "outbound transport failure");
            proxy.transport_failed("stream-outbound", e.to_string());
            return;
        }
        if retire {
            let drained = shared
                .num_senders
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map(|prev| prev == 1)
                .unwrap_or(true);
            // Once the stream is closing, the loop only stays alive to
            // flush close markers for still-live export stubs.
            if drained && shared.is_closing() {
                break;
            }
        }
    }
    let _ = framed.flush().await;
    debug!(peer = %proxy.label(), "stream outbound loop exit");
}

/// Read frames off the transport and hand them to the proxy.
pub(crate) async fn inbound_loop<R>(
    shared: Arc<StreamShared>,
    proxy: Arc<ProxyCore>,
    mut framed: FramedRead<R, LengthDelimitedCodec>,
) where
    R: AsyncRead + Unpin + Send,
{
    debug!(peer = %proxy.label(), "stream inbound loop start");
    loop {
        if shared.is_closing() {
            break;
        }
        let next = tokio::select! {
            _ = shared.shutdown.notified() => break,
            next = framed.next() => next,
        };
        match next {
            None => {
                // Transport closed under us; surface one disconnect
                // unless we are the side tearing down.
                if !shared.is_closing() {
                    proxy.transport_failed("stream-inbound", "transport closed".to_string());
                }
                break;
            }
            Some(Err(e)) => {
                if !shared.is_closing() {
                    proxy.transport_failed("stream-inbound", e.to_string());
                }
                break;
            }
            Some(Ok(bytes)) => match decode_frame(shared.format, &bytes) {
                Ok(frame) => proxy.handle_inbound(frame).await,
                Err(e) => {
                    proxy.transport_failed("stream-inbound", e.to_string());
                    break;
                }
            },
        }
    }
    debug!(peer = %proxy.label(), "stream inbound loop exit");
}
