//! Namespace notifications and fault raising.
//!
//! The notifier owns four internal sender endpoints under the
//! `Pub`/`UnPub`/`Sub`/`UnSub` system identifiers and publishes one
//! [`NameInfoMsg`] per namespace change. Fan-out is best-effort: the send
//! runs inline when the queue has room, otherwise a detached one-shot task
//! performs the blocking send and swallows the failure if the queue closed
//! meanwhile (which happens while a router shuts down).

use crate::channel::{channel, Sender, TrySendError};
use crate::endpoint::EndpointCore;
use crate::id::{Ident, Membership, Scope, SysIdx};
use crate::msgs::{FaultEvent, NameInfo, NameInfoMsg};
use crate::router::RouterCore;

use std::sync::Arc;

use tracing::{debug, warn};

const NOTIFY_IDS: [SysIdx; 4] = [SysIdx::Pub, SysIdx::UnPub, SysIdx::Sub, SysIdx::UnSub];

struct NotifyChan {
    idx: SysIdx,
    tx: Sender<NameInfoMsg>,
    ep: Arc<EndpointCore>,
}

pub(crate) struct Notifier {
    chans: Vec<NotifyChan>,
}

impl Notifier {
    pub(crate) fn new(router: &Arc<RouterCore>) -> Self {
        let mut chans = Vec::with_capacity(NOTIFY_IDS.len());
        for idx in NOTIFY_IDS {
            let (tx, rx) = channel::<NameInfoMsg>(router.cfg.default_chan_buf_size);
            let id = Ident::sys(idx, Scope::Global, Membership::Local);
            match router.attach_send_internal(id, rx) {
                Ok(ep) => chans.push(NotifyChan { idx, tx, ep }),
                // Cannot happen on a fresh router; leave the slot empty
                // rather than poison construction.
                Err(e) => warn!(?idx, error = %e, "failed to attach notification endpoint"),
            }
        }
        Self { chans }
    }

    pub(crate) fn notify(&self, idx: SysIdx, info: NameInfo) {
        let Some(chan) = self.chans.iter().find(|c| c.idx == idx) else {
            return;
        };
        if chan.ep.num_peers() == 0 {
            return;
        }
        debug!(?idx, id = %info.id, "namespace notification");
        let msg = NameInfoMsg { info: vec![info] };
        match chan.tx.try_send(msg) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(msg)) => {
                let tx = chan.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(msg).await;
                });
            }
        }
    }

    pub(crate) fn close(&self) {
        for chan in &self.chans {
            chan.tx.close();
            if let Some(router) = chan.ep.router.upgrade() {
                router.detach_core(&chan.ep);
            }
        }
    }
}

/// Sender endpoint under the `Fault` system identifier, through which
/// background loops report errors instead of aborting.
pub(crate) struct FaultRaiser {
    tx: Sender<FaultEvent>,
    ep: Option<Arc<EndpointCore>>,
}

impl FaultRaiser {
    pub(crate) fn new(router: &Arc<RouterCore>) -> Self {
        let (tx, rx) = channel::<FaultEvent>(router.cfg.default_chan_buf_size);
        let id = Ident::sys(SysIdx::Fault, Scope::Global, Membership::Local);
        let ep = match router.attach_send_internal(id, rx) {
            Ok(ep) => Some(ep),
            Err(e) => {
                warn!(error = %e, "failed to attach fault endpoint");
                None
            }
        };
        Self { tx, ep }
    }

    pub(crate) fn raise(&self, source: &str, detail: String) {
        warn!(source, detail, "fault raised");
        let Some(ep) = &self.ep else { return };
        if ep.num_peers() == 0 {
            return;
        }
        let event = FaultEvent {
            source: source.to_string(),
            detail,
        };
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
        }
    }

    pub(crate) fn close(&self) {
        self.tx.close();
        if let Some(ep) = &self.ep {
            if let Some(router) = ep.router.upgrade() {
                router.detach_core(ep);
            }
        }
    }
}
