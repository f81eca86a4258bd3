//! The routing table: identifier-key indices over attached endpoints.
//!
//! The table holds two indices, senders and receivers, keyed by the
//! identifier key (name only). The owning router serializes mutations
//! through one lock held for the duration of lookup plus bind.

use crate::endpoint::{EndpointCore, EndpointKind};
use crate::error::{Error, Result};
use crate::id::{IdKey, Membership, Scope};
use crate::msgs::NameInfo;

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct Table {
    senders: HashMap<IdKey, Vec<Arc<EndpointCore>>>,
    receivers: HashMap<IdKey, Vec<Arc<EndpointCore>>>,
}

impl Table {
    /// Validate and insert an endpoint, returning the opposite-direction
    /// endpoints it must bind with. The caller binds while still holding
    /// the table lock.
    pub(crate) fn attach(&mut self, ep: &Arc<EndpointCore>) -> Result<Vec<Arc<EndpointCore>>> {
        let key = ep.id.key();

        // One element type per identifier, regardless of direction.
        for existing in self.all_under(&key) {
            if existing.descriptor != ep.descriptor {
                return Err(Error::TypeMismatch {
                    id: ep.id.clone(),
                    expected: existing.descriptor.clone(),
                    found: ep.descriptor.clone(),
                });
            }
        }

        // A user may not attach two senders under the same identifier,
        // scope, and membership. Internal endpoints (proxy stubs, the
        // notifier) are exempt: every peer projects its own stubs.
        if ep.kind == EndpointKind::Sender && !ep.internal {
            let dup = self.senders.get(&key).is_some_and(|eps| {
                eps.iter().any(|s| {
                    s.id.scope() == ep.id.scope() && s.id.membership() == ep.id.membership()
                })
            });
            if dup {
                return Err(Error::DuplicateId(ep.id.clone()));
            }
        }

        let opposite = match ep.kind {
            EndpointKind::Sender => &self.receivers,
            EndpointKind::Receiver => &self.senders,
        };
        let matches: Vec<Arc<EndpointCore>> = opposite
            .get(&key)
            .map(|eps| {
                eps.iter()
                    .filter(|c| ep.id.matches(&c.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        self.index_mut(ep.kind).entry(key).or_default().push(ep.clone());
        Ok(matches)
    }

    /// Remove an endpoint. Returns false when it was not present.
    pub(crate) fn remove(&mut self, ep: &Arc<EndpointCore>) -> bool {
        let key = ep.id.key();
        let index = self.index_mut(ep.kind);
        let Some(eps) = index.get_mut(&key) else {
            return false;
        };
        let Some(pos) = eps.iter().position(|e| Arc::ptr_eq(e, ep)) else {
            return false;
        };
        eps.remove(pos);
        if eps.is_empty() {
            index.remove(&key);
        }
        true
    }

    /// A locally-owned global sender under the key, if any. Used by peers
    /// deciding whether a remote subscription can be served.
    pub(crate) fn global_sender(&self, key: &IdKey) -> Option<Arc<EndpointCore>> {
        self.senders.get(key).and_then(|eps| {
            eps.iter()
                .find(|e| {
                    !e.internal
                        && e.id.scope() == Scope::Global
                        && e.id.membership() == Membership::Local
                })
                .cloned()
        })
    }

    /// A locally-owned global receiver under the key, if any.
    pub(crate) fn global_receiver(&self, key: &IdKey) -> Option<Arc<EndpointCore>> {
        self.receivers.get(key).and_then(|eps| {
            eps.iter()
                .find(|e| {
                    !e.internal
                        && e.id.scope() == Scope::Global
                        && e.id.membership() == Membership::Local
                })
                .cloned()
        })
    }

    /// Announceable endpoints of one direction: locally-owned, global
    /// scope, not a reserved identifier.
    pub(crate) fn global_names(&self, kind: EndpointKind) -> Vec<NameInfo> {
        let index = match kind {
            EndpointKind::Sender => &self.senders,
            EndpointKind::Receiver => &self.receivers,
        };
        index
            .values()
            .flatten()
            .filter(|e| {
                !e.internal
                    && e.id.scope() == Scope::Global
                    && e.id.membership() == Membership::Local
                    && e.id.sys_index().is_none()
            })
            .map(|e| NameInfo {
                id: e.id.clone(),
                elem: e.descriptor.clone(),
            })
            .collect()
    }

    /// Drain every endpoint, leaving the table empty.
    pub(crate) fn drain_all(&mut self) -> Vec<Arc<EndpointCore>> {
        self.senders
            .drain()
            .chain(self.receivers.drain())
            .flat_map(|(_, eps)| eps)
            .collect()
    }

    fn all_under<'a>(&'a self, key: &'a IdKey) -> impl Iterator<Item = &'a Arc<EndpointCore>> + 'a {
        self.senders
            .get(key)
            .into_iter()
            .flatten()
            .chain(self.receivers.get(key).into_iter().flatten())
    }

    fn index_mut(&mut self, kind: EndpointKind) -> &mut HashMap<IdKey, Vec<Arc<EndpointCore>>> {
        match kind {
            EndpointKind::Sender => &mut self.senders,
            EndpointKind::Receiver => &mut self.receivers,
        }
    }
}
