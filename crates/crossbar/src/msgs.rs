//! Control-plane message types.
//!
//! These flow over the reserved system identifiers, both locally (namespace
//! notifications, connection lifecycle, faults) and across peer
//! connections.

use crate::codec::TypeDescriptor;
use crate::id::Ident;

use serde::{Deserialize, Serialize};

/// One announced endpoint: its identifier and element type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NameInfo {
    /// The announced identifier.
    pub id: Ident,
    /// Element type of the queue attached under it.
    pub elem: TypeDescriptor,
}

/// Namespace notification carried on `Pub`/`UnPub`/`Sub`/`UnSub`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NameInfoMsg {
    /// The announced endpoints.
    pub info: Vec<NameInfo>,
}

/// One flow-control credit grant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadyInfo {
    /// The data identifier the credit applies to.
    pub id: Ident,
    /// Number of returned credits.
    pub credit: usize,
}

/// Connection handshake and lifecycle payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnInfo {
    /// Name of the sending router.
    pub router: String,
    /// Wire protocol version of the sending router.
    pub version: u32,
    /// Error detail on `Error` frames.
    pub error: Option<String>,
}

/// Connection lifecycle event surfaced on the `Conn`/`Disconn`/`Error`
/// system identifiers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnEvent {
    /// Name of the remote router, as reported in its handshake.
    pub peer: String,
    /// Error detail, when the event reports a failure.
    pub error: Option<String>,
}

/// Fault raised by a background loop, surfaced on the `Fault` system
/// identifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultEvent {
    /// Which loop raised the fault.
    pub source: String,
    /// What went wrong.
    pub detail: String,
}
