//! Hierarchical identifiers with scope and membership.
//!
//! Identifiers name the streams endpoints attach under. Table lookup keys
//! hash the name only, so identifiers differing in scope or membership
//! share a key; whether two endpoints actually bind is decided by
//! [`Ident::matches`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved indices for system identifiers carrying control traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SysIdx {
    /// Peer connection established.
    Conn,
    /// Peer connection closed.
    Disconn,
    /// Peer-reported error.
    Error,
    /// Flow-control credit replenishment.
    Ready,
    /// A sender endpoint was attached.
    Pub,
    /// A sender endpoint was detached.
    UnPub,
    /// A receiver endpoint was attached.
    Sub,
    /// A receiver endpoint was detached.
    UnSub,
    /// Log records (reserved; the crate itself logs through `tracing`).
    Log,
    /// Faults raised by background loops.
    Fault,
}

/// The name part of an identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Name {
    /// Integer name.
    Int(i64),
    /// String name.
    Str(String),
    /// Path name: a sequence of tokens.
    Path(Vec<String>),
    /// Reserved system name.
    Sys(SysIdx),
}

/// Visibility of an endpoint's identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Visible to the attacher only; never announced.
    None,
    /// Visible within the owning router only.
    Local,
    /// Propagated to connected peers.
    Global,
}

/// Whether the endpoint is owned locally or projected from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Membership {
    /// Owned by this router.
    Local,
    /// A stub projected from a connected peer.
    Remote,
}

/// Key used for routing-table lookup. Hashes the name only.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdKey(Name);

/// An identifier: a name plus the scope/membership visibility axes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ident {
    name: Name,
    scope: Scope,
    membership: Membership,
}

impl Ident {
    /// Identifier with an integer name, scoped `Global`/`Local`.
    pub fn int(name: i64) -> Self {
        Self::new(Name::Int(name))
    }

    /// Identifier with a string name, scoped `Global`/`Local`.
    pub fn str(name: impl Into<String>) -> Self {
        Self::new(Name::Str(name.into()))
    }

    /// Identifier with a path name, scoped `Global`/`Local`.
    pub fn path<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Name::Path(tokens.into_iter().map(Into::into).collect()))
    }

    /// A reserved system identifier.
    pub fn sys(idx: SysIdx, scope: Scope, membership: Membership) -> Self {
        Self {
            name: Name::Sys(idx),
            scope,
            membership,
        }
    }

    fn new(name: Name) -> Self {
        Self {
            name,
            scope: Scope::Global,
            membership: Membership::Local,
        }
    }

    /// Copy of this identifier with a different scope.
    pub fn with_scope(&self, scope: Scope) -> Self {
        Self {
            name: self.name.clone(),
            scope,
            membership: self.membership,
        }
    }

    /// Copy of this identifier with a different membership.
    pub fn with_membership(&self, membership: Membership) -> Self {
        Self {
            name: self.name.clone(),
            scope: self.scope,
            membership,
        }
    }

    /// The name part.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// The scope axis.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// The membership axis.
    pub fn membership(&self) -> Membership {
        self.membership
    }

    /// The table-lookup key; hashes the name only.
    pub fn key(&self) -> IdKey {
        IdKey(self.name.clone())
    }

    /// Which system identifier this is, if any.
    pub fn sys_index(&self) -> Option<SysIdx> {
        match self.name {
            Name::Sys(idx) => Some(idx),
            _ => None,
        }
    }

    /// Whether endpoints attached under `self` and `other` bind.
    ///
    /// Names must be equal, scopes must be equal, and at most one side may
    /// be a remote projection (a router never bridges two peers).
    pub fn matches(&self, other: &Ident) -> bool {
        self.name == other.name
            && self.scope == other.scope
            && !(self.membership == Membership::Remote && other.membership == Membership::Remote)
    }
}

/// Bidirectional identifier rewrite applied at a peer boundary.
///
/// `outward` maps local identifiers to the peer's namespace on emit;
/// `inward` is its inverse, applied to every identifier read off the
/// transport.
pub trait IdTranslator: Send + Sync {
    /// Map a local identifier into the peer's namespace.
    fn outward(&self, id: Ident) -> Ident;

    /// Map a peer identifier into the local namespace.
    fn inward(&self, id: Ident) -> Ident;
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Name::Int(n) => write!(f, "{n}")?,
            Name::Str(s) => write!(f, "{s}")?,
            Name::Path(p) => write!(f, "{}", p.join("/"))?,
            Name::Sys(idx) => write!(f, "sys:{idx:?}")?,
        }
        write!(f, "[{:?}/{:?}]", self.scope, self.membership)
    }
}
