//! Typed publish/subscribe message router.
//!
//! A [`Router`] federates named, strongly-typed streams of values between
//! producers and consumers. Producers attach the receiving halves of
//! bounded queues as sender endpoints, consumers attach sending halves as
//! receiver endpoints; the router binds compatible endpoints by identifier
//! and forwards values under a configurable dispatch policy.
//!
//! Two routers connected over a bidirectional byte stream become peers:
//! each proxies the globally-scoped part of its namespace into the other,
//! with credit-based flow control per mirrored identifier.
//!
//! ```no_run
//! use crossbar::{channel, Ident, Router, RouterConfig};
//!
//! # async fn demo() -> crossbar::Result<()> {
//! let router = Router::new(RouterConfig::named("example"));
//! let (tx, rx) = channel::<String>(8);
//! router.attach_send(Ident::str("greetings"), rx, None)?;
//! tx.send("hello".to_string()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod adapter;
mod channel;
mod codec;
mod config;
mod dispatch;
mod endpoint;
mod error;
mod id;
mod msgs;
mod notifier;
mod proxy;
mod router;
mod stream;
mod table;

pub use channel::{
    channel, unbounded, Capacity, MsgValue, Receiver, Sender, TryRecvError, TrySendError,
};
pub use codec::{Msg, TypeDescriptor, WireFormat};
pub use config::{ConnectOptions, RouterConfig};
pub use dispatch::{
    BroadcastPolicy, DeliverOutcome, DispatchPolicy, Dispatcher, KeepLatestPolicy, RandomPolicy,
    RoundRobinPolicy, TimeoutDropPolicy, TimeoutEvent, TimeoutReportPolicy,
};
pub use endpoint::{BindEvent, BindEventKind, Endpoint, EndpointKind, Outlet};
pub use error::{Error, Result};
pub use id::{IdKey, IdTranslator, Ident, Membership, Name, Scope, SysIdx};
pub use msgs::{ConnEvent, ConnInfo, FaultEvent, NameInfo, NameInfoMsg, ReadyInfo};
pub use proxy::Peer;
pub use router::Router;
