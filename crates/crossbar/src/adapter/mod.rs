//! Channel adapters: unbounded buffering and credit-window flow control.
//!
//! Adapters compose over any erased queue capability and preserve its
//! contract; higher layers only notice them through capacity and length
//! reporting.

mod async_sink;
mod flow;

pub(crate) use async_sink::AsyncSink;
pub(crate) use flow::{FlowReceiver, FlowSender};
