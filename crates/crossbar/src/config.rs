//! Configuration for routers and peer connections.

use crate::dispatch::{BroadcastPolicy, DispatchPolicy};
use crate::id::IdTranslator;

use std::fmt;
use std::sync::Arc;

/// Queue capacity used for control-plane channels.
pub(crate) const CMD_CHAN_BUF_SIZE: usize = 64;

/// Configuration for a [`Router`](crate::Router).
#[derive(Clone)]
pub struct RouterConfig {
    /// Name of the router, carried in connection handshakes and log output.
    pub name: String,
    /// Default bounded queue capacity for endpoints the router creates.
    pub default_chan_buf_size: usize,
    /// Dispatch policy applied to each sender endpoint.
    pub dispatch_policy: Arc<dyn DispatchPolicy>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "router".to_string(),
            default_chan_buf_size: 32,
            dispatch_policy: Arc::new(BroadcastPolicy),
        }
    }
}

impl RouterConfig {
    /// Config with the given router name and defaults otherwise.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("name", &self.name)
            .field("default_chan_buf_size", &self.default_chan_buf_size)
            .finish_non_exhaustive()
    }
}

/// Options for one peer connection.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Give every peer stub unlimited buffering instead of flow control.
    pub async_mode: bool,
    /// Credit window per flow-controlled data stub; defaults to the
    /// router's `default_chan_buf_size`.
    pub flow_credit: Option<usize>,
    /// Bidirectional identifier rewrite applied at the peer boundary.
    pub translator: Option<Arc<dyn IdTranslator>>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("async_mode", &self.async_mode)
            .field("flow_credit", &self.flow_credit)
            .field("translator", &self.translator.is_some())
            .finish()
    }
}
