//! Unbounded-buffer adapter.
//!
//! Gives any sink unlimited buffering: when the wrapped queue is full,
//! values overflow into a side buffer that a single background task drains.
//! Sends never suspend. Used for the control plane, where back-pressure on
//! namespace events would deadlock the binding engine.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::{Capacity, MsgSink, MsgValue, SinkError, TrySinkError};

#[derive(Default)]
struct State {
    buffer: VecDeque<MsgValue>,
    draining: bool,
    closed: bool,
}

/// Sink adapter with unlimited internal buffering.
pub(crate) struct AsyncSink {
    inner: Arc<dyn MsgSink>,
    state: Arc<Mutex<State>>,
}

impl AsyncSink {
    pub(crate) fn new(inner: Arc<dyn MsgSink>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Move buffered values into the wrapped sink until the buffer is
    /// observed empty. At most one drain task runs per adapter; the close
    /// of the wrapped sink is deferred to it when the adapter was closed
    /// while it ran.
    async fn drain(inner: Arc<dyn MsgSink>, state: Arc<Mutex<State>>) {
        loop {
            let batch = {
                let mut st = state.lock();
                if st.buffer.is_empty() {
                    st.draining = false;
                    if st.closed {
                        inner.close();
                    }
                    return;
                }
                std::mem::take(&mut st.buffer)
            };
            for value in batch {
                if inner.send(value).await.is_err() {
                    // Wrapped queue closed under us; nothing left to deliver.
                    let mut st = state.lock();
                    st.buffer.clear();
                    st.draining = false;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl MsgSink for AsyncSink {
    async fn send(&self, value: MsgValue) -> Result<(), SinkError> {
        match MsgSink::try_send(self, value) {
            Ok(()) => Ok(()),
            Err(TrySinkError::Closed) => Err(SinkError::Closed),
            Err(TrySinkError::Type) => Err(SinkError::Type),
            // try_send buffers instead of reporting Full.
            Err(TrySinkError::Full) => Ok(()),
        }
    }

    fn try_send(&self, value: MsgValue) -> Result<(), TrySinkError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(TrySinkError::Closed);
        }
        if st.draining {
            st.buffer.push_back(value);
            return Ok(());
        }
        match self.inner.try_send(value.clone()) {
            Ok(()) => Ok(()),
            Err(TrySinkError::Full) => {
                st.buffer.push_back(value);
                st.draining = true;
                let inner = self.inner.clone();
                let state = self.state.clone();
                tokio::spawn(Self::drain(inner, state));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn drop_oldest(&self) {
        self.inner.drop_oldest();
    }

    fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        if !st.draining {
            self.inner.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn len(&self) -> usize {
        self.inner.len() + self.state.lock().buffer.len()
    }

    fn capacity(&self) -> Capacity {
        Capacity::Unbounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, TypedSink};

    use std::time::Duration;

    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_never_suspends() {
        let (tx, rx) = channel::<u32>(1);
        let sink = AsyncSink::new(Arc::new(TypedSink::new(tx)));
        for i in 0..50_u32 {
            sink.try_send(Arc::new(i)).expect("send");
        }
        for i in 0..50_u32 {
            let got = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("drained in time");
            assert_eq!(got, Some(i));
        }
    }

    #[tokio::test]
    async fn test_close_deferred_until_drained() {
        let (tx, rx) = channel::<u32>(1);
        let sink = AsyncSink::new(Arc::new(TypedSink::new(tx)));
        for i in 0..10_u32 {
            sink.try_send(Arc::new(i)).expect("send");
        }
        sink.close();
        assert!(matches!(
            sink.try_send(Arc::new(99_u32)),
            Err(TrySinkError::Closed)
        ));
        // Everything buffered before the close still arrives, then the
        // wrapped queue closes.
        for i in 0..10_u32 {
            let got = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("drained in time");
            assert_eq!(got, Some(i));
        }
        let end = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("closed in time");
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_immediate_close_closes_inner() {
        let (tx, rx) = channel::<u32>(1);
        let sink = AsyncSink::new(Arc::new(TypedSink::new(tx)));
        sink.close();
        sink.close();
        assert_eq!(rx.recv().await, None);
    }
}
