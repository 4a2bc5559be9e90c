//! Cross-thread handoff of received messages.
//!
//! Network reception is asynchronous, but the simulation mutates state from
//! exactly one thread. Received messages are therefore pushed into this queue
//! by the transport (any thread) and drained synchronously by the session at a
//! well-defined point between frames, preserving total ordering of command
//! admission relative to tick stepping.
//!
//! The queue is the only synchronization primitive in the crate: every other
//! mutable resource has exactly one writer thread by construction.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::connection::ConnId;
use crate::network::messages::Message;

/// The simulation-side receiving end of the handoff queue.
#[derive(Debug, Default)]
pub struct InboundQueue {
    inner: Arc<Mutex<VecDeque<(ConnId, Message)>>>,
}

impl InboundQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a producer handle for the transport thread.
    #[must_use]
    pub fn sender(&self) -> InboundSender {
        InboundSender {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Removes and returns every queued message, in arrival order.
    pub fn drain(&self) -> Vec<(ConnId, Message)> {
        let mut queue = self.inner.lock();
        queue.drain(..).collect()
    }

    /// Number of messages waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// `true` when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// The transport-side producer handle. Cheap to clone; safe to move to the
/// network thread.
#[derive(Debug, Clone)]
pub struct InboundSender {
    inner: Arc<Mutex<VecDeque<(ConnId, Message)>>>,
}

impl InboundSender {
    /// Queues one received message for the simulation thread.
    pub fn push(&self, conn: ConnId, msg: Message) {
        self.inner.lock().push_back((conn, msg));
    }
}
