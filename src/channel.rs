//! Named event channels between the run controller and its callers.
//!
//! Each channel name has at most one listener. Listening on a name first removes
//! whatever listener held it, so a fast remount can never receive the same event twice.
//! A `Listening` handle releases its registration when dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::ChannelError;
use crate::model::RunEvent;

#[derive(Debug)]
struct Listener {
    generation: u64,
    tx: UnboundedSender<RunEvent>,
}

#[derive(Debug, Default)]
struct BusInner {
    listeners: Mutex<HashMap<&'static str, Listener>>,
    next_generation: AtomicU64,
}

impl BusInner {
    fn release(&self, channel: &'static str, generation: u64) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.get(channel) {
            Some(l) if l.generation == generation => {
                listeners.remove(channel);
                tracing::debug!(channel, generation, "listener released");
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single listener for `channel`, replacing any previous one.
    ///
    /// The replaced listener's receiver is closed, so it drains what it already
    /// holds and then yields `None`.
    pub fn listen(&self, channel: &'static str) -> Listening {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .inner
            .listeners
            .lock()
            .insert(channel, Listener { generation, tx });
        if let Some(prev) = previous {
            tracing::debug!(
                channel,
                replaced = prev.generation,
                generation,
                "replaced existing listener"
            );
        }
        Listening {
            channel,
            generation,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to the listener of `channel`.
    pub fn publish(&self, channel: &'static str, event: RunEvent) -> Result<(), ChannelError> {
        let mut listeners = self.inner.listeners.lock();
        let Some(listener) = listeners.get(channel) else {
            return Err(ChannelError::NoListener { channel });
        };
        if listener.tx.send(event).is_err() {
            // Receiver went away without releasing; treat the registration as dead.
            listeners.remove(channel);
            return Err(ChannelError::NoListener { channel });
        }
        Ok(())
    }

    /// Remove the listener of `channel` if it is still the given generation.
    pub fn release(&self, channel: &'static str, generation: u64) -> bool {
        self.inner.release(channel, generation)
    }

    pub fn has_listener(&self, channel: &str) -> bool {
        self.inner.listeners.lock().contains_key(channel)
    }

    /// Whether `generation` still holds the registration for `channel`.
    pub fn is_current(&self, channel: &str, generation: u64) -> bool {
        self.inner
            .listeners
            .lock()
            .get(channel)
            .is_some_and(|l| l.generation == generation)
    }
}

/// Receiving end of one channel registration.
#[derive(Debug)]
pub struct Listening {
    channel: &'static str,
    generation: u64,
    rx: UnboundedReceiver<RunEvent>,
    bus: Weak<BusInner>,
}

impl Listening {
    pub fn channel(&self) -> &'static str {
        self.channel
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the next event. `None` once the registration is released or replaced
    /// and everything already queued has been drained.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RunEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Listening {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.release(self.channel, self.generation);
        }
    }
}
