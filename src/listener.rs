//! Binds run subscriptions to the lifetime of a caller context.
//!
//! A `ContextScope` stands for one observing context (a screen, a console session).
//! Every `RunWatch` it hands out dies with it: closing or dropping the scope releases
//! its channel registrations and makes outstanding watches yield `None`, even while the
//! run itself keeps going.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{EventBus, Listening};
use crate::model::{RunCategory, RunEvent};

pub struct ContextScope {
    name: String,
    bus: EventBus,
    token: CancellationToken,
    owned: Mutex<Vec<(&'static str, u64)>>,
}

impl ContextScope {
    pub fn enter(bus: EventBus, name: impl Into<String>) -> Self {
        let name = name.into();
        tracing::debug!(context = %name, "context entered");
        Self {
            name,
            bus,
            token: CancellationToken::new(),
            owned: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the reply (and progress, if any) channel of `category`.
    ///
    /// Whatever listener held those channel names before is removed first.
    pub fn watch(&self, category: RunCategory) -> RunWatch {
        let binding = category.binding();
        let reply = self.bus.listen(binding.reply);
        let progress = binding.progress.map(|channel| self.bus.listen(channel));

        let mut owned = self.owned.lock();
        owned.retain(|&(channel, generation)| self.bus.is_current(channel, generation));
        owned.push((reply.channel(), reply.generation()));
        if let Some(p) = &progress {
            owned.push((p.channel(), p.generation()));
        }
        tracing::debug!(context = %self.name, %category, "watching run category");

        let progress_open = progress.is_some();
        RunWatch {
            category,
            reply,
            progress,
            alive: self.token.child_token(),
            bus: self.bus.clone(),
            backlog: VecDeque::new(),
            reply_open: true,
            progress_open,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Tear the context down. Same as dropping it.
    pub fn close(self) {}
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        self.token.cancel();
        let owned = std::mem::take(&mut *self.owned.lock());
        let released = owned
            .into_iter()
            .filter(|&(channel, generation)| self.bus.release(channel, generation))
            .count();
        tracing::debug!(context = %self.name, released, "context closed");
    }
}

/// Event stream of one run category for one context.
///
/// Events come out in publish order: `started`, then progress, then the terminal event,
/// even when progress travels on its own channel.
pub struct RunWatch {
    category: RunCategory,
    reply: Listening,
    progress: Option<Listening>,
    alive: CancellationToken,
    bus: EventBus,
    backlog: VecDeque<RunEvent>,
    reply_open: bool,
    progress_open: bool,
}

async fn next_on(listening: Option<&mut Listening>) -> Option<RunEvent> {
    match listening {
        Some(l) => l.recv().await,
        None => futures::future::pending().await,
    }
}

impl RunWatch {
    pub fn category(&self) -> RunCategory {
        self.category
    }

    /// Whether this watch still receives events: its context is alive and no newer
    /// subscription has taken over the reply channel.
    pub fn is_live(&self) -> bool {
        !self.alive.is_cancelled()
            && self
                .bus
                .is_current(self.reply.channel(), self.reply.generation())
    }

    /// Next event, or `None` once the context is gone or the subscription was replaced.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        if self.alive.is_cancelled() {
            return None;
        }
        if let Some(ev) = self.backlog.pop_front() {
            return Some(ev);
        }

        let RunWatch {
            reply,
            progress,
            alive,
            backlog,
            reply_open,
            progress_open,
            ..
        } = self;
        loop {
            if !*reply_open && !*progress_open {
                return None;
            }
            tokio::select! {
                biased;
                _ = alive.cancelled() => return None,
                // Reply first: `started` is always queued before any progress.
                ev = reply.recv(), if *reply_open => match ev {
                    Some(ev) => return Some(sequence_terminal(ev, progress.as_mut(), backlog)),
                    None => *reply_open = false,
                },
                ev = next_on(progress.as_mut()), if *progress_open => match ev {
                    Some(ev) => return Some(ev),
                    None => *progress_open = false,
                },
            }
        }
    }

    /// Non-blocking variant of [`RunWatch::recv`].
    pub fn try_recv(&mut self) -> Option<RunEvent> {
        if self.alive.is_cancelled() {
            return None;
        }
        if let Some(ev) = self.backlog.pop_front() {
            return Some(ev);
        }
        if let Some(ev) = self.reply.try_recv() {
            return Some(sequence_terminal(
                ev,
                self.progress.as_mut(),
                &mut self.backlog,
            ));
        }
        self.progress.as_mut().and_then(|p| p.try_recv())
    }

    /// Drop the subscription. Events published afterwards go nowhere.
    pub fn release(self) {
        tracing::debug!(category = %self.category, "run watch released");
    }
}

/// A terminal event on the reply channel must not overtake progress that was
/// published before it on the progress channel.
fn sequence_terminal(
    ev: RunEvent,
    progress: Option<&mut Listening>,
    backlog: &mut VecDeque<RunEvent>,
) -> RunEvent {
    let Some(progress) = progress else {
        return ev;
    };
    if !ev.is_terminal() {
        return ev;
    }
    while let Some(p) = progress.try_recv() {
        backlog.push_back(p);
    }
    match backlog.pop_front() {
        Some(first) => {
            backlog.push_back(ev);
            first
        }
        None => ev,
    }
}
