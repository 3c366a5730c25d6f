//! Fan-out of worker output to live subscribers.
//!
//! One [`LogBroadcaster`] exists per worker run. The drain loop
//! ([`drain_output`]) is its only producer; each [`LogSubscription`] owns a
//! bounded drop-oldest queue, so a slow or absent subscriber never blocks
//! the drain loop and never backs pressure up into the worker's pipe.

pub mod drain;
pub mod subscription;

pub use drain::{DrainSummary, drain_output};
pub use subscription::{LogSubscription, SubscriberOverflow};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::worker::LogLine;
use subscription::SubscriberQueue;

/// Sizing for a broadcaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Lines a subscriber may have unread before the oldest is dropped.
    pub subscriber_capacity: usize,
    /// Recent lines replayed to a subscriber when it attaches. 0 disables
    /// replay.
    pub backlog_lines: usize,
    /// Recent lines retained for exit diagnostics.
    pub tail_lines: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 1024,
            backlog_lines: 0,
            tail_lines: 20,
        }
    }
}

impl BroadcastConfig {
    fn history_capacity(&self) -> usize {
        self.backlog_lines.max(self.tail_lines)
    }
}

struct HubState {
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
    next_id: u64,
    history: VecDeque<LogLine>,
    last_seq: u64,
    closed: bool,
}

/// Shared between the broadcaster handle(s) and every subscription.
pub(crate) struct Hub {
    config: BroadcastConfig,
    state: Mutex<HubState>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Hub {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn detach(&self, id: u64) {
        if self.lock().subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "log subscriber detached");
        }
    }
}

/// Cloneable handle to one run's output fan-out.
#[derive(Clone)]
pub struct LogBroadcaster {
    hub: Arc<Hub>,
}

impl std::fmt::Debug for LogBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBroadcaster")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.lines_published())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LogBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        let history = VecDeque::with_capacity(config.history_capacity().min(1024));
        Self {
            hub: Arc::new(Hub {
                config,
                state: Mutex::new(HubState {
                    subscribers: HashMap::new(),
                    next_id: 1,
                    history,
                    last_seq: 0,
                    closed: false,
                }),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a new subscriber.
    ///
    /// It receives the configured backlog (if any) followed by every line
    /// published after this call. Subscribing after [`Self::close`] yields
    /// only the backlog.
    pub fn subscribe(&self) -> LogSubscription {
        let mut state = self.hub.lock();
        let id = state.next_id;
        state.next_id += 1;

        let queue = Arc::new(SubscriberQueue::new(self.hub.config.subscriber_capacity));
        let backlog = self.hub.config.backlog_lines;
        let skip = state.history.len().saturating_sub(backlog);
        for line in state.history.iter().skip(skip) {
            queue.push(line.clone());
        }

        if state.closed {
            queue.close();
        } else {
            state.subscribers.insert(id, Arc::clone(&queue));
        }
        drop(state);

        debug!(subscriber = id, "log subscriber attached");
        LogSubscription::new(id, queue, Arc::clone(&self.hub))
    }

    /// Deliver `line` to every attached subscriber without blocking.
    ///
    /// Lines must be published in increasing sequence order; out-of-order
    /// lines are discarded.
    pub fn publish(&self, line: LogLine) {
        let mut state = self.hub.lock();
        if state.closed {
            return;
        }
        if line.seq <= state.last_seq {
            warn!(
                seq = line.seq,
                last_seq = state.last_seq,
                "discarding out-of-order log line"
            );
            return;
        }
        state.last_seq = line.seq;

        let history_cap = self.hub.config.history_capacity();
        if history_cap > 0 {
            if state.history.len() >= history_cap {
                state.history.pop_front();
            }
            state.history.push_back(line.clone());
        }

        for (id, queue) in &state.subscribers {
            let first_loss = queue.dropped() == 0;
            if queue.push(line.clone()) {
                self.hub.dropped.fetch_add(1, Ordering::Relaxed);
                if first_loss {
                    warn!(
                        subscriber = id,
                        capacity = self.hub.config.subscriber_capacity,
                        "log subscriber overflow; dropping oldest lines"
                    );
                }
            }
        }
        drop(state);

        self.hub.published.fetch_add(1, Ordering::Relaxed);
    }

    /// End the stream: every subscription finishes after its queued lines.
    pub fn close(&self) {
        let mut state = self.hub.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for queue in state.subscribers.values() {
            queue.close();
        }
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.hub.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.lock().subscribers.len()
    }

    pub fn lines_published(&self) -> u64 {
        self.hub.published.load(Ordering::Relaxed)
    }

    /// Lines dropped across all subscribers because of overflow.
    pub fn lines_dropped(&self) -> u64 {
        self.hub.dropped.load(Ordering::Relaxed)
    }

    /// Up to `n` most recent lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogLine> {
        let state = self.hub.lock();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }
}
