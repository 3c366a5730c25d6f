//! Per-subscriber bounded queues and the [`LogSubscription`] handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use serde::Serialize;
use tokio::sync::Notify;

use super::Hub;
use crate::worker::LogLine;

/// A subscriber fell behind and lost lines (oldest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriberOverflow {
    pub subscriber_id: u64,
    pub dropped: u64,
}

struct QueueState {
    lines: VecDeque<LogLine>,
    closed: bool,
}

/// Bounded drop-oldest queue shared between the broadcaster (producer)
/// and one subscription (consumer).
pub(crate) struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                lines: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without ever blocking. Returns `true` if the oldest line had
    /// to be dropped to make room.
    pub(crate) fn push(&self, line: LogLine) -> bool {
        let overflowed = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let overflowed = state.lines.len() >= self.capacity;
            if overflowed {
                state.lines.pop_front();
            }
            state.lines.push_back(line);
            overflowed
        };
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        overflowed
    }

    /// No more lines will arrive; queued lines stay readable.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().lines.len()
    }
}

/// A live view of one run's output.
///
/// Yields lines in sequence order until the run's output ends. Dropping the
/// subscription detaches it; the drain loop carries on for everyone else.
pub struct LogSubscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    hub: Arc<Hub>,
}

impl std::fmt::Debug for LogSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSubscription")
            .field("id", &self.id)
            .field("queued", &self.queue.len())
            .field("dropped", &self.queue.dropped())
            .finish()
    }
}

impl LogSubscription {
    pub(crate) fn new(id: u64, queue: Arc<SubscriberQueue>, hub: Arc<Hub>) -> Self {
        Self { id, queue, hub }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next line. `None` once the run's output has ended and
    /// every queued line has been delivered.
    pub async fn next_line(&mut self) -> Option<LogLine> {
        loop {
            if let Some(line) = self.try_next_line() {
                return Some(line);
            }
            if self.queue.lock().closed {
                // A line may have raced in between the two checks.
                return self.try_next_line();
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take a queued line without waiting.
    pub fn try_next_line(&mut self) -> Option<LogLine> {
        self.queue.lock().lines.pop_front()
    }

    /// `true` once the output has ended and the queue is drained.
    pub fn is_finished(&self) -> bool {
        let state = self.queue.lock();
        state.closed && state.lines.is_empty()
    }

    /// Lines lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// The overflow condition, if this subscriber has lost any lines.
    pub fn overflow(&self) -> Option<SubscriberOverflow> {
        match self.dropped() {
            0 => None,
            dropped => Some(SubscriberOverflow {
                subscriber_id: self.id,
                dropped,
            }),
        }
    }

    /// Detach explicitly. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}

    /// Turn the subscription into a `Stream` of lines.
    pub fn into_stream(mut self) -> impl Stream<Item = LogLine> + Send {
        async_stream::stream! {
            while let Some(line) = self.next_line().await {
                yield line;
            }
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}
