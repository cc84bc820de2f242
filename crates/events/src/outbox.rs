//! Per-session bounded outbound buffer.
//!
//! A fixed-capacity ring of pre-serialized frames. Producers never wait: when
//! the ring is full the oldest frame is discarded and the session is owed a
//! resync marker, which the consumer receives before any newer frame.
//! Closing cancels everything still buffered.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Why an outbox was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client went away or asked to close.
    Disconnected,
    /// Server forced the session out (e.g. permission revoked).
    Evicted(String),
}

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Queued after discarding the oldest buffered frame.
    Overflowed,
    Closed,
}

/// Item handed to the connection writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxItem {
    Frame(Arc<str>),
    Resync { dropped: u64 },
    Closed(CloseReason),
}

#[derive(Debug)]
struct State {
    frames: VecDeque<Arc<str>>,
    dropped: u64,
    closed: Option<CloseReason>,
}

#[derive(Debug)]
pub struct Outbox {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                frames: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: None,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    pub fn push(&self, frame: Arc<str>) -> Pushed {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return Pushed::Closed;
            }
            let outcome = if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.dropped += 1;
                Pushed::Overflowed
            } else {
                Pushed::Queued
            };
            state.frames.push_back(frame);
            outcome
        };
        // Single consumer: a stored permit covers a consumer not yet waiting.
        self.notify.notify_one();
        outcome
    }

    pub fn try_pop(&self) -> Option<OutboxItem> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.closed {
            return Some(OutboxItem::Closed(reason.clone()));
        }
        if state.dropped > 0 {
            let dropped = std::mem::take(&mut state.dropped);
            return Some(OutboxItem::Resync { dropped });
        }
        state.frames.pop_front().map(OutboxItem::Frame)
    }

    /// Wait for the next item. Returns `Closed` forever once closed.
    pub async fn next(&self) -> OutboxItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Close and discard everything still buffered. Idempotent; the first
    /// reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.frames.clear();
            state.dropped = 0;
            state.closed = Some(reason);
        }
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn delivers_in_order_under_capacity() {
        let outbox = Outbox::new(4);
        assert_eq!(outbox.push(frame("a")), Pushed::Queued);
        assert_eq!(outbox.push(frame("b")), Pushed::Queued);

        assert_eq!(outbox.try_pop(), Some(OutboxItem::Frame(frame("a"))));
        assert_eq!(outbox.try_pop(), Some(OutboxItem::Frame(frame("b"))));
        assert_eq!(outbox.try_pop(), None);
    }

    #[test]
    fn overflow_drops_oldest_and_owes_resync() {
        let outbox = Outbox::new(2);
        outbox.push(frame("1"));
        outbox.push(frame("2"));
        assert_eq!(outbox.push(frame("3")), Pushed::Overflowed);
        assert_eq!(outbox.push(frame("4")), Pushed::Overflowed);
        assert_eq!(outbox.len(), 2);

        assert_eq!(outbox.try_pop(), Some(OutboxItem::Resync { dropped: 2 }));
        assert_eq!(outbox.try_pop(), Some(OutboxItem::Frame(frame("3"))));
        assert_eq!(outbox.try_pop(), Some(OutboxItem::Frame(frame("4"))));
        assert_eq!(outbox.try_pop(), None);
    }

    #[test]
    fn close_cancels_pending_frames() {
        let outbox = Outbox::new(8);
        outbox.push(frame("pending"));
        outbox.close(CloseReason::Evicted("revoked".into()));
        outbox.close(CloseReason::Disconnected);

        assert_eq!(outbox.push(frame("late")), Pushed::Closed);
        assert_eq!(
            outbox.try_pop(),
            Some(OutboxItem::Closed(CloseReason::Evicted("revoked".into())))
        );
    }

    #[tokio::test]
    async fn next_wakes_on_push() {
        let outbox = Arc::new(Outbox::new(8));
        let consumer = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.next().await })
        };
        tokio::task::yield_now().await;
        outbox.push(frame("hello"));

        assert_eq!(consumer.await.unwrap(), OutboxItem::Frame(frame("hello")));
    }

    proptest::proptest! {
        #[test]
        fn never_exceeds_capacity(capacity in 1usize..16, pushes in 0usize..64) {
            let outbox = Outbox::new(capacity);
            for i in 0..pushes {
                outbox.push(Arc::from(i.to_string()));
            }
            proptest::prop_assert!(outbox.len() <= capacity);

            let mut frames = 0usize;
            let mut dropped = 0u64;
            while let Some(item) = outbox.try_pop() {
                match item {
                    OutboxItem::Frame(_) => frames += 1,
                    OutboxItem::Resync { dropped: n } => dropped += n,
                    OutboxItem::Closed(_) => unreachable!(),
                }
            }
            proptest::prop_assert_eq!(frames as u64 + dropped, pushes as u64);
        }
    }
}
