//! `FramePump` — single-slot rendezvous between the capture callback thread
//! and the encoder pull thread.
//!
//! The producer never blocks: `publish` overwrites whatever is in the slot.
//! The consumer blocks in `wait_for_next` until a frame is pending or the
//! sticky `closed` flag is latched. Both flags live under the same mutex the
//! waiter re-checks after every wakeup, so a notification cannot be lost.

use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Result of one `wait_for_next` call.
#[derive(Debug)]
pub enum Next<T> {
    Frame(T),
    Closed,
}

impl<T> Next<T> {
    pub fn into_frame(self) -> Option<T> {
        match self {
            Self::Frame(frame) => Some(frame),
            Self::Closed => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// What happened to a frame handed to `publish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The slot was empty.
    Stored,
    /// An undelivered frame was dropped in favour of this one.
    Replaced,
    /// The pump is closed; the frame was dropped.
    Rejected,
}

/// Counters since the pump was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub published: u64,
    pub replaced: u64,
    pub delivered: u64,
    pub rejected: u64,
}

struct Slot<T> {
    pending: Option<T>,
    frame_ready: bool,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    replaced: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
}

pub struct FramePump<T> {
    slot: Mutex<Slot<T>>,
    signal: Condvar,
    counters: Counters,
}

impl<T> Default for FramePump<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FramePump<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot { pending: None, frame_ready: false, closed: false }),
            signal: Condvar::new(),
            counters: Counters::default(),
        }
    }

    /// Store `frame` as the newest one and wake the consumer.
    ///
    /// Any frame still waiting in the slot is dropped. Called from the capture
    /// delivery thread; never blocks beyond the slot lock.
    pub fn publish(&self, frame: T) -> Publish {
        let (outcome, dropped) = {
            let mut slot = self.slot.lock();
            if slot.closed {
                (Publish::Rejected, Some(frame))
            } else {
                let previous = slot.pending.replace(frame);
                slot.frame_ready = true;
                self.signal.notify_one();
                let outcome = if previous.is_some() { Publish::Replaced } else { Publish::Stored };
                (outcome, previous)
            }
        };
        // Native frames go back to their pool on drop; keep that outside the lock.
        drop(dropped);

        match outcome {
            Publish::Rejected => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Publish::Replaced => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
            }
            Publish::Stored => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Latch the sticky closed flag and wake every waiter.
    ///
    /// Returns `true` only for the call that actually closed the pump. A frame
    /// still pending is discarded.
    pub fn signal_closed(&self) -> bool {
        let discarded = {
            let mut slot = self.slot.lock();
            if slot.closed {
                return false;
            }
            slot.closed = true;
            slot.frame_ready = false;
            self.signal.notify_all();
            slot.pending.take()
        };
        drop(discarded);
        true
    }

    /// Block until a frame is pending or the pump is closed.
    ///
    /// `Closed` wins when both are true, and once returned it is returned by
    /// every later call. The frame handed out by the previous call is owned by
    /// the caller and released when it is dropped.
    pub fn wait_for_next(&self) -> Next<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(next) = self.try_take(&mut slot) {
                return next;
            }
            self.signal.wait(&mut slot);
        }
    }

    /// Like `wait_for_next`, but gives up after `timeout` and returns `None`.
    #[cfg(test)]
    fn wait_for_next_timeout(&self, timeout: Duration) -> Option<Next<T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(next) = self.try_take(&mut slot) {
                return Some(next);
            }
            if self.signal.wait_until(&mut slot, deadline).timed_out() {
                return self.try_take(&mut slot);
            }
        }
    }

    fn try_take(&self, slot: &mut Slot<T>) -> Option<Next<T>> {
        if slot.closed {
            return Some(Next::Closed);
        }
        if !slot.frame_ready {
            return None;
        }
        slot.frame_ready = false;
        let frame = slot.pending.take()?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Some(Next::Frame(frame))
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    /// Remove and return the pending frame without waiting. Used at teardown.
    pub fn take_pending(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        slot.frame_ready = false;
        slot.pending.take()
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            published: self.counters.published.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const PATIENCE: Duration = Duration::from_secs(5);

    /// Counts how many values are still alive.
    struct Tracked(u32, Arc<AtomicUsize>);

    impl Tracked {
        fn new(id: u32, live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self(id, Arc::clone(live))
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pending_frame_is_returned_without_blocking() {
        let pump = FramePump::new();
        assert_eq!(pump.publish(7), Publish::Stored);
        assert_eq!(pump.wait_for_next().into_frame(), Some(7));
        assert!(pump.wait_for_next_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn newest_frame_wins_and_older_is_released() {
        let live = Arc::new(AtomicUsize::new(0));
        let pump = FramePump::new();
        assert_eq!(pump.publish(Tracked::new(1, &live)), Publish::Stored);
        assert_eq!(pump.publish(Tracked::new(2, &live)), Publish::Replaced);
        assert_eq!(live.load(Ordering::SeqCst), 1);

        let frame = pump.wait_for_next().into_frame().unwrap();
        assert_eq!(frame.0, 2);
        drop(frame);
        assert_eq!(live.load(Ordering::SeqCst), 0);

        let stats = pump.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn closed_takes_precedence_over_pending_frame() {
        let live = Arc::new(AtomicUsize::new(0));
        let pump = FramePump::new();
        pump.publish(Tracked::new(1, &live));
        assert!(pump.signal_closed());

        assert!(pump.wait_for_next().is_closed());
        assert_eq!(live.load(Ordering::SeqCst), 0, "pending frame discarded on close");
    }

    #[test]
    fn close_is_sticky_and_idempotent() {
        let pump = FramePump::new();
        assert!(pump.signal_closed());
        assert!(!pump.signal_closed());

        assert_eq!(pump.publish(1), Publish::Rejected);
        for _ in 0..3 {
            assert!(pump.wait_for_next().is_closed());
        }
        assert_eq!(pump.stats().rejected, 1);
        assert_eq!(pump.stats().delivered, 0);
    }

    #[test]
    fn waiter_wakes_on_frame_from_another_thread() {
        let pump = Arc::new(FramePump::new());
        let consumer = {
            let pump = Arc::clone(&pump);
            thread::spawn(move || pump.wait_for_next_timeout(PATIENCE))
        };
        thread::sleep(Duration::from_millis(20));
        pump.publish(42u32);

        let next = consumer.join().unwrap().expect("consumer woke up");
        assert_eq!(next.into_frame(), Some(42));
    }

    #[test]
    fn waiter_wakes_on_close_from_another_thread() {
        let pump = Arc::new(FramePump::<u32>::new());
        let consumer = {
            let pump = Arc::clone(&pump);
            thread::spawn(move || pump.wait_for_next_timeout(PATIENCE))
        };
        thread::sleep(Duration::from_millis(20));
        pump.signal_closed();

        assert!(consumer.join().unwrap().expect("consumer woke up").is_closed());
    }

    #[test]
    fn frames_arrive_in_order_and_nothing_after_close() {
        let pump = Arc::new(FramePump::new());
        let producer = {
            let pump = Arc::clone(&pump);
            thread::spawn(move || {
                for id in 0..500u32 {
                    pump.publish(id);
                    if id % 16 == 0 {
                        thread::yield_now();
                    }
                }
                pump.signal_closed();
            })
        };

        let mut seen = Vec::new();
        loop {
            match pump.wait_for_next_timeout(PATIENCE).expect("producer never stalls") {
                Next::Frame(id) => seen.push(id),
                Next::Closed => break,
            }
        }
        producer.join().unwrap();

        assert!(seen.windows(2).all(|w| w[0] < w[1]), "strictly increasing: {seen:?}");
        for _ in 0..3 {
            assert!(pump.wait_for_next().is_closed());
        }
        let stats = pump.stats();
        assert_eq!(stats.delivered as usize, seen.len());
        assert_eq!(stats.published, 500);
    }

    #[test]
    fn take_pending_clears_slot() {
        let pump = FramePump::new();
        pump.publish("frame");
        assert_eq!(pump.take_pending(), Some("frame"));
        assert_eq!(pump.take_pending(), None);
        assert!(pump.wait_for_next_timeout(Duration::from_millis(10)).is_none());
    }
}
