//! Unbounded MPSC submission queue with close semantics.
//!
//! Producers (caller threads) `push`; the single consumer (the worker) pops.
//! `close()` stops intake: later pushes fail and hand the item back, items
//! pushed before the close are still delivered.
//!
//! A state word packs the CLOSED bit with the number of producers currently
//! inside `push`. A push increments the count, re-checks CLOSED and only
//! then enqueues; the consumer treats the queue as terminated only when the
//! word is exactly CLOSED (no producer mid-push) and the queue is empty.
//! That ordering means no item can land after the consumer has seen
//! "closed and drained".

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::{Parker, Unparker};

const CLOSED: usize = 1 << (usize::BITS - 1);

pub struct SubmissionQueue<T> {
    items: SegQueue<T>,
    /// CLOSED bit | producers inside push()
    state: AtomicUsize,
    unparker: Unparker,
    parks: AtomicU64,
}

impl<T> SubmissionQueue<T> {
    /// Create a queue whose consumer blocks on `parker`.
    pub fn new(parker: &Parker) -> Self {
        Self {
            items: SegQueue::new(),
            state: AtomicUsize::new(0),
            unparker: parker.unparker().clone(),
            parks: AtomicU64::new(0),
        }
    }

    /// Enqueue `item` and wake the consumer. Never blocks.
    ///
    /// Returns the item back if the queue is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        if prev & CLOSED != 0 {
            self.state.fetch_sub(1, Ordering::AcqRel);
            // The consumer may be parked waiting for this producer to leave.
            self.unparker.unpark();
            return Err(item);
        }
        self.items.push(item);
        self.state.fetch_sub(1, Ordering::AcqRel);
        self.unparker.unpark();
        Ok(())
    }

    /// Stop intake. Idempotent; returns `true` on the first call.
    pub fn close(&self) -> bool {
        let prev = self.state.fetch_or(CLOSED, Ordering::AcqRel);
        self.unparker.unpark();
        prev & CLOSED == 0
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    /// Closed, no producer mid-push, nothing left to pop.
    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED && self.items.is_empty()
    }

    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        self.items.pop()
    }

    /// Pop, parking the consumer while the queue is empty.
    ///
    /// Returns `None` once the queue is terminated, or when `interrupted()`
    /// reports other work for the consumer (checked before every park).
    /// Must only be called from the thread owning the `Parker`.
    pub fn pop_blocking(&self, parker: &Parker, mut interrupted: impl FnMut() -> bool) -> Option<T> {
        loop {
            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            if self.is_terminated() || interrupted() {
                return None;
            }
            self.parks.fetch_add(1, Ordering::Relaxed);
            parker.park();
        }
    }

    /// Wake a parked consumer without enqueuing anything.
    #[inline]
    pub fn notify(&self) {
        self.unparker.unpark();
    }

    /// Close the queue and take everything still in it, waiting out any
    /// producer that is mid-push.
    pub fn drain_remaining(&self) -> Vec<T> {
        self.close();
        let mut out = Vec::new();
        loop {
            while let Some(item) = self.items.pop() {
                out.push(item);
            }
            if self.is_terminated() {
                return out;
            }
            std::thread::yield_now();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Times the consumer parked.
    pub fn parks(&self) -> u64 {
        self.parks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_push_pop_fifo() {
        let parker = Parker::new();
        let q = SubmissionQueue::new(&parker);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        assert_eq!(q.len(), 5);
        for i in 0..5 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_close_rejects_and_keeps_queued() {
        let parker = Parker::new();
        let q = SubmissionQueue::new(&parker);
        q.push(1).unwrap();
        assert!(q.close());
        assert!(!q.close());

        assert_eq!(q.push(2), Err(2));
        assert!(q.is_closed());
        assert!(!q.is_terminated());

        assert_eq!(q.pop_blocking(&parker, || false), Some(1));
        assert!(q.is_terminated());
        assert_eq!(q.pop_blocking(&parker, || false), None);
    }

    #[test]
    fn test_pop_blocking_wakes_on_push() {
        let parker = Parker::new();
        let q = Arc::new(SubmissionQueue::new(&parker));
        let q2 = Arc::clone(&q);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            q2.push(7u32).unwrap();
        });

        assert_eq!(q.pop_blocking(&parker, || false), Some(7));
        t.join().unwrap();
    }

    #[test]
    fn test_pop_blocking_returns_on_close() {
        let parker = Parker::new();
        let q = Arc::new(SubmissionQueue::<u32>::new(&parker));
        let q2 = Arc::clone(&q);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            q2.close();
        });

        let start = Instant::now();
        assert_eq!(q.pop_blocking(&parker, || false), None);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(q.parks() >= 1);
        t.join().unwrap();
    }

    #[test]
    fn test_pop_blocking_interrupted() {
        let parker = Parker::new();
        let q = SubmissionQueue::<u32>::new(&parker);
        q.notify();
        let mut calls = 0;
        let got = q.pop_blocking(&parker, || {
            calls += 1;
            calls > 1
        });
        assert_eq!(got, None);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_no_push_lost_across_close() {
        let parker = Parker::new();
        let q = Arc::new(SubmissionQueue::new(&parker));
        let accepted = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                let accepted = Arc::clone(&accepted);
                thread::spawn(move || {
                    for i in 0..1000 {
                        if q.push(p * 1000 + i).is_ok() {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(1));
        q.close();

        let mut received = 0;
        while q.pop_blocking(&parker, || false).is_some() {
            received += 1;
        }
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(received, accepted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drain_remaining() {
        let parker = Parker::new();
        let q = SubmissionQueue::new(&parker);
        q.push("a").unwrap();
        q.push("b").unwrap();
        assert_eq!(q.drain_remaining(), vec!["a", "b"]);
        assert!(q.is_terminated());
        assert!(q.push("c").is_err());
    }
}
