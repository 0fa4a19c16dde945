//! Single-assignment completion slot.
//!
//! A `CompletionSlot` is the write side: shared between the worker's in-flight
//! registry and the multi-handle, written exactly once. A `ResponseFuture` is
//! the read side, held by the submitting caller, and can be awaited or
//! blocked on.
//!
//! Resolution order:
//! 1. state flips to `Resolved` under the lock (first writer wins)
//! 2. blocked waiters are notified, the async waker is woken
//! 3. `on_resolved` hooks run, outside the lock, on the resolving thread

use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};

use crate::error::RequestError;

type ResolvedHook = Box<dyn FnOnce() + Send>;

enum SlotState<T> {
    Pending { hooks: Vec<ResolvedHook> },
    /// `None` once the caller has taken the value.
    Resolved(Option<Result<T, RequestError>>),
}

struct SlotInner<T> {
    state: Mutex<SlotState<T>>,
    resolved: AtomicBool,
    cond: Condvar,
    waker: AtomicWaker,
}

/// Write side of a single-assignment result cell.
pub struct CompletionSlot<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> Clone for CompletionSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> CompletionSlot<T> {
    /// Create a slot and the future that observes it.
    pub fn new() -> (Self, ResponseFuture<T>) {
        let inner = Arc::new(SlotInner {
            state: Mutex::new(SlotState::Pending { hooks: Vec::new() }),
            resolved: AtomicBool::new(false),
            cond: Condvar::new(),
            waker: AtomicWaker::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            ResponseFuture { inner },
        )
    }

    /// Write the result. Only the first call has any effect.
    ///
    /// Returns `true` if this call resolved the slot.
    pub fn complete(&self, result: Result<T, RequestError>) -> bool {
        let hooks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                SlotState::Pending { hooks } => {
                    let hooks = std::mem::take(hooks);
                    *state = SlotState::Resolved(Some(result));
                    self.inner.resolved.store(true, Ordering::Release);
                    hooks
                }
                SlotState::Resolved(_) => return false,
            }
        };

        self.inner.cond.notify_all();
        self.inner.waker.wake();
        for hook in hooks {
            hook();
        }
        true
    }

    #[inline]
    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    #[inline]
    pub fn fail(&self, error: RequestError) -> bool {
        self.complete(Err(error))
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }

    /// Run `hook` once the slot resolves; immediately if it already has.
    pub fn on_resolved<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if let SlotState::Pending { hooks } = &mut *state {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl<T> core::fmt::Debug for CompletionSlot<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("resolved", &self.inner.resolved.load(Ordering::Acquire))
            .finish()
    }
}

/// Read side of a completion slot, owned by the submitting caller.
///
/// Await it from async code or call `wait()` from a plain thread. Dropping it
/// does not cancel the request; cancel the request's `ExecutionContext`.
pub struct ResponseFuture<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> ResponseFuture<T> {
    /// A future that is already resolved with `error`.
    pub fn failed(error: RequestError) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                state: Mutex::new(SlotState::Resolved(Some(Err(error)))),
                resolved: AtomicBool::new(true),
                cond: Condvar::new(),
                waker: AtomicWaker::new(),
            }),
        }
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }

    /// Block the calling thread until the slot resolves.
    pub fn wait(self) -> Result<T, RequestError> {
        let mut state = self.inner.state.lock();
        loop {
            if let SlotState::Resolved(value) = &mut *state {
                return take_value(value);
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Block for at most `timeout`. Gives the future back on timeout.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, RequestError>, Self> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.inner.state.lock();
            loop {
                if let SlotState::Resolved(value) = &mut *state {
                    return Ok(take_value(value));
                }
                if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                    if let SlotState::Resolved(value) = &mut *state {
                        return Ok(take_value(value));
                    }
                    break;
                }
            }
        }
        Err(self)
    }

    fn try_take(&self) -> Option<Result<T, RequestError>> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            SlotState::Resolved(value) => Some(take_value(value)),
            SlotState::Pending { .. } => None,
        }
    }
}

fn take_value<T>(value: &mut Option<Result<T, RequestError>>) -> Result<T, RequestError> {
    // The future is consumed by value in wait() and never polled after Ready,
    // so the value is present exactly once.
    value
        .take()
        .expect("ResponseFuture polled after completion")
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_resolved() {
            if let Some(result) = self.try_take() {
                return Poll::Ready(result);
            }
        }

        self.inner.waker.register(cx.waker());

        // Re-check after registering so a resolution racing the register
        // is not lost.
        if self.is_resolved() {
            if let Some(result) = self.try_take() {
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    }
}

impl<T> core::fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelCause;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_exactly_once() {
        let (slot, fut) = CompletionSlot::<u32>::new();
        assert!(!slot.is_resolved());

        assert!(slot.succeed(1));
        assert!(!slot.succeed(2));
        assert!(!slot.fail(RequestError::QueueClosed));
        assert!(slot.is_resolved());

        assert_eq!(fut.wait(), Ok(1));
    }

    #[test]
    fn test_hooks_run_once_after_resolution() {
        let (slot, _fut) = CompletionSlot::<u32>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        slot.on_resolved(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        slot.fail(RequestError::Cancelled(CancelCause::cancelled("t")));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Late registration runs immediately
        let c = Arc::clone(&counter);
        slot.on_resolved(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        slot.succeed(5);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_blocking_wait_across_threads() {
        let (slot, fut) = CompletionSlot::<String>::new();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            slot.succeed("done".to_string());
        });
        assert_eq!(fut.wait(), Ok("done".to_string()));
        t.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_returns_future() {
        let (slot, fut) = CompletionSlot::<u8>::new();
        let fut = match fut.wait_timeout(Duration::from_millis(10)) {
            Ok(_) => panic!("should have timed out"),
            Err(fut) => fut,
        };
        slot.succeed(9);
        assert_eq!(fut.wait_timeout(Duration::from_millis(10)).ok(), Some(Ok(9)));
    }

    #[test]
    fn test_async_await() {
        let (slot, fut) = CompletionSlot::<u64>::new();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            slot.succeed(42);
        });
        let result = futures::executor::block_on(fut);
        assert_eq!(result, Ok(42));
        t.join().unwrap();
    }

    #[test]
    fn test_failed_future() {
        let fut = ResponseFuture::<u8>::failed(RequestError::QueueClosed);
        assert!(fut.is_resolved());
        assert_eq!(futures::executor::block_on(fut), Err(RequestError::QueueClosed));
    }

    #[test]
    fn test_racing_writers() {
        let (slot, fut) = CompletionSlot::<usize>::new();
        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let slot = slot.clone();
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    if slot.succeed(i) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(fut.wait().is_ok());
    }
}
