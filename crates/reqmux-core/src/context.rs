//! Execution context for cooperative cancellation
//!
//! Every request carries an `ExecutionContext`, a cancellable scope owned by
//! the caller. The worker registers a hook on it when the request is handed to
//! the multi-handle; if the context ends abnormally before the request
//! completes, the hook posts a cancellation back onto the worker.
//!
//! Contexts can be linked into parent-child chains: cancelling a parent
//! cancels every live child with the same cause. A child never affects its
//! parent.
//!
//! Hooks are one-shot. Each registration owns an armed flag; firing and
//! disposing both race for it with a compare-and-swap, so a hook either runs
//! exactly once or never.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::RequestError;

/// Why a context was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Explicit cancellation by the owner.
    Cancelled,
    /// The owning scope failed.
    Failed,
}

/// Cause attached to an abnormal context completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCause {
    pub kind: CancelKind,
    pub message: String,
}

impl CancelCause {
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: CancelKind::Cancelled,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: CancelKind::Failed,
            message: message.into(),
        }
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CancelKind::Cancelled => write!(f, "cancelled ({})", self.message),
            CancelKind::Failed => write!(f, "scope failed ({})", self.message),
        }
    }
}

type CancelHook = Box<dyn FnOnce(&CancelCause) + Send>;

struct HookCell {
    armed: AtomicBool,
    hook: Mutex<Option<CancelHook>>,
}

impl HookCell {
    fn new(hook: CancelHook) -> Self {
        Self {
            armed: AtomicBool::new(true),
            hook: Mutex::new(Some(hook)),
        }
    }

    /// Claim the armed flag. Only the winner may run or drop the hook.
    fn disarm(&self) -> bool {
        self.armed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn fire(&self, cause: &CancelCause) {
        if self.disarm() {
            if let Some(hook) = self.hook.lock().take() {
                hook(cause);
            }
        }
    }
}

enum ContextState {
    Active {
        hooks: Vec<(u64, Arc<HookCell>)>,
        next_hook: u64,
    },
    Cancelled(CancelCause),
    Completed,
}

struct ContextInner {
    state: Mutex<ContextState>,
    /// Mirrors `state == Cancelled` for lock-free checks.
    cancelled: AtomicBool,
    /// Registration on the parent, disposed when this context ends.
    parent_link: Mutex<Option<HookRegistration>>,
}

/// Caller-owned cancellable scope.
///
/// Cloning shares state. `complete()` ends the scope normally and discards
/// all hooks; `cancel()` ends it abnormally and runs them.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Create a new independent context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                state: Mutex::new(ContextState::Active {
                    hooks: Vec::new(),
                    next_hook: 0,
                }),
                cancelled: AtomicBool::new(false),
                parent_link: Mutex::new(None),
            }),
        }
    }

    /// Create a child context.
    ///
    /// If this context is cancelled, the child is cancelled with the same
    /// cause. If this context is already cancelled, the child starts
    /// cancelled.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let weak: Weak<ContextInner> = Arc::downgrade(&child.inner);
        let link = self.on_cancel(move |cause| {
            if let Some(inner) = weak.upgrade() {
                ExecutionContext { inner }.cancel_with(cause.clone());
            }
        });
        if link.is_armed() {
            *child.inner.parent_link.lock() = Some(link);
        }
        child
    }

    /// Cancel with a plain reason.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.cancel_with(CancelCause::cancelled(reason))
    }

    /// End the context abnormally and run every armed hook.
    ///
    /// Returns `false` if the context had already ended.
    pub fn cancel_with(&self, cause: CancelCause) -> bool {
        let hooks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                ContextState::Active { hooks, .. } => {
                    let hooks = std::mem::take(hooks);
                    *state = ContextState::Cancelled(cause.clone());
                    self.inner.cancelled.store(true, Ordering::Release);
                    hooks
                }
                _ => return false,
            }
        };

        for (_, cell) in hooks {
            cell.fire(&cause);
        }
        self.release_parent_link();
        true
    }

    /// End the context normally. Registered hooks are discarded unrun.
    ///
    /// Returns `false` if the context had already ended.
    pub fn complete(&self) -> bool {
        let hooks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                ContextState::Active { hooks, .. } => {
                    let hooks = std::mem::take(hooks);
                    *state = ContextState::Completed;
                    hooks
                }
                _ => return false,
            }
        };

        for (_, cell) in hooks {
            if cell.disarm() {
                cell.hook.lock().take();
            }
        }
        self.release_parent_link();
        true
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// True once the context ended, normally or not.
    pub fn is_finished(&self) -> bool {
        !matches!(&*self.inner.state.lock(), ContextState::Active { .. })
    }

    /// The cancellation cause, if cancelled.
    pub fn cause(&self) -> Option<CancelCause> {
        match &*self.inner.state.lock() {
            ContextState::Cancelled(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    /// `Err(Cancelled)` if the context was cancelled.
    #[inline]
    pub fn check(&self) -> Result<(), RequestError> {
        if !self.is_cancelled() {
            return Ok(());
        }
        match self.cause() {
            Some(cause) => Err(RequestError::Cancelled(cause)),
            None => Ok(()),
        }
    }

    /// Register a one-shot hook that runs if this context is cancelled.
    ///
    /// - Active context: the hook is stored until cancel, complete or dispose.
    /// - Already cancelled: the hook runs now, on the calling thread.
    /// - Already completed: the hook is dropped unrun.
    pub fn on_cancel<F>(&self, hook: F) -> HookRegistration
    where
        F: FnOnce(&CancelCause) + Send + 'static,
    {
        let cell = Arc::new(HookCell::new(Box::new(hook)));
        let mut state = self.inner.state.lock();
        match &mut *state {
            ContextState::Active { hooks, next_hook } => {
                let id = *next_hook;
                *next_hook += 1;
                hooks.push((id, Arc::clone(&cell)));
                HookRegistration {
                    cell,
                    owner: Arc::downgrade(&self.inner),
                    id,
                }
            }
            ContextState::Cancelled(cause) => {
                let cause = cause.clone();
                drop(state);
                cell.fire(&cause);
                HookRegistration::detached(cell)
            }
            ContextState::Completed => {
                drop(state);
                if cell.disarm() {
                    cell.hook.lock().take();
                }
                HookRegistration::detached(cell)
            }
        }
    }

    /// Number of hooks still registered (diagnostics).
    pub fn hook_count(&self) -> usize {
        match &*self.inner.state.lock() {
            ContextState::Active { hooks, .. } => hooks.len(),
            _ => 0,
        }
    }

    fn release_parent_link(&self) {
        if let Some(link) = self.inner.parent_link.lock().take() {
            link.dispose();
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle to a hook registered with [`ExecutionContext::on_cancel`].
///
/// Dropping the registration does NOT dispose it; call `dispose()`.
pub struct HookRegistration {
    cell: Arc<HookCell>,
    owner: Weak<ContextInner>,
    id: u64,
}

impl HookRegistration {
    fn detached(cell: Arc<HookCell>) -> Self {
        Self {
            cell,
            owner: Weak::new(),
            id: u64::MAX,
        }
    }

    /// Disarm the hook. Idempotent; a no-op once the hook has fired.
    ///
    /// Returns `true` if this call disarmed a still-pending hook.
    pub fn dispose(&self) -> bool {
        if !self.cell.disarm() {
            return false;
        }
        self.cell.hook.lock().take();
        if let Some(owner) = self.owner.upgrade() {
            if let ContextState::Active { hooks, .. } = &mut *owner.state.lock() {
                hooks.retain(|(id, _)| *id != self.id);
            }
        }
        true
    }

    /// True while the hook can still fire.
    pub fn is_armed(&self) -> bool {
        self.cell.armed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> impl FnOnce(&CancelCause) + Send + 'static {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_basic_cancellation() {
        let ctx = ExecutionContext::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check().is_ok());

        assert!(ctx.cancel("stop"));
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(RequestError::Cancelled(_))));
        assert_eq!(ctx.cause(), Some(CancelCause::cancelled("stop")));

        // Second cancel is a no-op
        assert!(!ctx.cancel("again"));
        assert_eq!(ctx.cause(), Some(CancelCause::cancelled("stop")));
    }

    #[test]
    fn test_hook_fires_once_with_cause() {
        let ctx = ExecutionContext::new();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let reg = ctx.on_cancel(move |cause| {
            *seen2.lock() = Some(cause.clone());
        });
        assert!(reg.is_armed());

        ctx.cancel_with(CancelCause::failed("parent crashed"));
        assert_eq!(*seen.lock(), Some(CancelCause::failed("parent crashed")));
        assert!(!reg.is_armed());
        assert!(!reg.dispose());
    }

    #[test]
    fn test_complete_discards_hooks() {
        let ctx = ExecutionContext::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let reg = ctx.on_cancel(counting_hook(&counter));

        assert!(ctx.complete());
        assert!(!ctx.cancel("late"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!reg.is_armed());
        assert!(ctx.is_finished());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_dispose_prevents_fire() {
        let ctx = ExecutionContext::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let reg = ctx.on_cancel(counting_hook(&counter));
        assert_eq!(ctx.hook_count(), 1);

        assert!(reg.dispose());
        assert!(!reg.dispose());
        assert_eq!(ctx.hook_count(), 0);

        ctx.cancel("after dispose");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_register_on_cancelled_runs_immediately() {
        let ctx = ExecutionContext::new();
        ctx.cancel("early");

        let counter = Arc::new(AtomicUsize::new(0));
        let reg = ctx.on_cancel(counting_hook(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!reg.is_armed());
    }

    #[test]
    fn test_register_on_completed_never_runs() {
        let ctx = ExecutionContext::new();
        ctx.complete();

        let counter = Arc::new(AtomicUsize::new(0));
        let reg = ctx.on_cancel(counting_hook(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!reg.is_armed());
    }

    #[test]
    fn test_child_token() {
        let parent = ExecutionContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel("shutdown");
        assert!(child.is_cancelled());
        assert_eq!(child.cause(), Some(CancelCause::cancelled("shutdown")));
    }

    #[test]
    fn test_child_independent_cancel() {
        let parent = ExecutionContext::new();
        let child = parent.child();
        assert_eq!(parent.hook_count(), 1);

        child.cancel("child only");
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        // Child released its link on the parent
        assert_eq!(parent.hook_count(), 0);
    }

    #[test]
    fn test_deep_hierarchy() {
        let root = ExecutionContext::new();
        let level1 = root.child();
        let level2 = level1.child();
        let level3 = level2.child();

        root.cancel("root");
        assert!(level1.is_cancelled());
        assert!(level2.is_cancelled());
        assert!(level3.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent() {
        let parent = ExecutionContext::new();
        parent.cancel("gone");
        let child = parent.child();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_concurrent_cancel_and_dispose() {
        for _ in 0..200 {
            let ctx = ExecutionContext::new();
            let counter = Arc::new(AtomicUsize::new(0));
            let reg = ctx.on_cancel(counting_hook(&counter));

            let ctx2 = ctx.clone();
            let t = std::thread::spawn(move || {
                ctx2.cancel("race");
            });
            let disposed = reg.dispose();
            t.join().unwrap();

            // Exactly one side won the armed flag
            let fired = counter.load(Ordering::SeqCst);
            assert_eq!(fired + disposed as usize, 1);
        }
    }
}
