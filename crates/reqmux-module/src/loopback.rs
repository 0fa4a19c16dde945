//! `LoopbackMulti`: in-process `MultiHandle` that simulates transfers.
//!
//! No sockets. Each scheduled request is answered by a responder closure
//! with a `Reply` (response or transport error) and a completion delay.
//! `perform()` blocks on the platform wakeup until the next reply is due or
//! the poll interval elapses, whichever is first, then resolves every due
//! transfer.
//!
//! The default responder echoes the request body with status 200 and obeys
//! three request headers:
//!
//! | Header | Effect |
//! |---|---|
//! | `x-loopback-delay-ms: N` | complete after N ms instead of the configured latency |
//! | `x-loopback-hang: 1` | never complete (only cancel or close resolves it) |
//! | `x-loopback-fail: CODE` | fail with `TransportError { code: CODE, .. }` |
//!
//! A shared `LoopbackProbe` counts calls so tests can observe what the
//! worker did, including calls made from a thread other than the owner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqmux_core::completion::CompletionSlot;
use reqmux_core::context::CancelCause;
use reqmux_core::env::env_get_millis;
use reqmux_core::error::{MuxError, RequestError, Result, TransportError};
use reqmux_core::multi::MultiHandle;
use reqmux_core::request::{RequestData, Response};
use reqmux_core::wakeup::{Wakeup, WakeupWait};
use reqmux_core::{kdebug, ktrace, kwarn};

use crate::PlatformWakeup;

/// curl's code for a malformed URL; used for requests with an empty URL.
const URL_MALFORMED: i32 = 3;

// ── Config ──

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Upper bound on one blocking `perform()`.
    pub poll_interval: Duration,
    /// Completion delay for replies that do not pick their own.
    pub latency: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            latency: Duration::ZERO,
        }
    }
}

impl LoopbackConfig {
    /// Defaults overridden by `REQMUX_LOOPBACK_POLL_MS` and
    /// `REQMUX_LOOPBACK_LATENCY_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_get_millis("REQMUX_LOOPBACK_POLL_MS", d.poll_interval),
            latency: env_get_millis("REQMUX_LOOPBACK_LATENCY_MS", d.latency),
        }
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

// ── Replies ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delay {
    Latency,
    After(Duration),
    Never,
}

/// What the loopback does with one request.
#[derive(Debug, Clone)]
pub struct Reply {
    outcome: std::result::Result<Response, TransportError>,
    delay: Delay,
}

impl Reply {
    pub fn ok(response: Response) -> Self {
        Self {
            outcome: Ok(response),
            delay: Delay::Latency,
        }
    }

    pub fn error(error: TransportError) -> Self {
        Self {
            outcome: Err(error),
            delay: Delay::Latency,
        }
    }

    /// Complete after `delay` instead of the configured latency.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Delay::After(delay);
        self
    }

    /// Never complete on its own.
    pub fn never(mut self) -> Self {
        self.delay = Delay::Never;
        self
    }
}

pub type Responder = Box<dyn FnMut(&RequestData) -> Reply + Send>;

/// Echo responder driven by `x-loopback-*` request headers.
pub fn echo(request: &RequestData) -> Reply {
    if let Some(code) = request.header_value("x-loopback-fail") {
        let code = code.trim().parse().unwrap_or(-1);
        return Reply::error(TransportError::new(code, "injected transport failure"));
    }

    let response = Response::new(200)
        .with_header("x-loopback-method", request.method.as_str())
        .with_body(request.body.clone());
    let mut reply = Reply::ok(response);

    if request.header_value("x-loopback-hang").is_some() {
        reply = reply.never();
    } else if let Some(ms) = request
        .header_value("x-loopback-delay-ms")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        reply = reply.after(Duration::from_millis(ms));
    }
    reply
}

// ── Probe ──

/// Call counters shared between a `LoopbackMulti` and its observers.
#[derive(Debug, Default)]
pub struct LoopbackProbe {
    scheduled: AtomicU64,
    performed: AtomicU64,
    cancelled: AtomicU64,
    completed: AtomicU64,
    closed: AtomicU64,
    foreign_calls: AtomicU64,
    cancelled_handles: Mutex<Vec<TransferHandle>>,
}

impl LoopbackProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn performed(&self) -> u64 {
        self.performed.load(Ordering::Acquire)
    }

    /// Number of `cancel()` calls.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Transfers resolved by `perform()`.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Number of `close()` calls that took effect.
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Acquire)
    }

    /// Calls made from a thread other than the one that built the handle.
    pub fn foreign_calls(&self) -> u64 {
        self.foreign_calls.load(Ordering::Acquire)
    }

    pub fn cancelled_handles(&self) -> Vec<TransferHandle> {
        self.cancelled_handles.lock().clone()
    }
}

// ── Multi-handle ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub u64);

struct Transfer {
    handle: TransferHandle,
    slot: CompletionSlot<Response>,
    outcome: std::result::Result<Response, TransportError>,
    /// `None` = never due.
    due: Option<Instant>,
}

pub struct LoopbackMulti {
    config: LoopbackConfig,
    wakeup: Arc<PlatformWakeup>,
    responder: Responder,
    transfers: Vec<Transfer>,
    next_handle: u64,
    probe: Arc<LoopbackProbe>,
    owner: ThreadId,
    fail_after: Option<u64>,
    closed: bool,
}

impl LoopbackMulti {
    /// Build on the calling thread, which becomes the owner.
    pub fn new(config: LoopbackConfig) -> Result<Self> {
        let wakeup = Arc::new(PlatformWakeup::create()?);
        Ok(Self {
            config,
            wakeup,
            responder: Box::new(echo),
            transfers: Vec::new(),
            next_handle: 1,
            probe: LoopbackProbe::new(),
            owner: thread::current().id(),
            fail_after: None,
            closed: false,
        })
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&RequestData) -> Reply + Send + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    pub fn with_probe(mut self, probe: Arc<LoopbackProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Make every `perform()` after the first `n` return an error.
    pub fn fail_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn probe(&self) -> Arc<LoopbackProbe> {
        Arc::clone(&self.probe)
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    fn check_owner(&self, op: &str) {
        if thread::current().id() != self.owner {
            self.probe.foreign_calls.fetch_add(1, Ordering::AcqRel);
            kwarn!("loopback: {} called off the owner thread", op);
        }
    }

    fn wait_timeout(&self, now: Instant) -> Duration {
        let next_due = self.transfers.iter().filter_map(|t| t.due).min();
        match next_due {
            Some(due) => due.saturating_duration_since(now).min(self.config.poll_interval),
            None => self.config.poll_interval,
        }
    }
}

impl MultiHandle for LoopbackMulti {
    type Handle = TransferHandle;

    fn schedule(
        &mut self,
        request: RequestData,
        completion: CompletionSlot<Response>,
    ) -> std::result::Result<TransferHandle, RequestError> {
        self.check_owner("schedule");
        if self.closed {
            return Err(RequestError::LoopTerminated("multi handle closed".into()));
        }
        if request.url.is_empty() {
            return Err(TransportError::new(URL_MALFORMED, "URL malformed").into());
        }

        let reply = (self.responder)(&request);
        let now = Instant::now();
        let due = match reply.delay {
            Delay::Latency => Some(now + self.config.latency),
            Delay::After(d) => Some(now + d),
            Delay::Never => None,
        };

        let handle = TransferHandle(self.next_handle);
        self.next_handle += 1;
        self.transfers.push(Transfer {
            handle,
            slot: completion,
            outcome: reply.outcome,
            due,
        });
        self.probe.scheduled.fetch_add(1, Ordering::AcqRel);
        ktrace!("loopback: scheduled {:?} {} {}", handle, request.method, request.url);
        Ok(handle)
    }

    fn perform(&mut self) -> Result<()> {
        self.check_owner("perform");
        if self.closed {
            return Err(MuxError::Perform("perform after close".into()));
        }
        let n = self.probe.performed.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(limit) = self.fail_after {
            if n > limit {
                return Err(MuxError::Perform(format!(
                    "injected failure after {} performs",
                    limit
                )));
            }
        }

        // Slots failed elsewhere (worker-side cancel) are finished transfers.
        self.transfers.retain(|t| !t.slot.is_resolved());
        if self.transfers.is_empty() {
            return Ok(());
        }

        let timeout = self.wait_timeout(Instant::now());
        if !timeout.is_zero() {
            self.wakeup.wait(Some(timeout))?;
        }

        let now = Instant::now();
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.transfers)
            .into_iter()
            .partition(|t| t.due.is_some_and(|due| due <= now));
        self.transfers = pending;

        for t in done {
            if t.slot.complete(t.outcome.map_err(RequestError::Transport)) {
                self.probe.completed.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wakeup> {
        self.wakeup.clone()
    }

    fn cancel(&mut self, handle: TransferHandle, cause: &CancelCause) {
        self.check_owner("cancel");
        self.probe.cancelled.fetch_add(1, Ordering::AcqRel);
        self.probe.cancelled_handles.lock().push(handle);

        if let Some(pos) = self.transfers.iter().position(|t| t.handle == handle) {
            let t = self.transfers.remove(pos);
            t.slot.fail(RequestError::Cancelled(cause.clone()));
            kdebug!("loopback: cancelled {:?}: {}", handle, cause);
        }
    }

    fn has_pending_work(&self) -> bool {
        self.check_owner("has_pending_work");
        self.transfers.iter().any(|t| !t.slot.is_resolved())
    }

    fn close(&mut self) {
        self.check_owner("close");
        if self.closed {
            return;
        }
        self.closed = true;
        self.probe.closed.fetch_add(1, Ordering::AcqRel);
        for t in self.transfers.drain(..) {
            t.slot
                .fail(RequestError::LoopTerminated("multi handle closed".into()));
        }
    }
}
