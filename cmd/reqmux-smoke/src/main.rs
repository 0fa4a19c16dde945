//! reqmux End-to-End Smoke Test
//!
//! Drives a real `Processor` over `LoopbackMulti`:
//!   Part A: Wakeup: platform wakeup interrupts a blocking wait
//!   Part B: Round trips: blocking, async, concurrent submitters
//!   Part C: Cancellation: before completion, after completion
//!   Part D: Shutdown: queued requests served, submit after close
//!   Part E: Fatal loop: perform error fails everything outstanding
//!
//! Run: ./target/release/reqmux-smoke
//! (REQMUX_LOG_LEVEL=debug for worker logs)

use reqmux_core::context::ExecutionContext;
use reqmux_core::error::{MuxError, RequestError};
use reqmux_core::request::{RequestData, Response};
use reqmux_core::wakeup::{Wakeup, WakeupWait};

use reqmux_executor::{LoopState, Processor, ProcessorConfig};
use reqmux_module::{LoopbackConfig, LoopbackMulti, LoopbackProbe, PlatformWakeup, Reply};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn loopback(probe: &Arc<LoopbackProbe>) -> Result<Processor, MuxError> {
    let probe = Arc::clone(probe);
    let config = LoopbackConfig::from_env();
    Processor::start(ProcessorConfig::from_env(), move || {
        Ok(LoopbackMulti::new(config)?.with_probe(probe))
    })
}

fn hang(url: &str) -> RequestData {
    RequestData::get(url).header("x-loopback-hang", "1")
}

/// Poll `cond` for up to 5s.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

// ════════════════════════════════════════════════════════════
// Part A: Wakeup
// ════════════════════════════════════════════════════════════

fn test_wakeup(t: &mut TestRunner) {
    t.section("Part A: Platform wakeup");

    let w = match PlatformWakeup::create() {
        Ok(w) => { t.pass("create wakeup"); Arc::new(w) }
        Err(e) => { t.fail("create wakeup", &e.to_string()); return; }
    };

    let timed_out = w.wait(Some(Duration::from_millis(20)));
    t.check("wait times out", matches!(timed_out, Ok(false)), &format!("{:?}", timed_out));

    let w2 = Arc::clone(&w);
    let waiter = thread::spawn(move || {
        let start = Instant::now();
        let r = w2.wait(Some(Duration::from_secs(10)));
        (r, start.elapsed())
    });
    thread::sleep(Duration::from_millis(20));
    let woke = w.wake();
    t.check("wake()", woke.is_ok(), &format!("{:?}", woke));
    match waiter.join() {
        Ok((Ok(true), elapsed)) => t.check(
            "wake interrupts wait",
            elapsed < Duration::from_secs(5),
            &format!("took {:?}", elapsed),
        ),
        other => t.fail("wake interrupts wait", &format!("{:?}", other.map(|(r, _)| r))),
    }
}

// ════════════════════════════════════════════════════════════
// Part B: Round trips
// ════════════════════════════════════════════════════════════

fn test_round_trips(t: &mut TestRunner) {
    t.section("Part B: Round trips");

    let probe = LoopbackProbe::new();
    let processor = match loopback(&probe) {
        Ok(p) => { t.pass("Processor::start"); Arc::new(p) }
        Err(e) => { t.fail("Processor::start", &e.to_string()); return; }
    };
    t.check("state Running", processor.state() == LoopState::Running, &format!("{:?}", processor.state()));

    match processor.execute_blocking(RequestData::post("http://loop/echo", "smoke")) {
        Ok(resp) => t.check(
            "execute_blocking echo",
            resp.status == 200 && resp.body == b"smoke",
            &format!("status={} body={:?}", resp.status, resp.body),
        ),
        Err(e) => t.fail("execute_blocking echo", &e.to_string()),
    }

    let fut = processor.execute_request(RequestData::get("http://loop/async"));
    match futures::executor::block_on(fut) {
        Ok(resp) => t.check("execute_request (async)", resp.is_success(), &format!("status={}", resp.status)),
        Err(e) => t.fail("execute_request (async)", &e.to_string()),
    }

    match processor.execute_blocking(RequestData::get("http://loop/fail").header("x-loopback-fail", "7")) {
        Err(RequestError::Transport(e)) => t.check("transport error delivered", e.code == 7, &e.to_string()),
        other => t.fail("transport error delivered", &format!("{:?}", other)),
    }

    // 8 threads x 100 requests
    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|n| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                let futures: Vec<_> = (0..100)
                    .filter_map(|i| processor.submit(RequestData::post("http://loop/n", format!("{}:{}", n, i))).ok())
                    .collect();
                futures
                    .into_iter()
                    .enumerate()
                    .map(|(i, fut)| match fut.wait() {
                        Ok(resp) => resp.body == format!("{}:{}", n, i).into_bytes(),
                        Err(_) => false,
                    })
                    .filter(|ok| *ok)
                    .count()
            })
        })
        .collect();
    let ok: usize = handles.into_iter().map(|h| h.join().unwrap_or(0)).sum();
    t.check(
        &format!("800 concurrent requests ({:?})", start.elapsed()),
        ok == 800,
        &format!("{} ok", ok),
    );
    t.check("owner-thread only", probe.foreign_calls() == 0, &format!("{} foreign calls", probe.foreign_calls()));

    processor.close();
    let joined = processor.join();
    t.check("close + join", joined.is_ok(), &format!("{:?}", joined));
    t.check("multi closed once", probe.closed() == 1, &format!("closed={}", probe.closed()));
}

// ════════════════════════════════════════════════════════════
// Part C: Cancellation
// ════════════════════════════════════════════════════════════

fn test_cancellation(t: &mut TestRunner) {
    t.section("Part C: Cancellation");

    let probe = LoopbackProbe::new();
    let processor = match loopback(&probe) {
        Ok(p) => p,
        Err(e) => { t.fail("Processor::start", &e.to_string()); return; }
    };

    let ctx = ExecutionContext::new();
    let fut = match processor.submit(hang("http://loop/hang").context(ctx.clone())) {
        Ok(f) => f,
        Err(e) => { t.fail("submit hanging", &e.to_string()); return; }
    };
    t.check("transfer scheduled", eventually(|| probe.scheduled() == 1), "never scheduled");

    ctx.cancel("smoke cancel");
    match fut.wait_timeout(Duration::from_secs(5)) {
        Ok(Err(e)) => t.check("cancel before completion", e.is_cancellation(), &e.to_string()),
        Ok(Ok(_)) => t.fail("cancel before completion", "completed normally"),
        Err(_) => t.fail("cancel before completion", "timed out"),
    }
    t.check("exactly one cancel()", probe.cancelled() == 1, &format!("cancelled={}", probe.cancelled()));

    let late = ExecutionContext::new();
    let done = processor.execute_blocking(RequestData::get("http://loop/done").context(late.clone()));
    t.check("request completes", done.is_ok(), &format!("{:?}", done));
    eventually(|| late.hook_count() == 0);
    late.cancel("too late");
    thread::sleep(Duration::from_millis(20));
    t.check("cancel after completion ignored", probe.cancelled() == 1, &format!("cancelled={}", probe.cancelled()));
}

// ════════════════════════════════════════════════════════════
// Part D: Shutdown
// ════════════════════════════════════════════════════════════

fn test_shutdown(t: &mut TestRunner) {
    t.section("Part D: Shutdown");

    let probe = LoopbackProbe::new();
    let worker_probe = Arc::clone(&probe);
    let processor = Processor::start(ProcessorConfig::default(), move || {
        Ok(LoopbackMulti::new(LoopbackConfig::default())?
            .with_probe(worker_probe)
            .with_responder(|req: &RequestData| {
                if req.url.ends_with("/busy") {
                    thread::sleep(Duration::from_millis(50));
                }
                Reply::ok(Response::new(200))
            }))
    });
    let processor = match processor {
        Ok(p) => p,
        Err(e) => { t.fail("Processor::start", &e.to_string()); return; }
    };

    let first = processor.submit(RequestData::get("http://loop/busy"));
    eventually(|| processor.stats().queued == 0);
    let a = processor.submit(RequestData::get("http://loop/a"));
    let b = processor.submit(RequestData::get("http://loop/b"));
    processor.close();

    let served = [first, a, b]
        .into_iter()
        .filter_map(|f| f.ok())
        .map(|f| f.wait().is_ok())
        .filter(|ok| *ok)
        .count();
    t.check("queued requests served after close", served == 3, &format!("{} of 3", served));

    let late = processor.submit(RequestData::get("http://loop/late"));
    t.check(
        "submit after close rejected",
        matches!(late, Err(RequestError::QueueClosed)),
        &format!("{:?}", late.map(|_| ())),
    );

    let joined = processor.join();
    t.check("join Ok", joined.is_ok(), &format!("{:?}", joined));
    t.check("state Stopped", processor.state() == LoopState::Stopped, &format!("{:?}", processor.state()));
    t.check("multi closed once", probe.closed() == 1, &format!("closed={}", probe.closed()));
}

// ════════════════════════════════════════════════════════════
// Part E: Fatal loop
// ════════════════════════════════════════════════════════════

fn test_fatal(t: &mut TestRunner) {
    t.section("Part E: Fatal perform error");

    let probe = LoopbackProbe::new();
    let worker_probe = Arc::clone(&probe);
    let processor = match Processor::start(ProcessorConfig::default(), move || {
        Ok(LoopbackMulti::new(LoopbackConfig::default())?
            .with_probe(worker_probe)
            .fail_after(2))
    }) {
        Ok(p) => p,
        Err(e) => { t.fail("Processor::start", &e.to_string()); return; }
    };

    let fut = processor.submit(hang("http://loop/doomed"));
    match fut.map(|f| f.wait_timeout(Duration::from_secs(5))) {
        Ok(Ok(Err(RequestError::LoopTerminated(msg)))) => t.pass(&format!("in-flight failed: {}", truncate(&msg, 30))),
        other => t.fail("in-flight failed", &format!("{:?}", other.map(|r| r.ok()))),
    }

    let joined = processor.join();
    t.check("join reports error", matches!(joined, Err(MuxError::Perform(_))), &format!("{:?}", joined));
    t.check("state Failed", processor.state() == LoopState::Failed, &format!("{:?}", processor.state()));
    t.check("multi closed once", probe.closed() == 1, &format!("closed={}", probe.closed()));
    t.check(
        "intake closed",
        matches!(processor.submit(RequestData::get("http://loop/x")), Err(RequestError::QueueClosed)),
        "submit accepted",
    );
}

fn truncate(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn main() {
    println!("=== reqmux End-to-End Smoke Test ===");

    let mut t = TestRunner::new();

    test_wakeup(&mut t);
    test_round_trips(&mut t);
    test_cancellation(&mut t);
    test_shutdown(&mut t);
    test_fatal(&mut t);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
