//! # reqmux-executor - The Worker Loop
//!
//! Many caller threads, one native multi-handle, one thread allowed to
//! touch it. The `Processor` owns a dedicated worker thread that builds the
//! multi-handle, then runs this loop until intake is closed and every
//! accepted request has resolved:
//!
//! ```text
//!  submit() ──► SubmissionQueue ──► drain ──► MultiHandle::schedule()
//!                                               │
//!  cancel hook ──► control queue ──► cancel()   ▼
//!                                           perform() ──► CompletionSlot
//! ```
//!
//! Submitters and cancel hooks interrupt a blocked `perform()` through the
//! multi-handle's `Wakeup` and unpark an idle drain through the queue. The
//! loop never spins when there is nothing to do.

pub mod config;
pub mod container;
pub mod processor;
pub mod queue;
mod worker;

pub use config::ProcessorConfig;
pub use container::RequestContainer;
pub use processor::{Processor, ProcessorStats};
pub use queue::SubmissionQueue;
pub use worker::LoopState;
