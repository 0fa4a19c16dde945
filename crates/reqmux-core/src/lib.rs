//! # reqmux-core
//!
//! Types and trait boundaries shared by every reqmux crate.
//!
//! reqmux feeds many concurrently submitted HTTP requests into one native
//! multi-request handle that may only be touched from a single thread. This
//! crate holds the vocabulary of that bridge and nothing that spawns threads:
//!
//! ```text
//!  caller threads                         worker thread
//!  ──────────────                         ─────────────
//!  RequestData ──► submission queue ──►   MultiHandle::schedule()
//!  ResponseFuture ◄── CompletionSlot ◄──  MultiHandle::perform()
//!  ExecutionContext::cancel() ──► control task ──► MultiHandle::cancel()
//! ```
//!
//! ## Modules
//!
//! - `request` - request/response data carriers and `RequestId`
//! - `context` - caller-owned cancellable execution context
//! - `completion` - single-assignment completion slot and the caller's future
//! - `multi` - the native multi-handle capability boundary
//! - `wakeup` - cross-thread interrupt signal for a blocking `perform()`
//! - `error` - per-request and loop-level error types
//! - `kprint` - leveled stderr logging macros
//! - `env` - environment variable helpers for configuration

pub mod request;
pub mod context;
pub mod completion;
pub mod multi;
pub mod wakeup;
pub mod error;
pub mod kprint;
pub mod env;

pub use request::{Method, RequestData, RequestId, Response};
pub use context::{CancelCause, CancelKind, ExecutionContext, HookRegistration};
pub use completion::{CompletionSlot, ResponseFuture};
pub use multi::MultiHandle;
pub use wakeup::{Wakeup, WakeupWait};
pub use error::{MuxError, RequestError, Result, TransportError};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
