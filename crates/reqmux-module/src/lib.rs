//! # reqmux-module - Default implementations
//!
//! Concrete implementations of the reqmux-core traits. Each one favours
//! correctness and simplicity; a real transport binding (curl multi, ...)
//! plugs in through the same `MultiHandle` trait.
//!
//! ## Default stack
//!
//! | Trait         | Default Impl     | Alternative                    |
//! |---------------|------------------|--------------------------------|
//! | WakeupWait    | EventFdWakeup    | CondvarWakeup (non-Linux)      |
//! | MultiHandle   | LoopbackMulti    | native transport bindings      |
//!
//! `LoopbackMulti` simulates transfers in-process. It backs the smoke binary,
//! the executor tests and the benchmarks.

pub mod condvar_wakeup;
pub mod loopback;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod eventfd_wakeup;
        pub use eventfd_wakeup::EventFdWakeup as PlatformWakeup;
    } else {
        pub use condvar_wakeup::CondvarWakeup as PlatformWakeup;
    }
}

pub use condvar_wakeup::CondvarWakeup;
pub use loopback::{echo, LoopbackConfig, LoopbackMulti, LoopbackProbe, Reply, Responder, TransferHandle};
