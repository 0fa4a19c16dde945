//! Processor configuration

use reqmux_core::env::{env_get, env_get_opt, env_get_str};

/// Smallest stack accepted for the worker thread.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Configuration for a `Processor`
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name of the dedicated worker thread (default: "reqmux-worker")
    pub thread_name: String,

    /// Max containers scheduled per loop iteration while transfers are
    /// pending, so `perform()` is reached in bounded steps (default: 256)
    pub drain_batch: usize,

    /// Worker thread stack size; `None` = platform default
    pub stack_size: Option<usize>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            thread_name: "reqmux-worker".to_string(),
            drain_batch: 256,
            stack_size: None,
        }
    }
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `REQMUX_THREAD_NAME`, `REQMUX_DRAIN_BATCH` and
    /// `REQMUX_STACK_SIZE`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            thread_name: env_get_str("REQMUX_THREAD_NAME", &d.thread_name),
            drain_batch: env_get("REQMUX_DRAIN_BATCH", d.drain_batch),
            stack_size: env_get_opt("REQMUX_STACK_SIZE").or(d.stack_size),
        }
    }

    /// Set the worker thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the per-iteration drain cap
    pub fn drain_batch(mut self, n: usize) -> Self {
        self.drain_batch = n;
        self
    }

    /// Set the worker stack size
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.thread_name.is_empty() {
            return Err("thread_name must not be empty");
        }
        if self.thread_name.contains('\0') {
            return Err("thread_name must not contain NUL");
        }
        if self.drain_batch == 0 {
            return Err("drain_batch must be at least 1");
        }
        if let Some(size) = self.stack_size {
            if size < MIN_STACK_SIZE {
                return Err("stack_size below 64 KiB");
            }
        }
        Ok(())
    }
}
