//! Toggleable verbose diagnostics.
//!
//! Admins can flip verbose logging at runtime without touching the log
//! filter; when disabled the message closure is never evaluated.

use std::sync::atomic::{AtomicBool, Ordering};

/// Runtime-toggleable debug logger.
#[derive(Debug, Default)]
pub struct DebugLogger {
    enabled: AtomicBool,
}

impl DebugLogger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Flip the toggle and return the new state.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::Relaxed)
    }

    /// Log a diagnostic line. The closure only runs while enabled.
    pub fn log<F>(&self, message: F)
    where
        F: FnOnce() -> String,
    {
        if self.is_enabled() {
            log::info!(target: "secure_auth::debug", "{}", message());
        }
    }
}
