//! Surprise checks: cooperative interrupt points
//!
//! Other threads (a watchdog, a debugger) raise conditions through a shared
//! [`SurpriseFlags`]; the interpreter services them only at surprise checks,
//! which run on function entry and backward jumps.
//!
//! ## Check cost
//!
//! The fast path is one atomic load plus a counter. The wall-clock deadline
//! is read only every `surprise_poll_interval` checks.

use super::ExecutionContext;
use crate::{VmError, VmResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tracing::debug;

/// Surprise condition bits
pub mod surprise_bits {
    /// The request ran out of time
    pub const TIMED_OUT: u32 = 1 << 0;
    /// Throw an `ErrorException` at the next check
    pub const PENDING_EXCEPTION: u32 = 1 << 1;
    /// Call the interrupt hook at the next check
    pub const DEBUGGER_INTERRUPT: u32 = 1 << 2;
}

/// Pending surprise conditions, shareable across threads
#[derive(Debug, Default)]
pub struct SurpriseFlags {
    flags: AtomicU32,
    pending_message: Mutex<Option<String>>,
}

impl SurpriseFlags {
    /// Create with no conditions pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a timeout
    pub fn request_timeout(&self) {
        self.flags.fetch_or(surprise_bits::TIMED_OUT, Ordering::Release);
    }

    /// Request that an exception carrying `msg` be thrown
    pub fn request_exception(&self, msg: impl Into<String>) {
        *self.pending_message.lock() = Some(msg.into());
        self.flags
            .fetch_or(surprise_bits::PENDING_EXCEPTION, Ordering::Release);
    }

    /// Request a debugger interrupt
    pub fn request_interrupt(&self) {
        self.flags
            .fetch_or(surprise_bits::DEBUGGER_INTERRUPT, Ordering::Release);
    }

    /// Fast check for any pending condition
    #[inline(always)]
    pub fn is_pending(&self) -> bool {
        self.flags.load(Ordering::Acquire) != 0
    }

    /// Clear and return all pending bits
    pub fn take(&self) -> u32 {
        self.flags.swap(0, Ordering::AcqRel)
    }

    /// Put back bits that were taken but not serviced
    pub fn restore(&self, bits: u32) {
        if bits != 0 {
            self.flags.fetch_or(bits, Ordering::Release);
        }
    }

    /// Take the pending exception message
    pub fn take_message(&self) -> Option<String> {
        self.pending_message.lock().take()
    }
}

impl ExecutionContext {
    /// Service pending surprise conditions
    ///
    /// # Errors
    ///
    /// - `VmError::Timeout` once the deadline has passed or a timeout was
    ///   requested
    /// - `VmError::Exception` for a requested exception
    #[inline(always)]
    pub fn check_surprise(&mut self) -> VmResult<()> {
        self.stats.surprise_checks += 1;
        if self.deadline.is_some() {
            self.surprise_polls += 1;
            if self.surprise_polls >= self.options.surprise_poll_interval {
                self.surprise_polls = 0;
                if self.deadline.is_some_and(|d| Instant::now() >= d) {
                    self.surprise.request_timeout();
                }
            }
        }
        if !self.surprise.is_pending() {
            return Ok(());
        }
        self.service_surprise()
    }

    #[cold]
    fn service_surprise(&mut self) -> VmResult<()> {
        let bits = self.surprise.take();
        debug!(target: "strata::vm", bits, "servicing surprise");
        if bits & surprise_bits::TIMED_OUT != 0 {
            // Left for the next check, which runs once the timeout unwinds.
            self.surprise.restore(bits & !surprise_bits::TIMED_OUT);
            return Err(VmError::Timeout);
        }
        if bits & surprise_bits::DEBUGGER_INTERRUPT != 0 {
            if let Some(hook) = self.interrupt_hook.clone() {
                hook(self);
            }
        }
        if bits & surprise_bits::PENDING_EXCEPTION != 0 {
            let msg = self
                .surprise
                .take_message()
                .unwrap_or_else(|| "Pending exception".to_string());
            let exc = self.create_error_exception(&msg, super::severity::E_ERROR);
            return Err(VmError::Exception(exc));
        }
        Ok(())
    }
}
