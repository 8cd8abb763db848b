//! Error/exception state machine
//!
//! Recoverable errors are offered to the user error handler stack, most
//! recently registered first. Whether an error then becomes a thrown
//! `ErrorException` depends on [`ErrorThrowMode`] and the
//! `throw_all_errors` policy.
//!
//! The state moves `NoError -> ErrorRaised -> ExecutingUserHandler`, and an
//! error raised while a handler runs enters `ErrorRaisedByUserHandler`,
//! which never calls a user handler again. Each raise restores the state it
//! found once it is done.

use super::context::VmOptions;
use super::ExecutionContext;
use crate::value::Value;
use crate::{VmError, VmResult};
use std::rc::Rc;
use tracing::{error, warn};

/// Error severities
pub mod severity {
    /// Fatal run-time error
    pub const E_ERROR: u32 = 1;
    /// Run-time warning
    pub const E_WARNING: u32 = 1 << 1;
    /// Parse error
    pub const E_PARSE: u32 = 1 << 2;
    /// Run-time notice
    pub const E_NOTICE: u32 = 1 << 3;
    /// Fatal error during startup
    pub const E_CORE_ERROR: u32 = 1 << 4;
    /// Fatal compile-time error
    pub const E_COMPILE_ERROR: u32 = 1 << 6;
    /// `trigger_error(..., E_USER_ERROR)`
    pub const E_USER_ERROR: u32 = 1 << 8;
    /// `trigger_error(..., E_USER_WARNING)`
    pub const E_USER_WARNING: u32 = 1 << 9;
    /// `trigger_error(..., E_USER_NOTICE)`
    pub const E_USER_NOTICE: u32 = 1 << 10;
    /// Strict-mode suggestion
    pub const E_STRICT: u32 = 1 << 11;
    /// Catchable fatal error
    pub const E_RECOVERABLE_ERROR: u32 = 1 << 12;
    /// Deprecation notice
    pub const E_DEPRECATED: u32 = 1 << 13;
    /// `trigger_error(..., E_USER_DEPRECATED)`
    pub const E_USER_DEPRECATED: u32 = 1 << 14;
    /// Every severity
    pub const E_ALL: u32 = (1 << 15) - 1;

    /// Severities that end the request when escalated
    pub const FATAL: u32 = E_ERROR | E_PARSE | E_CORE_ERROR | E_COMPILE_ERROR | E_USER_ERROR;
    /// Severities guest code may raise with `trigger_error`
    pub const USER: u32 = E_USER_ERROR | E_USER_WARNING | E_USER_NOTICE | E_USER_DEPRECATED;

    /// Display name of a single severity bit
    pub fn name(errnum: u32) -> &'static str {
        match errnum {
            E_ERROR | E_CORE_ERROR | E_COMPILE_ERROR | E_USER_ERROR => "Fatal error",
            E_RECOVERABLE_ERROR => "Catchable fatal error",
            E_WARNING | E_USER_WARNING => "Warning",
            E_PARSE => "Parse error",
            E_NOTICE | E_USER_NOTICE => "Notice",
            E_STRICT => "Strict Standards",
            E_DEPRECATED | E_USER_DEPRECATED => "Deprecated",
            _ => "Unknown error",
        }
    }
}

/// Error-handling state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorState {
    /// Nothing in progress
    #[default]
    NoError,
    /// An error is being handled
    ErrorRaised,
    /// A user error handler is running
    ExecutingUserHandler,
    /// A user error handler raised an error itself
    ErrorRaisedByUserHandler,
}

/// When a raised error becomes a thrown exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorThrowMode {
    /// Only under the `throw_all_errors` policy
    Never,
    /// When no user handler claims it
    IfUnhandled,
    /// Always
    Always,
}

/// The most recent recorded error
#[derive(Debug, Clone, PartialEq)]
pub struct LastError {
    /// Severity bit
    pub number: u32,
    /// Message
    pub message: String,
    /// Source path of the nearest guest frame
    pub file: Rc<str>,
    /// Source line of the nearest guest frame
    pub line: u32,
}

/// Error-handling state owned by the execution context
#[derive(Debug)]
pub(crate) struct ErrorHandling {
    pub state: ErrorState,
    pub last_error: Option<LastError>,
    pub user_error_handlers: Vec<(Value, u32)>,
    pub user_exception_handlers: Vec<Value>,
    pub throw_all_errors: bool,
    pub error_page: Option<String>,
}

impl ErrorHandling {
    pub fn new(options: &VmOptions) -> Self {
        Self {
            state: ErrorState::NoError,
            last_error: None,
            user_error_handlers: Vec::new(),
            user_exception_handlers: Vec::new(),
            throw_all_errors: options.throw_all_errors,
            error_page: options.error_page.clone(),
        }
    }

    pub fn reset(&mut self, options: &VmOptions) {
        *self = Self::new(options);
    }
}

impl ExecutionContext {
    // ========================================================================
    // Handler registration
    // ========================================================================

    /// Install a user error handler for the severities in `mask`
    ///
    /// Returns the previously active handler, or `Null`.
    pub fn push_user_error_handler(&mut self, handler: Value, mask: u32) -> Value {
        let prev = self.current_user_error_handler();
        self.errors.user_error_handlers.push((handler, mask));
        prev
    }

    /// Remove the most recent user error handler
    ///
    /// Returns the handler that is active afterwards, or `Null`.
    pub fn pop_user_error_handler(&mut self) -> Value {
        self.errors.user_error_handlers.pop();
        self.current_user_error_handler()
    }

    /// Install a user exception handler
    ///
    /// Returns the previously active handler, or `Null`.
    pub fn push_user_exception_handler(&mut self, handler: Value) -> Value {
        let prev = self
            .errors
            .user_exception_handlers
            .last()
            .cloned()
            .unwrap_or_default();
        self.errors.user_exception_handlers.push(handler);
        prev
    }

    /// Remove the most recent user exception handler
    ///
    /// Returns the handler that is active afterwards, or `Null`.
    pub fn pop_user_exception_handler(&mut self) -> Value {
        self.errors.user_exception_handlers.pop();
        self.errors
            .user_exception_handlers
            .last()
            .cloned()
            .unwrap_or_default()
    }

    fn current_user_error_handler(&self) -> Value {
        self.errors
            .user_error_handlers
            .last()
            .map(|(h, _)| h.clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // Raising
    // ========================================================================

    /// Raise a recoverable error
    ///
    /// Records it as the last error, offers it to user handlers if
    /// `call_user_handler` is set, and escalates it according to `mode`.
    /// A raise while another raise is being processed is ignored, except
    /// from inside a running user handler.
    ///
    /// # Errors
    ///
    /// - `VmError::Exception` carrying an `ErrorException` when escalated
    /// - `VmError::Fatal` when a fatal severity is escalated
    /// - Anything a user handler raises
    pub fn handle_error(
        &mut self,
        msg: &str,
        errnum: u32,
        call_user_handler: bool,
        mode: ErrorThrowMode,
    ) -> VmResult<()> {
        if !self.error_needs_handling(errnum, call_user_handler, mode) {
            return Ok(());
        }
        let prev = self.errors.state;
        self.errors.state = match prev {
            ErrorState::NoError => ErrorState::ErrorRaised,
            ErrorState::ExecutingUserHandler => ErrorState::ErrorRaisedByUserHandler,
            ErrorState::ErrorRaised | ErrorState::ErrorRaisedByUserHandler => return Ok(()),
        };
        self.record_last_error(errnum, msg);
        let result = self.escalate_error(msg, errnum, call_user_handler, mode);
        self.errors.state = prev;
        result
    }

    fn escalate_error(
        &mut self,
        msg: &str,
        errnum: u32,
        call_user_handler: bool,
        mode: ErrorThrowMode,
    ) -> VmResult<()> {
        let handled = call_user_handler && self.call_user_error_handler(msg, errnum)?;
        let throw = match mode {
            ErrorThrowMode::Always => true,
            ErrorThrowMode::IfUnhandled => !handled,
            ErrorThrowMode::Never => self.errors.throw_all_errors && !handled,
        };
        if throw {
            if errnum & severity::FATAL != 0 {
                return Err(VmError::Fatal(msg.to_string()));
            }
            return Err(VmError::Exception(self.create_error_exception(msg, errnum)));
        }
        if !handled && self.error_needs_logging(errnum) {
            let (file, line) = self
                .errors
                .last_error
                .as_ref()
                .map(|e| (Rc::clone(&e.file), e.line))
                .unwrap_or_else(|| (Rc::from(""), 0));
            warn!(
                target: "strata::error",
                file = %file,
                line,
                "{}: {}",
                severity::name(errnum),
                msg
            );
        }
        Ok(())
    }

    /// Raise `E_WARNING`, offering it to user handlers
    ///
    /// # Errors
    ///
    /// As [`handle_error`](Self::handle_error).
    pub fn raise_warning(&mut self, msg: &str) -> VmResult<()> {
        self.handle_error(msg, severity::E_WARNING, true, ErrorThrowMode::Never)
    }

    /// Raise `E_NOTICE`, offering it to user handlers
    ///
    /// # Errors
    ///
    /// As [`handle_error`](Self::handle_error).
    pub fn raise_notice(&mut self, msg: &str) -> VmResult<()> {
        self.handle_error(msg, severity::E_NOTICE, true, ErrorThrowMode::Never)
    }

    /// Offer an error to the user error handlers, newest first
    ///
    /// Handlers whose mask excludes `errnum` are skipped. A handler returning
    /// exactly `false` declines and the next one is tried. Returns whether a
    /// handler claimed the error; never calls a handler while one is already
    /// running.
    ///
    /// # Errors
    ///
    /// Whatever the claiming handler raises.
    pub fn call_user_error_handler(&mut self, msg: &str, errnum: u32) -> VmResult<bool> {
        if matches!(
            self.errors.state,
            ErrorState::ExecutingUserHandler | ErrorState::ErrorRaisedByUserHandler
        ) {
            return Ok(false);
        }
        let (file, line) = self
            .get_caller_info()
            .map(|info| (info.file, info.line))
            .unwrap_or_else(|| (Rc::from(""), 0));
        let args = [
            Value::Int(i64::from(errnum)),
            Value::str(msg),
            Value::Str(file),
            Value::Int(i64::from(line)),
        ];

        let mut index = self.errors.user_error_handlers.len();
        while index > 0 {
            index -= 1;
            let Some((handler, mask)) = self.errors.user_error_handlers.get(index).cloned() else {
                continue;
            };
            if mask & errnum == 0 {
                continue;
            }
            let saved = self.errors.state;
            self.errors.state = ErrorState::ExecutingUserHandler;
            let result = self.call_user_func(&handler, &args);
            self.errors.state = saved;
            if !matches!(result?, Value::Bool(false)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Record an error as the last error of the request
    pub fn record_last_error(&mut self, errnum: u32, msg: &str) {
        let (file, line) = self
            .get_caller_info()
            .map(|info| (info.file, info.line))
            .unwrap_or_else(|| (Rc::from(""), 0));
        self.errors.last_error = Some(LastError {
            number: errnum,
            message: msg.to_string(),
            file,
            line,
        });
    }

    /// Whether raising `errnum` has any observable effect
    pub fn error_needs_handling(
        &self,
        errnum: u32,
        call_user_handler: bool,
        mode: ErrorThrowMode,
    ) -> bool {
        self.errors.throw_all_errors
            || self.options.error_reporting & errnum != 0
            || (call_user_handler && !self.errors.user_error_handlers.is_empty())
            || mode != ErrorThrowMode::Never
    }

    /// Whether an unhandled `errnum` is logged
    pub fn error_needs_logging(&self, errnum: u32) -> bool {
        self.options.log_errors && self.options.error_reporting & errnum != 0
    }

    // ========================================================================
    // Top-level paths
    // ========================================================================

    /// Offer an uncaught exception to the user exception handlers, newest
    /// first
    ///
    /// Returns whether a handler claimed it.
    ///
    /// # Errors
    ///
    /// - `VmError::Exit` if a handler exits
    /// - `VmError::Fatal` if a handler throws
    pub fn on_unhandled_exception(&mut self, exc: &Value) -> VmResult<bool> {
        let mut index = self.errors.user_exception_handlers.len();
        while index > 0 {
            index -= 1;
            let Some(handler) = self.errors.user_exception_handlers.get(index).cloned() else {
                continue;
            };
            match self.call_user_func(&handler, std::slice::from_ref(exc)) {
                Ok(Value::Bool(false)) => continue,
                Ok(_) => return Ok(true),
                Err(VmError::Exception(inner)) => {
                    return Err(VmError::Fatal(format!(
                        "Uncaught {} thrown from exception handler",
                        inner
                    )))
                }
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    /// Terminate the request after an unrecoverable error
    ///
    /// Records and logs the error, redirects to the configured error page
    /// and tears down all frames. Never re-enters bytecode.
    pub fn on_fatal_error(&mut self, err: &VmError) {
        let msg = err.to_string();
        self.record_last_error(severity::E_ERROR, &msg);
        let location = self
            .errors
            .last_error
            .as_ref()
            .map(|e| format!("{}:{}", e.file, e.line))
            .unwrap_or_default();
        error!(target: "strata::error", location = %location, "{}", msg);
        if let Some(page) = self.errors.error_page.clone() {
            self.output.redirect(&page);
        }
        self.terminated = true;
        self.reset_execution_state();
    }

    /// Build an `ErrorException` for a raised error
    pub fn create_error_exception(&self, msg: &str, errnum: u32) -> Value {
        let Some(cls) = self.classes.get(self.classes.builtins.error_exception).cloned() else {
            return Value::str(msg);
        };
        let obj = self.create_object_only(&cls);
        {
            let mut o = obj.borrow_mut();
            o.set_prop("message", Value::str(msg));
            o.set_prop("code", Value::Int(0));
            o.set_prop("severity", Value::Int(i64::from(errnum)));
        }
        Value::Object(obj)
    }

    /// Build an exception of a built-in or loaded class without running
    /// its constructor
    ///
    /// # Errors
    ///
    /// Returns `VmError::ClassNotFound` if `class` is undefined.
    pub fn create_exception(&self, class: &str, msg: &str) -> VmResult<Value> {
        let cls = self.classes.require(class)?;
        let obj = self.create_object_only(&cls);
        obj.borrow_mut().set_prop("message", Value::str(msg));
        Ok(Value::Object(obj))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current error-handling state
    pub fn error_state(&self) -> ErrorState {
        self.errors.state
    }

    /// The most recent recorded error
    pub fn last_error(&self) -> Option<&LastError> {
        self.errors.last_error.as_ref()
    }

    /// Whether every unhandled error is thrown
    pub fn throw_all_errors(&self) -> bool {
        self.errors.throw_all_errors
    }

    /// Convert every unhandled error into a thrown exception
    pub fn set_throw_all_errors(&mut self, on: bool) {
        self.errors.throw_all_errors = on;
    }

    /// Page shown after a fatal error
    pub fn error_page(&self) -> Option<&str> {
        self.errors.error_page.as_deref()
    }

    /// Set the page shown after a fatal error
    pub fn set_error_page(&mut self, page: Option<String>) {
        self.errors.error_page = page;
    }
}
