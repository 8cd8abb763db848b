//! Nested re-entry stack and frame-chain walkers
//!
//! Every entry into the dispatch loop from native code runs as a *session*.
//! A session started while another one is live pushes a [`VmState`]
//! snapshot of the outer registers and restores it verbatim when it ends,
//! whether it returned, threw or hit a fatal error.
//!
//! Frame chains never link across sessions: a session's entry frame has no
//! `prev`. Walkers that need to cross the boundary go through the snapshot
//! recorded when the session started.

use super::ExecutionContext;
use crate::object::Class;
use crate::stack::{ar_flags, FrameId};
use crate::value::Value;
use crate::{VmError, VmResult};
use std::fmt::Write;
use std::rc::Rc;
use tracing::trace;

/// Registers of an interrupted session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmState {
    /// Program counter
    pub pc: usize,
    /// Current frame
    pub fp: Option<FrameId>,
    /// Entry frame of the interrupted session
    pub first_ar: Option<FrameId>,
    /// Stack pointer
    pub sp: usize,
    /// Operand floor
    pub floor: usize,
    /// Frame arena length; the nested session's entry frame gets this index
    pub frame_depth: usize,
}

/// One entry of a backtrace
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Function or method name
    pub function: Rc<str>,
    /// Declaring class for methods
    pub class: Option<Rc<str>>,
    /// Source path
    pub file: Rc<str>,
    /// Source line of the executing instruction (0 if unknown)
    pub line: u32,
    /// Offset of the executing instruction
    pub pc: usize,
    /// The frame was entered from native code
    pub from_vm_entry: bool,
}

impl ExecutionContext {
    fn snapshot(&self) -> VmState {
        VmState {
            pc: self.regs.pc,
            fp: self.regs.fp,
            first_ar: self.regs.first_ar,
            sp: self.stack.sp(),
            floor: self.stack.floor(),
            frame_depth: self.stack.frame_count(),
        }
    }

    fn restore(&mut self, state: VmState) {
        self.stack.truncate_frames(state.frame_depth);
        self.stack.truncate(state.sp);
        self.stack.set_floor(state.floor);
        self.regs.pc = state.pc;
        self.regs.fp = state.fp;
        self.regs.first_ar = state.first_ar;
    }

    /// Save the current registers and enter a nested session
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackOverflow` past the configured nesting depth.
    pub fn push_vm_state(&mut self) -> VmResult<()> {
        if self.nesting >= self.options.limits.max_nesting_depth {
            return Err(VmError::StackOverflow);
        }
        let state = self.snapshot();
        self.nested.push(state);
        self.nesting += 1;
        self.stats.reentries += 1;
        self.stats.max_nesting = self.stats.max_nesting.max(self.nesting);
        trace!(target: "strata::vm", depth = self.nesting, sp = state.sp, "enter nested session");
        Ok(())
    }

    /// Leave a nested session, restoring the outer registers and dropping
    /// everything the session left on the stack
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if no nested session is active.
    pub fn pop_vm_state(&mut self) -> VmResult<()> {
        let state = self
            .nested
            .pop()
            .ok_or_else(|| VmError::StackCorruption("no nested session to leave".into()))?;
        self.nesting -= 1;
        self.restore(state);
        trace!(target: "strata::vm", depth = self.nesting, sp = state.sp, "leave nested session");
        Ok(())
    }

    /// Run `setup` then `drive` as one session
    ///
    /// `setup` pushes and enters the session's entry frame; it may finish
    /// the session immediately by returning a value. The outer registers
    /// are restored on every exit path.
    pub(crate) fn run_session<S, D>(&mut self, setup: S, drive: D) -> VmResult<Value>
    where
        S: FnOnce(&mut Self) -> VmResult<Option<Value>>,
        D: FnOnce(&mut Self) -> VmResult<Value>,
    {
        if self.terminated {
            return Err(VmError::RequestTerminated);
        }
        let nested = self.regs.fp.is_some() || self.stack.frame_count() > 0;
        let outer = if nested {
            self.push_vm_state()?;
            None
        } else {
            Some(self.snapshot())
        };
        let depth = self.nested.len();
        self.regs.fp = None;
        self.regs.first_ar = None;
        self.stack.set_floor(self.stack.sp());

        let result = match setup(self) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => drive(self),
            Err(err) => Err(err),
        };

        match outer {
            Some(state) => self.restore(state),
            // A fatal error inside the session already tore the stack down.
            None if self.nested.len() < depth => {}
            None => self.pop_vm_state()?,
        }
        result
    }

    /// Whether a nested session is active
    pub fn is_nested(&self) -> bool {
        self.nesting > 0
    }

    /// Number of active nested sessions
    pub fn nesting_level(&self) -> usize {
        self.nesting
    }

    /// Snapshots of the interrupted sessions, outermost first
    pub fn vm_states(&self) -> &[VmState] {
        &self.nested
    }

    // ========================================================================
    // Frame walkers
    // ========================================================================

    /// Caller of a frame within its own session
    pub fn caller_frame(&self, frame: FrameId) -> Option<FrameId> {
        self.stack.frame(frame).ok()?.prev
    }

    /// Entry frame of the session `frame` belongs to
    pub fn session_entry_frame(&self, frame: FrameId) -> Option<FrameId> {
        let mut current = frame;
        loop {
            let ar = self.stack.frame(current).ok()?;
            if ar.has_flag(ar_flags::FROM_VM_ENTRY) {
                return Some(current);
            }
            current = ar.prev?;
        }
    }

    /// Snapshot taken when the session containing `frame` started, if that
    /// session is nested
    pub fn get_prev_vm_state(&self, frame: FrameId) -> Option<&VmState> {
        let entry = self.session_entry_frame(frame)?;
        self.nested
            .iter()
            .rev()
            .find(|state| state.frame_depth == entry.index())
    }

    /// The frame that was executing when the session containing `frame`
    /// was entered
    pub fn get_outer_vm_frame(&self, frame: FrameId) -> Option<FrameId> {
        self.get_prev_vm_state(frame)?.fp
    }

    /// Walk the frame chain from the current instruction outward
    ///
    /// Without `cross_boundary` the walk stops at the current session's
    /// entry frame.
    pub fn backtrace(&self, cross_boundary: bool) -> Vec<FrameInfo> {
        let mut out = Vec::new();
        let mut cursor = match self.regs.fp {
            Some(fp) => Some((fp, self.regs.pc)),
            None if cross_boundary => self
                .nested
                .iter()
                .rev()
                .find_map(|s| s.fp.map(|fp| (fp, s.pc))),
            None => None,
        };
        while let Some((id, pc)) = cursor {
            let Ok(ar) = self.stack.frame(id) else { break };
            let op_pc = pc.saturating_sub(1);
            if let Some(func) = ar.func() {
                out.push(FrameInfo {
                    function: Rc::clone(&func.name),
                    class: func.class.as_ref().map(|(_, name)| Rc::clone(name)),
                    file: Rc::clone(&func.unit.path),
                    line: func.def.line_for_pc(op_pc).unwrap_or(0),
                    pc: op_pc,
                    from_vm_entry: ar.has_flag(ar_flags::FROM_VM_ENTRY),
                });
            }
            cursor = match ar.prev {
                Some(prev) => Some((prev, ar.saved_pc)),
                None if cross_boundary => self
                    .get_prev_vm_state(id)
                    .and_then(|s| s.fp.map(|fp| (fp, s.pc))),
                None => None,
            };
        }
        out
    }

    /// Function, class, path and line of the nearest guest frame
    pub fn get_caller_info(&self) -> Option<FrameInfo> {
        self.backtrace(true).into_iter().next()
    }

    /// Source line of the executing instruction
    pub fn get_line(&self) -> Option<u32> {
        self.get_caller_info().map(|info| info.line)
    }

    /// Multi-line backtrace across all sessions
    pub fn pretty_stack(&self) -> String {
        let mut out = String::new();
        for (i, info) in self.backtrace(true).iter().enumerate() {
            let name = match &info.class {
                Some(class) => format!("{}::{}", class, info.function),
                None => info.function.to_string(),
            };
            let _ = writeln!(out, "#{} {}() called at [{}:{}]", i, name, info.file, info.line);
        }
        out
    }

    /// Class of the executing method, for visibility checks
    pub fn get_context_class(&self) -> Option<Rc<Class>> {
        let func = self.stack.frame(self.regs.fp?).ok()?.func()?;
        self.classes.get(func.class_id()?).cloned()
    }

    /// Parent of the context class
    pub fn get_parent_context_class(&self) -> Option<Rc<Class>> {
        self.get_context_class()?.parent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::VmOptions;

    #[test]
    fn test_push_pop_restores_registers() {
        let mut ctx = ExecutionContext::new(VmOptions::default());
        ctx.stack.push(Value::Int(1)).unwrap();
        ctx.regs.pc = 7;
        ctx.push_vm_state().unwrap();
        assert!(ctx.is_nested());

        ctx.stack.push(Value::Int(2)).unwrap();
        ctx.regs.pc = 99;
        ctx.pop_vm_state().unwrap();
        assert!(!ctx.is_nested());
        assert_eq!(ctx.pc(), 7);
        assert_eq!(ctx.stack().sp(), 1);
        assert_eq!(ctx.stats().reentries, 1);
        assert_eq!(ctx.stats().max_nesting, 1);
    }

    #[test]
    fn test_pop_without_push_is_corruption() {
        let mut ctx = ExecutionContext::new(VmOptions::default());
        assert!(matches!(ctx.pop_vm_state(), Err(VmError::StackCorruption(_))));
    }

    #[test]
    fn test_nesting_limit() {
        let mut options = VmOptions::default();
        options.limits.max_nesting_depth = 2;
        let mut ctx = ExecutionContext::new(options);
        ctx.push_vm_state().unwrap();
        ctx.push_vm_state().unwrap();
        assert!(matches!(ctx.push_vm_state(), Err(VmError::StackOverflow)));
        assert_eq!(ctx.nesting_level(), 2);
        assert_eq!(ctx.vm_states().len(), 2);
    }

    #[test]
    fn test_idle_context_has_no_frames() {
        let ctx = ExecutionContext::new(VmOptions::default());
        assert!(ctx.backtrace(true).is_empty());
        assert!(ctx.get_caller_info().is_none());
        assert!(ctx.get_context_class().is_none());
        assert_eq!(ctx.pretty_stack(), "");
    }
}
