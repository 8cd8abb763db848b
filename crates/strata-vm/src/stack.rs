//! Evaluation stack and activation records
//!
//! # Architecture
//!
//! The stack holds two things:
//! - Value slots (arguments, locals and operand temporaries)
//! - Activation records, one per call, in a parallel frame arena
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │ operand temporaries                 │  ← sp
//! ├─────────────────────────────────────┤  ← floor (locals end of current frame)
//! │ local₂ … (non-parameter locals)     │
//! │ local₁ = param₁                     │
//! │ local₀ = param₀                     │  ← ActRec::base
//! ├─────────────────────────────────────┤
//! │ caller's operand temporaries        │
//! │ caller's locals                     │
//! └─────────────────────────────────────┘
//! ```
//!
//! Slots live in fixed-size chunks. Growing the stack allocates a new chunk
//! and never moves existing ones, so a slot's address is stable for as long
//! as it is below the cursor. Frames are addressed by [`FrameId`] indices;
//! tearing a frame down is index invalidation plus dropping its values.

use crate::func::{Callee, Func};
use crate::object::{Class, ObjectRef};
use crate::resumable::Resumable;
use crate::value::{ArrayRef, Value};
use crate::{VmError, VmResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

const CHUNK_BITS: usize = 10;
/// Slots per stack chunk
pub const CHUNK_SIZE: usize = 1 << CHUNK_BITS;
const CHUNK_MASK: usize = CHUNK_SIZE - 1;

/// Default maximum stack size (in slots)
pub const DEFAULT_MAX_STACK_SLOTS: usize = 1 << 20;

/// Shared variable environment (name → value)
pub type VarEnv = Rc<RefCell<FxHashMap<Rc<str>, Value>>>;

/// Index of an activation record in the frame arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub(crate) usize);

impl FrameId {
    /// Arena index
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// What a call executes against
#[derive(Clone, Default)]
pub enum CallSubject {
    /// Free function or static call without class context
    #[default]
    None,
    /// Instance call; the frame holds a reference to `$this`
    Object(ObjectRef),
    /// Static call in a class context
    Class(Rc<Class>),
}

impl CallSubject {
    /// `$this`, if bound
    pub fn this(&self) -> Option<&ObjectRef> {
        match self {
            CallSubject::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Class context: the object's class or the static class
    pub fn class(&self) -> Option<Rc<Class>> {
        match self {
            CallSubject::Object(o) => Some(o.borrow().class.clone()),
            CallSubject::Class(c) => Some(c.clone()),
            CallSubject::None => None,
        }
    }

    /// Check for no subject
    pub fn is_none(&self) -> bool {
        matches!(self, CallSubject::None)
    }

    /// Identity comparison
    pub fn same(&self, other: &CallSubject) -> bool {
        match (self, other) {
            (CallSubject::None, CallSubject::None) => true,
            (CallSubject::Object(a), CallSubject::Object(b)) => Rc::ptr_eq(a, b),
            (CallSubject::Class(a), CallSubject::Class(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl fmt::Debug for CallSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallSubject::None => write!(f, "None"),
            CallSubject::Object(o) => write!(f, "Object({:?})", Value::Object(o.clone())),
            CallSubject::Class(c) => write!(f, "Class({})", c.name),
        }
    }
}

/// Activation record flags
pub mod ar_flags {
    /// Entered from native code; returning leaves the dispatch loop
    pub const FROM_VM_ENTRY: u8 = 1 << 0;
    /// Arguments were repackaged for a magic `__call`/`__callStatic`
    pub const MAGIC_CALL: u8 = 1 << 1;
    /// Constructor frame; its return value is discarded
    pub const CTOR: u8 = 1 << 2;
    /// Frame was re-attached from a resumable
    pub const RESUMED: u8 = 1 << 3;
}

/// Iterator cursor held in a frame's iterator slot
#[derive(Debug, Clone)]
pub enum IterState {
    /// Position in an array
    Array {
        /// Iterated array
        array: ArrayRef,
        /// Current position
        pos: usize,
    },
    /// A generator being driven by `foreach`
    Generator(ObjectRef),
}

/// Connects a re-attached frame to the resumable and the object that owns it
#[derive(Clone)]
pub struct ResumeLink {
    /// Suspended state being run
    pub resumable: Rc<RefCell<Resumable>>,
    /// Generator or wait-handle object exposing it to guest code
    pub owner: ObjectRef,
}

/// One call frame
pub struct ActRec {
    /// Function being executed
    pub callee: Callee,
    /// `$this` or static class context
    pub subject: CallSubject,
    /// Calling frame in the same nested session
    pub prev: Option<FrameId>,
    /// Caller pc to continue at on return
    pub saved_pc: usize,
    /// First slot of the frame (local 0)
    pub base: usize,
    /// Arguments supplied by the caller, before trimming
    pub num_args: u32,
    /// [`ar_flags`] bits
    pub flags: u8,
    /// Original method name for magic calls
    pub inv_name: Option<Rc<str>>,
    /// Surplus arguments kept for the callee
    pub extra_args: Option<Vec<Value>>,
    /// Iterator slots
    pub iters: Vec<Option<IterState>>,
    /// Variable environment seeded into and written back from named locals
    pub var_env: Option<VarEnv>,
    /// Resumable this frame was re-attached from
    pub resume: Option<ResumeLink>,
}

impl ActRec {
    /// Create a pre-live frame whose arguments start at `base`
    pub fn new(callee: Callee, subject: CallSubject, base: usize) -> Self {
        Self {
            callee,
            subject,
            prev: None,
            saved_pc: 0,
            base,
            num_args: 0,
            flags: 0,
            inv_name: None,
            extra_args: None,
            iters: Vec::new(),
            var_env: None,
            resume: None,
        }
    }

    /// Check a flag
    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Set a flag
    #[inline]
    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    /// Interpreted function, if any
    #[inline]
    pub fn func(&self) -> Option<&Rc<Func>> {
        self.callee.as_func()
    }

    /// Local slot count (0 for natives)
    #[inline]
    pub fn local_count(&self) -> usize {
        self.func().map_or(0, |f| f.def.local_count as usize)
    }

    /// One past the last local slot
    #[inline]
    pub fn locals_end(&self) -> usize {
        self.base + self.local_count()
    }
}

impl fmt::Debug for ActRec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActRec")
            .field("callee", self.callee.name())
            .field("subject", &self.subject)
            .field("prev", &self.prev)
            .field("saved_pc", &self.saved_pc)
            .field("base", &self.base)
            .field("num_args", &self.num_args)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Stack statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackStats {
    /// Slots in use
    pub depth: usize,
    /// Frames in the arena (live and pre-live)
    pub frames: usize,
    /// Allocated chunks
    pub chunks: usize,
    /// Maximum slots
    pub max_slots: usize,
}

/// Evaluation stack with its frame arena
pub struct Stack {
    chunks: Vec<Box<[Value]>>,
    sp: usize,
    floor: usize,
    max_slots: usize,
    frames: Vec<ActRec>,
}

impl Stack {
    /// Create a new stack with default size
    pub fn new() -> Self {
        Self::with_max_slots(DEFAULT_MAX_STACK_SLOTS)
    }

    /// Create a stack with a slot limit
    pub fn with_max_slots(max_slots: usize) -> Self {
        Self {
            chunks: Vec::new(),
            sp: 0,
            floor: 0,
            max_slots,
            frames: Vec::with_capacity(64),
        }
    }

    // ========================================================================
    // Value Slots
    // ========================================================================

    /// Push a value onto the stack
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackOverflow` if the slot limit is reached.
    #[inline]
    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.sp >= self.max_slots {
            return Err(VmError::StackOverflow);
        }
        let chunk = self.sp >> CHUNK_BITS;
        if chunk == self.chunks.len() {
            self.chunks
                .push(vec![Value::Null; CHUNK_SIZE].into_boxed_slice());
        }
        self.chunks[chunk][self.sp & CHUNK_MASK] = value;
        self.sp += 1;
        Ok(())
    }

    /// Pop a value from above the current frame's floor
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if the pop would read into the
    /// current frame's locals.
    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        if self.sp <= self.floor {
            return Err(VmError::StackCorruption(format!(
                "pop below frame base (sp={}, floor={})",
                self.sp, self.floor
            )));
        }
        self.sp -= 1;
        Ok(std::mem::take(&mut self.chunks[self.sp >> CHUNK_BITS][self.sp & CHUNK_MASK]))
    }

    /// Peek at value N slots from top (0 = top)
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if the slot is below the floor.
    #[inline]
    pub fn peek_n(&self, n: usize) -> VmResult<&Value> {
        if self.sp <= self.floor + n {
            return Err(VmError::StackCorruption(format!(
                "peek below frame base (sp={}, floor={}, n={})",
                self.sp, self.floor, n
            )));
        }
        let idx = self.sp - 1 - n;
        Ok(&self.chunks[idx >> CHUNK_BITS][idx & CHUNK_MASK])
    }

    /// Peek at the top value
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if the operand stack is empty.
    #[inline]
    pub fn top(&self) -> VmResult<&Value> {
        self.peek_n(0)
    }

    /// Borrow the slot at an absolute index below the cursor
    #[inline]
    pub fn slot(&self, idx: usize) -> Option<&Value> {
        if idx < self.sp {
            Some(&self.chunks[idx >> CHUNK_BITS][idx & CHUNK_MASK])
        } else {
            None
        }
    }

    /// Overwrite the slot at an absolute index below the cursor
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if `idx` is at or above the cursor.
    #[inline]
    pub fn set_slot(&mut self, idx: usize, value: Value) -> VmResult<()> {
        if idx >= self.sp {
            return Err(VmError::StackCorruption(format!(
                "write above stack cursor (idx={}, sp={})",
                idx, self.sp
            )));
        }
        self.chunks[idx >> CHUNK_BITS][idx & CHUNK_MASK] = value;
        Ok(())
    }

    /// Move the slot's value out, leaving null
    #[inline]
    pub fn take_slot(&mut self, idx: usize) -> Value {
        if idx < self.sp {
            std::mem::take(&mut self.chunks[idx >> CHUNK_BITS][idx & CHUNK_MASK])
        } else {
            Value::Null
        }
    }

    /// Pop the top `n` values in push order
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` if fewer than `n` operands exist
    /// above the floor.
    pub fn pop_n(&mut self, n: usize) -> VmResult<SmallVec<[Value; 8]>> {
        if self.sp < self.floor + n {
            return Err(VmError::StackCorruption(format!(
                "pop of {} values below frame base (sp={}, floor={})",
                n, self.sp, self.floor
            )));
        }
        let start = self.sp - n;
        let values = (start..self.sp).map(|i| self.take_slot(i)).collect();
        self.sp = start;
        Ok(values)
    }

    /// Drop every value at or above `new_sp`
    ///
    /// Values are released in top-down order.
    pub fn truncate(&mut self, new_sp: usize) {
        while self.sp > new_sp {
            self.sp -= 1;
            let slot = &mut self.chunks[self.sp >> CHUNK_BITS][self.sp & CHUNK_MASK];
            drop(std::mem::take(slot));
        }
    }

    /// Stack pointer (next free slot)
    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Lowest slot the operand stack may pop
    #[inline]
    pub fn floor(&self) -> usize {
        self.floor
    }

    /// Set the operand floor (done on every frame switch)
    #[inline]
    pub fn set_floor(&mut self, floor: usize) {
        self.floor = floor;
    }

    /// Maximum stack size
    #[inline]
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    // ========================================================================
    // Frame Arena
    // ========================================================================

    /// Push an activation record
    pub fn push_frame(&mut self, ar: ActRec) -> FrameId {
        self.frames.push(ar);
        FrameId(self.frames.len() - 1)
    }

    /// Pop the innermost activation record
    pub fn pop_frame(&mut self) -> Option<ActRec> {
        self.frames.pop()
    }

    /// Drop every frame from index `len` upward
    pub fn truncate_frames(&mut self, len: usize) {
        self.frames.truncate(len);
    }

    /// Borrow a frame
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` for a stale frame ID.
    #[inline]
    pub fn frame(&self, id: FrameId) -> VmResult<&ActRec> {
        self.frames
            .get(id.0)
            .ok_or_else(|| VmError::StackCorruption(format!("stale frame {}", id.0)))
    }

    /// Mutably borrow a frame
    ///
    /// # Errors
    ///
    /// Returns `VmError::StackCorruption` for a stale frame ID.
    #[inline]
    pub fn frame_mut(&mut self, id: FrameId) -> VmResult<&mut ActRec> {
        self.frames
            .get_mut(id.0)
            .ok_or_else(|| VmError::StackCorruption(format!("stale frame {}", id.0)))
    }

    /// Innermost frame ID
    #[inline]
    pub fn top_frame_id(&self) -> Option<FrameId> {
        self.frames.len().checked_sub(1).map(FrameId)
    }

    /// Number of frames in the arena
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Get stack statistics
    pub fn stats(&self) -> StackStats {
        StackStats {
            depth: self.sp,
            frames: self.frames.len(),
            chunks: self.chunks.len(),
            max_slots: self.max_slots,
        }
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}
