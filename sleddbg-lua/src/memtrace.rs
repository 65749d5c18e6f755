//! Interpreter allocation tracing.
//!
//! The host forwards every `(old_ptr, new_ptr, old_size, new_size)` its
//! Lua allocator sees. Events accumulate in a fixed array; filling it
//! signals the caller to stream the batch out and reset, and a
//! breakpoint dumps whatever is outstanding. The collector itself never
//! touches the network, which keeps it testable in isolation.

use sleddbg_core::allocator::SequentialAllocator;
use sleddbg_core::Result;

/// One allocator event. `what` is the wire letter: 'a' allocate,
/// 'd' free, 'r' realloc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemTraceEvent {
    pub what: u8,
    pub old_ptr: usize,
    pub new_ptr: usize,
    pub old_size: usize,
    pub new_size: usize,
}

impl MemTraceEvent {
    pub fn classify(old_ptr: usize, new_ptr: usize, old_size: usize, new_size: usize) -> Self {
        let what = if new_size == 0 {
            b'd'
        } else if old_ptr != 0 && new_ptr != 0 {
            b'r'
        } else {
            b'a'
        };
        Self {
            what,
            old_ptr,
            new_ptr,
            old_size,
            new_size,
        }
    }
}

#[derive(Debug)]
pub(crate) struct MemTrace {
    events: Vec<MemTraceEvent>,
    capacity: u32,
}

impl MemTrace {
    pub fn new(capacity: u32) -> Self {
        Self {
            events: Vec::with_capacity(capacity as usize),
            capacity,
        }
    }

    pub fn required_memory(capacity: u32, alloc: &mut dyn SequentialAllocator) -> Result<()> {
        alloc.allocate(
            capacity as usize * core::mem::size_of::<MemTraceEvent>(),
            1,
        )?;
        Ok(())
    }

    pub fn footprint(&self) -> usize {
        self.capacity as usize * core::mem::size_of::<MemTraceEvent>()
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity != 0
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Record one event. Returns true when this event filled the
    /// buffer; the caller streams [`MemTrace::events`] out and calls
    /// [`MemTrace::reset`].
    #[must_use]
    pub fn record(&mut self, event: MemTraceEvent) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.events.push(event);
        self.events.len() >= self.capacity as usize
    }

    /// Outstanding events, oldest first.
    pub fn events(&self) -> &[MemTraceEvent] {
        &self.events
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }
}
