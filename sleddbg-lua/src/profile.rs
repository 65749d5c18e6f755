//! Function profiler: an explicit call stack with inclusive and
//! exclusive timing.
//!
//! Entries live in a bounded arena keyed by `(tag, file, line_defined)`
//! and link to their callers by index, so the caller chain of any
//! function is iterable without pointers. The call hook pushes a record
//! on enter and pops on leave; exclusive ("inner") time is the
//! inclusive time minus the time spent in child calls. Breakpoints
//! pause all active timers and resume them with the stopped wall-clock
//! gap subtracted.

use std::time::{Duration, Instant};

use sleddbg_core::allocator::SequentialAllocator;
use sleddbg_core::scmp::sizes;
use sleddbg_core::Result;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProfileConfig {
    pub max_functions: u16,
    pub max_call_stack_depth: u16,
}

/// Statistics for one profiled function.
#[derive(Debug, Clone)]
pub(crate) struct ProfileEntry {
    pub tag: String,
    pub file: String,
    pub line_defined: i32,
    pub call_count: u32,
    /// Inclusive elapsed time across all calls.
    pub total: Duration,
    pub shortest: Duration,
    pub longest: Duration,
    /// Exclusive elapsed time (children subtracted) across all calls.
    pub inner_total: Duration,
    pub inner_shortest: Duration,
    pub inner_longest: Duration,
    /// Arena indices of distinct callers observed for this function.
    pub callers: Vec<usize>,
}

impl ProfileEntry {
    fn new(tag: &str, file: &str, line_defined: i32) -> Self {
        Self {
            tag: tag.to_string(),
            file: file.to_string(),
            line_defined,
            call_count: 0,
            total: Duration::ZERO,
            shortest: Duration::MAX,
            longest: Duration::ZERO,
            inner_total: Duration::ZERO,
            inner_shortest: Duration::MAX,
            inner_longest: Duration::ZERO,
            callers: Vec::new(),
        }
    }

    fn matches(&self, tag: &str, file: &str, line_defined: i32) -> bool {
        self.line_defined == line_defined && self.tag == tag && self.file == file
    }

    #[must_use]
    pub fn average(&self) -> Duration {
        if self.call_count == 0 {
            Duration::ZERO
        } else {
            self.total / self.call_count
        }
    }

    #[must_use]
    pub fn inner_average(&self) -> Duration {
        if self.call_count == 0 {
            Duration::ZERO
        } else {
            self.inner_total / self.call_count
        }
    }

    /// Shortest observed time, zero before the first completed call.
    #[must_use]
    pub fn shortest_or_zero(&self) -> Duration {
        if self.call_count == 0 {
            Duration::ZERO
        } else {
            self.shortest
        }
    }

    #[must_use]
    pub fn inner_shortest_or_zero(&self) -> Duration {
        if self.call_count == 0 {
            Duration::ZERO
        } else {
            self.inner_shortest
        }
    }
}

/// One active call being timed.
#[derive(Debug)]
struct ActiveCall {
    entry: usize,
    started: Instant,
    /// Inclusive time of completed child calls.
    child_time: Duration,
}

#[derive(Debug)]
pub(crate) struct ProfileStack {
    config: ProfileConfig,
    entries: Vec<ProfileEntry>,
    stack: Vec<ActiveCall>,
    paused_at: Option<Instant>,
}

impl ProfileStack {
    pub fn new(config: &ProfileConfig) -> Self {
        Self {
            config: *config,
            entries: Vec::with_capacity(config.max_functions as usize),
            stack: Vec::with_capacity(config.max_call_stack_depth as usize),
            paused_at: None,
        }
    }

    /// Nominal per-entry storage: the record plus the bounded tag and
    /// file strings.
    const ENTRY_SPAN: usize = core::mem::size_of::<ProfileEntry>() + sizes::STRING_LEN * 2;

    pub fn required_memory(
        config: &ProfileConfig,
        alloc: &mut dyn SequentialAllocator,
    ) -> Result<()> {
        alloc.allocate(config.max_functions as usize * Self::ENTRY_SPAN, 1)?;
        alloc.allocate(
            config.max_call_stack_depth as usize * core::mem::size_of::<ActiveCall>(),
            1,
        )?;
        Ok(())
    }

    pub fn footprint(&self) -> usize {
        self.config.max_functions as usize * Self::ENTRY_SPAN
            + self.config.max_call_stack_depth as usize * core::mem::size_of::<ActiveCall>()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.max_functions != 0
    }

    pub fn max_functions(&self) -> u16 {
        self.config.max_functions
    }

    pub fn num_functions(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProfileEntry> {
        self.entries.iter()
    }

    /// Begin timing a call. Silently ignored when the arena or the call
    /// stack is at capacity.
    pub fn enter_fn(&mut self, tag: &str, file: &str, line_defined: i32) {
        if !self.is_enabled() || self.stack.len() >= self.config.max_call_stack_depth as usize {
            return;
        }
        let Some(entry) = self.find_or_insert(tag, file, line_defined) else {
            return;
        };
        if let Some(parent) = self.stack.last() {
            let caller = parent.entry;
            let callers = &mut self.entries[entry].callers;
            if !callers.contains(&caller) {
                callers.push(caller);
            }
        }
        self.stack.push(ActiveCall {
            entry,
            started: Instant::now(),
            child_time: Duration::ZERO,
        });
    }

    /// Finish timing the innermost call and fold its elapsed time into
    /// the function's statistics and the caller's child time.
    pub fn leave_fn(&mut self) {
        let Some(call) = self.stack.pop() else {
            return;
        };
        let elapsed = call.started.elapsed();
        let inner = elapsed.saturating_sub(call.child_time);

        let entry = &mut self.entries[call.entry];
        entry.call_count += 1;
        entry.total += elapsed;
        entry.shortest = entry.shortest.min(elapsed);
        entry.longest = entry.longest.max(elapsed);
        entry.inner_total += inner;
        entry.inner_shortest = entry.inner_shortest.min(inner);
        entry.inner_longest = entry.inner_longest.max(inner);

        if let Some(parent) = self.stack.last_mut() {
            parent.child_time += elapsed;
        }
    }

    /// Pause all active timers while a breakpoint holds the interpreter.
    pub fn pre_breakpoint(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    /// Resume after a breakpoint, shifting every active start forward by
    /// the stopped wall-clock gap.
    pub fn post_breakpoint(&mut self) {
        let Some(paused_at) = self.paused_at.take() else {
            return;
        };
        let gap = paused_at.elapsed();
        for call in &mut self.stack {
            if let Some(shifted) = call.started.checked_add(gap) {
                call.started = shifted;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.stack.clear();
        self.paused_at = None;
    }

    /// Look up a profiled function by identity.
    pub fn find_fn(&self, tag: &str, file: &str, line_defined: i32) -> Option<&ProfileEntry> {
        self.entries
            .iter()
            .find(|entry| entry.matches(tag, file, line_defined))
    }

    /// The callers of `entry`, walked through the arena links.
    pub fn callers_of<'a>(
        &'a self,
        entry: &'a ProfileEntry,
    ) -> impl Iterator<Item = &'a ProfileEntry> {
        entry.callers.iter().filter_map(|&index| self.entries.get(index))
    }

    fn find_or_insert(&mut self, tag: &str, file: &str, line_defined: i32) -> Option<usize> {
        if let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.matches(tag, file, line_defined))
        {
            return Some(index);
        }
        if self.entries.len() >= self.config.max_functions as usize {
            return None;
        }
        self.entries.push(ProfileEntry::new(tag, file, line_defined));
        Some(self.entries.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::{ProfileConfig, ProfileStack};
    use std::time::Duration;

    fn stack() -> ProfileStack {
        ProfileStack::new(&ProfileConfig {
            max_functions: 8,
            max_call_stack_depth: 8,
        })
    }

    #[test]
    fn enter_leave_accumulates_statistics() {
        let mut profile = stack();
        profile.enter_fn("f", "a.lua", 1);
        std::thread::sleep(Duration::from_millis(2));
        profile.leave_fn();
        profile.enter_fn("f", "a.lua", 1);
        profile.leave_fn();

        let entry = profile.find_fn("f", "a.lua", 1).unwrap();
        assert_eq!(entry.call_count, 2);
        assert!(entry.total >= Duration::from_millis(2));
        assert!(entry.shortest <= entry.longest);
        assert!(entry.average() <= entry.longest);
        assert!(entry.average() >= entry.shortest_or_zero());
        assert_eq!(profile.num_functions(), 1);
    }

    #[test]
    fn inner_time_excludes_children() {
        let mut profile = stack();
        profile.enter_fn("parent", "a.lua", 1);
        profile.enter_fn("child", "a.lua", 10);
        std::thread::sleep(Duration::from_millis(5));
        profile.leave_fn();
        profile.leave_fn();

        let parent = profile.find_fn("parent", "a.lua", 1).unwrap();
        let child = profile.find_fn("child", "a.lua", 10).unwrap();
        assert!(child.total >= Duration::from_millis(5));
        assert!(parent.total >= child.total);
        assert!(parent.inner_total <= parent.total - child.total + Duration::from_millis(1));
    }

    #[test]
    fn caller_links_form_the_tree() {
        let mut profile = stack();
        profile.enter_fn("parent", "a.lua", 1);
        profile.enter_fn("child", "a.lua", 10);
        profile.leave_fn();
        profile.leave_fn();

        let child = profile.find_fn("child", "a.lua", 10).unwrap();
        let callers: Vec<&str> = profile.callers_of(child).map(|e| e.tag.as_str()).collect();
        assert_eq!(callers, vec!["parent"]);

        let parent = profile.find_fn("parent", "a.lua", 1).unwrap();
        assert_eq!(profile.callers_of(parent).count(), 0);
    }

    #[test]
    fn pause_subtracts_the_breakpoint_gap() {
        let mut profile = stack();
        profile.enter_fn("f", "a.lua", 1);
        profile.pre_breakpoint();
        std::thread::sleep(Duration::from_millis(20));
        profile.post_breakpoint();
        profile.leave_fn();

        let entry = profile.find_fn("f", "a.lua", 1).unwrap();
        assert!(
            entry.total < Duration::from_millis(15),
            "breakpoint gap leaked into timing: {:?}",
            entry.total
        );
    }

    #[test]
    fn capacity_limits_are_enforced() {
        let mut profile = ProfileStack::new(&ProfileConfig {
            max_functions: 1,
            max_call_stack_depth: 8,
        });
        profile.enter_fn("a", "a.lua", 1);
        profile.leave_fn();
        profile.enter_fn("b", "a.lua", 2);
        profile.leave_fn();
        assert_eq!(profile.num_functions(), 1);
        assert!(profile.find_fn("b", "a.lua", 2).is_none());
    }

    #[test]
    fn disabled_profiler_records_nothing() {
        let mut profile = ProfileStack::new(&ProfileConfig {
            max_functions: 0,
            max_call_stack_depth: 8,
        });
        profile.enter_fn("a", "a.lua", 1);
        profile.leave_fn();
        assert_eq!(profile.num_functions(), 0);
    }

    #[test]
    fn clear_empties_stack_and_entries() {
        let mut profile = stack();
        profile.enter_fn("a", "a.lua", 1);
        profile.clear();
        assert_eq!(profile.num_functions(), 0);
        // leave after clear must not panic
        profile.leave_fn();
    }
}
