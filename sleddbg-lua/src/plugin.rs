//! The Lua plugin: state registry, hook dispatch, and the Lua side of
//! the message catalog.
//!
//! Hooks are installed once per registered state with the full
//! line/call/return trigger set and stay installed while the state is
//! registered; every event fast-exits unless something could make it
//! stop (breakpoints, a stepping mode, a pending assert/error break, or
//! the profiler). When a line event decides to stop, the hook parks the
//! interpreter thread inside the core's breakpoint loop; the client's
//! lookup and update requests arrive on that same call stack and reach
//! the interpreter through the current-state slot.
//!
//! Lock order is fixed: the core's shared lock first, then the plugin
//! lock. Plugin state never holds interpreter handles; the registry
//! keys states by their globals-table address.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use mlua::{DebugEvent, HookTriggers, LightUserData, Lua, Value};
use parking_lot::ReentrantMutex;
use tracing::{debug, error, info, warn};

use sleddbg_core::allocator::{SequentialAllocator, SizingAllocator};
use sleddbg_core::scmp::{breakpoint as core_breakpoint, type_codes, Base};
use sleddbg_core::{
    BreakpointParams, ByteBuffer, DebuggerMode, Endian, Reader, SledDebugger, SledDebuggerPlugin,
    StringSet, StringSetConfig, Version,
};

use crate::breakpoint::{evaluate_condition, synthesize_function, Breakpoint};
use crate::config::{
    ChopCharsCallback, EditAndContinueCallback, EditAndContinueFinishCallback, LuaPluginConfig,
    var_exclude_flags,
};
use crate::luautils::{self, lua_types, CURRENT_FRAME};
use crate::memtrace::{MemTrace, MemTraceEvent};
use crate::profile::{ProfileConfig, ProfileEntry, ProfileStack};
use crate::scmp::{
    lua_sizes, lua_type_codes, CallStackLookUpMsg, CallStackLookUpPerformMsg, CallStackMsg,
    LimitsMsg, LuaStateAddMsg, LuaStateRemoveMsg, LuaStateToggleMsg, LuaVariable,
    LuaVariableContext, LuaVariableScope, MemoryTraceMsg, ProfileInfoLookUpPerformMsg,
    ProfileInfoMsg, VarFilterStateNameMsg, VarFilterStateTypeMsg, VarLookUpMsg, VarMsg,
    VarUpdateMsg, WatchLookUpMsg,
};
use crate::varfilter::{VarFilterConfig, VarFilterContainer};
use crate::variables::{self, ChildEntry};
use crate::{LuaError, Result};

/// Wire id of the Lua plugin.
pub const LUA_PLUGIN_ID: u16 = 1;

const PLUGIN_NAME: &str = "SLED Lua Plugin";
const PLUGIN_VERSION: Version = Version::new(0, 5, 0);

/// Script-visible table installed per state for the debugger core.
pub(crate) const DEBUGGER_TABLE: &str = "libsleddebugger";
/// Script-visible table installed per state for this plugin.
pub(crate) const PLUGIN_TABLE: &str = "libsledluaplugin";

#[derive(Debug)]
struct LuaStateEntry {
    key: usize,
    address: String,
    name: String,
    debugging: bool,
}

struct PluginState {
    send_buf: ByteBuffer,
    work_buf: String,
    states: Vec<LuaStateEntry>,
    breakpoints: Vec<Breakpoint>,
    profile: ProfileStack,
    memtrace: MemTrace,
    filters: VarFilterContainer,
    /// Per-scope type masks, indexed by scope ordinal then type ordinal.
    type_filters: [[bool; 9]; 4],
    edit_queue: StringSet,
    var_exclude: u32,
    lookup_watches: bool,
    hit_breakpoint: bool,
    assert_break: bool,
    error_break: bool,
    last_stack_levels: i32,
    profiler_running: bool,
    memtracer_running: bool,
    max_lua_states: u16,
    max_lua_state_name_len: u16,
    max_breakpoints: u16,
    chop_chars: i32,
    chop_callback: Option<ChopCharsCallback>,
    ec_callback: Option<EditAndContinueCallback>,
    ec_finish: Option<EditAndContinueFinishCallback>,
    footprint: usize,
}

/// Slot holding the interpreter currently parked in the breakpoint
/// loop. Written only by the interpreter thread right before it enters
/// `breakpoint_reached` and cleared before that borrow ends; readers
/// run on the same call stack (message handlers dispatched by the pump),
/// so the reference is live for every access.
struct CurrentLua(AtomicPtr<Lua>);

impl CurrentLua {
    const fn empty() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    fn set(&self, lua: &Lua) {
        self.0.store((lua as *const Lua).cast_mut(), Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(ptr::null_mut(), Ordering::Release);
    }

    fn is_set(&self) -> bool {
        !self.0.load(Ordering::Acquire).is_null()
    }

    #[allow(unsafe_code)]
    fn with<R>(&self, f: impl FnOnce(&Lua) -> R) -> Option<R> {
        let raw = self.0.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: non-null only while the owning interpreter thread is
        // parked inside the breakpoint loop below us on this call stack.
        let lua = unsafe { &*raw };
        Some(f(lua))
    }
}

/// Lua language plugin. One instance may serve several interpreter
/// states, including coroutine children registered separately.
pub struct LuaPlugin {
    cell: ReentrantMutex<RefCell<PluginState>>,
    current: CurrentLua,
}

fn filter_config(config: &LuaPluginConfig) -> VarFilterConfig {
    VarFilterConfig {
        max_filters: config.max_num_var_filters,
        max_patterns_per_filter: config.max_patterns_per_var_filter,
        max_pattern_len: config.max_var_filter_pattern_len,
    }
}

fn profile_config(config: &LuaPluginConfig) -> ProfileConfig {
    ProfileConfig {
        max_functions: config.max_profile_functions,
        max_call_stack_depth: config.max_profile_call_stack_depth,
    }
}

fn edit_queue_config(config: &LuaPluginConfig) -> StringSetConfig {
    StringSetConfig {
        max_entries: config.max_edit_and_continues,
        max_entry_len: config.max_edit_and_continue_entry_len,
        allow_duplicates: false,
    }
}

fn validate_config(config: &LuaPluginConfig) -> Result<()> {
    if config.max_lua_states == 0
        || config.max_send_buffer_size == 0
        || config.max_work_buffer_size == 0
    {
        return Err(LuaError::Core(sleddbg_core::Error::InvalidConfiguration));
    }
    Ok(())
}

fn layout(config: &LuaPluginConfig, alloc: &mut dyn SequentialAllocator) -> Result<()> {
    alloc.allocate(config.max_send_buffer_size as usize, 1)?;
    alloc.allocate(config.max_work_buffer_size as usize, 1)?;
    alloc.allocate(
        config.max_lua_states as usize
            * (core::mem::size_of::<LuaStateEntry>()
                + config.max_lua_state_name_len as usize
                + lua_sizes::PTR_LEN),
        1,
    )?;
    alloc.allocate(
        config.max_breakpoints as usize
            * (core::mem::size_of::<Breakpoint>() + sleddbg_core::scmp::sizes::STRING_LEN * 2),
        1,
    )?;
    ProfileStack::required_memory(&profile_config(config), alloc)?;
    MemTrace::required_memory(config.max_mem_traces, alloc)?;
    VarFilterContainer::required_memory(&filter_config(config), alloc)?;
    StringSet::required_memory(&edit_queue_config(config), alloc)?;
    Ok(())
}

impl LuaPlugin {
    /// Bytes of config-sized storage a plugin built from `config` will
    /// reserve. A successful size query is the precondition for
    /// [`LuaPlugin::new`].
    ///
    /// # Errors
    ///
    /// Configuration errors.
    pub fn required_memory(config: &LuaPluginConfig) -> Result<usize> {
        validate_config(config)?;
        let mut sizing = SizingAllocator::new();
        layout(config, &mut sizing)?;
        Ok(sizing.bytes_allocated())
    }

    /// Create a plugin instance. All capacities are fixed here.
    ///
    /// # Errors
    ///
    /// Configuration errors, as reported by
    /// [`LuaPlugin::required_memory`].
    pub fn new(config: &LuaPluginConfig) -> Result<Arc<Self>> {
        let footprint = Self::required_memory(config)?;
        let mut work_buf = String::new();
        work_buf.reserve_exact(config.max_work_buffer_size as usize);
        let state = PluginState {
            send_buf: ByteBuffer::new(config.max_send_buffer_size),
            work_buf,
            states: Vec::with_capacity(config.max_lua_states as usize),
            breakpoints: Vec::with_capacity(config.max_breakpoints as usize),
            profile: ProfileStack::new(&profile_config(config)),
            memtrace: MemTrace::new(config.max_mem_traces),
            filters: VarFilterContainer::new(&filter_config(config)),
            type_filters: [[false; 9]; 4],
            edit_queue: StringSet::new(&edit_queue_config(config)),
            var_exclude: var_exclude_flags::NONE,
            lookup_watches: false,
            hit_breakpoint: false,
            assert_break: false,
            error_break: false,
            last_stack_levels: 0,
            profiler_running: false,
            memtracer_running: false,
            max_lua_states: config.max_lua_states,
            max_lua_state_name_len: config.max_lua_state_name_len,
            max_breakpoints: config.max_breakpoints,
            chop_chars: config.num_path_chop_chars,
            chop_callback: config.chop_chars_callback.clone(),
            ec_callback: config.edit_and_continue_callback.clone(),
            ec_finish: config.edit_and_continue_finish_callback.clone(),
            footprint,
        };
        Ok(Arc::new(Self {
            cell: ReentrantMutex::new(RefCell::new(state)),
            current: CurrentLua::empty(),
        }))
    }

    /// Bytes of config-sized storage actually reserved.
    #[must_use]
    pub fn memory_footprint(&self) -> usize {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.footprint
    }

    #[must_use]
    pub fn is_profiler_running(&self) -> bool {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.profiler_running
    }

    #[must_use]
    pub fn is_memory_tracer_running(&self) -> bool {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.memtracer_running
    }

    /// Drop all accumulated profile data.
    pub fn reset_profile_info(&self) {
        let guard = self.cell.lock();
        guard.borrow_mut().profile.clear();
    }

    /// Drop all outstanding memory trace events.
    pub fn reset_memory_trace(&self) {
        let guard = self.cell.lock();
        guard.borrow_mut().memtrace.reset();
    }

    /// Suppress per-scope variable emission during breakpoints; see
    /// [`var_exclude_flags`].
    pub fn set_var_exclude_flags(&self, flags: u32) {
        let guard = self.cell.lock();
        guard.borrow_mut().var_exclude = flags;
    }

    #[must_use]
    pub fn var_exclude_flags(&self) -> u32 {
        let guard = self.cell.lock();
        let __tmp = guard.borrow().var_exclude;
        __tmp
    }

    /// Number of registered states.
    #[must_use]
    pub fn num_states(&self) -> usize {
        let guard = self.cell.lock();
        let __tmp = guard.borrow().states.len();
        __tmp
    }

    /// Number of registered breakpoints.
    #[must_use]
    pub fn num_breakpoints(&self) -> usize {
        let guard = self.cell.lock();
        let __tmp = guard.borrow().breakpoints.len();
        __tmp
    }

    // ------------------------------------------------------------------
    // State registry
    // ------------------------------------------------------------------

    /// Register an interpreter state: install the script-visible helper
    /// tables and the debug hook, and announce the state to a connected
    /// client. Coroutine children share the parent's globals and must
    /// not be registered separately; new independent states may.
    ///
    /// # Errors
    ///
    /// [`LuaError::DuplicateLuaState`], [`LuaError::OverLuaStateLimit`],
    /// [`LuaError::LuaStateAlreadyRegistered`] when the state carries
    /// another instance's helper tables, or
    /// [`LuaError::InvalidLuaState`] for interpreter failures.
    pub fn register_state(
        self: &Arc<Self>,
        debugger: &Arc<SledDebugger>,
        lua: &Lua,
        name: &str,
    ) -> Result<()> {
        let _shared = debugger.lock_shared();
        let key = luautils::state_key(lua);
        {
            let guard = self.cell.lock();
            let st = guard.borrow();
            if st.states.iter().any(|entry| entry.key == key) {
                return Err(LuaError::DuplicateLuaState);
            }
            if st.states.len() >= st.max_lua_states as usize {
                error!("no space for lua state");
                return Err(LuaError::OverLuaStateLimit);
            }
        }

        self.install_helper_tables(debugger, lua)?;

        let address = luautils::state_address(lua);
        {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            let mut display = name.to_string();
            display.truncate(st.max_lua_state_name_len as usize);
            st.states.push(LuaStateEntry {
                key,
                address: address.clone(),
                name: display,
                debugging: true,
            });
        }

        self.install_hook(debugger, lua);
        info!(%address, name, "lua state registered");

        if debugger.is_debugger_connected() {
            self.send_simple(debugger, lua_type_codes::LUA_STATE_BEGIN);
            let display = {
                let guard = self.cell.lock();
                let st = guard.borrow();
                st.states
                    .last()
                    .map(|entry| entry.name.clone())
                    .unwrap_or_default()
            };
            self.send_via_buf(debugger, |buf| {
                LuaStateAddMsg {
                    plugin_id: LUA_PLUGIN_ID,
                    address: &address,
                    name: &display,
                    debugging: true,
                }
                .pack(buf, Endian::NATIVE)
            });
            self.send_simple(debugger, lua_type_codes::LUA_STATE_END);
        }
        Ok(())
    }

    /// Unregister a state: remove the helper tables and the hook, and
    /// announce the removal to a connected client.
    ///
    /// # Errors
    ///
    /// [`LuaError::LuaStateNotFound`] for an unknown state.
    pub fn unregister_state(&self, debugger: &Arc<SledDebugger>, lua: &Lua) -> Result<()> {
        let _shared = debugger.lock_shared();
        let key = luautils::state_key(lua);
        let address = {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            let index = st
                .states
                .iter()
                .position(|entry| entry.key == key)
                .ok_or(LuaError::LuaStateNotFound)?;
            st.states.remove(index).address
        };

        let globals = lua.globals();
        let _ = globals.set(DEBUGGER_TABLE, Value::Nil);
        let _ = globals.set(PLUGIN_TABLE, Value::Nil);
        lua.remove_hook();
        info!(%address, "lua state unregistered");

        if debugger.is_debugger_connected() {
            self.send_simple(debugger, lua_type_codes::LUA_STATE_BEGIN);
            self.send_via_buf(debugger, |buf| {
                LuaStateRemoveMsg {
                    plugin_id: LUA_PLUGIN_ID,
                    address: &address,
                }
                .pack(buf, Endian::NATIVE)
            });
            self.send_simple(debugger, lua_type_codes::LUA_STATE_END);
        }
        Ok(())
    }

    fn install_helper_tables(
        self: &Arc<Self>,
        debugger: &Arc<SledDebugger>,
        lua: &Lua,
    ) -> Result<()> {
        let globals = lua.globals();

        // Core table: reject a state already claimed by another core.
        match globals.get::<_, Value>(DEBUGGER_TABLE) {
            Ok(Value::Table(existing)) => {
                let claimed = matches!(
                    existing.get::<_, Value>("instance"),
                    Ok(Value::LightUserData(ptr))
                        if ptr.0 == (Arc::as_ptr(debugger) as *mut core::ffi::c_void)
                );
                if !claimed {
                    error!("lua state already registered to another debugger");
                    return Err(LuaError::LuaStateAlreadyRegistered);
                }
            }
            _ => {
                let table = lua.create_table().map_err(|_| LuaError::InvalidLuaState)?;
                table
                    .set(
                        "instance",
                        Value::LightUserData(LightUserData(
                            Arc::as_ptr(debugger) as *mut core::ffi::c_void,
                        )),
                    )
                    .and_then(|()| table.set("version", SledDebugger::version().to_string()))
                    .and_then(|()| globals.set(DEBUGGER_TABLE, table))
                    .map_err(|_| LuaError::InvalidLuaState)?;
            }
        }

        // Plugin table: reject a state claimed by another plugin.
        match globals.get::<_, Value>(PLUGIN_TABLE) {
            Ok(Value::Table(existing)) => {
                let claimed = matches!(
                    existing.get::<_, Value>("instance"),
                    Ok(Value::LightUserData(ptr))
                        if ptr.0 == (Arc::as_ptr(self) as *mut core::ffi::c_void)
                );
                if claimed {
                    Ok(())
                } else {
                    error!("lua state already registered to another plugin");
                    Err(LuaError::LuaStateAlreadyRegistered)
                }
            }
            _ => {
                let table = lua.create_table().map_err(|_| LuaError::InvalidLuaState)?;
                table
                    .set(
                        "instance",
                        Value::LightUserData(LightUserData(
                            Arc::as_ptr(self) as *mut core::ffi::c_void
                        )),
                    )
                    .and_then(|()| table.set("version", PLUGIN_VERSION.to_string()))
                    .map_err(|_| LuaError::InvalidLuaState)?;

                let plugin = Arc::clone(self);
                let core = Arc::clone(debugger);
                let tty = lua
                    .create_function(move |lua, args: mlua::MultiValue| {
                        plugin.script_tty(&core, lua, args);
                        Ok(())
                    })
                    .map_err(|_| LuaError::InvalidLuaState)?;
                table.set("tty", tty).map_err(|_| LuaError::InvalidLuaState)?;

                let plugin = Arc::clone(self);
                let core = Arc::clone(debugger);
                let assert_fn = lua
                    .create_function(move |lua, args: (Value, Option<String>)| {
                        plugin.script_assert(&core, lua, args.0, args.1.as_deref());
                        Ok(())
                    })
                    .map_err(|_| LuaError::InvalidLuaState)?;
                table
                    .set("assert", assert_fn)
                    .map_err(|_| LuaError::InvalidLuaState)?;

                let plugin = Arc::clone(self);
                let core = Arc::clone(debugger);
                let errorhandler = lua
                    .create_function(move |lua, err: Value| {
                        plugin.script_error_handler(&core, lua, &err);
                        Ok(())
                    })
                    .map_err(|_| LuaError::InvalidLuaState)?;
                table
                    .set("errorhandler", errorhandler)
                    .map_err(|_| LuaError::InvalidLuaState)?;

                table
                    .set("userdatatostring", Value::Nil)
                    .and_then(|()| {
                        let sub = lua.create_table()?;
                        table.set("editandcontinue", sub)
                    })
                    .and_then(|()| globals.set(PLUGIN_TABLE, table))
                    .map_err(|_| LuaError::InvalidLuaState)?;

                // Placeholder replaced per evaluation by the condition
                // machinery's synthesized predicates.
                lua.load("function libsledluaplugin:bp_func() end")
                    .exec()
                    .map_err(|_| LuaError::InvalidLuaState)?;
                Ok(())
            }
        }
    }

    fn install_hook(self: &Arc<Self>, debugger: &Arc<SledDebugger>, lua: &Lua) {
        let plugin = Arc::clone(self);
        let core = Arc::clone(debugger);
        lua.set_hook(
            HookTriggers {
                every_line: true,
                on_calls: true,
                on_returns: true,
                ..HookTriggers::default()
            },
            move |lua, ar| {
                plugin.hook_event(&core, lua, &ar);
                Ok(())
            },
        );
    }

    // ------------------------------------------------------------------
    // Hook dispatch
    // ------------------------------------------------------------------

    fn hook_event(&self, debugger: &Arc<SledDebugger>, lua: &Lua, ar: &mlua::Debug) {
        match ar.event() {
            DebugEvent::Line => self.line_event(debugger, lua, ar),
            DebugEvent::Call => self.profiler_enter(lua),
            DebugEvent::Ret => self.profiler_leave(lua),
            _ => {}
        }
    }

    fn state_debugging(&self, lua: &Lua) -> bool {
        let key = luautils::state_key(lua);
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.states
            .iter()
            .find(|entry| entry.key == key)
            .is_some_and(|entry| entry.debugging)
    }

    fn line_event(&self, debugger: &Arc<SledDebugger>, lua: &Lua, ar: &mlua::Debug) {
        let line = ar.curr_line();
        if line < 0 {
            return;
        }

        let (has_breakpoints, assert_break, error_break) = {
            let guard = self.cell.lock();
            let st = guard.borrow();
            (!st.breakpoints.is_empty(), st.assert_break, st.error_break)
        };
        let mode = debugger.debugger_mode();

        // Nothing can stop this line: bail before touching the source.
        if !has_breakpoints && mode == DebuggerMode::Normal && !assert_break && !error_break {
            return;
        }
        if !self.state_debugging(lua) {
            return;
        }

        let source = {
            let raw = ar.source();
            let raw = raw.source.as_deref().unwrap_or("");
            let guard = self.cell.lock();
            let st = guard.borrow();
            luautils::trim_file_name(raw, st.chop_chars, st.chop_callback.as_ref()).to_string()
        };

        let mut should_stop =
            mode == DebuggerMode::StepInto || mode == DebuggerMode::Stop || assert_break || error_break;
        if mode == DebuggerMode::StepOver || mode == DebuggerMode::StepOut {
            let depth = luautils::stack_depth(lua);
            let last = {
                let guard = self.cell.lock();
                let __tmp = guard.borrow().last_stack_levels;
                __tmp
            };
            should_stop = if mode == DebuggerMode::StepOver {
                depth <= last
            } else {
                depth < last
            };
        }

        if should_stop || self.is_line_breakpoint(lua, &source, line) {
            self.stop_at(debugger, lua, &source, line);
        }
    }

    fn is_line_breakpoint(&self, lua: &Lua, source: &str, line: i32) -> bool {
        let Ok(hash) = sleddbg_core::generate_hash(source, line) else {
            return false;
        };
        let matched = {
            let guard = self.cell.lock();
            let st = guard.borrow();
            st.breakpoints
                .iter()
                .find(|bp| bp.matches(source, line, hash))
                .cloned()
        };
        match matched {
            None => false,
            Some(bp) if !bp.has_condition() => true,
            Some(bp) => {
                let mut work_buf = {
                    let guard = self.cell.lock();
                    let __tmp = core::mem::take(&mut guard.borrow_mut().work_buf);
                    __tmp
                };
                let fired = evaluate_condition(lua, &bp, &mut work_buf);
                let guard = self.cell.lock();
                guard.borrow_mut().work_buf = work_buf;
                fired
            }
        }
    }

    /// Park the interpreter in the breakpoint loop and restore the
    /// profiler clocks afterwards.
    fn stop_at(&self, debugger: &Arc<SledDebugger>, lua: &Lua, source: &str, line: i32) {
        {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            st.assert_break = false;
            st.error_break = false;
            st.last_stack_levels = 0;
            st.profile.pre_breakpoint();
            st.hit_breakpoint = true;
        }
        self.current.set(lua);

        let params = BreakpointParams::new(LUA_PLUGIN_ID, line.max(0) as u32, source);
        if let Err(err) = debugger.breakpoint_reached(&params) {
            debug!(?err, "breakpoint loop ended early");
        }
        self.handle_edit_and_continue_resume(debugger, lua);

        self.current.clear();
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        st.profile.post_breakpoint();
        st.hit_breakpoint = false;
    }

    fn profiler_enter(&self, lua: &Lua) {
        {
            let guard = self.cell.lock();
            if !guard.borrow().profiler_running {
                return;
            }
        }
        if !self.state_debugging(lua) {
            return;
        }
        let Some(info) = luautils::frame_info(lua, CURRENT_FRAME) else {
            return;
        };
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        let file = if info.line_defined < 0 {
            // C functions keep their raw chunk name.
            info.source.clone()
        } else {
            luautils::trim_file_name(&info.source, st.chop_chars, st.chop_callback.as_ref())
                .to_string()
        };
        let tag = luautils::tag_for_lookup(info.name.as_deref(), &file, info.line_defined);
        st.profile.enter_fn(&tag, &file, info.line_defined);
    }

    fn profiler_leave(&self, _lua: &Lua) {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if st.profiler_running {
            st.profile.leave_fn();
        }
    }

    // ------------------------------------------------------------------
    // Script-visible functions
    // ------------------------------------------------------------------

    fn script_tty(&self, core: &Arc<SledDebugger>, lua: &Lua, args: mlua::MultiValue) {
        if args.is_empty() {
            return;
        }
        let _shared = core.lock_shared();
        for value in args {
            if let Ok(Some(text)) = lua.coerce_string(value) {
                if let Ok(text) = text.to_str() {
                    let _ = core.tty_notify(text);
                }
            }
        }
        let _ = core.tty_notify("\n");
    }

    fn script_assert(
        &self,
        core: &Arc<SledDebugger>,
        lua: &Lua,
        condition: Value,
        message: Option<&str>,
    ) {
        // Only a literal false boolean fails the assertion.
        if !matches!(condition, Value::Boolean(false)) {
            return;
        }
        self.debugger_break_state(core, lua, message.unwrap_or(""));
    }

    fn script_error_handler(&self, core: &Arc<SledDebugger>, lua: &Lua, err: &Value) {
        if !core.is_debugger_connected() {
            return;
        }
        {
            let _shared = core.lock_shared();
            if let Ok(Some(text)) = lua.coerce_string(err.clone()) {
                if let Ok(text) = text.to_str() {
                    let _ = core.tty_notify(text);
                }
            }
        }
        {
            let guard = self.cell.lock();
            guard.borrow_mut().error_break = true;
        }
        // Stop right here, in the erroring frame.
        self.force_break(core, lua);
    }

    fn force_break(&self, debugger: &Arc<SledDebugger>, lua: &Lua) {
        // Find the innermost Lua frame; C frames carry no line info.
        for level in CURRENT_FRAME..CURRENT_FRAME + 8 {
            if let Some(info) = luautils::frame_info(lua, level) {
                if info.current_line >= 0 {
                    let source = {
                        let guard = self.cell.lock();
                        let st = guard.borrow();
                        luautils::trim_file_name(
                            &info.source,
                            st.chop_chars,
                            st.chop_callback.as_ref(),
                        )
                        .to_string()
                    };
                    self.stop_at(debugger, lua, &source, info.current_line);
                    return;
                }
            } else {
                break;
            }
        }
    }

    /// Force a breakpoint on one state, with optional TTY text. The
    /// break takes effect at the state's next executed line.
    pub fn debugger_break_state(&self, core: &Arc<SledDebugger>, lua: &Lua, text: &str) {
        let _shared = core.lock_shared();
        if !core.is_debugger_connected() {
            return;
        }
        if !self.state_debugging(lua) {
            return;
        }
        {
            let guard = self.cell.lock();
            guard.borrow_mut().assert_break = true;
        }
        if !text.is_empty() {
            let _ = core.tty_notify(text);
            let _ = core.tty_notify("\n");
        }
    }

    /// Force a breakpoint on every debuggable state.
    pub fn debugger_break(&self, core: &Arc<SledDebugger>, text: &str) {
        let _shared = core.lock_shared();
        if !core.is_debugger_connected() {
            return;
        }
        let any_debuggable = {
            let guard = self.cell.lock();
            let __tmp = guard.borrow().states.iter().any(|entry| entry.debugging);
            __tmp
        };
        if !any_debuggable {
            return;
        }
        {
            let guard = self.cell.lock();
            guard.borrow_mut().assert_break = true;
        }
        if !text.is_empty() {
            let _ = core.tty_notify(text);
            let _ = core.tty_notify("\n");
        }
    }

    // ------------------------------------------------------------------
    // Memory tracer
    // ------------------------------------------------------------------

    /// Report one interpreter allocator event. Returns whether the event
    /// was recorded. A full buffer streams out as a
    /// `MemoryTraceStreamBegin` / events / `MemoryTraceStreamEnd` burst.
    pub fn memory_trace_notify(
        &self,
        core: &Arc<SledDebugger>,
        old_ptr: usize,
        new_ptr: usize,
        old_size: usize,
        new_size: usize,
    ) -> bool {
        let full = {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            if !st.memtracer_running || !st.memtrace.is_enabled() {
                return false;
            }
            st.memtrace
                .record(MemTraceEvent::classify(old_ptr, new_ptr, old_size, new_size))
        };
        if full {
            let _shared = core.lock_shared();
            self.flush_memtrace(
                core,
                lua_type_codes::MEMORY_TRACE_STREAM_BEGIN,
                lua_type_codes::MEMORY_TRACE_STREAM,
                lua_type_codes::MEMORY_TRACE_STREAM_END,
            );
        }
        true
    }

    fn flush_memtrace(&self, core: &SledDebugger, begin: u16, item: u16, end: u16) {
        let outstanding = {
            let guard = self.cell.lock();
            let __tmp = guard.borrow().memtrace.len();
            __tmp
        };
        if outstanding == 0 {
            return;
        }
        self.send_simple(core, begin);
        let mut index = 0;
        loop {
            let event = {
                let guard = self.cell.lock();
                let __tmp = guard.borrow().memtrace.events().get(index).copied();
                __tmp
            };
            let Some(event) = event else { break };
            self.send_via_buf(core, |buf| {
                MemoryTraceMsg {
                    plugin_id: LUA_PLUGIN_ID,
                    what: event.what,
                    old_ptr: &format!("0x{:x}", event.old_ptr),
                    new_ptr: &format!("0x{:x}", event.new_ptr),
                    old_size: event.old_size as i32,
                    new_size: event.new_size as i32,
                }
                .pack(item, buf, Endian::NATIVE)
            });
            index += 1;
        }
        self.send_simple(core, end);
        let guard = self.cell.lock();
        guard.borrow_mut().memtrace.reset();
    }

    // ------------------------------------------------------------------
    // Emission helpers
    // ------------------------------------------------------------------

    fn send_simple(&self, core: &SledDebugger, type_code: u16) {
        let frame = Base::simple(type_code, LUA_PLUGIN_ID).encode(Endian::NATIVE);
        let _ = core.send(&frame);
    }

    fn send_via_buf(
        &self,
        core: &SledDebugger,
        pack: impl FnOnce(&mut ByteBuffer) -> sleddbg_core::Result<()>,
    ) {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if pack(&mut st.send_buf).is_ok() {
            let _ = core.send(st.send_buf.as_slice());
        }
    }

    fn scope_ordinal(scope: LuaVariableScope) -> usize {
        scope.as_u8() as usize
    }

    fn is_type_filtered(&self, scope: LuaVariableScope, ordinal: i32) -> bool {
        let Ok(index) = usize::try_from(ordinal) else {
            return false;
        };
        if index >= 9 {
            return false;
        }
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.type_filters[Self::scope_ordinal(scope)][index]
    }

    fn is_name_filtered(&self, scope: LuaVariableScope, name: &str) -> bool {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.filters.is_filtered_scope(name, scope)
    }

    fn is_child_filtered(&self, scope: LuaVariableScope, child: &ChildEntry) -> bool {
        self.is_type_filtered(scope, child.value_type) || self.is_name_filtered(scope, &child.key)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_var(
        &self,
        core: &SledDebugger,
        scope: LuaVariableScope,
        parent: Option<&LuaVariable<'_>>,
        name: &str,
        name_type: i32,
        value: &str,
        value_type: i32,
        stack_level: i32,
        index: i32,
    ) {
        // Interpreter temporaries never leave the runtime.
        if (scope == LuaVariableScope::Local || scope == LuaVariableScope::Upvalue)
            && name.starts_with('(')
        {
            return;
        }
        let type_code = match scope {
            LuaVariableScope::Global => lua_type_codes::GLOBAL_VAR,
            LuaVariableScope::Local => lua_type_codes::LOCAL_VAR,
            LuaVariableScope::Upvalue => lua_type_codes::UPVALUE_VAR,
            LuaVariableScope::Environment => lua_type_codes::ENV_VAR,
        };
        self.send_via_buf(core, |buf| {
            VarMsg {
                plugin_id: LUA_PLUGIN_ID,
                parent,
                name,
                name_type: name_type as i16,
                value,
                value_type: value_type as i16,
                stack_level: stack_level as i16,
                index,
            }
            .pack(type_code, buf, Endian::NATIVE)
        });
    }

    // ------------------------------------------------------------------
    // Breakpoint snapshot emission
    // ------------------------------------------------------------------

    fn emit_breakpoint_snapshot(&self, core: &SledDebugger, lua: &Lua) {
        let exclude = {
            let guard = self.cell.lock();
            let __tmp = guard.borrow().var_exclude;
            __tmp
        };

        if exclude & var_exclude_flags::GLOBALS == 0 {
            self.send_simple(core, lua_type_codes::GLOBAL_VAR_BEGIN);
            for child in variables::global_children(lua) {
                if !self.is_child_filtered(LuaVariableScope::Global, &child) {
                    self.send_var(
                        core,
                        LuaVariableScope::Global,
                        None,
                        &child.key,
                        child.key_type,
                        &child.value,
                        child.value_type,
                        0,
                        0,
                    );
                }
            }
            self.send_simple(core, lua_type_codes::GLOBAL_VAR_END);
        }

        self.send_simple(core, lua_type_codes::CALL_STACK_BEGIN);

        let mut level = CURRENT_FRAME;
        while let Some(info) = luautils::frame_info(lua, level) {
            let (file, tag) = {
                let guard = self.cell.lock();
                let st = guard.borrow();
                let file = luautils::trim_file_name(
                    &info.source,
                    st.chop_chars,
                    st.chop_callback.as_ref(),
                )
                .to_string();
                let tag = luautils::tag_for_lookup(info.name.as_deref(), &file, info.line_defined);
                (file, tag)
            };
            self.send_via_buf(core, |buf| {
                CallStackMsg {
                    plugin_id: LUA_PLUGIN_ID,
                    rel_script_path: &file,
                    current_line: info.current_line,
                    line_defined: info.line_defined,
                    last_line_defined: info.last_line_defined,
                    function_name: &tag,
                    stack_level: (level - CURRENT_FRAME) as i16,
                }
                .pack(buf, Endian::NATIVE)
            });

            if level == CURRENT_FRAME {
                self.emit_frame_variables(core, lua, level, exclude);
            }
            level += 1;
        }
        {
            let guard = self.cell.lock();
            guard.borrow_mut().last_stack_levels = level - CURRENT_FRAME - 1;
        }

        self.send_simple(core, lua_type_codes::CALL_STACK_END);
    }

    /// Locals, upvalues, and environment of one frame, each group framed
    /// by its Begin/End pair.
    fn emit_frame_variables(&self, core: &SledDebugger, lua: &Lua, level: i32, exclude: u32) {
        if exclude & var_exclude_flags::LOCALS == 0 {
            self.send_simple(core, lua_type_codes::LOCAL_VAR_BEGIN);
            for (name, value, index) in luautils::capture_locals(lua, level) {
                let (value_type, rendered) = variables::encode_value(lua, &value);
                if !self.is_type_filtered(LuaVariableScope::Local, value_type)
                    && !self.is_name_filtered(LuaVariableScope::Local, &name)
                {
                    self.send_var(
                        core,
                        LuaVariableScope::Local,
                        None,
                        &name,
                        lua_types::STRING,
                        &rendered,
                        value_type,
                        level,
                        index,
                    );
                }
            }
            self.send_simple(core, lua_type_codes::LOCAL_VAR_END);
        }

        if exclude & var_exclude_flags::UPVALUES == 0 {
            self.send_simple(core, lua_type_codes::UPVALUE_VAR_BEGIN);
            if let Some(func) = luautils::function_at_level(lua, level) {
                for (name, value, index) in luautils::capture_upvalues(lua, &func) {
                    let (value_type, rendered) = variables::encode_value(lua, &value);
                    if !self.is_type_filtered(LuaVariableScope::Upvalue, value_type)
                        && !self.is_name_filtered(LuaVariableScope::Upvalue, &name)
                    {
                        self.send_var(
                            core,
                            LuaVariableScope::Upvalue,
                            None,
                            &name,
                            lua_types::STRING,
                            &rendered,
                            value_type,
                            level,
                            index,
                        );
                    }
                }
            }
            self.send_simple(core, lua_type_codes::UPVALUE_VAR_END);
        }

        if exclude & var_exclude_flags::ENVIRONMENT == 0 {
            self.send_simple(core, lua_type_codes::ENV_VAR_BEGIN);
            if let Some(env) = variables::environment_at_level(lua, level) {
                for child in variables::table_children(lua, &env) {
                    if !self.is_child_filtered(LuaVariableScope::Environment, &child) {
                        self.send_var(
                            core,
                            LuaVariableScope::Environment,
                            None,
                            &child.key,
                            child.key_type,
                            &child.value,
                            child.value_type,
                            level,
                            0,
                        );
                    }
                }
            }
            self.send_simple(core, lua_type_codes::ENV_VAR_END);
        }
    }

    fn emit_profile_dump(&self, core: &SledDebugger) {
        let entries: Vec<ProfileInfoSnapshot> = {
            let guard = self.cell.lock();
            let st = guard.borrow();
            if st.profile.num_functions() == 0 {
                return;
            }
            st.profile
                .entries()
                .map(|entry| ProfileInfoSnapshot::from_entry(entry, &st.profile))
                .collect()
        };
        self.send_simple(core, lua_type_codes::PROFILE_INFO_BEGIN);
        for snapshot in &entries {
            self.send_via_buf(core, |buf| {
                snapshot.as_msg().pack(lua_type_codes::PROFILE_INFO, buf, Endian::NATIVE)
            });
        }
        self.send_simple(core, lua_type_codes::PROFILE_INFO_END);
    }

    fn emit_memtrace_dump(&self, core: &SledDebugger) {
        self.flush_memtrace(
            core,
            lua_type_codes::MEMORY_TRACE_BEGIN,
            lua_type_codes::MEMORY_TRACE,
            lua_type_codes::MEMORY_TRACE_END,
        );
    }

    // ------------------------------------------------------------------
    // Message handlers
    // ------------------------------------------------------------------

    fn handle_breakpoint_details(&self, reader: &mut Reader<'_>) {
        let Ok(details) = core_breakpoint::Details::unpack(reader) else {
            return;
        };
        let Ok(hash) = sleddbg_core::generate_hash(details.rel_file_path, details.line) else {
            return;
        };
        let incoming = Breakpoint {
            file: details.rel_file_path.to_string(),
            condition: details.condition.to_string(),
            line: details.line,
            hash,
            fires_when_true: details.result,
            use_function_environment: details.use_function_environment,
        };

        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if let Some(position) = st
            .breakpoints
            .iter()
            .position(|bp| bp.same_location(&incoming))
        {
            debug!(file = %incoming.file, line = incoming.line, "breakpoint removed");
            st.breakpoints.remove(position);
        } else if st.breakpoints.len() < st.max_breakpoints as usize {
            debug!(file = %incoming.file, line = incoming.line, "breakpoint added");
            st.breakpoints.push(incoming);
        } else {
            error!(
                limit = st.max_breakpoints,
                "cannot add breakpoint, limit reached"
            );
        }
    }

    fn handle_var_lookup(&self, core: &SledDebugger, reader: &mut Reader<'_>) {
        let Ok(mut msg) = VarLookUpMsg::unpack(reader) else {
            return;
        };
        if msg.extra == 1 {
            msg.variable.shallow = true;
            self.send_simple(core, lua_type_codes::WATCH_LOOKUP_CLEAR);
        }
        let watch_frame = msg.extra == 1 && msg.variable.context != LuaVariableContext::Normal;
        if watch_frame {
            self.send_simple(core, lua_type_codes::WATCH_LOOKUP_PROJECT_BEGIN);
        }

        match msg.variable.context {
            LuaVariableContext::Normal | LuaVariableContext::WatchProject => {
                self.lookup_normal(core, &msg.variable);
            }
            LuaVariableContext::WatchCustom => {
                self.send_simple(core, lua_type_codes::WATCH_LOOKUP_CUSTOM_BEGIN);
                self.lookup_custom(core, &msg.variable);
                self.send_simple(core, lua_type_codes::WATCH_LOOKUP_CUSTOM_END);
            }
        }

        if watch_frame {
            self.send_simple(core, lua_type_codes::WATCH_LOOKUP_PROJECT_END);
        }
    }

    fn lookup_normal(&self, core: &SledDebugger, variable: &LuaVariable<'_>) {
        if !self.current.is_set() {
            return;
        }
        let framed = {
            let guard = self.cell.lock();
            let __tmp = !guard.borrow().lookup_watches;
            __tmp
        };
        let (begin, end) = match variable.scope {
            LuaVariableScope::Global => (
                lua_type_codes::GLOBAL_VAR_LOOKUP_BEGIN,
                lua_type_codes::GLOBAL_VAR_LOOKUP_END,
            ),
            LuaVariableScope::Local => (
                lua_type_codes::LOCAL_VAR_LOOKUP_BEGIN,
                lua_type_codes::LOCAL_VAR_LOOKUP_END,
            ),
            LuaVariableScope::Upvalue => (
                lua_type_codes::UPVALUE_VAR_LOOKUP_BEGIN,
                lua_type_codes::UPVALUE_VAR_LOOKUP_END,
            ),
            LuaVariableScope::Environment => (
                lua_type_codes::ENV_VAR_LOOKUP_BEGIN,
                lua_type_codes::ENV_VAR_LOOKUP_END,
            ),
        };
        if framed {
            self.send_simple(core, begin);
        }
        let _ = self.current.with(|lua| self.perform_lookup(core, lua, variable));
        if framed {
            self.send_simple(core, end);
        }
    }

    fn perform_lookup(&self, core: &SledDebugger, lua: &Lua, variable: &LuaVariable<'_>) {
        let Some(root) = variables::resolve_root(lua, variable) else {
            return;
        };
        let Some(value) = variables::walk_keys(lua, root, variable) else {
            return;
        };
        match &value {
            Value::Nil => {}
            Value::Table(table) if !variable.shallow => {
                for child in variables::table_children(lua, table) {
                    if !self.is_child_filtered(variable.scope, &child) {
                        self.send_var(
                            core,
                            variable.scope,
                            Some(variable),
                            &child.key,
                            child.key_type,
                            &child.value,
                            child.value_type,
                            variable.level,
                            variable.index,
                        );
                    }
                }
            }
            _ => {
                let (value_type, rendered) = variables::encode_value(lua, &value);
                let (last_name, last_type) = variable.keys.last().map_or(
                    (variable.name, variable.name_type),
                    |key| (key.name, key.ty),
                );
                self.send_var(
                    core,
                    variable.scope,
                    Some(variable),
                    last_name,
                    last_type,
                    &rendered,
                    value_type,
                    variable.level,
                    variable.index,
                );
            }
        }
    }

    /// Custom watches may run metamethods; only global and environment
    /// roots support them.
    fn lookup_custom(&self, core: &SledDebugger, variable: &LuaVariable<'_>) {
        if !matches!(
            variable.scope,
            LuaVariableScope::Global | LuaVariableScope::Environment
        ) {
            return;
        }
        let _ = self.current.with(|lua| self.perform_lookup(core, lua, variable));
    }

    fn handle_var_update(&self, reader: &mut Reader<'_>) {
        let Ok(msg) = VarUpdateMsg::unpack(reader) else {
            return;
        };
        let _ = self
            .current
            .with(|lua| variables::set_variable(lua, &msg.variable));
    }

    fn handle_callstack_lookup(&self, core: &SledDebugger, reader: &mut Reader<'_>) {
        let Ok(msg) = CallStackLookUpPerformMsg::unpack(reader) else {
            return;
        };
        let level = i32::from(msg.stack_level);
        let _ = self.current.with(|lua| {
            let Some(info) = luautils::frame_info(lua, level) else {
                return;
            };
            let (file, tag, exclude) = {
                let guard = self.cell.lock();
                let st = guard.borrow();
                let file = luautils::trim_file_name(
                    &info.source,
                    st.chop_chars,
                    st.chop_callback.as_ref(),
                )
                .to_string();
                let tag = luautils::tag_for_lookup(info.name.as_deref(), &file, info.line_defined);
                (file, tag, st.var_exclude)
            };
            self.send_simple(core, lua_type_codes::CALL_STACK_LOOKUP_BEGIN);
            self.send_via_buf(core, |buf| {
                CallStackLookUpMsg {
                    plugin_id: LUA_PLUGIN_ID,
                    function_name: &tag,
                    line_defined: info.line_defined,
                    stack_level: msg.stack_level,
                }
                .pack(buf, Endian::NATIVE)
            });
            self.emit_frame_variables(core, lua, level, exclude);
            self.send_simple(core, lua_type_codes::CALL_STACK_LOOKUP_END);
        });
    }

    fn handle_profile_lookup(&self, core: &SledDebugger, reader: &mut Reader<'_>) {
        let Ok(msg) = ProfileInfoLookUpPerformMsg::unpack(reader) else {
            return;
        };
        let callers: Option<Vec<ProfileInfoSnapshot>> = {
            let guard = self.cell.lock();
            let st = guard.borrow();
            let found = st
                .profile
                .find_fn(msg.function_name, msg.rel_script_path, msg.line)
                .or_else(|| {
                    let tag =
                        luautils::tag_for_lookup(None, msg.rel_script_path, msg.line);
                    st.profile.find_fn(&tag, msg.rel_script_path, msg.line)
                });
            found.map(|entry| {
                st.profile
                    .callers_of(entry)
                    .map(|caller| ProfileInfoSnapshot::from_entry(caller, &st.profile))
                    .collect()
            })
        };
        let Some(callers) = callers else { return };
        self.send_simple(core, lua_type_codes::PROFILE_INFO_LOOKUP_BEGIN);
        for snapshot in &callers {
            self.send_via_buf(core, |buf| {
                snapshot
                    .as_msg()
                    .pack(lua_type_codes::PROFILE_INFO_LOOKUP, buf, Endian::NATIVE)
            });
        }
        self.send_simple(core, lua_type_codes::PROFILE_INFO_LOOKUP_END);
    }

    fn handle_dev_cmd(&self, core: &SledDebugger, reader: &mut Reader<'_>) {
        let Ok(msg) = sleddbg_core::scmp::DevCmdMsg::unpack(reader) else {
            return;
        };
        if msg.command.is_empty() {
            return;
        }
        let _ = self.current.with(|lua| {
            let outcome = if let Some(body) = msg.command.strip_prefix(':') {
                // Wrapped: the command sees the frame's locals and
                // upvalues as parameters, like breakpoint conditions.
                let capture = luautils::capture_frame(lua, CURRENT_FRAME);
                let mut work_buf = {
                    let guard = self.cell.lock();
                    let __tmp = core::mem::take(&mut guard.borrow_mut().work_buf);
                    __tmp
                };
                let result = synthesize_function(lua, &capture.names, body, &mut work_buf)
                    .and_then(|func| {
                        func.call::<_, mlua::MultiValue>(mlua::MultiValue::from_vec(
                            capture.values,
                        ))
                    })
                    .map(|_| ());
                let guard = self.cell.lock();
                guard.borrow_mut().work_buf = work_buf;
                result
            } else {
                lua.load(msg.command).exec()
            };
            if let Err(err) = outcome {
                let _ = core.tty_notify(&format!("{err}\n"));
            }
        });
    }

    fn handle_edit_and_continue(&self, reader: &mut Reader<'_>) {
        let Ok(msg) = sleddbg_core::scmp::EditAndContinueMsg::unpack(reader) else {
            return;
        };
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if st.edit_queue.add(msg.rel_script_path) {
            info!(path = msg.rel_script_path, "scheduled edit and continue");
        } else {
            error!(path = msg.rel_script_path, "failed to schedule edit and continue");
        }
    }

    fn handle_edit_and_continue_resume(&self, core: &Arc<SledDebugger>, lua: &Lua) {
        let (paths, open, finish) = {
            let guard = self.cell.lock();
            let st = guard.borrow();
            if st.edit_queue.is_empty() {
                return;
            }
            let paths: Vec<String> = st.edit_queue.iter().map(ToString::to_string).collect();
            (paths, st.ec_callback.clone(), st.ec_finish.clone())
        };
        let Some(open) = open else {
            error!("no edit-and-continue callback configured; scripts will be out of sync");
            return;
        };

        let _shared = core.lock_shared();
        for path in &paths {
            info!(%path, "reloading script");
            if let Some(source) = open(path) {
                match lua.load(&source).exec() {
                    Ok(()) => {
                        let _ = core.tty_notify("File loaded successfully!\n");
                    }
                    Err(err) => {
                        let _ = core.tty_notify(&format!("{err}\n"));
                        error!(%path, %err, "edit-and-continue reload failed");
                    }
                }
            } else {
                let _ = core.tty_notify(&format!("Failed to open script: {path}\n"));
                error!(%path, "edit-and-continue open failed");
            }
            if let Some(finish) = &finish {
                finish(path);
            }
        }
        let guard = self.cell.lock();
        guard.borrow_mut().edit_queue.clear();
    }

    fn handle_state_toggle(&self, reader: &mut Reader<'_>) {
        let Ok(msg) = LuaStateToggleMsg::unpack(reader) else {
            return;
        };
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if let Some(entry) = st
            .states
            .iter_mut()
            .find(|entry| entry.address == msg.address)
        {
            entry.debugging = !entry.debugging;
            debug!(address = %msg.address, debugging = entry.debugging, "state toggled");
        }
    }
}

/// Owned copy of one profile entry, taken under the plugin lock so the
/// wire packing can run without it.
struct ProfileInfoSnapshot {
    tag: String,
    file: String,
    time_elapsed: f32,
    time_elapsed_avg: f32,
    time_elapsed_shortest: f32,
    time_elapsed_longest: f32,
    time_inner_elapsed: f32,
    time_inner_elapsed_avg: f32,
    time_inner_elapsed_shortest: f32,
    time_inner_elapsed_longest: f32,
    call_count: u32,
    line: i32,
    calls: i32,
}

impl ProfileInfoSnapshot {
    #[allow(clippy::cast_possible_truncation)]
    fn from_entry(entry: &ProfileEntry, profile: &ProfileStack) -> Self {
        Self {
            tag: entry.tag.clone(),
            file: entry.file.clone(),
            time_elapsed: entry.total.as_secs_f32(),
            time_elapsed_avg: entry.average().as_secs_f32(),
            time_elapsed_shortest: entry.shortest_or_zero().as_secs_f32(),
            time_elapsed_longest: entry.longest.as_secs_f32(),
            time_inner_elapsed: entry.inner_total.as_secs_f32(),
            time_inner_elapsed_avg: entry.inner_average().as_secs_f32(),
            time_inner_elapsed_shortest: entry.inner_shortest_or_zero().as_secs_f32(),
            time_inner_elapsed_longest: entry.inner_longest.as_secs_f32(),
            call_count: entry.call_count,
            line: entry.line_defined,
            calls: profile.callers_of(entry).count() as i32,
        }
    }

    fn as_msg(&self) -> ProfileInfoMsg<'_> {
        ProfileInfoMsg {
            plugin_id: LUA_PLUGIN_ID,
            function_name: &self.tag,
            rel_script_path: &self.file,
            time_elapsed: self.time_elapsed,
            time_elapsed_avg: self.time_elapsed_avg,
            time_elapsed_shortest: self.time_elapsed_shortest,
            time_elapsed_longest: self.time_elapsed_longest,
            time_inner_elapsed: self.time_inner_elapsed,
            time_inner_elapsed_avg: self.time_inner_elapsed_avg,
            time_inner_elapsed_shortest: self.time_inner_elapsed_shortest,
            time_inner_elapsed_longest: self.time_inner_elapsed_longest,
            call_count: self.call_count,
            line: self.line,
            calls: self.calls,
        }
    }
}

impl SledDebuggerPlugin for LuaPlugin {
    fn id(&self) -> u16 {
        LUA_PLUGIN_ID
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn version(&self) -> Version {
        PLUGIN_VERSION
    }

    fn shutdown(&self) {}

    fn client_connected(&self, core: &SledDebugger) {
        let (limits, states): (LimitsOwned, Vec<(String, String, bool)>) = {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            st.lookup_watches = false;
            (
                LimitsOwned {
                    max_breakpoints: st.max_breakpoints,
                    max_var_filters: st.filters.max_filters(),
                    profiler_enabled: st.profile.is_enabled(),
                    memory_tracer_enabled: st.memtrace.is_enabled(),
                },
                st.states
                    .iter()
                    .map(|entry| (entry.address.clone(), entry.name.clone(), entry.debugging))
                    .collect(),
            )
        };

        self.send_via_buf(core, |buf| {
            LimitsMsg {
                plugin_id: LUA_PLUGIN_ID,
                max_breakpoints: limits.max_breakpoints,
                max_var_filters: limits.max_var_filters,
                profiler_enabled: limits.profiler_enabled,
                memory_tracer_enabled: limits.memory_tracer_enabled,
            }
            .pack(buf, Endian::NATIVE)
        });

        self.send_simple(core, lua_type_codes::LUA_STATE_BEGIN);
        for (address, name, debugging) in &states {
            self.send_via_buf(core, |buf| {
                LuaStateAddMsg {
                    plugin_id: LUA_PLUGIN_ID,
                    address,
                    name,
                    debugging: *debugging,
                }
                .pack(buf, Endian::NATIVE)
            });
        }
        self.send_simple(core, lua_type_codes::LUA_STATE_END);
    }

    fn client_disconnected(&self, _core: &SledDebugger) {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        for entry in &mut st.states {
            entry.debugging = true;
        }
        st.lookup_watches = false;
        st.breakpoints.clear();
        st.memtracer_running = false;
        st.memtrace.reset();
        st.profiler_running = false;
        st.profile.clear();
        st.type_filters = [[false; 9]; 4];
        st.filters.clear_all();
        debug!("client state cleared after disconnect");
    }

    fn client_message(&self, core: &SledDebugger, data: &[u8]) {
        let Some(base) = Base::peek(data, Endian::NATIVE) else {
            return;
        };
        let mut reader = Reader::new(data, Endian::NATIVE);
        match base.type_code {
            type_codes::BREAKPOINT_DETAILS => self.handle_breakpoint_details(&mut reader),
            type_codes::DEV_CMD => self.handle_dev_cmd(core, &mut reader),
            type_codes::EDIT_AND_CONTINUE => self.handle_edit_and_continue(&mut reader),
            lua_type_codes::VAR_FILTER_STATE_NAME_BEGIN => {
                if let Ok(msg) = crate::scmp::ScopeTagMsg::unpack(&mut reader) {
                    let guard = self.cell.lock();
                    guard.borrow_mut().filters.clear(msg.what as char);
                }
            }
            lua_type_codes::VAR_FILTER_STATE_NAME => {
                if let Ok(msg) = VarFilterStateNameMsg::unpack(&mut reader) {
                    let guard = self.cell.lock();
                    if !guard
                        .borrow_mut()
                        .filters
                        .add_filter(msg.what as char, msg.filter)
                    {
                        warn!(filter = msg.filter, "variable filter rejected");
                    }
                }
            }
            lua_type_codes::VAR_FILTER_STATE_NAME_END => {}
            lua_type_codes::VAR_FILTER_STATE_TYPE_BEGIN => {
                if let Ok(msg) = crate::scmp::ScopeTagMsg::unpack(&mut reader) {
                    if let Some(index) = scope_index(msg.what) {
                        let guard = self.cell.lock();
                        guard.borrow_mut().type_filters[index] = [false; 9];
                    }
                }
            }
            lua_type_codes::VAR_FILTER_STATE_TYPE => {
                if let Ok(msg) = VarFilterStateTypeMsg::unpack(&mut reader) {
                    if let Some(index) = scope_index(msg.what) {
                        let guard = self.cell.lock();
                        guard.borrow_mut().type_filters[index] = msg.filter;
                    }
                }
            }
            lua_type_codes::VAR_FILTER_STATE_TYPE_END => {}
            lua_type_codes::VAR_LOOKUP => self.handle_var_lookup(core, &mut reader),
            lua_type_codes::VAR_UPDATE => self.handle_var_update(&mut reader),
            lua_type_codes::WATCH_LOOKUP_BEGIN => {
                if let Ok(msg) = WatchLookUpMsg::unpack(&mut reader) {
                    {
                        let guard = self.cell.lock();
                        guard.borrow_mut().lookup_watches = true;
                    }
                    self.send_via_buf(core, |buf| {
                        WatchLookUpMsg {
                            plugin_id: LUA_PLUGIN_ID,
                            what: msg.what,
                        }
                        .pack(lua_type_codes::WATCH_LOOKUP_BEGIN, buf, Endian::NATIVE)
                    });
                }
            }
            lua_type_codes::WATCH_LOOKUP_END => {
                if let Ok(msg) = WatchLookUpMsg::unpack(&mut reader) {
                    {
                        let guard = self.cell.lock();
                        guard.borrow_mut().lookup_watches = false;
                    }
                    self.send_via_buf(core, |buf| {
                        WatchLookUpMsg {
                            plugin_id: LUA_PLUGIN_ID,
                            what: msg.what,
                        }
                        .pack(lua_type_codes::WATCH_LOOKUP_END, buf, Endian::NATIVE)
                    });
                }
            }
            lua_type_codes::CALL_STACK_LOOKUP_PERFORM => {
                self.handle_callstack_lookup(core, &mut reader);
            }
            lua_type_codes::MEMORY_TRACE_TOGGLE => {
                let guard = self.cell.lock();
                let mut st = guard.borrow_mut();
                st.memtracer_running = !st.memtracer_running;
                st.memtrace.reset();
                debug!(running = st.memtracer_running, "memory tracer toggled");
            }
            lua_type_codes::PROFILER_TOGGLE => {
                let guard = self.cell.lock();
                let mut st = guard.borrow_mut();
                st.profiler_running = !st.profiler_running;
                st.profile.clear();
                debug!(running = st.profiler_running, "profiler toggled");
            }
            lua_type_codes::PROFILE_INFO_LOOKUP_PERFORM => {
                self.handle_profile_lookup(core, &mut reader);
            }
            lua_type_codes::LUA_STATE_TOGGLE => self.handle_state_toggle(&mut reader),
            other => {
                debug!(type_code = other, "unhandled plugin message");
            }
        }
    }

    fn client_breakpoint_begin(&self, core: &SledDebugger, _params: &BreakpointParams<'_>) {
        let hit = {
            let guard = self.cell.lock();
            let __tmp = guard.borrow().hit_breakpoint;
            __tmp
        };
        if !hit {
            // Another plugin stopped; just pause our clocks.
            let guard = self.cell.lock();
            guard.borrow_mut().profile.pre_breakpoint();
            return;
        }
        let _ = self
            .current
            .with(|lua| self.emit_breakpoint_snapshot(core, lua));
        self.emit_profile_dump(core);
        self.emit_memtrace_dump(core);
    }

    fn client_breakpoint_end(&self, _core: &SledDebugger, _params: &BreakpointParams<'_>) {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if !st.hit_breakpoint {
            st.profile.post_breakpoint();
        }
    }

    fn client_debug_mode_changed(&self, _core: &SledDebugger, _new_mode: DebuggerMode) {
        // Hooks stay installed; the line hook reads the mode on each
        // event, so there is nothing to re-arm here.
    }
}

struct LimitsOwned {
    max_breakpoints: u16,
    max_var_filters: u16,
    profiler_enabled: bool,
    memory_tracer_enabled: bool,
}

fn scope_index(letter: u8) -> Option<usize> {
    match letter {
        b'g' => Some(0),
        b'l' => Some(1),
        b'u' => Some(2),
        b'e' => Some(3),
        _ => None,
    }
}
