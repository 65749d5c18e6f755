//! Lua plugin configuration.

use std::sync::Arc;

/// Trims a raw interpreter source path to the project-relative form the
/// IDE knows. Receives the raw `lua_Debug.source` string (without the
/// leading `@`) and returns the suffix to report.
pub type ChopCharsCallback = Arc<dyn for<'a> Fn(&'a str) -> &'a str + Send + Sync>;

/// Loads the source of a script scheduled for edit-and-continue.
/// Returns `None` when the file cannot be opened.
pub type EditAndContinueCallback = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Called after each edit-and-continue reload attempt, successful or not.
pub type EditAndContinueFinishCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Bitmask suppressing per-scope variable emission during the
/// breakpoint begin phase.
pub mod var_exclude_flags {
    pub const NONE: u32 = 0;
    pub const GLOBALS: u32 = 1 << 0;
    pub const LOCALS: u32 = 1 << 1;
    pub const UPVALUES: u32 = 1 << 2;
    pub const ENVIRONMENT: u32 = 1 << 3;
}

/// Configuration for a [`crate::LuaPlugin`] instance.
///
/// Capacities of zero disable the corresponding subsystem where noted.
/// Callbacks are explicit injection points; there are no process-wide
/// fallbacks.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LuaPluginConfig {
    /// Send buffer capacity in bytes.
    pub max_send_buffer_size: u32,
    /// Maximum number of registered interpreter states.
    pub max_lua_states: u16,
    /// Maximum byte length of a state's display name.
    pub max_lua_state_name_len: u16,
    /// Memory trace event capacity; 0 disables the tracer.
    pub max_mem_traces: u32,
    /// Breakpoint capacity.
    pub max_breakpoints: u16,
    /// Edit-and-continue queue capacity; 0 disables the feature.
    pub max_edit_and_continues: u16,
    /// Maximum byte length of one edit-and-continue path.
    pub max_edit_and_continue_entry_len: u16,
    /// Variable name-filter capacity; 0 disables name filters.
    pub max_num_var_filters: u16,
    /// Maximum byte length of one filter pattern.
    pub max_var_filter_pattern_len: u16,
    /// Maximum `*`-separated segments per filter.
    pub max_patterns_per_var_filter: u16,
    /// Profiler function capacity; 0 disables the profiler.
    pub max_profile_functions: u16,
    /// Profiler call-stack depth.
    pub max_profile_call_stack_depth: u16,
    /// Characters chopped off the front of reported script paths when no
    /// chop callback is installed. A leading `@` is always skipped.
    pub num_path_chop_chars: i32,
    /// Work buffer capacity for synthesized chunk sources.
    pub max_work_buffer_size: u32,

    #[cfg_attr(feature = "serde", serde(skip))]
    pub chop_chars_callback: Option<ChopCharsCallback>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub edit_and_continue_callback: Option<EditAndContinueCallback>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub edit_and_continue_finish_callback: Option<EditAndContinueFinishCallback>,
}

impl Default for LuaPluginConfig {
    fn default() -> Self {
        Self {
            max_send_buffer_size: 2048,
            max_lua_states: 1,
            max_lua_state_name_len: 32,
            max_mem_traces: 0,
            max_breakpoints: 64,
            max_edit_and_continues: 0,
            max_edit_and_continue_entry_len: 0,
            max_num_var_filters: 0,
            max_var_filter_pattern_len: 0,
            max_patterns_per_var_filter: 0,
            max_profile_functions: 0,
            max_profile_call_stack_depth: 32,
            num_path_chop_chars: 0,
            max_work_buffer_size: 2048,
            chop_chars_callback: None,
            edit_and_continue_callback: None,
            edit_and_continue_finish_callback: None,
        }
    }
}

impl core::fmt::Debug for LuaPluginConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LuaPluginConfig")
            .field("max_send_buffer_size", &self.max_send_buffer_size)
            .field("max_lua_states", &self.max_lua_states)
            .field("max_lua_state_name_len", &self.max_lua_state_name_len)
            .field("max_mem_traces", &self.max_mem_traces)
            .field("max_breakpoints", &self.max_breakpoints)
            .field("max_edit_and_continues", &self.max_edit_and_continues)
            .field(
                "max_edit_and_continue_entry_len",
                &self.max_edit_and_continue_entry_len,
            )
            .field("max_num_var_filters", &self.max_num_var_filters)
            .field("max_var_filter_pattern_len", &self.max_var_filter_pattern_len)
            .field(
                "max_patterns_per_var_filter",
                &self.max_patterns_per_var_filter,
            )
            .field("max_profile_functions", &self.max_profile_functions)
            .field(
                "max_profile_call_stack_depth",
                &self.max_profile_call_stack_depth,
            )
            .field("num_path_chop_chars", &self.num_path_chop_chars)
            .field("max_work_buffer_size", &self.max_work_buffer_size)
            .field("chop_chars_callback", &self.chop_chars_callback.is_some())
            .field(
                "edit_and_continue_callback",
                &self.edit_and_continue_callback.is_some(),
            )
            .field(
                "edit_and_continue_finish_callback",
                &self.edit_and_continue_finish_callback.is_some(),
            )
            .finish()
    }
}
