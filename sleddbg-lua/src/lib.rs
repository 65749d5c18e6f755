//! Lua language plugin for the `sleddbg` debugger core.
//!
//! The plugin registers one or more `mlua` interpreter states, installs
//! line/call/return hooks into each, and implements the Lua side of the
//! SCMP catalog: breakpoints with conditional expressions evaluated in
//! the stopped frame, stepping, variable inspection and mutation by
//! typed path, name/type variable filters, a call profiler, an
//! allocation tracer, and edit-and-continue script reloads.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sleddbg_core::{SledDebugger, SledDebuggerConfig};
//! use sleddbg_lua::{LuaPlugin, LuaPluginConfig};
//!
//! fn main() -> Result<(), sleddbg_lua::LuaError> {
//!     let debugger = SledDebugger::new(&SledDebuggerConfig::default())?;
//!     let plugin = LuaPlugin::new(&LuaPluginConfig::default())?;
//!     debugger.add_plugin(plugin.clone()).map_err(sleddbg_lua::LuaError::from)?;
//!
//!     let lua = mlua::Lua::new();
//!     plugin.register_state(&debugger, &lua, "main")?;
//!
//!     debugger.start_networking()?;
//!     // run scripts; pump debugger.update() once per frame
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod breakpoint;
pub mod config;
pub mod luautils;
pub mod memtrace;
pub mod plugin;
pub mod profile;
pub mod scmp;
pub mod varfilter;
pub mod variables;

pub use config::{
    var_exclude_flags, ChopCharsCallback, EditAndContinueCallback, EditAndContinueFinishCallback,
    LuaPluginConfig,
};
pub use plugin::{LuaPlugin, LUA_PLUGIN_ID};
pub use scmp::{LuaVariable, LuaVariableContext, LuaVariableScope, TypedName};

/// Errors produced by the Lua plugin, extending the core taxonomy.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LuaError {
    #[error(transparent)]
    Core(#[from] sleddbg_core::Error),

    #[error("plugin is not attached to a debugger instance")]
    NoDebuggerInstance,

    #[error("invalid lua state")]
    InvalidLuaState,

    #[error("lua state is already registered")]
    DuplicateLuaState,

    #[error("lua state is not registered")]
    LuaStateNotFound,

    #[error("lua state is registered to a different debugger or plugin")]
    LuaStateAlreadyRegistered,

    #[error("maximum number of lua states reached")]
    OverLuaStateLimit,
}

impl LuaError {
    /// Stable numeric code. Core errors pass through; Lua-specific codes
    /// occupy their own `0x8084xxxx` space.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn code(self) -> i32 {
        match self {
            Self::Core(err) => err.code(),
            Self::NoDebuggerInstance => 0x8084_0001_u32 as i32,
            Self::InvalidLuaState => 0x8084_0002_u32 as i32,
            Self::DuplicateLuaState => 0x8084_0003_u32 as i32,
            Self::LuaStateNotFound => 0x8084_0004_u32 as i32,
            Self::LuaStateAlreadyRegistered => 0x8084_0005_u32 as i32,
            Self::OverLuaStateLimit => 0x8084_0006_u32 as i32,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, LuaError>;

#[cfg(test)]
mod tests {
    use super::LuaError;

    #[test]
    fn lua_codes_are_disjoint_from_core_codes() {
        assert_eq!(LuaError::InvalidLuaState.code() as u32, 0x8084_0002);
        assert_eq!(
            LuaError::Core(sleddbg_core::Error::NotNetworking).code() as u32,
            0x8083_0016
        );
    }
}
