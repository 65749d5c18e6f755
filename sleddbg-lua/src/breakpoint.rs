//! Breakpoint records and conditional evaluation.
//!
//! A breakpoint is keyed by the path hash plus line, with full equality
//! adding a case- and slash-insensitive path comparison. Conditions are
//! evaluated inside the stopped activation record: the frame's
//! non-temporary locals and upvalues become the parameters of a
//! synthesized predicate which is called with the captured values, so
//! the condition source can reference them by name. The predicate's
//! chunk environment is either the stopped function's own environment
//! or the globals table, per breakpoint flag.

use mlua::{Function, Lua, Value};
use tracing::debug;

use crate::luautils::{self, CURRENT_FRAME};

/// Case- and slash-insensitive script path comparison.
pub(crate) fn paths_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).all(|(x, y)| {
        let x = if x == b'\\' { b'/' } else { x.to_ascii_lowercase() };
        let y = if y == b'\\' { b'/' } else { y.to_ascii_lowercase() };
        x == y
    })
}

/// One registered breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Breakpoint {
    pub file: String,
    pub condition: String,
    pub line: i32,
    pub hash: i32,
    /// Fire when the condition evaluates to this value.
    pub fires_when_true: bool,
    /// Evaluate the condition in the stopped function's environment
    /// instead of the globals table.
    pub use_function_environment: bool,
}

impl Breakpoint {
    pub fn has_condition(&self) -> bool {
        !self.condition.is_empty()
    }

    /// First-cut hash key match refined by line and path equality.
    pub fn matches(&self, file: &str, line: i32, hash: i32) -> bool {
        self.hash == hash && self.line == line && paths_equal(&self.file, file)
    }

    /// Same breakpoint identity (condition excluded), the key used for
    /// the IDE's add/remove toggling.
    pub fn same_location(&self, other: &Self) -> bool {
        self.matches(&other.file, other.line, other.hash)
    }
}

/// Evaluate a breakpoint condition in the current hook frame. A
/// condition that fails to compile or run does not fire; only a strict
/// boolean result counts.
pub(crate) fn evaluate_condition(lua: &Lua, bp: &Breakpoint, work_buf: &mut String) -> bool {
    match try_evaluate(lua, bp, work_buf) {
        Ok(fired) => fired,
        Err(err) => {
            debug!(file = %bp.file, line = bp.line, %err, "breakpoint condition failed");
            false
        }
    }
}

fn try_evaluate(lua: &Lua, bp: &Breakpoint, work_buf: &mut String) -> mlua::Result<bool> {
    let capture = luautils::capture_frame(lua, CURRENT_FRAME);

    let predicate = synthesize_function(
        lua,
        &capture.names,
        &format!("return ({})", bp.condition),
        work_buf,
    )?;
    if bp.use_function_environment {
        if let Some(func) = &capture.function {
            if let Some(env) = luautils::function_environment(lua, func) {
                luautils::set_function_environment(lua, &predicate, env)?;
            }
        }
    }

    let result: Value = predicate.call(mlua::MultiValue::from_vec(capture.values))?;
    match result {
        Value::Boolean(value) => Ok(value == bp.fires_when_true),
        _ => Ok(false),
    }
}

/// Build `return function(<params>) <body> end` in the work buffer and
/// evaluate it to the synthesized function. The chunk's environment is
/// the globals table unless the caller replaces it afterwards.
pub(crate) fn synthesize_function<'lua>(
    lua: &'lua Lua,
    params: &[String],
    body: &str,
    work_buf: &mut String,
) -> mlua::Result<Function<'lua>> {
    work_buf.clear();
    work_buf.push_str("return function(");
    for (index, name) in params.iter().enumerate() {
        if index > 0 {
            work_buf.push_str(", ");
        }
        work_buf.push_str(name);
    }
    work_buf.push_str(")\n");
    work_buf.push_str(body);
    work_buf.push_str("\nend");

    lua.load(work_buf.as_str()).eval()
}
