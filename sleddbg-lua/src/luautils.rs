//! Interpreter helpers shared across the plugin: state identity, path
//! trimming, function tagging, wire-value construction, frame capture,
//! and the per-version environment rules.
//!
//! Stack and variable access goes through the interpreter's own `debug`
//! library, called as plain functions. Stack levels in those calls are
//! relative to the caller: level 0 is the `debug.*` function itself and
//! level 1 is the frame that raised the hook event, so the IDE-visible
//! level `n` maps to `n + 1` here.

use mlua::{Function, Lua, Table, Value};

/// Interpreter type ordinals as they appear on the wire and in the
/// 9-slot type filters.
pub mod lua_types {
    pub const NIL: i32 = 0;
    pub const BOOLEAN: i32 = 1;
    pub const LIGHTUSERDATA: i32 = 2;
    pub const NUMBER: i32 = 3;
    pub const STRING: i32 = 4;
    pub const TABLE: i32 = 5;
    pub const FUNCTION: i32 = 6;
    pub const USERDATA: i32 = 7;
    pub const THREAD: i32 = 8;
}

/// IDE-visible stack level of the frame a hook stopped in.
pub(crate) const CURRENT_FRAME: i32 = 0;

/// Translate an IDE-visible stack level into a `debug` library level.
pub(crate) const fn lua_level(report_level: i32) -> i32 {
    report_level + 1
}

/// Identity key for a registered state: the address of its globals
/// table, stable for the lifetime of the interpreter.
pub(crate) fn state_key(lua: &Lua) -> usize {
    lua.globals().to_pointer() as usize
}

/// Pointer string for a state, as shown in the IDE's state list.
pub(crate) fn state_address(lua: &Lua) -> String {
    format!("{:p}", lua.globals().to_pointer())
}

/// Trim a raw `lua_Debug.source` path for reporting: drop the leading
/// `@`, then either hand the rest to the host's chop callback or chop a
/// configured number of characters.
pub(crate) fn trim_file_name<'a>(
    source: &'a str,
    chop_chars: i32,
    callback: Option<&crate::config::ChopCharsCallback>,
) -> &'a str {
    let stripped = source.strip_prefix('@').unwrap_or(source);
    if let Some(callback) = callback {
        return callback(stripped);
    }
    let chop = usize::try_from(chop_chars).unwrap_or(0);
    if chop >= stripped.len() {
        ""
    } else {
        &stripped[chop..]
    }
}

/// Key a function for IDE-side lookup: its reported name, or the
/// `:line:file` tag for anonymous functions.
pub(crate) fn tag_for_lookup(name: Option<&str>, file: &str, line_defined: i32) -> String {
    match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!(":{line_defined}:{file}"),
    }
}

/// Construct a value from its wire representation. Only numbers,
/// booleans, and strings can cross the wire.
pub(crate) fn push_value<'lua>(lua: &'lua Lua, ty: i32, repr: &str) -> Option<Value<'lua>> {
    match ty {
        lua_types::NUMBER => repr.parse::<f64>().ok().map(Value::Number),
        lua_types::BOOLEAN => {
            let truthy = repr
                .parse::<i64>()
                .map(|v| v != 0)
                .unwrap_or(repr == "true");
            Some(Value::Boolean(truthy))
        }
        lua_types::STRING => lua.create_string(repr).ok().map(Value::String),
        _ => None,
    }
}

pub(crate) fn debug_fn<'lua>(lua: &'lua Lua, name: &str) -> mlua::Result<Function<'lua>> {
    let debug_table: Table = lua.globals().get("debug")?;
    debug_table.get(name)
}

/// Count the callstack levels above the current frame, the quantity the
/// step-over/step-out decisions compare against.
pub(crate) fn stack_depth(lua: &Lua) -> i32 {
    let Ok(getinfo) = debug_fn(lua, "getinfo") else {
        return 0;
    };
    let mut level = lua_level(CURRENT_FRAME) + 1;
    while getinfo
        .call::<_, Option<Table>>((level, "S"))
        .ok()
        .flatten()
        .is_some()
    {
        level += 1;
    }
    level - lua_level(CURRENT_FRAME) - 1
}

/// The function running at an IDE-visible stack level, if any.
pub(crate) fn function_at_level(lua: &Lua, report_level: i32) -> Option<Function> {
    let getinfo = debug_fn(lua, "getinfo").ok()?;
    let info: Table = getinfo
        .call::<_, Option<Table>>((lua_level(report_level), "f"))
        .ok()
        .flatten()?;
    info.get("func").ok()
}

/// Frame info fields used by callstack reporting.
pub(crate) struct FrameInfo {
    pub name: Option<String>,
    pub source: String,
    pub current_line: i32,
    pub line_defined: i32,
    pub last_line_defined: i32,
}

/// `debug.getinfo` for an IDE-visible stack level.
pub(crate) fn frame_info(lua: &Lua, report_level: i32) -> Option<FrameInfo> {
    let getinfo = debug_fn(lua, "getinfo").ok()?;
    let info: Table = getinfo
        .call::<_, Option<Table>>((lua_level(report_level), "nSl"))
        .ok()
        .flatten()?;
    Some(FrameInfo {
        name: info.get::<_, Option<String>>("name").ok().flatten(),
        source: info
            .get::<_, Option<String>>("source")
            .ok()
            .flatten()
            .unwrap_or_default(),
        current_line: info
            .get::<_, Option<i32>>("currentline")
            .ok()
            .flatten()
            .unwrap_or(-1),
        line_defined: info
            .get::<_, Option<i32>>("linedefined")
            .ok()
            .flatten()
            .unwrap_or(-1),
        last_line_defined: info
            .get::<_, Option<i32>>("lastlinedefined")
            .ok()
            .flatten()
            .unwrap_or(-1),
    })
}

/// Non-temporary locals of a frame: `(name, value, slot index)` in slot
/// order. Names starting with `(` are interpreter temporaries and are
/// skipped.
pub(crate) fn capture_locals<'lua>(
    lua: &'lua Lua,
    report_level: i32,
) -> Vec<(String, Value<'lua>, i32)> {
    let mut locals = Vec::new();
    let Ok(getlocal) = debug_fn(lua, "getlocal") else {
        return locals;
    };
    let mut index = 1;
    loop {
        match getlocal.call::<_, (Option<String>, Value)>((lua_level(report_level), index)) {
            Ok((Some(name), value)) => {
                if !name.starts_with('(') {
                    locals.push((name, value, index));
                }
                index += 1;
            }
            Ok((None, _)) | Err(_) => break,
        }
    }
    locals
}

/// Non-temporary upvalues of a function: `(name, value, slot index)`.
pub(crate) fn capture_upvalues<'lua>(
    lua: &'lua Lua,
    func: &Function<'lua>,
) -> Vec<(String, Value<'lua>, i32)> {
    let mut upvalues = Vec::new();
    let Ok(getupvalue) = debug_fn(lua, "getupvalue") else {
        return upvalues;
    };
    let mut index = 1;
    loop {
        match getupvalue.call::<_, (Option<String>, Value)>((func, index)) {
            Ok((Some(name), value)) => {
                if !name.starts_with('(') {
                    upvalues.push((name, value, index));
                }
                index += 1;
            }
            Ok((None, _)) | Err(_) => break,
        }
    }
    upvalues
}

pub(crate) fn set_local(
    lua: &Lua,
    report_level: i32,
    index: i32,
    value: Value,
) -> mlua::Result<()> {
    let setlocal = debug_fn(lua, "setlocal")?;
    setlocal.call((lua_level(report_level), index, value))
}

pub(crate) fn set_upvalue(
    lua: &Lua,
    func: &Function,
    index: i32,
    value: Value,
) -> mlua::Result<()> {
    let setupvalue = debug_fn(lua, "setupvalue")?;
    setupvalue.call((func, index, value))
}

/// The environment table of a function.
///
/// Lua 5.1 exposes it through `getfenv`; Lua 5.2 keeps it in the
/// function's `_ENV` upvalue.
#[cfg(feature = "lua51")]
pub(crate) fn function_environment<'lua>(
    lua: &'lua Lua,
    func: &Function<'lua>,
) -> Option<Table<'lua>> {
    let getfenv: Function = lua.globals().get("getfenv").ok()?;
    getfenv.call::<_, Option<Table>>(func).ok().flatten()
}

#[cfg(all(feature = "lua52", not(feature = "lua51")))]
pub(crate) fn function_environment<'lua>(
    lua: &'lua Lua,
    func: &Function<'lua>,
) -> Option<Table<'lua>> {
    let getupvalue = debug_fn(lua, "getupvalue").ok()?;
    let mut index = 1;
    loop {
        match getupvalue
            .call::<_, (Option<String>, Value)>((func, index))
            .ok()?
        {
            (Some(name), value) => {
                if name == "_ENV" {
                    return match value {
                        Value::Table(env) => Some(env),
                        _ => None,
                    };
                }
                index += 1;
            }
            (None, _) => return None,
        }
    }
}

/// Replace a function's environment table.
#[cfg(feature = "lua51")]
pub(crate) fn set_function_environment(
    lua: &Lua,
    func: &Function,
    env: Table,
) -> mlua::Result<()> {
    let setfenv: Function = lua.globals().get("setfenv")?;
    setfenv.call((func, env))
}

#[cfg(all(feature = "lua52", not(feature = "lua51")))]
pub(crate) fn set_function_environment(
    lua: &Lua,
    func: &Function,
    env: Table,
) -> mlua::Result<()> {
    let getupvalue = debug_fn(lua, "getupvalue")?;
    let setupvalue = debug_fn(lua, "setupvalue")?;
    let mut index = 1;
    loop {
        match getupvalue.call::<_, (Option<String>, Value)>((func, index))? {
            (Some(name), _) => {
                if name == "_ENV" {
                    return setupvalue.call((func, index, env));
                }
                index += 1;
            }
            (None, _) => return Ok(()),
        }
    }
}

/// Captured activation record of the stopped frame, feeding conditional
/// breakpoints and wrapped dev commands: non-temporary locals and
/// upvalues become the parameters of a synthesized function, with
/// shadowed names keeping their innermost value.
pub(crate) struct FrameCapture<'lua> {
    pub names: Vec<String>,
    pub values: Vec<Value<'lua>>,
    pub function: Option<Function<'lua>>,
}

pub(crate) fn capture_frame(lua: &Lua, report_level: i32) -> FrameCapture<'_> {
    let function = function_at_level(lua, report_level);
    let mut entries = capture_locals(lua, report_level);
    if let Some(func) = &function {
        entries.extend(capture_upvalues(lua, func));
    }

    let mut names: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for (name, value, _) in entries {
        if let Some(position) = names.iter().position(|existing| *existing == name) {
            values[position] = value;
        } else {
            names.push(name);
            values.push(value);
        }
    }
    FrameCapture {
        names,
        values,
        function,
    }
}
