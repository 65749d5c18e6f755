//! Variable introspection: typed value encoding, path walking, and
//! mutation against a stopped frame.
//!
//! A request identifies a variable by scope (global, local, upvalue, or
//! environment), a root name, and a chain of typed table keys. Normal
//! and project-watch reads index tables raw; custom watches go through
//! `gettable`/`settable` so metamethods may run. Only numbers, booleans,
//! and strings can be constructed from a wire representation, so those
//! are the only assignable value types.

use mlua::{Function, Lua, Table, Value};

use crate::luautils::{self, lua_types};
use crate::plugin::PLUGIN_TABLE;
use crate::scmp::{LuaVariable, LuaVariableContext, LuaVariableScope};

/// Interpreter type ordinal of a value, as used on the wire and by the
/// 9-slot type filters.
pub(crate) fn type_ordinal(value: &Value) -> i32 {
    match value {
        Value::Nil => lua_types::NIL,
        Value::Boolean(_) => lua_types::BOOLEAN,
        Value::LightUserData(_) => lua_types::LIGHTUSERDATA,
        Value::Integer(_) | Value::Number(_) => lua_types::NUMBER,
        Value::String(_) => lua_types::STRING,
        Value::Table(_) => lua_types::TABLE,
        Value::Function(_) => lua_types::FUNCTION,
        Value::UserData(_) => lua_types::USERDATA,
        Value::Thread(_) => lua_types::THREAD,
        Value::Error(_) => lua_types::NIL,
    }
}

/// Render a value for the IDE: `(type ordinal, display string)`.
///
/// Integer-valued numbers render in decimal; other numbers use the
/// interpreter's own string coercion. Userdata consults a `__tostring`
/// metamethod, then the host's `libsledluaplugin.userdatatostring`
/// callback, then falls back to a pointer literal.
pub(crate) fn encode_value(lua: &Lua, value: &Value) -> (i32, String) {
    let ordinal = type_ordinal(value);
    let rendered = match value {
        Value::Nil | Value::Error(_) => "nil".to_string(),
        Value::Boolean(flag) => if *flag { "true" } else { "false" }.to_string(),
        Value::LightUserData(_) => "<lightuserdata>".to_string(),
        Value::Integer(int) => int.to_string(),
        Value::Number(num) => {
            #[allow(clippy::cast_possible_truncation)]
            if num.floor() == *num && num.is_finite() {
                format!("{}", *num as i64)
            } else {
                lua_coerced_string(lua, value).unwrap_or_else(|| num.to_string())
            }
        }
        Value::String(text) => text.to_str().unwrap_or("").to_string(),
        Value::Table(_) => "<table>".to_string(),
        Value::Function(_) => format!("{:p}", value.to_pointer()),
        Value::UserData(userdata) => {
            encode_userdata(lua, value, userdata).unwrap_or_else(|| "<userdata>".to_string())
        }
        Value::Thread(thread) => match thread.status() {
            mlua::ThreadStatus::Resumable => "suspended".to_string(),
            mlua::ThreadStatus::Unresumable | mlua::ThreadStatus::Error => "dead".to_string(),
        },
    };
    (ordinal, rendered)
}

fn lua_coerced_string(lua: &Lua, value: &Value) -> Option<String> {
    lua.coerce_string(value.clone())
        .ok()
        .flatten()
        .and_then(|s| s.to_str().ok().map(ToString::to_string))
}

fn encode_userdata(
    lua: &Lua,
    value: &Value,
    userdata: &mlua::AnyUserData,
) -> Option<String> {
    // __tostring metamethod first.
    if let Ok(metatable) = userdata.get_metatable() {
        if let Ok(Value::Function(tostring)) = metatable.get::<Value>("__tostring") {
            if let Ok(Value::String(text)) = tostring.call::<_, Value>(value.clone()) {
                return text.to_str().ok().map(ToString::to_string);
            }
        }
    }
    // Then the host's configured callback.
    if let Ok(plugin_table) = lua.globals().get::<_, Table>(PLUGIN_TABLE) {
        if let Ok(Value::Function(callback)) = plugin_table.get::<_, Value>("userdatatostring") {
            if let Ok(Value::String(text)) = callback.call::<_, Value>(value.clone()) {
                return text.to_str().ok().map(ToString::to_string);
            }
        }
    }
    Some(format!("<userdata - {:p}>", value.to_pointer()))
}

/// Index `table` with a typed key, raw for normal/project reads and
/// through metamethods for custom watches.
pub(crate) fn index_table<'lua>(
    lua: &'lua Lua,
    table: &Table<'lua>,
    key_type: i32,
    key: &str,
    context: LuaVariableContext,
) -> Option<Value<'lua>> {
    let key = luautils::push_value(lua, key_type, key)?;
    if context == LuaVariableContext::WatchCustom {
        table.get(key).ok()
    } else {
        table.raw_get(key).ok()
    }
}

fn store_into_table(
    lua: &Lua,
    table: &Table,
    key_type: i32,
    key: &str,
    value: Value,
    context: LuaVariableContext,
) -> Option<()> {
    let key = luautils::push_value(lua, key_type, key)?;
    if context == LuaVariableContext::WatchCustom {
        table.set(key, value).ok()
    } else {
        table.raw_set(key, value).ok()
    }
}

/// Walk a key chain from `root`, stopping silently on a missing or
/// non-table intermediate.
pub(crate) fn walk_keys<'lua>(
    lua: &'lua Lua,
    root: Value<'lua>,
    variable: &LuaVariable<'_>,
) -> Option<Value<'lua>> {
    let mut current = root;
    for key in &variable.keys {
        let Value::Table(table) = current else {
            return None;
        };
        current = index_table(lua, &table, key.ty, key.name, variable.context)?;
    }
    Some(current)
}

/// The root value a request addresses, before any key walking: the
/// named global, the local/upvalue at the recorded slot (name
/// verified), or the named entry of the frame's environment table.
pub(crate) fn resolve_root<'lua>(
    lua: &'lua Lua,
    variable: &LuaVariable<'_>,
) -> Option<Value<'lua>> {
    match variable.scope {
        LuaVariableScope::Global => {
            index_table(lua, &lua.globals(), variable.name_type, variable.name, variable.context)
        }
        LuaVariableScope::Local => {
            let (name, value) = local_at(lua, variable.level, variable.index)?;
            if name == variable.name {
                Some(value)
            } else {
                None
            }
        }
        LuaVariableScope::Upvalue => {
            let func = luautils::function_at_level(lua, variable.level)?;
            let (name, value) = upvalue_at(lua, &func, variable.index)?;
            if name == variable.name {
                Some(value)
            } else {
                None
            }
        }
        LuaVariableScope::Environment => {
            let env = environment_at_level(lua, variable.level)?;
            index_table(lua, &env, variable.name_type, variable.name, variable.context)
        }
    }
}

fn local_at(lua: &Lua, level: i32, index: i32) -> Option<(String, Value)> {
    let getlocal = luautils::debug_fn(lua, "getlocal").ok()?;
    match getlocal
        .call::<_, (Option<String>, Value)>((luautils::lua_level(level), index))
        .ok()?
    {
        (Some(name), value) => Some((name, value)),
        (None, _) => None,
    }
}

fn upvalue_at<'lua>(
    lua: &'lua Lua,
    func: &Function<'lua>,
    index: i32,
) -> Option<(String, Value<'lua>)> {
    let getupvalue = luautils::debug_fn(lua, "getupvalue").ok()?;
    match getupvalue
        .call::<_, (Option<String>, Value)>((func, index))
        .ok()?
    {
        (Some(name), value) => Some((name, value)),
        (None, _) => None,
    }
}

pub(crate) fn environment_at_level(lua: &Lua, level: i32) -> Option<Table> {
    let func = luautils::function_at_level(lua, level)?;
    luautils::function_environment(lua, &func)
}

/// Apply a variable update: walk to the parent of the terminal key and
/// store the new value, or overwrite the root slot itself.
pub(crate) fn set_variable(lua: &Lua, variable: &LuaVariable<'_>) -> Option<()> {
    let new_value = luautils::push_value(lua, variable.value_type, variable.value)?;

    match variable.scope {
        LuaVariableScope::Global => {
            if variable.keys.is_empty() {
                store_into_table(
                    lua,
                    &lua.globals(),
                    variable.name_type,
                    variable.name,
                    new_value,
                    variable.context,
                )
            } else {
                let root = index_table(
                    lua,
                    &lua.globals(),
                    variable.name_type,
                    variable.name,
                    variable.context,
                )?;
                set_through_keys(lua, root, variable, new_value)
            }
        }
        LuaVariableScope::Local => {
            if variable.keys.is_empty() {
                luautils::set_local(lua, variable.level, variable.index, new_value).ok()
            } else {
                let (_, root) = local_at(lua, variable.level, variable.index)?;
                set_through_keys(lua, root, variable, new_value)
            }
        }
        LuaVariableScope::Upvalue => {
            let func = luautils::function_at_level(lua, variable.level)?;
            if variable.keys.is_empty() {
                luautils::set_upvalue(lua, &func, variable.index, new_value).ok()
            } else {
                let (_, root) = upvalue_at(lua, &func, variable.index)?;
                set_through_keys(lua, root, variable, new_value)
            }
        }
        LuaVariableScope::Environment => {
            let env = environment_at_level(lua, variable.level)?;
            if variable.keys.is_empty() {
                store_into_table(
                    lua,
                    &env,
                    variable.name_type,
                    variable.name,
                    new_value,
                    variable.context,
                )
            } else {
                let root = index_table(
                    lua,
                    &env,
                    variable.name_type,
                    variable.name,
                    variable.context,
                )?;
                set_through_keys(lua, root, variable, new_value)
            }
        }
    }
}

fn set_through_keys(
    lua: &Lua,
    root: Value,
    variable: &LuaVariable<'_>,
    new_value: Value,
) -> Option<()> {
    let mut current = root;
    let (walk, terminal) = variable.keys.split_at(variable.keys.len() - 1);
    for key in walk {
        let Value::Table(table) = current else {
            return None;
        };
        current = index_table(lua, &table, key.ty, key.name, variable.context)?;
    }
    let Value::Table(table) = current else {
        return None;
    };
    let last = terminal.first()?;
    store_into_table(lua, &table, last.ty, last.name, new_value, variable.context)
}

/// One enumerated table child, rendered for the wire.
pub(crate) struct ChildEntry {
    pub key: String,
    pub key_type: i32,
    pub value: String,
    pub value_type: i32,
}

/// Enumerate a table's direct children (raw traversal), rendering keys
/// and values. The caller applies scope filters before sending.
pub(crate) fn table_children(lua: &Lua, table: &Table) -> Vec<ChildEntry> {
    let mut children = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let Ok((key, value)) = pair else { continue };
        let (key_type, key_rendered) = encode_value(lua, &key);
        let (value_type, value_rendered) = encode_value(lua, &value);
        children.push(ChildEntry {
            key: key_rendered,
            key_type,
            value: value_rendered,
            value_type,
        });
    }
    children
}

/// Enumerate string-keyed globals. Numeric keys render through the
/// usual coercion; exotic keys (tables, functions) are skipped.
pub(crate) fn global_children(lua: &Lua) -> Vec<ChildEntry> {
    let mut children = Vec::new();
    for pair in lua.globals().pairs::<Value, Value>() {
        let Ok((key, value)) = pair else { continue };
        match key {
            Value::String(_) | Value::Integer(_) | Value::Number(_) => {}
            _ => continue,
        }
        let (key_type, key_rendered) = encode_value(lua, &key);
        let (value_type, value_rendered) = encode_value(lua, &value);
        children.push(ChildEntry {
            key: key_rendered,
            key_type,
            value: value_rendered,
            value_type,
        });
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scmp::TypedName;

    fn lua_with_tables() -> Lua {
        let lua = Lua::new();
        lua.load(
            r"
            score = 42
            ratio = 1.5
            inventory = { gold = 12, bags = { slots = 8 } }
            label = 'hello'
            flag = true
            ",
        )
        .exec()
        .unwrap();
        lua
    }

    #[test]
    fn encode_renders_wire_types() {
        let lua = lua_with_tables();
        let globals = lua.globals();

        let (ty, text) = encode_value(&lua, &globals.get("score").unwrap());
        assert_eq!((ty, text.as_str()), (lua_types::NUMBER, "42"));

        let (ty, text) = encode_value(&lua, &globals.get("ratio").unwrap());
        assert_eq!(ty, lua_types::NUMBER);
        assert_eq!(text, "1.5");

        let (ty, text) = encode_value(&lua, &globals.get("label").unwrap());
        assert_eq!((ty, text.as_str()), (lua_types::STRING, "hello"));

        let (ty, text) = encode_value(&lua, &globals.get("flag").unwrap());
        assert_eq!((ty, text.as_str()), (lua_types::BOOLEAN, "true"));

        let (ty, text) = encode_value(&lua, &globals.get("inventory").unwrap());
        assert_eq!((ty, text.as_str()), (lua_types::TABLE, "<table>"));

        let (ty, _) = encode_value(&lua, &Value::Nil);
        assert_eq!(ty, lua_types::NIL);
    }

    #[test]
    fn global_lookup_walks_typed_path() {
        let lua = lua_with_tables();
        let variable = LuaVariable {
            name: "inventory",
            name_type: lua_types::STRING,
            scope: LuaVariableScope::Global,
            keys: vec![
                TypedName {
                    name: "bags",
                    ty: lua_types::STRING,
                },
                TypedName {
                    name: "slots",
                    ty: lua_types::STRING,
                },
            ],
            ..LuaVariable::default()
        };
        let root = resolve_root(&lua, &variable).unwrap();
        let value = walk_keys(&lua, root, &variable).unwrap();
        let (ty, text) = encode_value(&lua, &value);
        assert_eq!((ty, text.as_str()), (lua_types::NUMBER, "8"));
    }

    #[test]
    fn lookup_stops_on_non_table_intermediate() {
        let lua = lua_with_tables();
        let variable = LuaVariable {
            name: "score",
            name_type: lua_types::STRING,
            scope: LuaVariableScope::Global,
            keys: vec![TypedName {
                name: "x",
                ty: lua_types::STRING,
            }],
            ..LuaVariable::default()
        };
        let root = resolve_root(&lua, &variable).unwrap();
        assert!(walk_keys(&lua, root, &variable).is_none());
    }

    #[test]
    fn set_then_read_roundtrips_for_wire_types() {
        let lua = lua_with_tables();
        for (value_type, repr, expect) in [
            (lua_types::NUMBER, "7", "7"),
            (lua_types::BOOLEAN, "1", "true"),
            (lua_types::STRING, "bye", "bye"),
        ] {
            let variable = LuaVariable {
                name: "target",
                name_type: lua_types::STRING,
                value: repr,
                value_type,
                scope: LuaVariableScope::Global,
                ..LuaVariable::default()
            };
            set_variable(&lua, &variable).unwrap();
            let got = resolve_root(&lua, &variable).unwrap();
            assert_eq!(encode_value(&lua, &got).1, expect);
        }
    }

    #[test]
    fn set_walks_into_nested_tables() {
        let lua = lua_with_tables();
        let variable = LuaVariable {
            name: "inventory",
            name_type: lua_types::STRING,
            value: "99",
            value_type: lua_types::NUMBER,
            scope: LuaVariableScope::Global,
            table: true,
            keys: vec![
                TypedName {
                    name: "bags",
                    ty: lua_types::STRING,
                },
                TypedName {
                    name: "slots",
                    ty: lua_types::STRING,
                },
            ],
            ..LuaVariable::default()
        };
        set_variable(&lua, &variable).unwrap();
        let slots: i64 = lua
            .load("return inventory.bags.slots")
            .eval()
            .unwrap();
        assert_eq!(slots, 99);
    }

    #[test]
    fn unsupported_value_types_are_rejected() {
        let lua = lua_with_tables();
        let variable = LuaVariable {
            name: "target",
            name_type: lua_types::STRING,
            value: "<table>",
            value_type: lua_types::TABLE,
            scope: LuaVariableScope::Global,
            ..LuaVariable::default()
        };
        assert!(set_variable(&lua, &variable).is_none());
    }

    #[test]
    fn custom_watch_context_uses_metamethods() {
        let lua = Lua::new();
        lua.load(
            r"
            proxy = setmetatable({}, { __index = function() return 123 end })
            ",
        )
        .exec()
        .unwrap();
        let custom = LuaVariable {
            name: "proxy",
            name_type: lua_types::STRING,
            scope: LuaVariableScope::Global,
            context: LuaVariableContext::WatchCustom,
            keys: vec![TypedName {
                name: "anything",
                ty: lua_types::STRING,
            }],
            ..LuaVariable::default()
        };
        let root = resolve_root(&lua, &custom).unwrap();
        let value = walk_keys(&lua, root, &custom).unwrap();
        assert_eq!(encode_value(&lua, &value).1, "123");

        // A raw read through the same path sees nothing.
        let raw = LuaVariable {
            context: LuaVariableContext::Normal,
            ..custom.clone()
        };
        let root = resolve_root(&lua, &raw).unwrap();
        let value = walk_keys(&lua, root, &raw).unwrap();
        assert_eq!(type_ordinal(&value), lua_types::NIL);
    }

    #[test]
    fn table_children_render_all_entries() {
        let lua = lua_with_tables();
        let table: Table = lua.globals().get("inventory").unwrap();
        let mut children = table_children(&lua, &table);
        children.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].key, "bags");
        assert_eq!(children[0].value_type, lua_types::TABLE);
        assert_eq!(children[1].key, "gold");
        assert_eq!(children[1].value, "12");
    }
}
