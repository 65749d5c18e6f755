//! Lua-plugin extension of the SCMP catalog (type codes 200–310).
//!
//! Variable records reference their container by a parent chain: the
//! root name plus the typed table keys that were walked to reach the
//! child. The chain count is packed as `keys + 1` entries with the
//! terminal key omitted for shallow lookups, mirroring what the IDE
//! expects when it rebuilds the tree.

use sleddbg_core::scmp::{sizes, string_wire_len, Base};
use sleddbg_core::{ByteBuffer, Endian, Error, Packer, Reader, Result};

/// Stable wire type codes for Lua plugin messages.
pub mod lua_type_codes {
    pub const MEMORY_TRACE_BEGIN: u16 = 200;
    pub const MEMORY_TRACE: u16 = 201;
    pub const MEMORY_TRACE_END: u16 = 202;
    pub const MEMORY_TRACE_STREAM_BEGIN: u16 = 203;
    pub const MEMORY_TRACE_STREAM: u16 = 204;
    pub const MEMORY_TRACE_STREAM_END: u16 = 205;

    pub const PROFILE_INFO_BEGIN: u16 = 207;
    pub const PROFILE_INFO: u16 = 208;
    pub const PROFILE_INFO_END: u16 = 209;
    pub const PROFILE_INFO_LOOKUP_PERFORM: u16 = 210;
    pub const PROFILE_INFO_LOOKUP_BEGIN: u16 = 211;
    pub const PROFILE_INFO_LOOKUP: u16 = 212;
    pub const PROFILE_INFO_LOOKUP_END: u16 = 213;

    pub const VAR_FILTER_STATE_TYPE_BEGIN: u16 = 214;
    pub const VAR_FILTER_STATE_TYPE: u16 = 215;
    pub const VAR_FILTER_STATE_TYPE_END: u16 = 216;
    pub const VAR_FILTER_STATE_NAME_BEGIN: u16 = 217;
    pub const VAR_FILTER_STATE_NAME: u16 = 218;
    pub const VAR_FILTER_STATE_NAME_END: u16 = 219;

    pub const GLOBAL_VAR_BEGIN: u16 = 220;
    pub const GLOBAL_VAR: u16 = 221;
    pub const GLOBAL_VAR_END: u16 = 222;
    pub const GLOBAL_VAR_LOOKUP_BEGIN: u16 = 223;
    pub const GLOBAL_VAR_LOOKUP_END: u16 = 224;

    pub const LOCAL_VAR_BEGIN: u16 = 230;
    pub const LOCAL_VAR: u16 = 231;
    pub const LOCAL_VAR_END: u16 = 232;
    pub const LOCAL_VAR_LOOKUP_BEGIN: u16 = 233;
    pub const LOCAL_VAR_LOOKUP_END: u16 = 234;

    pub const UPVALUE_VAR_BEGIN: u16 = 240;
    pub const UPVALUE_VAR: u16 = 241;
    pub const UPVALUE_VAR_END: u16 = 242;
    pub const UPVALUE_VAR_LOOKUP_BEGIN: u16 = 243;
    pub const UPVALUE_VAR_LOOKUP_END: u16 = 244;

    pub const ENV_VAR_BEGIN: u16 = 250;
    pub const ENV_VAR: u16 = 251;
    pub const ENV_VAR_END: u16 = 252;
    pub const ENV_VAR_LOOKUP_BEGIN: u16 = 253;
    pub const ENV_VAR_LOOKUP_END: u16 = 254;

    pub const VAR_LOOKUP: u16 = 255;
    pub const VAR_UPDATE: u16 = 256;

    pub const CALL_STACK_BEGIN: u16 = 260;
    pub const CALL_STACK: u16 = 261;
    pub const CALL_STACK_END: u16 = 262;
    pub const CALL_STACK_LOOKUP_PERFORM: u16 = 263;
    pub const CALL_STACK_LOOKUP_BEGIN: u16 = 264;
    pub const CALL_STACK_LOOKUP: u16 = 265;
    pub const CALL_STACK_LOOKUP_END: u16 = 266;

    pub const WATCH_LOOKUP_BEGIN: u16 = 270;
    pub const WATCH_LOOKUP_END: u16 = 271;
    pub const WATCH_LOOKUP_CLEAR: u16 = 272;

    pub const WATCH_LOOKUP_PROJECT_BEGIN: u16 = 280;
    pub const WATCH_LOOKUP_PROJECT_END: u16 = 281;
    pub const WATCH_LOOKUP_CUSTOM_BEGIN: u16 = 282;
    pub const WATCH_LOOKUP_CUSTOM_END: u16 = 283;

    pub const LUA_STATE_BEGIN: u16 = 290;
    pub const LUA_STATE_ADD: u16 = 291;
    pub const LUA_STATE_REMOVE: u16 = 292;
    pub const LUA_STATE_END: u16 = 293;
    pub const LUA_STATE_TOGGLE: u16 = 294;

    pub const MEMORY_TRACE_TOGGLE: u16 = 300;
    pub const PROFILER_TOGGLE: u16 = 301;

    pub const LIMITS: u16 = 310;
}

/// Wire bounds specific to the Lua catalog.
pub mod lua_sizes {
    /// Rendered pointer strings ("0x...").
    pub const PTR_LEN: usize = 32;
    pub const VAR_NAME_LEN: usize = 256;
    pub const VAR_VALUE_LEN: usize = 256;
    /// Maximum typed keys in one variable path.
    pub const MAX_KEY_VALUES: usize = 128;
}

/// Which table a variable record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LuaVariableScope {
    #[default]
    Global,
    Local,
    Upvalue,
    Environment,
}

impl LuaVariableScope {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Global => 0,
            Self::Local => 1,
            Self::Upvalue => 2,
            Self::Environment => 3,
        }
    }

    /// Scope letter used by variable filters.
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::Global => 'g',
            Self::Local => 'l',
            Self::Upvalue => 'u',
            Self::Environment => 'e',
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Global),
            1 => Ok(Self::Local),
            2 => Ok(Self::Upvalue),
            3 => Ok(Self::Environment),
            _ => Err(Error::InvalidParameter),
        }
    }
}

/// How a variable read reached the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LuaVariableContext {
    /// Ordinary breakpoint-driven read; raw table indexing.
    #[default]
    Normal,
    /// Project watch; raw table indexing.
    WatchProject,
    /// Custom watch; metamethods are allowed during indexing.
    WatchCustom,
}

impl LuaVariableContext {
    pub(crate) fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Normal),
            1 => Ok(Self::WatchProject),
            2 => Ok(Self::WatchCustom),
            _ => Err(Error::InvalidParameter),
        }
    }
}

/// One typed key in a variable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedName<'a> {
    pub name: &'a str,
    /// Interpreter type ordinal of the key.
    pub ty: i32,
}

/// A variable identified by scope, root name, and typed key path.
#[derive(Debug, Clone, Default)]
pub struct LuaVariable<'a> {
    pub name: &'a str,
    pub name_type: i32,
    pub value: &'a str,
    pub value_type: i32,
    pub scope: LuaVariableScope,
    pub context: LuaVariableContext,
    /// The identified value is a table.
    pub table: bool,
    /// Suppress recursive enumeration of table children.
    pub shallow: bool,
    /// Stack level, for locals/upvalues/environment.
    pub level: i32,
    /// Slot index, for locals/upvalues.
    pub index: i32,
    pub keys: Vec<TypedName<'a>>,
}

impl LuaVariable<'_> {
    /// Chain entries the wire carries for this record when used as a
    /// parent: the terminal key is omitted for shallow lookups.
    fn packed_key_count(&self) -> usize {
        let extra = usize::from(self.shallow);
        self.keys.len().saturating_sub(extra)
    }
}

fn parent_wire_len(parent: Option<&LuaVariable<'_>>) -> usize {
    let mut len = sizes::U16; // entry count
    if let Some(parent) = parent {
        len += string_wire_len(parent.name) + sizes::I16;
        for key in &parent.keys[..parent.packed_key_count()] {
            len += string_wire_len(key.name) + sizes::I16;
        }
    }
    len
}

#[allow(clippy::cast_possible_truncation)]
fn pack_parent(packer: &mut Packer<'_>, parent: Option<&LuaVariable<'_>>) -> Result<()> {
    match parent {
        None => packer.pack_u16(0),
        Some(parent) => {
            let count = parent.packed_key_count();
            packer.pack_u16((count + 1) as u16)?;
            packer.pack_str(parent.name)?;
            packer.pack_i16(parent.name_type as i16)?;
            for key in &parent.keys[..count] {
                packer.pack_str(key.name)?;
                packer.pack_i16(key.ty as i16)?;
            }
            Ok(())
        }
    }
}

/// Scoped variable record: GlobalVar, LocalVar, UpvalueVar, or EnvVar,
/// chosen by `type_code`. Locals and upvalues carry a stack level and
/// slot index; environment records carry only the level.
#[derive(Debug, Clone, Copy)]
pub struct VarMsg<'a> {
    pub plugin_id: u16,
    pub parent: Option<&'a LuaVariable<'a>>,
    pub name: &'a str,
    pub name_type: i16,
    pub value: &'a str,
    pub value_type: i16,
    pub stack_level: i16,
    pub index: i32,
}

impl VarMsg<'_> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, type_code: u16, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let mut payload = string_wire_len(self.name)
            + sizes::I16
            + string_wire_len(self.value)
            + sizes::I16
            + parent_wire_len(self.parent);
        let scoped = type_code == lua_type_codes::LOCAL_VAR
            || type_code == lua_type_codes::UPVALUE_VAR
            || type_code == lua_type_codes::ENV_VAR;
        if scoped {
            payload += sizes::I16;
        }
        let indexed = type_code == lua_type_codes::LOCAL_VAR
            || type_code == lua_type_codes::UPVALUE_VAR;
        if indexed {
            payload += sizes::I32;
        }

        let base = Base::with_payload(type_code, self.plugin_id, payload);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.name)?;
        packer.pack_i16(self.name_type)?;
        packer.pack_str(self.value)?;
        packer.pack_i16(self.value_type)?;
        if scoped {
            packer.pack_i16(self.stack_level)?;
        }
        if indexed {
            packer.pack_i32(self.index)?;
        }
        pack_parent(&mut packer, self.parent)
    }
}

/// Request to read a variable by typed path.
#[derive(Debug, Clone)]
pub struct VarLookUpMsg<'a> {
    pub plugin_id: u16,
    pub variable: LuaVariable<'a>,
    /// Non-zero when the IDE wants a fresh watch pass.
    pub extra: u8,
}

impl<'a> VarLookUpMsg<'a> {
    /// # Errors
    ///
    /// Propagates short reads and rejects out-of-range enums or key
    /// counts.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        let mut variable = LuaVariable {
            scope: LuaVariableScope::from_u8(reader.read_u8()?)?,
            context: LuaVariableContext::from_u8(reader.read_u8()?)?,
            ..LuaVariable::default()
        };
        let key_count = usize::from(reader.read_u16()?).saturating_sub(1);
        if key_count > lua_sizes::MAX_KEY_VALUES {
            return Err(Error::InvalidParameter);
        }
        variable.level = i32::from(reader.read_i16()?);
        variable.index = reader.read_i32()?;
        let extra = reader.read_u8()?;
        variable.name = reader.read_str()?;
        variable.name_type = i32::from(reader.read_u16()?);
        variable.keys.reserve_exact(key_count);
        for _ in 0..key_count {
            let name = reader.read_str()?;
            let ty = i32::from(reader.read_u16()?);
            variable.keys.push(TypedName { name, ty });
        }
        variable.table = !variable.keys.is_empty();
        Ok(Self {
            plugin_id: base.plugin_id,
            variable,
            extra,
        })
    }
}

/// Request to write a variable by typed path.
#[derive(Debug, Clone)]
pub struct VarUpdateMsg<'a> {
    pub plugin_id: u16,
    pub variable: LuaVariable<'a>,
}

impl<'a> VarUpdateMsg<'a> {
    /// # Errors
    ///
    /// Propagates short reads and rejects out-of-range enums or key
    /// counts.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        let mut variable = LuaVariable {
            scope: LuaVariableScope::from_u8(reader.read_u8()?)?,
            context: LuaVariableContext::from_u8(reader.read_u8()?)?,
            ..LuaVariable::default()
        };
        let key_count = usize::from(reader.read_u16()?).saturating_sub(1);
        if key_count > lua_sizes::MAX_KEY_VALUES {
            return Err(Error::InvalidParameter);
        }
        variable.level = i32::from(reader.read_i16()?);
        variable.index = reader.read_i32()?;
        variable.value = reader.read_str()?;
        variable.value_type = i32::from(reader.read_i16()?);
        variable.name = reader.read_str()?;
        variable.name_type = i32::from(reader.read_u16()?);
        variable.keys.reserve_exact(key_count);
        for _ in 0..key_count {
            let name = reader.read_str()?;
            let ty = i32::from(reader.read_u16()?);
            variable.keys.push(TypedName { name, ty });
        }
        variable.table = !variable.keys.is_empty();
        Ok(Self {
            plugin_id: base.plugin_id,
            variable,
        })
    }
}

/// Memory trace event, both the breakpoint dump (`MEMORY_TRACE`) and
/// the live stream (`MEMORY_TRACE_STREAM`) flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTraceMsg<'a> {
    pub plugin_id: u16,
    /// 'a' allocate, 'd' free, 'r' realloc.
    pub what: u8,
    pub old_ptr: &'a str,
    pub new_ptr: &'a str,
    pub old_size: i32,
    pub new_size: i32,
}

impl MemoryTraceMsg<'_> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, type_code: u16, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let payload = sizes::U8
            + string_wire_len(self.old_ptr)
            + string_wire_len(self.new_ptr)
            + sizes::I32 * 2;
        let base = Base::with_payload(type_code, self.plugin_id, payload);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_u8(self.what)?;
        packer.pack_str(self.old_ptr)?;
        packer.pack_str(self.new_ptr)?;
        packer.pack_i32(self.old_size)?;
        packer.pack_i32(self.new_size)
    }
}

/// Per-function profile statistics, both the breakpoint dump
/// (`PROFILE_INFO`) and lookup-reply (`PROFILE_INFO_LOOKUP`) flavors.
/// Times are seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileInfoMsg<'a> {
    pub plugin_id: u16,
    pub function_name: &'a str,
    pub rel_script_path: &'a str,
    pub time_elapsed: f32,
    pub time_elapsed_avg: f32,
    pub time_elapsed_shortest: f32,
    pub time_elapsed_longest: f32,
    pub time_inner_elapsed: f32,
    pub time_inner_elapsed_avg: f32,
    pub time_inner_elapsed_shortest: f32,
    pub time_inner_elapsed_longest: f32,
    pub call_count: u32,
    pub line: i32,
    pub calls: i32,
}

impl ProfileInfoMsg<'_> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, type_code: u16, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let payload = string_wire_len(self.function_name)
            + string_wire_len(self.rel_script_path)
            + sizes::F32 * 8
            + sizes::U32
            + sizes::I32 * 2;
        let base = Base::with_payload(type_code, self.plugin_id, payload);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.function_name)?;
        packer.pack_str(self.rel_script_path)?;
        packer.pack_f32(self.time_elapsed)?;
        packer.pack_f32(self.time_elapsed_avg)?;
        packer.pack_f32(self.time_elapsed_shortest)?;
        packer.pack_f32(self.time_elapsed_longest)?;
        packer.pack_f32(self.time_inner_elapsed)?;
        packer.pack_f32(self.time_inner_elapsed_avg)?;
        packer.pack_f32(self.time_inner_elapsed_shortest)?;
        packer.pack_f32(self.time_inner_elapsed_longest)?;
        packer.pack_u32(self.call_count)?;
        packer.pack_i32(self.line)?;
        packer.pack_i32(self.calls)
    }
}

/// Request for the profile of one function, by identity or tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileInfoLookUpPerformMsg<'a> {
    pub plugin_id: u16,
    pub function_name: &'a str,
    pub what: u8,
    pub line: i32,
    pub rel_script_path: &'a str,
}

impl<'a> ProfileInfoLookUpPerformMsg<'a> {
    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            function_name: reader.read_str()?,
            what: reader.read_u8()?,
            line: reader.read_i32()?,
            rel_script_path: reader.read_str()?,
        })
    }
}

/// Per-scope type filter: one flag per interpreter type ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarFilterStateTypeMsg {
    pub plugin_id: u16,
    pub what: u8,
    pub filter: [bool; 9],
}

impl VarFilterStateTypeMsg {
    /// # Errors
    ///
    /// Propagates short reads; rejects an oversized flag array.
    pub fn unpack(reader: &mut Reader<'_>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        let what = reader.read_u8()?;
        let count = reader.read_u16()? as usize;
        if count > 9 {
            return Err(Error::InvalidParameter);
        }
        let mut filter = [false; 9];
        for slot in filter.iter_mut().take(count) {
            *slot = reader.read_u8()? == 1;
        }
        Ok(Self {
            plugin_id: base.plugin_id,
            what,
            filter,
        })
    }
}

/// Per-scope name filter pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarFilterStateNameMsg<'a> {
    pub plugin_id: u16,
    pub what: u8,
    pub filter: &'a str,
}

impl<'a> VarFilterStateNameMsg<'a> {
    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            what: reader.read_u8()?,
            filter: reader.read_str()?,
        })
    }
}

/// A `what`-only frame: the var-filter Begin/End family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeTagMsg {
    pub plugin_id: u16,
    pub what: u8,
}

impl ScopeTagMsg {
    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'_>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            what: reader.read_u8()?,
        })
    }

    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, type_code: u16, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let base = Base::with_payload(type_code, self.plugin_id, sizes::U8);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_u8(self.what)
    }
}

/// One callstack level reported during the breakpoint begin phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStackMsg<'a> {
    pub plugin_id: u16,
    pub rel_script_path: &'a str,
    pub current_line: i32,
    pub line_defined: i32,
    pub last_line_defined: i32,
    pub function_name: &'a str,
    pub stack_level: i16,
}

impl CallStackMsg<'_> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let payload = string_wire_len(self.rel_script_path)
            + sizes::I32 * 3
            + string_wire_len(self.function_name)
            + sizes::I16;
        let base = Base::with_payload(lua_type_codes::CALL_STACK, self.plugin_id, payload);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.rel_script_path)?;
        packer.pack_i32(self.current_line)?;
        packer.pack_i32(self.line_defined)?;
        packer.pack_i32(self.last_line_defined)?;
        packer.pack_str(self.function_name)?;
        packer.pack_i16(self.stack_level)
    }
}

/// Request for the locals/upvalues/environment of one stack level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStackLookUpPerformMsg {
    pub plugin_id: u16,
    pub stack_level: i16,
}

impl CallStackLookUpPerformMsg {
    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'_>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            stack_level: reader.read_i16()?,
        })
    }
}

/// Reply header for a callstack lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStackLookUpMsg<'a> {
    pub plugin_id: u16,
    pub function_name: &'a str,
    pub line_defined: i32,
    pub stack_level: i16,
}

impl CallStackLookUpMsg<'_> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let payload = string_wire_len(self.function_name) + sizes::I32 + sizes::I16;
        let base = Base::with_payload(lua_type_codes::CALL_STACK_LOOKUP, self.plugin_id, payload);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.function_name)?;
        packer.pack_i32(self.line_defined)?;
        packer.pack_i16(self.stack_level)
    }
}

/// Watch lookup frame marker, echoed back to the IDE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchLookUpMsg {
    pub plugin_id: u16,
    pub what: LuaVariableScope,
}

impl WatchLookUpMsg {
    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'_>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            what: LuaVariableScope::from_u8(reader.read_u8()?)?,
        })
    }

    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, type_code: u16, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let base = Base::with_payload(type_code, self.plugin_id, sizes::U8);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_u8(self.what.as_u8())
    }
}

/// Announcement of a registered interpreter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuaStateAddMsg<'a> {
    pub plugin_id: u16,
    pub address: &'a str,
    pub name: &'a str,
    pub debugging: bool,
}

impl LuaStateAddMsg<'_> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let payload = string_wire_len(self.address) + string_wire_len(self.name) + sizes::U8;
        let base = Base::with_payload(lua_type_codes::LUA_STATE_ADD, self.plugin_id, payload);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.address)?;
        packer.pack_str(self.name)?;
        packer.pack_u8(u8::from(self.debugging))
    }
}

/// Announcement of an unregistered interpreter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuaStateRemoveMsg<'a> {
    pub plugin_id: u16,
    pub address: &'a str,
}

impl LuaStateRemoveMsg<'_> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let base = Base::with_payload(
            lua_type_codes::LUA_STATE_REMOVE,
            self.plugin_id,
            string_wire_len(self.address),
        );
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.address)
    }
}

/// Per-state debugging toggle request, addressed by pointer string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuaStateToggleMsg<'a> {
    pub plugin_id: u16,
    pub address: &'a str,
}

impl<'a> LuaStateToggleMsg<'a> {
    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            address: reader.read_str()?,
        })
    }
}

/// Capability limits announced right after a client connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitsMsg {
    pub plugin_id: u16,
    pub max_breakpoints: u16,
    pub max_var_filters: u16,
    pub profiler_enabled: bool,
    pub memory_tracer_enabled: bool,
}

impl LimitsMsg {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let payload = sizes::U16 * 2 + sizes::U8 * 2;
        let base = Base::with_payload(lua_type_codes::LIMITS, self.plugin_id, payload);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_u16(self.max_breakpoints)?;
        packer.pack_u16(self.max_var_filters)?;
        packer.pack_u8(u8::from(self.profiler_enabled))?;
        packer.pack_u8(u8::from(self.memory_tracer_enabled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed_var_lookup(endian: Endian) -> ByteBuffer {
        // Hand-pack a VarLookUp the way the IDE does: scope, context,
        // key count + 1, level, index, extra, name, name type, keys.
        let mut buf = ByteBuffer::new(256);
        let mut packer = Packer::new(&mut buf, endian);
        let payload = sizes::U8 * 3
            + sizes::U16
            + sizes::I16
            + sizes::I32
            + string_wire_len("inventory")
            + sizes::U16
            + string_wire_len("gold")
            + sizes::U16;
        Base::with_payload(lua_type_codes::VAR_LOOKUP, 1, payload)
            .write_fields(&mut packer)
            .unwrap();
        packer.pack_u8(0).unwrap(); // scope: global
        packer.pack_u8(2).unwrap(); // context: custom watch
        packer.pack_u16(2).unwrap(); // one key + 1
        packer.pack_i16(0).unwrap();
        packer.pack_i32(0).unwrap();
        packer.pack_u8(1).unwrap(); // extra
        packer.pack_str("inventory").unwrap();
        packer.pack_u16(4).unwrap(); // LUA_TSTRING
        packer.pack_str("gold").unwrap();
        packer.pack_u16(4).unwrap();
        buf
    }

    #[test]
    fn var_lookup_unpacks_typed_path() {
        for endian in [Endian::Little, Endian::Big] {
            let buf = packed_var_lookup(endian);
            let mut reader = Reader::new(buf.as_slice(), endian);
            let msg = VarLookUpMsg::unpack(&mut reader).unwrap();
            assert_eq!(msg.variable.scope, LuaVariableScope::Global);
            assert_eq!(msg.variable.context, LuaVariableContext::WatchCustom);
            assert_eq!(msg.variable.name, "inventory");
            assert_eq!(msg.variable.keys.len(), 1);
            assert_eq!(msg.variable.keys[0].name, "gold");
            assert!(msg.variable.table);
            assert_eq!(msg.extra, 1);
        }
    }

    #[test]
    fn var_update_unpacks_value_before_name() {
        let mut buf = ByteBuffer::new(256);
        let mut packer = Packer::new(&mut buf, Endian::Little);
        let payload = sizes::U8 * 2
            + sizes::U16
            + sizes::I16
            + sizes::I32
            + string_wire_len("42")
            + sizes::I16
            + string_wire_len("hp")
            + sizes::U16;
        Base::with_payload(lua_type_codes::VAR_UPDATE, 1, payload)
            .write_fields(&mut packer)
            .unwrap();
        packer.pack_u8(1).unwrap(); // scope: local
        packer.pack_u8(0).unwrap(); // context: normal
        packer.pack_u16(1).unwrap(); // no keys
        packer.pack_i16(0).unwrap(); // level
        packer.pack_i32(3).unwrap(); // index
        packer.pack_str("42").unwrap();
        packer.pack_i16(3).unwrap(); // LUA_TNUMBER
        packer.pack_str("hp").unwrap();
        packer.pack_u16(4).unwrap();

        let mut reader = Reader::new(buf.as_slice(), Endian::Little);
        let msg = VarUpdateMsg::unpack(&mut reader).unwrap();
        assert_eq!(msg.variable.scope, LuaVariableScope::Local);
        assert_eq!(msg.variable.value, "42");
        assert_eq!(msg.variable.value_type, 3);
        assert_eq!(msg.variable.name, "hp");
        assert_eq!(msg.variable.index, 3);
        assert!(!msg.variable.table);
    }

    #[test]
    fn var_msg_parent_chain_omits_terminal_key_when_shallow() {
        let parent = LuaVariable {
            name: "inventory",
            name_type: 4,
            shallow: true,
            keys: vec![
                TypedName {
                    name: "bags",
                    ty: 4,
                },
                TypedName {
                    name: "gold",
                    ty: 4,
                },
            ],
            ..LuaVariable::default()
        };
        let msg = VarMsg {
            plugin_id: 1,
            parent: Some(&parent),
            name: "gold",
            name_type: 4,
            value: "12",
            value_type: 3,
            stack_level: 0,
            index: 0,
        };
        let mut buf = ByteBuffer::new(256);
        msg.pack(lua_type_codes::GLOBAL_VAR, &mut buf, Endian::Little)
            .unwrap();

        let mut reader = Reader::new(buf.as_slice(), Endian::Little);
        let base = Base::read_fields(&mut reader).unwrap();
        assert_eq!(base.length as usize, buf.len());
        assert_eq!(reader.read_str().unwrap(), "gold");
        assert_eq!(reader.read_i16().unwrap(), 4);
        assert_eq!(reader.read_str().unwrap(), "12");
        assert_eq!(reader.read_i16().unwrap(), 3);
        // Parent chain: root + one key (terminal omitted).
        assert_eq!(reader.read_u16().unwrap(), 2);
        assert_eq!(reader.read_str().unwrap(), "inventory");
        assert_eq!(reader.read_i16().unwrap(), 4);
        assert_eq!(reader.read_str().unwrap(), "bags");
        assert_eq!(reader.read_i16().unwrap(), 4);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn local_var_msg_carries_level_and_index() {
        let msg = VarMsg {
            plugin_id: 1,
            parent: None,
            name: "n",
            name_type: 4,
            value: "3",
            value_type: 3,
            stack_level: 2,
            index: 5,
        };
        let mut buf = ByteBuffer::new(128);
        msg.pack(lua_type_codes::LOCAL_VAR, &mut buf, Endian::Little)
            .unwrap();

        let mut reader = Reader::new(buf.as_slice(), Endian::Little);
        let base = Base::read_fields(&mut reader).unwrap();
        assert_eq!(base.length as usize, buf.len());
        assert_eq!(reader.read_str().unwrap(), "n");
        reader.read_i16().unwrap();
        assert_eq!(reader.read_str().unwrap(), "3");
        reader.read_i16().unwrap();
        assert_eq!(reader.read_i16().unwrap(), 2);
        assert_eq!(reader.read_i32().unwrap(), 5);
        assert_eq!(reader.read_u16().unwrap(), 0);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn memory_trace_roundtrip_shape() {
        let msg = MemoryTraceMsg {
            plugin_id: 1,
            what: b'r',
            old_ptr: "0xdead",
            new_ptr: "0xbeef",
            old_size: 16,
            new_size: 32,
        };
        let mut buf = ByteBuffer::new(128);
        msg.pack(lua_type_codes::MEMORY_TRACE_STREAM, &mut buf, Endian::Little)
            .unwrap();
        let mut reader = Reader::new(buf.as_slice(), Endian::Little);
        let base = Base::read_fields(&mut reader).unwrap();
        assert_eq!(base.type_code, lua_type_codes::MEMORY_TRACE_STREAM);
        assert_eq!(base.length as usize, buf.len());
        assert_eq!(reader.read_u8().unwrap(), b'r');
        assert_eq!(reader.read_str().unwrap(), "0xdead");
        assert_eq!(reader.read_str().unwrap(), "0xbeef");
        assert_eq!(reader.read_i32().unwrap(), 16);
        assert_eq!(reader.read_i32().unwrap(), 32);
    }

    #[test]
    fn limits_pack_shape() {
        let msg = LimitsMsg {
            plugin_id: 1,
            max_breakpoints: 64,
            max_var_filters: 8,
            profiler_enabled: true,
            memory_tracer_enabled: false,
        };
        let mut buf = ByteBuffer::new(64);
        msg.pack(&mut buf, Endian::Little).unwrap();
        assert_eq!(buf.len(), 8 + 2 + 2 + 1 + 1);
    }

    #[test]
    fn profile_info_length_matches() {
        let msg = ProfileInfoMsg {
            plugin_id: 1,
            function_name: "update",
            rel_script_path: "scripts/x.lua",
            time_elapsed: 1.0,
            time_elapsed_avg: 0.5,
            time_elapsed_shortest: 0.1,
            time_elapsed_longest: 0.9,
            time_inner_elapsed: 0.7,
            time_inner_elapsed_avg: 0.3,
            time_inner_elapsed_shortest: 0.1,
            time_inner_elapsed_longest: 0.6,
            call_count: 2,
            line: 7,
            calls: 1,
        };
        let mut buf = ByteBuffer::new(256);
        msg.pack(lua_type_codes::PROFILE_INFO, &mut buf, Endian::Little)
            .unwrap();
        let base = Base::peek(buf.as_slice(), Endian::Little).unwrap();
        assert_eq!(base.length as usize, buf.len());
    }

    #[test]
    fn var_filter_type_unpack_reads_flag_array() {
        let mut buf = ByteBuffer::new(64);
        let mut packer = Packer::new(&mut buf, Endian::Little);
        Base::with_payload(
            lua_type_codes::VAR_FILTER_STATE_TYPE,
            1,
            sizes::U8 + sizes::U16 + 9,
        )
        .write_fields(&mut packer)
        .unwrap();
        packer.pack_u8(b'g').unwrap();
        packer.pack_u16(9).unwrap();
        for i in 0..9u8 {
            packer.pack_u8(u8::from(i == 5)).unwrap();
        }
        let mut reader = Reader::new(buf.as_slice(), Endian::Little);
        let msg = VarFilterStateTypeMsg::unpack(&mut reader).unwrap();
        assert_eq!(msg.what, b'g');
        assert!(msg.filter[5]);
        assert!(!msg.filter[0]);
    }
}
