//! SCMP — the length-prefixed binary control protocol.
//!
//! Every message shares the [`Base`] envelope: `length` (i32, total
//! message bytes including itself), `type_code` (u16), `plugin_id`
//! (u16), followed by per-type fields in declaration order. The length
//! field is authoritative; the framer never consumes a message until
//! the full image is buffered. Plugin id 0 addresses the debugger core.

use crate::buffer::{ByteBuffer, Endian, Packer, Reader};
use crate::error::Error;
use crate::Result;

/// Stable wire type codes for core messages. Codes 200 and above belong
/// to language plugins.
pub mod type_codes {
    pub const BASE: u16 = 0;
    pub const BREAKPOINT_DETAILS: u16 = 1;
    pub const BREAKPOINT_BEGIN: u16 = 2;
    pub const BREAKPOINT_SYNC: u16 = 3;
    pub const BREAKPOINT_END: u16 = 4;
    pub const BREAKPOINT_CONTINUE: u16 = 5;
    pub const DISCONNECT: u16 = 6;
    pub const HEARTBEAT: u16 = 8;
    pub const SUCCESS: u16 = 9;
    pub const FAILURE: u16 = 10;
    pub const VERSION: u16 = 11;
    pub const DEBUG_START: u16 = 12;
    pub const DEBUG_STEP_INTO: u16 = 13;
    pub const DEBUG_STEP_OVER: u16 = 14;
    pub const DEBUG_STEP_OUT: u16 = 15;
    pub const DEBUG_STOP: u16 = 16;
    pub const SCRIPT_CACHE: u16 = 17;
    pub const AUTHENTICATED: u16 = 18;
    pub const READY: u16 = 20;
    pub const PLUGINS_READY: u16 = 21;
    pub const FUNCTION_INFO: u16 = 22;
    pub const TTY_BEGIN: u16 = 23;
    pub const TTY: u16 = 24;
    pub const TTY_END: u16 = 25;
    pub const DEV_CMD: u16 = 26;
    pub const EDIT_AND_CONTINUE: u16 = 27;
    pub const ENDIANNESS: u16 = 28;
    pub const PROTOCOL_DEBUG_MARK: u16 = 29;
}

/// Wire widths shared by all catalogs.
pub mod sizes {
    pub const U8: usize = 1;
    pub const U16: usize = 2;
    pub const U32: usize = 4;
    pub const U64: usize = 8;
    pub const I16: usize = 2;
    pub const I32: usize = 4;
    pub const I64: usize = 8;
    pub const F32: usize = 4;
    pub const F64: usize = 8;
    /// Default bound for strings carried in SCMP messages.
    pub const STRING_LEN: usize = 256;
}

/// Length on the wire of a string field: `u16` prefix plus the bytes.
#[must_use]
pub const fn string_wire_len(s: &str) -> usize {
    sizes::U16 + s.len()
}

/// Common message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Base {
    pub length: i32,
    pub type_code: u16,
    pub plugin_id: u16,
}

impl Base {
    /// Envelope size in bytes.
    pub const SIZE: usize = 8;

    /// Envelope for a message with no payload.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn simple(type_code: u16, plugin_id: u16) -> Self {
        Self {
            length: Self::SIZE as i32,
            type_code,
            plugin_id,
        }
    }

    /// Envelope for a message carrying `payload` extra bytes.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn with_payload(type_code: u16, plugin_id: u16, payload: usize) -> Self {
        Self {
            length: (Self::SIZE + payload) as i32,
            type_code,
            plugin_id,
        }
    }

    /// True for the breakpoint phase commands Begin/Sync/End.
    #[must_use]
    pub const fn is_breakpoint(&self) -> bool {
        self.type_code >= type_codes::BREAKPOINT_BEGIN
            && self.type_code <= type_codes::BREAKPOINT_END
    }

    /// True for the debug-mode commands Start/StepInto/StepOver/StepOut/Stop.
    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.type_code >= type_codes::DEBUG_START && self.type_code <= type_codes::DEBUG_STOP
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.type_code == type_codes::READY
    }

    /// Decode an envelope from the front of `data` without consuming it.
    #[must_use]
    pub fn peek(data: &[u8], endian: Endian) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let mut reader = Reader::new(data, endian);
        Self::read_fields(&mut reader).ok()
    }

    pub fn read_fields(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            length: reader.read_i32()?,
            type_code: reader.read_u16()?,
            plugin_id: reader.read_u16()?,
        })
    }

    pub fn write_fields(&self, packer: &mut Packer<'_>) -> Result<()> {
        packer.pack_i32(self.length)?;
        packer.pack_u16(self.type_code)?;
        packer.pack_u16(self.plugin_id)
    }

    /// Encode a payload-free envelope straight to bytes, without needing
    /// a send buffer.
    #[must_use]
    pub fn encode(&self, endian: Endian) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let (len, rest) = out.split_at_mut(4);
        let (code, plugin) = rest.split_at_mut(2);
        match endian {
            Endian::Little => {
                len.copy_from_slice(&self.length.to_le_bytes());
                code.copy_from_slice(&self.type_code.to_le_bytes());
                plugin.copy_from_slice(&self.plugin_id.to_le_bytes());
            }
            Endian::Big => {
                len.copy_from_slice(&self.length.to_be_bytes());
                code.copy_from_slice(&self.type_code.to_be_bytes());
                plugin.copy_from_slice(&self.plugin_id.to_be_bytes());
            }
        }
        out
    }
}

/// Library version announcement, second message of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMsg {
    pub plugin_id: u16,
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
}

impl VersionMsg {
    /// Pack into `buffer`.
    ///
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let base = Base::with_payload(type_codes::VERSION, self.plugin_id, sizes::U16 * 3);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_u16(self.major)?;
        packer.pack_u16(self.minor)?;
        packer.pack_u16(self.revision)
    }

    /// Unpack from a full message image.
    ///
    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'_>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            major: reader.read_u16()?,
            minor: reader.read_u16()?,
            revision: reader.read_u16()?,
        })
    }
}

/// One script cache entry replayed to the client after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptCacheMsg<'a> {
    pub plugin_id: u16,
    pub rel_script_path: &'a str,
}

impl<'a> ScriptCacheMsg<'a> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let base = Base::with_payload(
            type_codes::SCRIPT_CACHE,
            self.plugin_id,
            string_wire_len(self.rel_script_path),
        );
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.rel_script_path)
    }

    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            rel_script_path: reader.read_str()?,
        })
    }
}

/// One line of TTY output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtyMsg<'a> {
    pub plugin_id: u16,
    pub message: &'a str,
}

impl<'a> TtyMsg<'a> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let base = Base::with_payload(
            type_codes::TTY,
            self.plugin_id,
            string_wire_len(self.message),
        );
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.message)
    }

    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            message: reader.read_str()?,
        })
    }
}

/// Developer command entered in the IDE, executed in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevCmdMsg<'a> {
    pub plugin_id: u16,
    pub command: &'a str,
}

impl<'a> DevCmdMsg<'a> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let base = Base::with_payload(
            type_codes::DEV_CMD,
            self.plugin_id,
            string_wire_len(self.command),
        );
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.command)
    }

    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            command: reader.read_str()?,
        })
    }
}

/// Script scheduled for reload on the next breakpoint resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditAndContinueMsg<'a> {
    pub plugin_id: u16,
    pub rel_script_path: &'a str,
}

impl<'a> EditAndContinueMsg<'a> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let base = Base::with_payload(
            type_codes::EDIT_AND_CONTINUE,
            self.plugin_id,
            string_wire_len(self.rel_script_path),
        );
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.rel_script_path)
    }

    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            rel_script_path: reader.read_str()?,
        })
    }
}

/// Function identity announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfoMsg<'a> {
    pub plugin_id: u16,
    pub rel_script_path: &'a str,
    pub function_name: &'a str,
    pub line_defined: i32,
}

impl<'a> FunctionInfoMsg<'a> {
    /// # Errors
    ///
    /// Propagates buffer overflow.
    pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
        let payload = string_wire_len(self.rel_script_path)
            + string_wire_len(self.function_name)
            + sizes::I32;
        let base = Base::with_payload(type_codes::FUNCTION_INFO, self.plugin_id, payload);
        let mut packer = Packer::new(buffer, endian);
        base.write_fields(&mut packer)?;
        packer.pack_str(self.rel_script_path)?;
        packer.pack_str(self.function_name)?;
        packer.pack_i32(self.line_defined)
    }

    /// # Errors
    ///
    /// Propagates short reads.
    pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
        let base = Base::read_fields(reader)?;
        Ok(Self {
            plugin_id: base.plugin_id,
            rel_script_path: reader.read_str()?,
            function_name: reader.read_str()?,
            line_defined: reader.read_i32()?,
        })
    }
}

/// Breakpoint phase and detail messages.
pub mod breakpoint {
    use super::{string_wire_len, sizes, type_codes, Base, ByteBuffer, Endian, Packer, Reader};
    use crate::Result;

    /// Breakpoint add/remove request from the IDE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Details<'a> {
        pub plugin_id: u16,
        pub rel_file_path: &'a str,
        pub line: i32,
        pub condition: &'a str,
        pub result: bool,
        pub use_function_environment: bool,
    }

    impl<'a> Details<'a> {
        /// # Errors
        ///
        /// Propagates buffer overflow.
        pub fn pack(&self, buffer: &mut ByteBuffer, endian: Endian) -> Result<()> {
            let payload = string_wire_len(self.rel_file_path)
                + sizes::I32
                + string_wire_len(self.condition)
                + sizes::U8 * 2;
            let base = Base::with_payload(type_codes::BREAKPOINT_DETAILS, self.plugin_id, payload);
            let mut packer = Packer::new(buffer, endian);
            base.write_fields(&mut packer)?;
            packer.pack_str(self.rel_file_path)?;
            packer.pack_i32(self.line)?;
            packer.pack_str(self.condition)?;
            packer.pack_u8(u8::from(self.result))?;
            packer.pack_u8(u8::from(self.use_function_environment))
        }

        /// # Errors
        ///
        /// Propagates short reads.
        pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
            let base = Base::read_fields(reader)?;
            Ok(Self {
                plugin_id: base.plugin_id,
                rel_file_path: reader.read_str()?,
                line: reader.read_i32()?,
                condition: reader.read_str()?,
                result: reader.read_u8()? == 1,
                use_function_environment: reader.read_u8()? == 1,
            })
        }
    }

    /// Shared shape of the Begin/Sync/End/Continue phase messages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Phase<'a> {
        pub plugin_id: u16,
        pub break_plugin_id: u16,
        pub rel_file_path: &'a str,
        pub line: i32,
    }

    impl<'a> Phase<'a> {
        /// # Errors
        ///
        /// Propagates buffer overflow.
        pub fn pack(
            &self,
            type_code: u16,
            buffer: &mut ByteBuffer,
            endian: Endian,
        ) -> Result<()> {
            let payload = sizes::U16 + string_wire_len(self.rel_file_path) + sizes::I32;
            let base = Base::with_payload(type_code, self.plugin_id, payload);
            let mut packer = Packer::new(buffer, endian);
            base.write_fields(&mut packer)?;
            packer.pack_u16(self.break_plugin_id)?;
            packer.pack_str(self.rel_file_path)?;
            packer.pack_i32(self.line)
        }

        /// # Errors
        ///
        /// Propagates short reads.
        pub fn unpack(reader: &mut Reader<'a>) -> Result<Self> {
            let base = Base::read_fields(reader)?;
            Ok(Self {
                plugin_id: base.plugin_id,
                break_plugin_id: reader.read_u16()?,
                rel_file_path: reader.read_str()?,
                line: reader.read_i32()?,
            })
        }
    }
}

/// Breakpoint key hash: signed 32-bit wrapping sum of the lowercased
/// path bytes, slashes skipped, plus the line number. Invariant under
/// path case and `/` vs `\` substitution; full breakpoint equality adds
/// a case/slash-insensitive path compare and line equality.
///
/// # Errors
///
/// [`Error::InvalidParameter`] for an empty path.
pub fn generate_hash(path: &str, line: i32) -> Result<i32> {
    if path.is_empty() {
        return Err(Error::InvalidParameter);
    }
    let mut hash: i32 = 0;
    for byte in path.bytes() {
        if byte == b'/' || byte == b'\\' {
            continue;
        }
        hash = hash.wrapping_add(i32::from(byte.to_ascii_lowercase()));
    }
    Ok(hash.wrapping_add(line))
}
