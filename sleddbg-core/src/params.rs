//! Host-facing configuration and shared parameter types.

/// Network protocol selection. TCP is the only transport today; the enum
/// exists so the wire-level choice stays an explicit configuration item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    #[default]
    Tcp,
}

/// Debugger execution mode as driven by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebuggerMode {
    /// Run freely; only breakpoints stop execution.
    #[default]
    Normal,
    /// Stop on the next line event.
    StepInto,
    /// Stop on the next line at the same or a shallower stack depth.
    StepOver,
    /// Stop on the next line at a shallower stack depth.
    StepOut,
    /// Stop on the next line event, unconditionally.
    Stop,
}

/// Network settings for a debugger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkParams {
    /// Protocol to use.
    pub protocol: Protocol,
    /// TCP port to listen on. Port 0 binds an ephemeral port.
    pub port: u16,
    /// Whether `start_networking` blocks until a client connects and the
    /// handshake completes.
    pub block_until_connect: bool,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            port: 11111,
            block_until_connect: false,
        }
    }
}

/// Configuration for a [`crate::SledDebugger`] instance.
///
/// All capacities are fixed at construction; nothing grows afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SledDebuggerConfig {
    /// Maximum number of language plugins.
    pub max_plugins: u16,
    /// Maximum number of entries in the script cache.
    pub max_script_cache_entries: u16,
    /// Maximum byte length of one script cache entry.
    pub max_script_cache_entry_len: u16,
    /// Receive buffer capacity in bytes. 1024 is a sensible minimum.
    pub max_recv_buffer_size: u32,
    /// Send buffer capacity in bytes. 1024 is a sensible minimum.
    pub max_send_buffer_size: u32,
    /// Network settings.
    pub net: NetworkParams,
}

impl Default for SledDebuggerConfig {
    fn default() -> Self {
        Self {
            max_plugins: 1,
            max_script_cache_entries: 0,
            max_script_cache_entry_len: 0,
            max_recv_buffer_size: 2048,
            max_send_buffer_size: 2048,
            net: NetworkParams::default(),
        }
    }
}

/// Semantic version triple reported during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
}

impl Version {
    #[must_use]
    pub const fn new(major: u16, minor: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            revision,
        }
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Details of a breakpoint being reported by a plugin.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointParams<'a> {
    /// Plugin that hit the breakpoint.
    pub plugin_id: u16,
    /// Line number of the hit breakpoint.
    pub line_number: u32,
    /// Script path, relative to the host's asset directory.
    pub rel_file_path: &'a str,
}

impl<'a> BreakpointParams<'a> {
    #[must_use]
    pub const fn new(plugin_id: u16, line_number: u32, rel_file_path: &'a str) -> Self {
        Self {
            plugin_id,
            line_number,
            rel_file_path,
        }
    }
}
