//! Embedded script-debugger core.
//!
//! A host links this library in to expose a running scripting
//! interpreter to an external IDE over a single TCP connection. The
//! core owns the wire protocol (SCMP), the connection state machine,
//! and the plugin registry; language-specific behavior lives in
//! plugins implementing [`SledDebuggerPlugin`] (see the `sleddbg-lua`
//! crate for the Lua plugin).
//!
//! # Usage
//!
//! ```no_run
//! use sleddbg_core::{SledDebugger, SledDebuggerConfig};
//!
//! fn main() -> Result<(), sleddbg_core::Error> {
//!     let config = SledDebuggerConfig::default();
//!     let debugger = SledDebugger::new(&config)?;
//!     debugger.start_networking()?;
//!     loop {
//!         // once per frame
//!         match debugger.update() {
//!             Ok(()) | Err(sleddbg_core::Error::NotNetworking) => {}
//!             Err(err) => return Err(err),
//!         }
//!         # break;
//!     }
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod buffer;
pub mod debugger;
pub mod error;
pub mod params;
pub mod plugin;
pub mod scmp;
pub mod stringset;
pub mod transport;

pub use buffer::{ByteBuffer, Endian, Packer, Reader};
pub use debugger::{SharedLock, SledDebugger, CORE_PLUGIN_ID, LIBRARY_VERSION};
pub use error::Error;
pub use params::{
    BreakpointParams, DebuggerMode, NetworkParams, Protocol, SledDebuggerConfig, Version,
};
pub use plugin::SledDebuggerPlugin;
pub use scmp::generate_hash;
pub use stringset::{StringSet, StringSetConfig};

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;
