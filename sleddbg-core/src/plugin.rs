//! Language plugin capability interface.
//!
//! A plugin owns one interpreter-specific hook implementation and is
//! addressed by a 16-bit id; id 0 is reserved for the debugger core
//! itself. The core drives plugins purely through these callbacks and
//! passes itself as context, so plugins never cache a back-pointer.

use crate::debugger::SledDebugger;
use crate::params::{BreakpointParams, DebuggerMode, Version};

/// Observer interface the debugger core calls on each registered plugin.
///
/// Callbacks arrive with the core lock held; implementations may call
/// back into [`SledDebugger::send`] and the other public entry points
/// (the core lock is recursive) but must not call
/// [`SledDebugger::update`] re-entrantly.
pub trait SledDebuggerPlugin: Send + Sync {
    /// Unique plugin id. Must be non-zero.
    fn id(&self) -> u16;

    /// Human-readable plugin name.
    fn name(&self) -> &str;

    /// Plugin version, independent of the core library version.
    fn version(&self) -> Version;

    /// Final shutdown notice; called once from the core's shutdown path.
    fn shutdown(&self);

    /// A client finished the handshake.
    fn client_connected(&self, core: &SledDebugger);

    /// The client disconnected (gracefully or not).
    fn client_disconnected(&self, core: &SledDebugger);

    /// A message addressed to this plugin arrived. `data` is the full
    /// message image including the envelope.
    fn client_message(&self, core: &SledDebugger, data: &[u8]);

    /// A breakpoint was hit (possibly by a different plugin) and the
    /// begin phase handshake completed.
    fn client_breakpoint_begin(&self, core: &SledDebugger, params: &BreakpointParams<'_>);

    /// The breakpoint is over and execution is about to resume.
    fn client_breakpoint_end(&self, core: &SledDebugger, params: &BreakpointParams<'_>);

    /// The client changed the debug mode. The previous mode is still
    /// readable through [`SledDebugger::debugger_mode`] during this call.
    fn client_debug_mode_changed(&self, core: &SledDebugger, new_mode: DebuggerMode);
}
