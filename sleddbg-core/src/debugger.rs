//! The debugger core: connection state machine, plugin registry,
//! script cache, message dispatch, and breakpoint-loop orchestration.
//!
//! The host drives [`SledDebugger::update`] from its main loop; the
//! interpreter thread calls [`SledDebugger::breakpoint_reached`] from
//! inside a hook and stays parked there, pumping the same receive and
//! dispatch path, until the client resumes execution. One recursive
//! mutex serializes the two; interior state lives in a `RefCell` whose
//! borrows never span a plugin callback.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, warn};

use crate::allocator::{SequentialAllocator, SizingAllocator};
use crate::buffer::{ByteBuffer, Endian};
use crate::error::Error;
use crate::params::{
    BreakpointParams, DebuggerMode, Protocol, SledDebuggerConfig, Version,
};
use crate::plugin::SledDebuggerPlugin;
use crate::scmp::{self, breakpoint, type_codes, Base, ScriptCacheMsg, TtyMsg, VersionMsg};
use crate::stringset::{StringSet, StringSetConfig};
use crate::transport::Transport;
use crate::Result;

/// Plugin id reserved for the debugger core itself.
pub const CORE_PLUGIN_ID: u16 = 0;

/// Version announced to the client during the handshake.
pub const LIBRARY_VERSION: Version = Version::new(0, 5, 0);

/// Bytes pulled off the socket per update pass.
const RECV_CHUNK: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Outcome of one internal update pass. The breakpoint and handshake
/// loops spin on these until the message they are waiting for arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pump {
    Idle,
    Message,
    Ready,
    BpBegin,
    BpSync,
    BpEnd,
    BpContinue,
}

struct CoreState {
    transport: Transport,
    recv_buf: ByteBuffer,
    send_buf: ByteBuffer,
    script_cache: StringSet,
    plugins: Vec<Arc<dyn SledDebuggerPlugin>>,
    max_plugins: u16,
    mode: DebuggerMode,
    conn: ConnectionState,
    update_guard: bool,
    initialized: bool,
    footprint: usize,
}

/// A debugger instance hosting up to `max_plugins` language plugins.
pub struct SledDebugger {
    cell: ReentrantMutex<RefCell<CoreState>>,
    /// Scratch image of the message currently being dispatched. Lives
    /// outside the state cell so plugin callbacks can read it while the
    /// state is re-borrowed through re-entrant calls.
    dispatch_buf: Mutex<ByteBuffer>,
}

/// Guard returned by [`SledDebugger::lock_shared`].
pub struct SharedLock<'a> {
    _guard: parking_lot::ReentrantMutexGuard<'a, RefCell<CoreState>>,
}

fn validate_config(config: &SledDebuggerConfig) -> Result<()> {
    if config.max_plugins == 0
        || config.max_recv_buffer_size == 0
        || config.max_send_buffer_size == 0
    {
        return Err(Error::InvalidConfiguration);
    }
    match config.net.protocol {
        Protocol::Tcp => Ok(()),
    }
}

fn script_cache_config(config: &SledDebuggerConfig) -> StringSetConfig {
    StringSetConfig {
        max_entries: config.max_script_cache_entries,
        max_entry_len: config.max_script_cache_entry_len,
        allow_duplicates: false,
    }
}

fn layout(config: &SledDebuggerConfig, alloc: &mut dyn SequentialAllocator) -> Result<()> {
    StringSet::required_memory(&script_cache_config(config), alloc)?;
    ByteBuffer::required_memory(config.max_recv_buffer_size, alloc)?;
    ByteBuffer::required_memory(config.max_send_buffer_size, alloc)?;
    // Dispatch scratch mirrors the receive buffer.
    ByteBuffer::required_memory(config.max_recv_buffer_size, alloc)?;
    alloc.allocate(
        config.max_plugins as usize * core::mem::size_of::<Arc<dyn SledDebuggerPlugin>>(),
        1,
    )?;
    Ok(())
}

impl SledDebugger {
    /// Bytes of config-sized storage a debugger built from `config`
    /// will reserve. Configuration errors are reported here, making a
    /// successful size query the precondition for [`SledDebugger::new`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] / [`Error::InvalidProtocol`] for
    /// a bad config.
    pub fn required_memory(config: &SledDebuggerConfig) -> Result<usize> {
        validate_config(config)?;
        let mut sizing = SizingAllocator::new();
        layout(config, &mut sizing)?;
        Ok(sizing.bytes_allocated())
    }

    /// Create a debugger. All capacities are fixed here; nothing grows
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Configuration errors, as reported by
    /// [`SledDebugger::required_memory`].
    pub fn new(config: &SledDebuggerConfig) -> Result<Arc<Self>> {
        let footprint = Self::required_memory(config)?;
        let state = CoreState {
            transport: Transport::new(config.net),
            recv_buf: ByteBuffer::new(config.max_recv_buffer_size),
            send_buf: ByteBuffer::new(config.max_send_buffer_size),
            script_cache: StringSet::new(&script_cache_config(config)),
            plugins: Vec::with_capacity(config.max_plugins as usize),
            max_plugins: config.max_plugins,
            mode: DebuggerMode::Normal,
            conn: ConnectionState::Disconnected,
            update_guard: false,
            initialized: true,
            footprint,
        };
        debug_assert_eq!(footprint, state_footprint(&state));
        Ok(Arc::new(Self {
            cell: ReentrantMutex::new(RefCell::new(state)),
            dispatch_buf: Mutex::new(ByteBuffer::new(config.max_recv_buffer_size)),
        }))
    }

    /// Library version reported in the handshake.
    #[must_use]
    pub const fn version() -> Version {
        LIBRARY_VERSION
    }

    /// Bytes of config-sized storage actually reserved. Equals
    /// [`SledDebugger::required_memory`] for the construction config.
    #[must_use]
    pub fn memory_footprint(&self) -> usize {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.footprint
    }

    #[must_use]
    pub fn is_networking(&self) -> bool {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.transport.is_networking()
    }

    /// True from a completed accept until the connection is lost.
    #[must_use]
    pub fn is_debugger_connected(&self) -> bool {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.conn != ConnectionState::Disconnected
    }

    /// Current debug mode as last commanded by the client.
    #[must_use]
    pub fn debugger_mode(&self) -> DebuggerMode {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.mode
    }

    /// Port the listen socket is bound to, once networking has started.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        let guard = self.cell.lock();
        let st = guard.borrow();
        st.transport.local_port()
    }

    /// Hold the core's recursive lock across a multi-message section,
    /// keeping framed `Begin`/`End` groups atomic with respect to other
    /// threads. Lock order is fixed: plugins take this before their own
    /// lock whenever both are needed.
    #[must_use]
    pub fn lock_shared(&self) -> SharedLock<'_> {
        SharedLock {
            _guard: self.cell.lock(),
        }
    }

    /// Register a plugin. Ids must be unique and non-zero.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPlugin`] for id 0, [`Error::MaxPluginsReached`]
    /// when full, [`Error::PluginAlreadyAdded`] on a duplicate id.
    pub fn add_plugin(&self, plugin: Arc<dyn SledDebuggerPlugin>) -> Result<()> {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if plugin.id() == CORE_PLUGIN_ID {
            return Err(Error::InvalidPlugin);
        }
        if st.plugins.len() >= st.max_plugins as usize {
            return Err(Error::MaxPluginsReached);
        }
        if st.plugins.iter().any(|p| p.id() == plugin.id()) {
            return Err(Error::PluginAlreadyAdded);
        }
        st.plugins.push(plugin);
        Ok(())
    }

    /// Remove a plugin by id.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if no plugins are registered,
    /// [`Error::NoSearch`] if the id is unknown.
    pub fn remove_plugin(&self, id: u16) -> Result<()> {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if st.plugins.is_empty() {
            return Err(Error::InvalidState);
        }
        let index = st
            .plugins
            .iter()
            .position(|p| p.id() == id)
            .ok_or(Error::NoSearch)?;
        st.plugins.remove(index);
        Ok(())
    }

    /// Add a script path to the cache replayed on connection.
    pub fn script_cache_add(&self, rel_path: &str) -> bool {
        if rel_path.is_empty() {
            return false;
        }
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        st.script_cache.add(rel_path)
    }

    pub fn script_cache_remove(&self, rel_path: &str) -> bool {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        st.script_cache.remove(rel_path)
    }

    pub fn script_cache_clear(&self) {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        st.script_cache.clear();
    }

    /// Start listening. With `block_until_connect` set, also waits for a
    /// client and drives the handshake to completion before returning.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`], [`Error::AlreadyNetworking`],
    /// transport failures, or [`Error::Negotiation`] from a blocking
    /// handshake.
    pub fn start_networking(&self) -> Result<()> {
        // No outer lock here: the blocking accept below must not starve
        // other threads polling connection state.
        {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            if !st.initialized {
                return Err(Error::NotInitialized);
            }
            if st.transport.is_networking() {
                return Err(Error::AlreadyNetworking);
            }
            st.transport.start()?;
        }
        let block = {
            let guard = self.cell.lock();
            let st = guard.borrow();
            st.transport.params().block_until_connect
        };
        if block {
            // Poll rather than block inside the state lock, so other
            // threads can still observe connection state while we wait.
            let accepted = loop {
                let result = {
                    let guard = self.cell.lock();
                    let mut st = guard.borrow_mut();
                    st.transport.accept(false)
                };
                match result {
                    Err(Error::NotNetworking) => {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                    other => break other,
                }
            };
            if let Err(err) = accepted {
                let _ = self.stop_networking();
                return Err(err);
            }
            self.internal_connected()?;
        }
        Ok(())
    }

    /// Stop listening, sending a disconnect notice first if a client is
    /// attached.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for parity with the other
    /// lifecycle entry points.
    pub fn stop_networking(&self) -> Result<()> {
        let _outer = self.cell.lock();
        if self.is_debugger_connected() {
            let notice = Base::simple(type_codes::DISCONNECT, CORE_PLUGIN_ID).encode(Endian::NATIVE);
            let _ = self.send(&notice);
        }
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        st.transport.stop();
        st.conn = ConnectionState::Disconnected;
        Ok(())
    }

    /// One polling pass: drain complete messages, then either try a
    /// non-blocking accept (no client) or pull bytes off the socket.
    ///
    /// # Errors
    ///
    /// [`Error::NotNetworking`] before [`SledDebugger::start_networking`],
    /// [`Error::RecursiveUpdate`] when called from inside itself.
    pub fn update(&self) -> Result<()> {
        let guard = self.cell.lock();
        {
            let mut st = guard.borrow_mut();
            if !st.transport.is_networking() {
                return Err(Error::NotNetworking);
            }
            if st.update_guard {
                return Err(Error::RecursiveUpdate);
            }
            st.update_guard = true;
        }
        let result = self.internal_update();
        guard.borrow_mut().update_guard = false;
        result.map(|_| ())
    }

    /// Send raw, already-framed bytes to the client.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for empty data,
    /// [`Error::NotNetworking`] / [`Error::NoClientConnected`] when
    /// there is nobody to send to, plus transport failures.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if !st.transport.is_networking() {
            return Err(Error::NotNetworking);
        }
        if st.conn == ConnectionState::Disconnected {
            return Err(Error::NoClientConnected);
        }
        st.transport.send(data)
    }

    /// Stream a TTY message to the client, chunked into the wire string
    /// bound and framed by `TTYBegin`/`TTYEnd`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for an empty message, plus the same
    /// connectivity errors as [`SledDebugger::send`].
    pub fn tty_notify(&self, message: &str) -> Result<()> {
        if message.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let _outer = self.cell.lock();
        if !self.is_networking() {
            return Err(Error::NotNetworking);
        }
        if !self.is_debugger_connected() {
            return Err(Error::NoClientConnected);
        }
        let begin = Base::simple(type_codes::TTY_BEGIN, CORE_PLUGIN_ID).encode(Endian::NATIVE);
        let _ = self.send(&begin);
        {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            let CoreState {
                send_buf,
                transport,
                ..
            } = &mut *st;
            for chunk in str_chunks(message, scmp::sizes::STRING_LEN - 1) {
                let msg = TtyMsg {
                    plugin_id: CORE_PLUGIN_ID,
                    message: chunk,
                };
                if msg.pack(send_buf, Endian::NATIVE).is_ok() {
                    let _ = transport.send(send_buf.as_slice());
                }
            }
        }
        let end = Base::simple(type_codes::TTY_END, CORE_PLUGIN_ID).encode(Endian::NATIVE);
        let _ = self.send(&end);
        Ok(())
    }

    /// Run the four-phase breakpoint exchange: Begin, Sync, End, then
    /// wait for a debug-mode command and acknowledge with Continue.
    /// Blocks the calling (interpreter) thread, pumping the receive and
    /// dispatch path throughout.
    ///
    /// # Errors
    ///
    /// [`Error::NotNetworking`] / [`Error::NoClientConnected`] when the
    /// client is unavailable before or during the exchange. Once the
    /// begin phase is entered, `client_breakpoint_end` is delivered
    /// exactly once on every exit path.
    pub fn breakpoint_reached(&self, params: &BreakpointParams<'_>) -> Result<()> {
        let _outer = self.cell.lock();
        {
            let guard = self.cell.lock();
            let st = guard.borrow();
            if !st.transport.is_networking() {
                return Err(Error::NotNetworking);
            }
            if st.conn == ConnectionState::Disconnected {
                return Err(Error::NoClientConnected);
            }
        }

        self.send_phase(type_codes::BREAKPOINT_BEGIN, params);
        if !self.pump_until(Pump::BpBegin) {
            self.notify_breakpoint_end(params);
            return Err(Error::NoClientConnected);
        }
        self.notify_breakpoint_begin(params);

        self.send_phase(type_codes::BREAKPOINT_SYNC, params);
        if !self.pump_until(Pump::BpSync) {
            self.notify_breakpoint_end(params);
            return Err(Error::NoClientConnected);
        }

        self.send_phase(type_codes::BREAKPOINT_END, params);
        if !self.pump_until(Pump::BpEnd) {
            self.notify_breakpoint_end(params);
            return Err(Error::NoClientConnected);
        }

        if !self.pump_until(Pump::BpContinue) {
            self.notify_breakpoint_end(params);
            return Err(Error::NoClientConnected);
        }
        self.send_phase(type_codes::BREAKPOINT_CONTINUE, params);
        self.notify_breakpoint_end(params);
        Ok(())
    }

    /// Shut down plugins and networking. Idempotent.
    pub fn shutdown(&self) {
        let _outer = self.cell.lock();
        {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            if !st.initialized {
                return;
            }
            st.initialized = false;
        }
        self.for_each_plugin(|plugin| plugin.shutdown());
        let _ = self.stop_networking();
    }

    // ------------------------------------------------------------------
    // Internals. All of these assume the caller already holds the core
    // lock (it is recursive, so they re-acquire freely).
    // ------------------------------------------------------------------

    fn for_each_plugin(&self, mut f: impl FnMut(&Arc<dyn SledDebuggerPlugin>)) {
        let mut index = 0;
        loop {
            let plugin = {
                let guard = self.cell.lock();
                let st = guard.borrow();
                st.plugins.get(index).cloned()
            };
            match plugin {
                Some(plugin) => {
                    f(&plugin);
                    index += 1;
                }
                None => break,
            }
        }
    }

    fn plugin_for(&self, plugin_id: u16) -> Option<Arc<dyn SledDebuggerPlugin>> {
        let guard = self.cell.lock();
        let st = guard.borrow();
        if st.plugins.len() == 1 {
            st.plugins.first().cloned()
        } else {
            st.plugins.iter().find(|p| p.id() == plugin_id).cloned()
        }
    }

    fn send_phase(&self, type_code: u16, params: &BreakpointParams<'_>) {
        let guard = self.cell.lock();
        let mut st = guard.borrow_mut();
        if st.conn == ConnectionState::Disconnected {
            return;
        }
        let CoreState {
            send_buf,
            transport,
            ..
        } = &mut *st;
        let msg = breakpoint::Phase {
            plugin_id: CORE_PLUGIN_ID,
            break_plugin_id: params.plugin_id,
            rel_file_path: params.rel_file_path,
            line: params.line_number as i32,
        };
        if msg.pack(type_code, send_buf, Endian::NATIVE).is_ok() {
            let _ = transport.send(send_buf.as_slice());
        }
    }

    fn pump_until(&self, want: Pump) -> bool {
        loop {
            if !self.is_debugger_connected() {
                return false;
            }
            match self.internal_update() {
                Ok(status) if status == want => return true,
                Ok(_) => {}
                Err(err) => {
                    debug!(?err, "update error while pumping");
                }
            }
        }
    }

    fn notify_breakpoint_begin(&self, params: &BreakpointParams<'_>) {
        self.for_each_plugin(|plugin| plugin.client_breakpoint_begin(self, params));
    }

    fn notify_breakpoint_end(&self, params: &BreakpointParams<'_>) {
        self.for_each_plugin(|plugin| plugin.client_breakpoint_end(self, params));
    }

    fn internal_update(&self) -> Result<Pump> {
        let status = self.process_messages()?;
        if !matches!(status, Pump::Idle | Pump::Message) {
            return Ok(status);
        }

        let connected = {
            let guard = self.cell.lock();
            let st = guard.borrow();
            st.transport.is_connected()
        };

        if connected {
            let mut chunk = [0u8; RECV_CHUNK];
            let received = {
                let guard = self.cell.lock();
                let mut st = guard.borrow_mut();
                st.transport.recv(&mut chunk, false)
            };
            match received {
                Ok(0) => Ok(status),
                Ok(count) => {
                    let guard = self.cell.lock();
                    let mut st = guard.borrow_mut();
                    if !st.recv_buf.append(&chunk[..count]) {
                        warn!(count, "receive buffer full; dropping bytes");
                    }
                    Ok(status)
                }
                Err(_) => {
                    self.internal_disconnected();
                    Ok(Pump::Idle)
                }
            }
        } else {
            let accepted = {
                let guard = self.cell.lock();
                let mut st = guard.borrow_mut();
                st.transport.accept(false)
            };
            match accepted {
                Ok(()) => self.internal_connected(),
                Err(Error::NotNetworking) => Ok(Pump::Idle),
                Err(err) => Err(err),
            }
        }
    }

    /// Drain complete messages off the receive buffer, dispatching each.
    /// Stops early (with the matching status) on breakpoint-phase,
    /// debug-mode, and ready messages so the waiting loops can react.
    fn process_messages(&self) -> Result<Pump> {
        let mut status = Pump::Idle;
        loop {
            enum Extracted {
                None,
                Framing,
                Msg(Base),
            }
            let extracted = {
                let guard = self.cell.lock();
                let mut st = guard.borrow_mut();
                match Base::peek(st.recv_buf.as_slice(), Endian::NATIVE) {
                    None => Extracted::None,
                    Some(base) if base.length < Base::SIZE as i32 => Extracted::Framing,
                    Some(base) => {
                        let length = base.length as usize;
                        if st.recv_buf.len() < length {
                            Extracted::None
                        } else {
                            let mut dispatch = self.dispatch_buf.lock();
                            dispatch.reset();
                            dispatch.append(&st.recv_buf.as_slice()[..length]);
                            st.recv_buf.shuffle(length);
                            Extracted::Msg(base)
                        }
                    }
                }
            };

            match extracted {
                Extracted::None => break,
                Extracted::Framing => {
                    warn!("malformed frame length; dropping connection");
                    {
                        let guard = self.cell.lock();
                        let mut st = guard.borrow_mut();
                        st.transport.disconnect();
                    }
                    self.internal_disconnected();
                    return Ok(Pump::Idle);
                }
                Extracted::Msg(base) => {
                    self.dispatch_message(base);
                    status = match base {
                        b if b.is_breakpoint() => match b.type_code {
                            type_codes::BREAKPOINT_BEGIN => Pump::BpBegin,
                            type_codes::BREAKPOINT_SYNC => Pump::BpSync,
                            _ => Pump::BpEnd,
                        },
                        b if b.is_debug() => Pump::BpContinue,
                        b if b.is_ready() => Pump::Ready,
                        _ => Pump::Message,
                    };
                    if status != Pump::Message {
                        return Ok(status);
                    }
                }
            }
        }
        Ok(status)
    }

    fn dispatch_message(&self, base: Base) {
        if base.plugin_id == CORE_PLUGIN_ID {
            match base.type_code {
                type_codes::DEBUG_START => self.change_mode(DebuggerMode::Normal),
                type_codes::DEBUG_STEP_INTO => self.change_mode(DebuggerMode::StepInto),
                type_codes::DEBUG_STEP_OVER => self.change_mode(DebuggerMode::StepOver),
                type_codes::DEBUG_STEP_OUT => self.change_mode(DebuggerMode::StepOut),
                type_codes::DEBUG_STOP => self.change_mode(DebuggerMode::Stop),
                type_codes::HEARTBEAT => {
                    let echo =
                        Base::simple(type_codes::HEARTBEAT, CORE_PLUGIN_ID).encode(Endian::NATIVE);
                    let _ = self.send(&echo);
                }
                type_codes::PROTOCOL_DEBUG_MARK => {
                    let echo = Base::simple(type_codes::PROTOCOL_DEBUG_MARK, CORE_PLUGIN_ID)
                        .encode(Endian::NATIVE);
                    let _ = self.send(&echo);
                }
                _ => {}
            }
        } else if let Some(plugin) = self.plugin_for(base.plugin_id) {
            let dispatch = self.dispatch_buf.lock();
            plugin.client_message(self, dispatch.as_slice());
        }
    }

    /// Plugins observe the old mode during the notification; the new
    /// mode is committed afterwards.
    fn change_mode(&self, new_mode: DebuggerMode) {
        debug!(?new_mode, "debug mode changed");
        self.for_each_plugin(|plugin| plugin.client_debug_mode_changed(self, new_mode));
        let guard = self.cell.lock();
        guard.borrow_mut().mode = new_mode;
    }

    /// Server-initiated handshake, run once per accepted connection.
    fn internal_connected(&self) -> Result<Pump> {
        debug!("negotiating with client");
        {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            st.conn = ConnectionState::Connecting;
            st.recv_buf.reset();

            let endianness =
                Base::simple(type_codes::ENDIANNESS, CORE_PLUGIN_ID).encode(Endian::NATIVE);
            let CoreState {
                send_buf,
                transport,
                ..
            } = &mut *st;
            transport.send(&endianness)?;

            let version = VersionMsg {
                plugin_id: CORE_PLUGIN_ID,
                major: LIBRARY_VERSION.major,
                minor: LIBRARY_VERSION.minor,
                revision: LIBRARY_VERSION.revision,
            };
            version.pack(send_buf, Endian::NATIVE)?;
            transport.send(send_buf.as_slice())?;
        }

        if self.wait_for_success() {
            {
                let guard = self.cell.lock();
                let mut st = guard.borrow_mut();
                let auth = Base::simple(type_codes::AUTHENTICATED, CORE_PLUGIN_ID)
                    .encode(Endian::NATIVE);
                let _ = st.transport.send(&auth);
                st.conn = ConnectionState::Connected;
            }
            self.on_client_connected();

            // Block until the client signals it finished its own setup.
            loop {
                if !self.is_debugger_connected() {
                    break;
                }
                match self.internal_update() {
                    Ok(Pump::Ready) => break,
                    Ok(_) => {}
                    Err(err) => debug!(?err, "update error while waiting for ready"),
                }
            }
            if self.is_debugger_connected() {
                let ready = Base::simple(type_codes::READY, CORE_PLUGIN_ID).encode(Endian::NATIVE);
                let _ = self.send(&ready);
            }
            debug!("handshake complete");
            Ok(Pump::Message)
        } else {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            let bye = Base::simple(type_codes::DISCONNECT, CORE_PLUGIN_ID).encode(Endian::NATIVE);
            let _ = st.transport.send(&bye);
            st.conn = ConnectionState::Disconnected;
            st.transport.disconnect();
            warn!("negotiation failed");
            Err(Error::Negotiation)
        }
    }

    /// Read exactly one envelope and check it is `Success`. Polls so the
    /// state lock is never held while waiting on the peer.
    fn wait_for_success(&self) -> bool {
        let mut buf = [0u8; Base::SIZE];
        let mut got = 0;
        while got < Base::SIZE {
            let received = {
                let guard = self.cell.lock();
                let mut st = guard.borrow_mut();
                st.transport.recv(&mut buf[got..], false)
            };
            match received {
                Ok(0) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Ok(count) => got += count,
                Err(_) => return false,
            }
        }
        Base::peek(&buf, Endian::NATIVE)
            .is_some_and(|base| base.type_code == type_codes::SUCCESS)
    }

    fn on_client_connected(&self) {
        {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            let CoreState {
                script_cache,
                send_buf,
                transport,
                ..
            } = &mut *st;
            for entry in script_cache.iter() {
                let msg = ScriptCacheMsg {
                    plugin_id: CORE_PLUGIN_ID,
                    rel_script_path: entry,
                };
                if msg.pack(send_buf, Endian::NATIVE).is_ok() {
                    let _ = transport.send(send_buf.as_slice());
                }
            }
        }
        self.for_each_plugin(|plugin| plugin.client_connected(self));
        let ready = Base::simple(type_codes::PLUGINS_READY, CORE_PLUGIN_ID).encode(Endian::NATIVE);
        let _ = self.send(&ready);
    }

    fn internal_disconnected(&self) {
        debug!("client disconnected");
        {
            let guard = self.cell.lock();
            let mut st = guard.borrow_mut();
            st.conn = ConnectionState::Disconnected;
            st.mode = DebuggerMode::Normal;
            st.recv_buf.reset();
        }
        self.for_each_plugin(|plugin| plugin.client_disconnected(self));
    }
}

impl Drop for SledDebugger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn state_footprint(st: &CoreState) -> usize {
    st.script_cache.footprint()
        + st.recv_buf.footprint()
        + st.send_buf.footprint()
        // Dispatch scratch mirrors the receive buffer.
        + st.recv_buf.footprint()
        + st.max_plugins as usize * core::mem::size_of::<Arc<dyn SledDebuggerPlugin>>()
}

/// Split on char boundaries into chunks of at most `max_bytes` bytes.
fn str_chunks(s: &str, max_bytes: usize) -> impl Iterator<Item = &str> {
    let mut rest = s;
    core::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut end = rest.len().min(max_bytes);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        rest = tail;
        Some(head)
    })
}
