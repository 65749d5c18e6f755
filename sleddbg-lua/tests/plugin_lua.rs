//! End-to-end tests: a simulated IDE drives the plugin over localhost
//! TCP while the interpreter runs on the test thread (the breakpoint
//! loop parks it inside the hook, exactly as in a host application).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use mlua::Lua;
use sleddbg_core::{NetworkParams, SledDebugger, SledDebuggerConfig};
use sleddbg_lua::{LuaError, LuaPlugin, LuaPluginConfig};

mod codes {
    pub const BREAKPOINT_DETAILS: u16 = 1;
    pub const BREAKPOINT_BEGIN: u16 = 2;
    pub const BREAKPOINT_SYNC: u16 = 3;
    pub const BREAKPOINT_END: u16 = 4;
    pub const BREAKPOINT_CONTINUE: u16 = 5;
    pub const SUCCESS: u16 = 9;
    pub const DEBUG_START: u16 = 12;
    pub const DEBUG_STEP_OVER: u16 = 14;
    pub const READY: u16 = 20;
    pub const PLUGINS_READY: u16 = 21;
    pub const TTY: u16 = 24;
    pub const EDIT_AND_CONTINUE: u16 = 27;

    pub const MEMORY_TRACE_STREAM_BEGIN: u16 = 203;
    pub const MEMORY_TRACE_STREAM: u16 = 204;
    pub const MEMORY_TRACE_STREAM_END: u16 = 205;
    pub const GLOBAL_VAR: u16 = 221;
    pub const GLOBAL_VAR_LOOKUP_BEGIN: u16 = 223;
    pub const GLOBAL_VAR_LOOKUP_END: u16 = 224;
    pub const LOCAL_VAR: u16 = 231;
    pub const VAR_LOOKUP: u16 = 255;
    pub const VAR_UPDATE: u16 = 256;
    pub const CALL_STACK: u16 = 261;
    pub const MEMORY_TRACE_TOGGLE: u16 = 300;
}

#[derive(Debug, Clone)]
struct Frame {
    type_code: u16,
    plugin_id: u16,
    payload: Vec<u8>,
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head)?;
    let length = i32::from_ne_bytes(head[0..4].try_into().unwrap());
    let type_code = u16::from_ne_bytes(head[4..6].try_into().unwrap());
    let plugin_id = u16::from_ne_bytes(head[6..8].try_into().unwrap());
    assert!(length >= 8);
    let mut payload = vec![0u8; length as usize - 8];
    stream.read_exact(&mut payload)?;
    Ok(Frame {
        type_code,
        plugin_id,
        payload,
    })
}

struct FrameWriter {
    bytes: Vec<u8>,
}

impl FrameWriter {
    fn new(type_code: u16, plugin_id: u16) -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0i32.to_ne_bytes());
        bytes.extend_from_slice(&type_code.to_ne_bytes());
        bytes.extend_from_slice(&plugin_id.to_ne_bytes());
        Self { bytes }
    }

    fn u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    fn u16(mut self, value: u16) -> Self {
        self.bytes.extend_from_slice(&value.to_ne_bytes());
        self
    }

    fn i16(mut self, value: i16) -> Self {
        self.bytes.extend_from_slice(&value.to_ne_bytes());
        self
    }

    fn i32(mut self, value: i32) -> Self {
        self.bytes.extend_from_slice(&value.to_ne_bytes());
        self
    }

    fn string(mut self, value: &str) -> Self {
        self.bytes
            .extend_from_slice(&(value.len() as u16).to_ne_bytes());
        self.bytes.extend_from_slice(value.as_bytes());
        self
    }

    fn bytes(mut self) -> Vec<u8> {
        let length = self.bytes.len() as i32;
        self.bytes[0..4].copy_from_slice(&length.to_ne_bytes());
        self.bytes
    }

    fn send(self, stream: &mut TcpStream) {
        let bytes = self.bytes();
        stream.write_all(&bytes).unwrap();
    }
}

fn write_simple(stream: &mut TcpStream, type_code: u16, plugin_id: u16) {
    FrameWriter::new(type_code, plugin_id).send(stream);
}

fn send_breakpoint_details(
    stream: &mut TcpStream,
    path: &str,
    line: i32,
    condition: &str,
    result: bool,
) {
    FrameWriter::new(codes::BREAKPOINT_DETAILS, 1)
        .string(path)
        .i32(line)
        .string(condition)
        .u8(u8::from(result))
        .u8(0)
        .send(stream);
}

fn payload_string(payload: &[u8]) -> (String, &[u8]) {
    let len = u16::from_ne_bytes(payload[0..2].try_into().unwrap()) as usize;
    let text = String::from_utf8(payload[2..2 + len].to_vec()).unwrap();
    (text, &payload[2 + len..])
}

/// Decode a scoped variable frame far enough for assertions.
fn decode_var(payload: &[u8]) -> (String, String, i16) {
    let (name, rest) = payload_string(payload);
    let rest = &rest[2..]; // name type
    let (value, rest) = payload_string(rest);
    let value_type = i16::from_ne_bytes(rest[0..2].try_into().unwrap());
    (name, value, value_type)
}

/// Client half of the handshake, consuming everything through the
/// server's final `Ready`.
fn client_handshake(stream: &mut TcpStream) {
    let endianness = read_frame(stream).unwrap();
    assert_eq!(endianness.type_code, 28);
    let version = read_frame(stream).unwrap();
    assert_eq!(version.type_code, 11);
    write_simple(stream, codes::SUCCESS, 0);
    // Authenticated, cache entries, plugin limits and states, then
    // PluginsReady in some order defined by the server.
    loop {
        let frame = read_frame(stream).unwrap();
        if frame.type_code == codes::PLUGINS_READY {
            break;
        }
    }
    write_simple(stream, codes::READY, 0);
    loop {
        let frame = read_frame(stream).unwrap();
        if frame.type_code == codes::READY {
            break;
        }
    }
}

struct Harness {
    debugger: Arc<SledDebugger>,
    plugin: Arc<LuaPlugin>,
    lua: Lua,
}

fn harness(lua_config: &LuaPluginConfig) -> (Harness, u16) {
    let config = SledDebuggerConfig {
        max_plugins: 1,
        net: NetworkParams {
            port: 0,
            block_until_connect: true,
            ..NetworkParams::default()
        },
        ..SledDebuggerConfig::default()
    };
    let debugger = SledDebugger::new(&config).unwrap();
    let plugin = LuaPlugin::new(lua_config).unwrap();
    debugger.add_plugin(plugin.clone()).unwrap();

    let lua = Lua::new();
    plugin.register_state(&debugger, &lua, "main").unwrap();

    let server = debugger.clone();
    std::thread::spawn(move || {
        server.start_networking().unwrap();
        // Keep pumping so client requests are handled outside of
        // breakpoint windows too. Holding only a weak handle lets the
        // debugger shut down when the test drops it.
        let weak = Arc::downgrade(&server);
        drop(server);
        while let Some(debugger) = weak.upgrade() {
            if debugger.update().is_err() {
                break;
            }
            drop(debugger);
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    let port = loop {
        if let Some(port) = debugger.local_port() {
            break port;
        }
        std::thread::sleep(Duration::from_millis(5));
    };
    (
        Harness {
            debugger,
            plugin,
            lua,
        },
        port,
    )
}

/// Drive one complete breakpoint exchange from the IDE side. Returns
/// the frames the server emitted between the begin acknowledgement and
/// the sync request, and the line reported in the begin message.
fn drive_breakpoint(stream: &mut TcpStream, continue_code: u16, during_sync: &[FrameSpec]) -> (Vec<Frame>, i32) {
    let begin = loop {
        let frame = read_frame(stream).unwrap();
        if frame.type_code == codes::BREAKPOINT_BEGIN {
            break frame;
        }
    };
    let rest = &begin.payload[2..];
    let (_, after_path) = payload_string(rest);
    let line = i32::from_ne_bytes(after_path[0..4].try_into().unwrap());

    write_simple(stream, codes::BREAKPOINT_BEGIN, 0);

    let mut snapshot = Vec::new();
    loop {
        let frame = read_frame(stream).unwrap();
        if frame.type_code == codes::BREAKPOINT_SYNC {
            break;
        }
        snapshot.push(frame);
    }

    for spec in during_sync {
        spec.send(stream);
    }
    write_simple(stream, codes::BREAKPOINT_SYNC, 0);

    loop {
        let frame = read_frame(stream).unwrap();
        if frame.type_code == codes::BREAKPOINT_END {
            break;
        }
        snapshot.push(frame);
    }
    write_simple(stream, codes::BREAKPOINT_END, 0);

    write_simple(stream, continue_code, 0);
    loop {
        let frame = read_frame(stream).unwrap();
        if frame.type_code == codes::BREAKPOINT_CONTINUE {
            break;
        }
        snapshot.push(frame);
    }
    (snapshot, line)
}

/// A client-built frame to inject during the sync window.
enum FrameSpec {
    GlobalUpdate {
        name: &'static str,
        value: &'static str,
        value_type: i16,
    },
    GlobalLookup {
        name: &'static str,
        keys: &'static [&'static str],
    },
    DevCmd {
        command: &'static str,
    },
}

impl FrameSpec {
    fn send(&self, stream: &mut TcpStream) {
        match self {
            Self::GlobalUpdate {
                name,
                value,
                value_type,
            } => {
                FrameWriter::new(codes::VAR_UPDATE, 1)
                    .u8(0) // scope: global
                    .u8(0) // context: normal
                    .u16(1) // no keys
                    .i16(0)
                    .i32(0)
                    .string(value)
                    .i16(*value_type)
                    .string(name)
                    .u16(4)
                    .send(stream);
            }
            Self::GlobalLookup { name, keys } => {
                let mut writer = FrameWriter::new(codes::VAR_LOOKUP, 1)
                    .u8(0)
                    .u8(0)
                    .u16(keys.len() as u16 + 1)
                    .i16(0)
                    .i32(0)
                    .u8(0) // extra
                    .string(name)
                    .u16(4);
                for key in *keys {
                    writer = writer.string(key).u16(4);
                }
                writer.send(stream);
            }
            Self::DevCmd { command } => {
                FrameWriter::new(26, 1).string(command).send(stream);
            }
        }
    }
}

// ----------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------

#[test]
fn registration_installs_helper_tables() {
    let debugger = SledDebugger::new(&SledDebuggerConfig::default()).unwrap();
    let plugin = LuaPlugin::new(&LuaPluginConfig::default()).unwrap();
    debugger.add_plugin(plugin.clone()).unwrap();

    let lua = Lua::new();
    plugin.register_state(&debugger, &lua, "main").unwrap();
    assert_eq!(plugin.num_states(), 1);

    let check: bool = lua
        .load(
            r#"
            return type(libsleddebugger) == 'table'
                and type(libsleddebugger.instance) == 'userdata'
                and type(libsleddebugger.version) == 'string'
                and type(libsledluaplugin) == 'table'
                and type(libsledluaplugin.instance) == 'userdata'
                and type(libsledluaplugin.assert) == 'function'
                and type(libsledluaplugin.tty) == 'function'
                and type(libsledluaplugin.errorhandler) == 'function'
                and type(libsledluaplugin.bp_func) == 'function'
                and type(libsledluaplugin.editandcontinue) == 'table'
            "#,
        )
        .eval()
        .unwrap();
    assert!(check);

    assert_eq!(
        plugin.register_state(&debugger, &lua, "again"),
        Err(LuaError::DuplicateLuaState)
    );

    plugin.unregister_state(&debugger, &lua).unwrap();
    assert_eq!(plugin.num_states(), 0);
    let gone: bool = lua
        .load("return libsleddebugger == nil and libsledluaplugin == nil")
        .eval()
        .unwrap();
    assert!(gone);

    assert_eq!(
        plugin.unregister_state(&debugger, &lua),
        Err(LuaError::LuaStateNotFound)
    );
}

#[test]
fn state_registered_to_another_plugin_is_rejected() {
    let debugger = SledDebugger::new(&SledDebuggerConfig::default()).unwrap();
    let first = LuaPlugin::new(&LuaPluginConfig::default()).unwrap();
    debugger.add_plugin(first.clone()).unwrap();

    let lua = Lua::new();
    first.register_state(&debugger, &lua, "main").unwrap();

    let other = LuaPlugin::new(&LuaPluginConfig::default()).unwrap();
    assert_eq!(
        other.register_state(&debugger, &lua, "thief"),
        Err(LuaError::LuaStateAlreadyRegistered)
    );
}

#[test]
fn state_limit_is_enforced() {
    let debugger = SledDebugger::new(&SledDebuggerConfig::default()).unwrap();
    let plugin = LuaPlugin::new(&LuaPluginConfig {
        max_lua_states: 1,
        ..LuaPluginConfig::default()
    })
    .unwrap();
    debugger.add_plugin(plugin.clone()).unwrap();

    let first = Lua::new();
    plugin.register_state(&debugger, &first, "one").unwrap();
    let second = Lua::new();
    assert_eq!(
        plugin.register_state(&debugger, &second, "two"),
        Err(LuaError::OverLuaStateLimit)
    );
}

#[test]
fn required_memory_matches_footprint() {
    let config = LuaPluginConfig {
        max_mem_traces: 16,
        max_num_var_filters: 4,
        max_var_filter_pattern_len: 32,
        max_patterns_per_var_filter: 4,
        max_profile_functions: 32,
        max_edit_and_continues: 4,
        max_edit_and_continue_entry_len: 64,
        ..LuaPluginConfig::default()
    };
    let required = LuaPlugin::required_memory(&config).unwrap();
    assert_eq!(required, LuaPlugin::required_memory(&config).unwrap());
    let plugin = LuaPlugin::new(&config).unwrap();
    assert_eq!(plugin.memory_footprint(), required);
}

// ----------------------------------------------------------------------
// Breakpoints (scenario: conditional hit, variable update, lookup)
// ----------------------------------------------------------------------

#[test]
fn conditional_breakpoint_fires_when_truthy() {
    let (harness, port) = harness(&LuaPluginConfig::default());

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        send_breakpoint_details(&mut stream, "scripts/x.lua", 3, "n > 0", true);
        let (snapshot, line) = drive_breakpoint(
            &mut stream,
            codes::DEBUG_START,
            &[
                FrameSpec::GlobalUpdate {
                    name: "poked",
                    value: "42",
                    value_type: 3,
                },
                FrameSpec::GlobalLookup {
                    name: "inventory",
                    keys: &["gold"],
                },
            ],
        );
        (snapshot, line)
    });

    // Wait for the breakpoint to land before running the script.
    while harness.plugin.num_breakpoints() == 0 {
        std::thread::sleep(Duration::from_millis(2));
    }

    harness
        .lua
        .load("inventory = { gold = 12 }")
        .exec()
        .unwrap();
    harness
        .lua
        .load(
            "local function f()\n    local n = 3\n    local after = n\nend\nf()\n",
        )
        .set_name("@scripts/x.lua")
        .exec()
        .unwrap();

    let (snapshot, line) = ide.join().unwrap();
    assert_eq!(line, 3);

    // The begin phase reported the stopped frame's locals.
    let locals: Vec<(String, String, i16)> = snapshot
        .iter()
        .filter(|f| f.type_code == codes::LOCAL_VAR && f.plugin_id == 1)
        .map(|f| decode_var(&f.payload))
        .collect();
    assert!(
        locals.iter().any(|(name, value, ty)| name == "n" && value == "3" && *ty == 3),
        "local n=3 missing from {locals:?}"
    );

    // And a callstack naming the script.
    let callstack: Vec<String> = snapshot
        .iter()
        .filter(|f| f.type_code == codes::CALL_STACK)
        .map(|f| payload_string(&f.payload).0)
        .collect();
    assert!(callstack.iter().any(|path| path == "scripts/x.lua"));

    // The sync-phase update landed in the interpreter.
    let poked: i64 = harness.lua.load("return poked").eval().unwrap();
    assert_eq!(poked, 42);

    // The sync-phase lookup was answered inside its framing.
    let lookup_frames: Vec<u16> = snapshot
        .iter()
        .filter(|f| {
            matches!(
                f.type_code,
                codes::GLOBAL_VAR_LOOKUP_BEGIN | codes::GLOBAL_VAR | codes::GLOBAL_VAR_LOOKUP_END
            )
        })
        .map(|f| f.type_code)
        .collect();
    let begin_at = lookup_frames
        .iter()
        .position(|&c| c == codes::GLOBAL_VAR_LOOKUP_BEGIN)
        .expect("lookup begin frame");
    assert!(lookup_frames[begin_at..].contains(&codes::GLOBAL_VAR_LOOKUP_END));
    let gold = snapshot
        .iter()
        .filter(|f| f.type_code == codes::GLOBAL_VAR)
        .map(|f| decode_var(&f.payload))
        .find(|(name, _, _)| name == "gold");
    let (_, value, ty) = gold.expect("gold lookup reply");
    assert_eq!((value.as_str(), ty), ("12", 3));
}

#[test]
fn conditional_breakpoint_stays_silent_when_falsy() {
    let (harness, port) = harness(&LuaPluginConfig::default());
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        send_breakpoint_details(&mut stream, "scripts/x.lua", 3, "n > 100", true);
        // No breakpoint exchange should arrive before the script ends.
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        done_rx.recv().unwrap();
        let mut head = [0u8; 8];
        match stream.peek(&mut head) {
            Ok(8) => {
                let type_code = u16::from_ne_bytes(head[4..6].try_into().unwrap());
                panic!("unexpected frame {type_code} for a falsy condition");
            }
            _ => {}
        }
    });

    while harness.plugin.num_breakpoints() == 0 {
        std::thread::sleep(Duration::from_millis(2));
    }

    harness
        .lua
        .load(
            "local function f()\n    local n = 3\n    local after = n\nend\nf()\n",
        )
        .set_name("@scripts/x.lua")
        .exec()
        .unwrap();

    done_tx.send(()).unwrap();
    ide.join().unwrap();
}

// ----------------------------------------------------------------------
// Stepping (scenario: step-over across a call)
// ----------------------------------------------------------------------

#[test]
fn step_over_skips_the_callee_and_stops_on_the_next_line() {
    let (harness, port) = harness(&LuaPluginConfig::default());

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        send_breakpoint_details(&mut stream, "scripts/step.lua", 6, "", true);
        // First stop: the breakpoint on the call line. Resume stepping
        // over, which must skip g entirely.
        let (_, first_line) = drive_breakpoint(&mut stream, codes::DEBUG_STEP_OVER, &[]);
        // Second stop: the line after the call in the same function.
        let (_, second_line) = drive_breakpoint(&mut stream, codes::DEBUG_START, &[]);
        (first_line, second_line)
    });

    while harness.plugin.num_breakpoints() == 0 {
        std::thread::sleep(Duration::from_millis(2));
    }

    harness
        .lua
        .load(
            "local function g()\n    local inside = 1\n    return inside\nend\nlocal function f()\n    g()\n    local after = 2\nend\nf()\n",
        )
        .set_name("@scripts/step.lua")
        .exec()
        .unwrap();

    let (first_line, second_line) = ide.join().unwrap();
    // Breakpoint sits on the `g()` call line; the step lands one line
    // below, never inside g.
    assert_eq!(first_line, 6);
    assert_eq!(second_line, 7);
}

// ----------------------------------------------------------------------
// Memory tracer (scenario: overflow streaming)
// ----------------------------------------------------------------------

#[test]
fn memory_tracer_streams_full_batches() {
    let (harness, port) = harness(&LuaPluginConfig {
        max_mem_traces: 3,
        ..LuaPluginConfig::default()
    });

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        write_simple(&mut stream, codes::MEMORY_TRACE_TOGGLE, 1);
        let mut bursts = Vec::new();
        for _ in 0..2 {
            let mut burst = Vec::new();
            loop {
                let frame = read_frame(&mut stream).unwrap();
                burst.push(frame.type_code);
                if *burst.last().unwrap() == codes::MEMORY_TRACE_STREAM_END {
                    break;
                }
            }
            bursts.push(burst);
        }
        bursts
    });

    while !harness.plugin.is_memory_tracer_running() {
        std::thread::sleep(Duration::from_millis(2));
    }

    for allocation in 0..6usize {
        assert!(harness.plugin.memory_trace_notify(
            &harness.debugger,
            0,
            0x1000 + allocation,
            0,
            64
        ));
    }

    let bursts = ide.join().unwrap();
    let expected = vec![
        codes::MEMORY_TRACE_STREAM_BEGIN,
        codes::MEMORY_TRACE_STREAM,
        codes::MEMORY_TRACE_STREAM,
        codes::MEMORY_TRACE_STREAM,
        codes::MEMORY_TRACE_STREAM_END,
    ];
    assert_eq!(bursts, vec![expected.clone(), expected]);
}

// ----------------------------------------------------------------------
// Edit and continue (scenario: reload on resume)
// ----------------------------------------------------------------------

#[test]
fn edit_and_continue_reloads_on_resume() {
    let opened = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let opened_cb = opened.clone();
    let config = LuaPluginConfig {
        max_edit_and_continues: 4,
        max_edit_and_continue_entry_len: 64,
        edit_and_continue_callback: Some(Arc::new(move |path: &str| {
            opened_cb.lock().unwrap().push(path.to_string());
            if path == "scripts/bad.lua" {
                None
            } else {
                Some("reloaded = true".to_string())
            }
        })),
        ..LuaPluginConfig::default()
    };
    let (harness, port) = harness(&config);

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        send_breakpoint_details(&mut stream, "scripts/x.lua", 2, "", true);

        let begin = loop {
            let frame = read_frame(&mut stream).unwrap();
            if frame.type_code == codes::BREAKPOINT_BEGIN {
                break frame;
            }
        };
        let _ = begin;
        write_simple(&mut stream, codes::BREAKPOINT_BEGIN, 0);
        loop {
            if read_frame(&mut stream).unwrap().type_code == codes::BREAKPOINT_SYNC {
                break;
            }
        }
        // Queue both scripts during the sync window.
        FrameWriter::new(codes::EDIT_AND_CONTINUE, 1)
            .string("scripts/y.lua")
            .send(&mut stream);
        FrameWriter::new(codes::EDIT_AND_CONTINUE, 1)
            .string("scripts/bad.lua")
            .send(&mut stream);
        write_simple(&mut stream, codes::BREAKPOINT_SYNC, 0);
        loop {
            if read_frame(&mut stream).unwrap().type_code == codes::BREAKPOINT_END {
                break;
            }
        }
        write_simple(&mut stream, codes::BREAKPOINT_END, 0);
        write_simple(&mut stream, codes::DEBUG_START, 0);

        // Continue ack, then the TTY traffic from the reloads.
        let mut tty = Vec::new();
        loop {
            let frame = read_frame(&mut stream).unwrap();
            if frame.type_code == codes::TTY {
                tty.push(payload_string(&frame.payload).0);
                if tty.len() >= 2 {
                    break;
                }
            }
            if frame.type_code == codes::BREAKPOINT_CONTINUE {
                continue;
            }
        }
        tty
    });

    while harness.plugin.num_breakpoints() == 0 {
        std::thread::sleep(Duration::from_millis(2));
    }

    harness
        .lua
        .load("local stop_here = 1\nlocal after = stop_here\n")
        .set_name("@scripts/x.lua")
        .exec()
        .unwrap();

    let tty = ide.join().unwrap();
    assert!(tty.iter().any(|line| line.contains("loaded successfully")));
    assert!(tty.iter().any(|line| line.contains("bad.lua")));

    // The good script ran in the stopped state.
    let reloaded: bool = harness.lua.load("return reloaded == true").eval().unwrap();
    assert!(reloaded);

    // Both paths were attempted, in order, and the queue was emptied:
    // a second breakpoint would reload nothing more.
    assert_eq!(
        opened.lock().unwrap().clone(),
        vec!["scripts/y.lua".to_string(), "scripts/bad.lua".to_string()]
    );
}

// ----------------------------------------------------------------------
// Breakpoint toggling, script functions, stepping into, profiler,
// dev commands
// ----------------------------------------------------------------------

#[test]
fn breakpoint_toggle_is_idempotent() {
    use sleddbg_core::SledDebuggerPlugin;

    let debugger = SledDebugger::new(&SledDebuggerConfig::default()).unwrap();
    let plugin = LuaPlugin::new(&LuaPluginConfig::default()).unwrap();
    debugger.add_plugin(plugin.clone()).unwrap();

    let details = FrameWriter::new(codes::BREAKPOINT_DETAILS, 1)
        .string("scripts/x.lua")
        .i32(10)
        .string("n > 0")
        .u8(1)
        .u8(0)
        .bytes();

    assert_eq!(plugin.num_breakpoints(), 0);
    plugin.client_message(&debugger, &details);
    assert_eq!(plugin.num_breakpoints(), 1);
    // The same location again removes it, restoring the pre-state.
    plugin.client_message(&debugger, &details);
    assert_eq!(plugin.num_breakpoints(), 0);

    // Case/slash variants address the same breakpoint.
    plugin.client_message(&debugger, &details);
    let variant = FrameWriter::new(codes::BREAKPOINT_DETAILS, 1)
        .string("SCRIPTS\\X.LUA")
        .i32(10)
        .string("")
        .u8(1)
        .u8(0)
        .bytes();
    plugin.client_message(&debugger, &variant);
    assert_eq!(plugin.num_breakpoints(), 0);
}

#[test]
fn script_assert_breaks_on_the_next_line() {
    let (harness, port) = harness(&LuaPluginConfig::default());
    let (ready_tx, ready_rx) = mpsc::channel::<()>();

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        ready_tx.send(()).unwrap();
        // No breakpoints at all; the stop comes from the script assert.
        let mut tty = Vec::new();
        let begin_line = loop {
            let frame = read_frame(&mut stream).unwrap();
            match frame.type_code {
                codes::TTY => tty.push(payload_string(&frame.payload).0),
                codes::BREAKPOINT_BEGIN => {
                    let rest = &frame.payload[2..];
                    let (_, after_path) = payload_string(rest);
                    break i32::from_ne_bytes(after_path[0..4].try_into().unwrap());
                }
                _ => {}
            }
        };
        write_simple(&mut stream, codes::BREAKPOINT_BEGIN, 0);
        loop {
            if read_frame(&mut stream).unwrap().type_code == codes::BREAKPOINT_SYNC {
                break;
            }
        }
        write_simple(&mut stream, codes::BREAKPOINT_SYNC, 0);
        loop {
            if read_frame(&mut stream).unwrap().type_code == codes::BREAKPOINT_END {
                break;
            }
        }
        write_simple(&mut stream, codes::BREAKPOINT_END, 0);
        write_simple(&mut stream, codes::DEBUG_START, 0);
        loop {
            if read_frame(&mut stream).unwrap().type_code == codes::BREAKPOINT_CONTINUE {
                break;
            }
        }
        (tty, begin_line)
    });

    // Run only after the client finished its half of the handshake, so
    // the TTY frames below cannot be swallowed by the handshake loops.
    ready_rx.recv().unwrap();

    harness
        .lua
        .load("libsledluaplugin.assert(1 == 2, 'values diverged')\nlocal after = 1\n")
        .set_name("@scripts/a.lua")
        .exec()
        .unwrap();

    let (tty, begin_line) = ide.join().unwrap();
    assert!(tty.iter().any(|line| line.contains("values diverged")));
    // The pending assert stops at the next executed line.
    assert_eq!(begin_line, 2);
}

#[test]
fn step_into_descends_into_the_callee() {
    let (harness, port) = harness(&LuaPluginConfig::default());

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        send_breakpoint_details(&mut stream, "scripts/into.lua", 6, "", true);
        let (_, first_line) = drive_breakpoint(&mut stream, 13, &[]); // DebugStepInto
        let (_, second_line) = drive_breakpoint(&mut stream, codes::DEBUG_START, &[]);
        (first_line, second_line)
    });

    while harness.plugin.num_breakpoints() == 0 {
        std::thread::sleep(Duration::from_millis(2));
    }

    harness
        .lua
        .load(
            "local function g()\n    local inside = 1\n    return inside\nend\nlocal function f()\n    g()\n    local after = 2\nend\nf()\n",
        )
        .set_name("@scripts/into.lua")
        .exec()
        .unwrap();

    let (first_line, second_line) = ide.join().unwrap();
    assert_eq!(first_line, 6);
    // Step-into lands on the callee's first executed line.
    assert_eq!(second_line, 2);
}

#[test]
fn profiler_dump_accompanies_the_breakpoint() {
    let (harness, port) = harness(&LuaPluginConfig {
        max_profile_functions: 16,
        max_profile_call_stack_depth: 16,
        ..LuaPluginConfig::default()
    });

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        write_simple(&mut stream, 301, 1); // ProfilerToggle
        send_breakpoint_details(&mut stream, "scripts/prof.lua", 7, "", true);
        let (snapshot, _) = drive_breakpoint(&mut stream, codes::DEBUG_START, &[]);
        snapshot
    });

    while harness.plugin.num_breakpoints() == 0 || !harness.plugin.is_profiler_running() {
        std::thread::sleep(Duration::from_millis(2));
    }

    harness
        .lua
        .load(
            "local function work()\n    local total = 0\n    for i = 1, 100 do total = total + i end\n    return total\nend\nwork()\nlocal stop_here = work()\n",
        )
        .set_name("@scripts/prof.lua")
        .exec()
        .unwrap();

    let snapshot = ide.join().unwrap();
    let profile_names: Vec<String> = snapshot
        .iter()
        .filter(|f| f.type_code == 208) // ProfileInfo
        .map(|f| payload_string(&f.payload).0)
        .collect();
    assert!(
        profile_names.iter().any(|name| name == "work"),
        "profiled functions: {profile_names:?}"
    );
}

#[test]
fn dev_command_executes_in_the_stopped_state() {
    let (harness, port) = harness(&LuaPluginConfig::default());

    let ide = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client_handshake(&mut stream);
        send_breakpoint_details(&mut stream, "scripts/cmd.lua", 2, "", true);
        drive_breakpoint(
            &mut stream,
            codes::DEBUG_START,
            &[FrameSpec::DevCmd {
                command: "devcmd_ran = 7",
            }],
        )
        .1
    });

    while harness.plugin.num_breakpoints() == 0 {
        std::thread::sleep(Duration::from_millis(2));
    }

    harness
        .lua
        .load("local stop_here = 1\nlocal after = stop_here\n")
        .set_name("@scripts/cmd.lua")
        .exec()
        .unwrap();

    assert_eq!(ide.join().unwrap(), 2);
    let ran: i64 = harness.lua.load("return devcmd_ran").eval().unwrap();
    assert_eq!(ran, 7);
}
