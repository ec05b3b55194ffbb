use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stopcast::adapter::{AdapterError, DebuggerAdapter, RegisterSet};
use stopcast::proto::codec;
use stopcast::proto::{ClientConfig, Message, RegisterValue};
use stopcast::server::Server;
use stopcast::transport::Connection;

pub const FIXED_SP: u64 = 0x1000;
pub const FIXED_PC: u64 = 0x401000;
pub const STACK_LEN: usize = 64;

/// Adapter over a fictional stopped x86 debuggee.
pub struct FixedAdapter {
    target: AtomicBool,
    /// Makes `disasm` fail, to check per-client isolation.
    broken_disasm: AtomicBool,
    /// Number of `arch` calls.
    pub arch_calls: AtomicUsize,
}

impl FixedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            target: AtomicBool::new(true),
            broken_disasm: AtomicBool::new(false),
            arch_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_target(&self, target: bool) {
        self.target.store(target, Ordering::SeqCst)
    }

    pub fn break_disasm(&self) {
        self.broken_disasm.store(true, Ordering::SeqCst)
    }

    fn ensure_target(&self) -> Result<(), AdapterError> {
        if self.target.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::NoTarget)
        }
    }
}

impl DebuggerAdapter for FixedAdapter {
    fn has_target(&self) -> bool {
        self.target.load(Ordering::SeqCst)
    }

    fn arch(&self) -> Result<String, AdapterError> {
        self.arch_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_target()?;
        Ok("x86".to_string())
    }

    fn registers(&self) -> Result<RegisterSet, AdapterError> {
        self.ensure_target()?;
        Ok(BTreeMap::from([
            ("eax".to_string(), RegisterValue::Int(1)),
            ("ebx".to_string(), RegisterValue::Int(2)),
        ]))
    }

    fn register(&self, name: &str) -> Result<RegisterValue, AdapterError> {
        self.registers()?
            .remove(name)
            .ok_or_else(|| AdapterError::RegisterNotFound(name.to_string()))
    }

    fn pc(&self) -> Result<u64, AdapterError> {
        self.ensure_target()?;
        Ok(FIXED_PC)
    }

    fn sp(&self) -> Result<u64, AdapterError> {
        self.ensure_target()?;
        Ok(FIXED_SP)
    }

    fn next_instruction(&self) -> Result<String, AdapterError> {
        self.ensure_target()?;
        Ok("0x401000: nop".to_string())
    }

    fn disasm(&self) -> Result<String, AdapterError> {
        self.ensure_target()?;
        if self.broken_disasm.load(Ordering::SeqCst) {
            return Err(AdapterError::Disasm("broken".to_string()));
        }
        Ok("0x401000: nop\n0x401001: ret".to_string())
    }

    fn stack(&self) -> Result<Vec<u8>, AdapterError> {
        self.ensure_target()?;
        Ok(vec![0; STACK_LEN])
    }

    /// Every byte is the low byte of its own address.
    fn memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, AdapterError> {
        self.ensure_target()?;
        Ok((0..len as u64).map(|i| addr.wrapping_add(i) as u8).collect())
    }

    fn backtrace(&self) -> Result<String, AdapterError> {
        self.ensure_target()?;
        Ok("#0 0x401000 in main".to_string())
    }

    fn cmd_output(&self, command: &str) -> Result<String, AdapterError> {
        self.ensure_target()?;
        Ok(format!("output of {command}"))
    }
}

pub fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("stopcast-it-{name}-{}.sock", std::process::id()))
}

/// Started server over a [`FixedAdapter`].
pub fn start_server(name: &str) -> (Server, Arc<FixedAdapter>) {
    let adapter = FixedAdapter::new();
    let mut server = Server::new(socket_path(name), adapter.clone() as Arc<dyn DebuggerAdapter>);
    server.start().unwrap();
    (server, adapter)
}

/// Poll `cond` until it holds, fail the test after a few seconds.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn registered(server: &Server) -> usize {
    server
        .clients()
        .iter()
        .filter(|(_, config)| config.is_some())
        .count()
}

/// Raw client: connect, register and wait until the server has the registration.
pub fn connect(server: &Server, config: ClientConfig) -> Connection {
    let before = registered(server);
    let conn = Connection::connect(server.socket_path()).unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    conn.send(&Message::Register { config }).unwrap();
    wait_for("registration", || registered(server) > before);
    conn
}

pub fn receive(conn: &Connection) -> Message {
    codec::decode(&conn.receive().unwrap()).unwrap()
}

/// True if nothing arrives on `conn` for a short while.
pub fn is_silent(conn: &Connection) -> bool {
    conn.set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let silent = matches!(conn.receive(), Err(e) if e.is_timeout());
    conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    silent
}
