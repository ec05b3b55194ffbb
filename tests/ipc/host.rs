use crate::common::{connect, receive, socket_path};
use nix::sys::signal::Signal;
use serial_test::serial;
use std::sync::Arc;
use stopcast::adapter::{AdapterError, DebuggerAdapter, MAX_STACK_BYTES};
use stopcast::host::target::{StopReason, Target, TargetError};
use stopcast::host::ProcessAdapter;
use stopcast::proto::{ClientConfig, ClientKind, Message, RegisterValue, UpdateData};
use stopcast::server::Server;

const SLEEP_APP: &str = "/bin/sleep";
const TRUE_APP: &str = "/bin/true";

#[test]
#[serial]
fn test_target_runs_to_exit() {
    let mut target = Target::spawn(TRUE_APP, &[]).unwrap();
    assert!(target.is_alive());
    assert_eq!(target.program(), TRUE_APP);

    assert!(matches!(
        target.step().unwrap(),
        StopReason::Stopped(Signal::SIGTRAP)
    ));
    assert_eq!(target.cont().unwrap(), StopReason::Exited(0));
    assert!(!target.is_alive());
    assert!(matches!(target.step(), Err(TargetError::NotAlive)));
}

#[test]
#[serial]
fn test_spawn_missing_program() {
    assert!(matches!(
        Target::spawn("/nonexistent/stopcast-debuggee", &[]),
        Err(TargetError::Spawn { .. })
    ));
}

#[test]
#[serial]
fn test_process_adapter() {
    let target = Target::spawn(SLEEP_APP, &["10".to_string()]).unwrap();
    let adapter = ProcessAdapter::new();
    adapter.capture(&target).unwrap();

    assert!(adapter.has_target());
    assert_eq!(adapter.arch().unwrap(), "x86_64");

    let pc = adapter.pc().unwrap();
    let sp = adapter.sp().unwrap();
    let regs = adapter.registers().unwrap();
    assert_eq!(regs.get("rip"), Some(&RegisterValue::Int(pc)));
    assert_eq!(regs.get("rsp"), Some(&RegisterValue::Int(sp)));
    assert_eq!(adapter.register("pc").unwrap(), RegisterValue::Int(pc));
    assert!(matches!(
        adapter.register("xmm0"),
        Err(AdapterError::RegisterNotFound(_))
    ));

    let stack = adapter.stack().unwrap();
    assert!(!stack.is_empty() && stack.len() <= MAX_STACK_BYTES);
    assert_eq!(adapter.memory(sp, 8).unwrap(), stack[..8]);

    let disasm = adapter.disasm().unwrap();
    assert!(disasm.starts_with(&format!("{pc:#018x}: ")));
    assert!(adapter
        .next_instruction()
        .unwrap()
        .starts_with(&format!("{pc:#018x}: ")));
    assert!(adapter.backtrace().unwrap().starts_with("#0 "));

    assert!(adapter.cmd_output("regs").unwrap().contains("rip"));
    let dump = adapter.cmd_output(&format!("x {sp:#x} 16")).unwrap();
    assert_eq!(dump.lines().count(), 1);
    assert!(matches!(
        adapter.cmd_output("frobnicate"),
        Err(AdapterError::UnsupportedCommand(_))
    ));

    adapter.clear_target();
    assert!(!adapter.has_target());
    assert!(matches!(adapter.pc(), Err(AdapterError::NoTarget)));
}

#[test]
#[serial]
fn test_stop_hook_updates_clients() {
    let mut target = Target::spawn(SLEEP_APP, &["10".to_string()]).unwrap();
    let adapter = Arc::new(ProcessAdapter::new());
    let mut server = Server::new(
        socket_path("host"),
        adapter.clone() as Arc<dyn DebuggerAdapter>,
    );
    server.start().unwrap();

    let regs_client = connect(&server, ClientConfig::new(ClientKind::Register));
    let stack_client = connect(&server, ClientConfig::new(ClientKind::Stack));

    // nothing captured yet
    assert_eq!(server.update_clients().delivered, 0);

    assert!(target.step().unwrap().is_alive());
    adapter.capture(&target).unwrap();
    assert_eq!(server.update_clients().delivered, 2);

    let Message::Update { arch, data } = receive(&regs_client) else {
        panic!("update expected");
    };
    assert_eq!(arch.as_deref(), Some("x64"));
    let UpdateData::Registers {
        regs,
        next_instruction,
    } = data
    else {
        panic!("registers expected, got {data:?}");
    };
    assert_eq!(regs.get("rip"), Some(&RegisterValue::Int(adapter.pc().unwrap())));
    assert!(next_instruction.is_some());

    let Message::Update { data, .. } = receive(&stack_client) else {
        panic!("update expected");
    };
    let UpdateData::Stack { sp, .. } = data else {
        panic!("stack expected, got {data:?}");
    };
    assert_eq!(sp, adapter.sp().unwrap());

    server.stop().unwrap();
}
