use crate::common::{
    connect, is_silent, receive, registered, socket_path, start_server, wait_for, FixedAdapter,
    FIXED_PC, FIXED_SP, STACK_LEN,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stopcast::proto::codec;
use stopcast::adapter::DebuggerAdapter;
use stopcast::proto::{
    ClientConfig, ClientKind, Message, Query, QueryValue, RegisterValue, Response, UpdateData,
    UpdateOn,
};
use stopcast::server::dispatch::DispatchStats;
use stopcast::server::{Server, ServerError};
use stopcast::transport::Connection;

#[test]
fn test_start_stop() {
    let path = socket_path("start-stop");
    std::fs::write(&path, b"stale").unwrap();

    let mut server = Server::new(&path, FixedAdapter::new() as Arc<dyn DebuggerAdapter>);
    assert!(matches!(server.stop(), Err(ServerError::NotRunning)));

    server.start().unwrap();
    assert!(server.is_running());
    assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));

    let conn = connect(&server, ClientConfig::new(ClientKind::Stack));
    server.stop().unwrap();
    assert!(!server.is_running());
    assert!(!path.exists());
    assert!(server.clients().is_empty());
    assert!(conn.receive().is_err());

    // restart on the same path
    server.start().unwrap();
    connect(&server, ClientConfig::new(ClientKind::Stack));
    assert_eq!(registered(&server), 1);
}

#[test]
fn test_bind_failure() {
    let path = std::env::temp_dir()
        .join("stopcast-missing-dir")
        .join("server.sock");
    let mut server = Server::new(path, FixedAdapter::new() as Arc<dyn DebuggerAdapter>);
    assert!(matches!(server.start(), Err(ServerError::Bind { .. })));
    assert!(!server.is_running());
}

#[test]
fn test_registration_round_trip() {
    let (server, _adapter) = start_server("register");

    let configs = [
        ClientConfig::new(ClientKind::Register),
        ClientConfig::new(ClientKind::Backtrace).with_update_on(UpdateOn::Manual),
        ClientConfig::command("regs"),
        ClientConfig::new(ClientKind::Interactive),
    ];
    let _conns: Vec<Connection> = configs
        .iter()
        .map(|config| connect(&server, config.clone()))
        .collect();

    let stored: Vec<ClientConfig> = server
        .clients()
        .into_iter()
        .filter_map(|(_, config)| config)
        .collect();
    assert_eq!(stored, configs);

    let summary = server.client_summary();
    assert_eq!(summary.len(), 4);
    assert!(summary[2].contains("cmd `regs`"));
}

#[test]
fn test_second_register_ignored() {
    let (server, _adapter) = start_server("register-twice");
    let conn = connect(&server, ClientConfig::new(ClientKind::Stack));

    conn.send(&Message::Register {
        config: ClientConfig::new(ClientKind::Disasm),
    })
    .unwrap();
    // a query after the second register proves it was processed
    conn.send(&Message::Interactive(Query::GetRegister {
        register: "eax".to_string(),
    }))
    .unwrap();
    assert!(matches!(receive(&conn), Message::Response(_)));

    let clients = server.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].1, Some(ClientConfig::new(ClientKind::Stack)));
}

#[test]
fn test_fan_out_by_kind() {
    let (server, _adapter) = start_server("fan-out");

    let stack_clients: Vec<Connection> = (0..3)
        .map(|_| connect(&server, ClientConfig::new(ClientKind::Stack)))
        .collect();
    let disasm = connect(&server, ClientConfig::new(ClientKind::Disasm));
    let manual = connect(
        &server,
        ClientConfig::new(ClientKind::Stack).with_update_on(UpdateOn::Manual),
    );

    let stats = server.update_clients();
    assert_eq!(
        stats,
        DispatchStats {
            delivered: 4,
            skipped: 0,
            purged: 0,
        }
    );

    for conn in &stack_clients {
        let Message::Update { arch, data } = receive(conn) else {
            panic!("update expected");
        };
        assert_eq!(arch.as_deref(), Some("x86"));
        assert!(matches!(data, UpdateData::Stack { sp: FIXED_SP, .. }));
        assert!(is_silent(conn));
    }

    let Message::Update { data, .. } = receive(&disasm) else {
        panic!("update expected");
    };
    assert!(matches!(data, UpdateData::Disasm { .. }));
    assert!(is_silent(&manual));
}

#[test]
fn test_payload_per_kind() {
    let (server, _adapter) = start_server("payloads");

    let bt = connect(&server, ClientConfig::new(ClientKind::Backtrace));
    let cmd = connect(&server, ClientConfig::command("info frame"));
    let interactive = connect(&server, ClientConfig::new(ClientKind::Interactive));
    let view = connect(&server, ClientConfig::new(ClientKind::View));

    server.update_clients();

    assert_eq!(
        receive(&bt),
        Message::Update {
            arch: Some("x86".to_string()),
            data: UpdateData::Backtrace {
                backtrace: "#0 0x401000 in main".to_string(),
            },
        }
    );
    assert_eq!(
        receive(&cmd),
        Message::Update {
            arch: Some("x86".to_string()),
            data: UpdateData::Command {
                output: "output of info frame".to_string(),
            },
        }
    );
    assert_eq!(
        receive(&interactive),
        Message::Update {
            arch: Some("x86".to_string()),
            data: UpdateData::Stopped { pc: FIXED_PC },
        }
    );
    assert!(is_silent(&view));
}

#[test]
fn test_disconnected_client_purged() {
    let (server, _adapter) = start_server("purge");

    let first = connect(&server, ClientConfig::new(ClientKind::Register));
    let gone = connect(&server, ClientConfig::new(ClientKind::Register));
    let last = connect(&server, ClientConfig::new(ClientKind::Register));
    let gone_id = server.clients()[1].0;

    gone.close();
    drop(gone);
    let stats = server.update_clients();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.skipped, 0);

    assert!(matches!(receive(&first), Message::Update { .. }));
    assert!(matches!(receive(&last), Message::Update { .. }));

    // either the event loop or the failed send removes it
    wait_for("purge", || server.clients().len() == 2);
    assert!(server.clients().iter().all(|(id, _)| *id != gone_id));
    assert!(server
        .client_summary()
        .iter()
        .all(|line| !line.starts_with(&gone_id.to_string())));
}

#[test]
fn test_adapter_error_isolated() {
    let (server, adapter) = start_server("adapter-error");
    adapter.break_disasm();

    let disasm = connect(&server, ClientConfig::new(ClientKind::Disasm));
    let stack = connect(&server, ClientConfig::new(ClientKind::Stack));

    let stats = server.update_clients();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.delivered, 1);
    assert!(matches!(receive(&stack), Message::Update { .. }));
    assert!(is_silent(&disasm));
    assert_eq!(server.clients().len(), 2);
}

#[test]
fn test_push_update_relay() {
    let (server, _adapter) = start_server("push");

    let watchers: Vec<Connection> = (0..2)
        .map(|_| {
            connect(
                &server,
                ClientConfig::new(ClientKind::Register).with_update_on(UpdateOn::Manual),
            )
        })
        .collect();
    let other = connect(&server, ClientConfig::new(ClientKind::Stack));
    let proxy = connect(&server, ClientConfig::new(ClientKind::Register));

    let data = UpdateData::Registers {
        regs: BTreeMap::from([("r0".to_string(), RegisterValue::Int(7))]),
        next_instruction: None,
    };
    let push = Message::PushUpdate {
        update_type: ClientKind::Register,
        data: serde_json::to_value(&data).unwrap(),
    };

    for _ in 0..2 {
        proxy.send(&push).unwrap();
        assert_eq!(receive(&proxy), Message::Ack);
        for conn in &watchers {
            assert_eq!(
                receive(conn),
                Message::Update {
                    arch: None,
                    data: data.clone(),
                }
            );
        }
    }

    assert!(is_silent(&proxy));
    assert!(is_silent(&other));
}

#[test]
fn test_push_passes_unknown_payload() {
    let (server, _adapter) = start_server("push-raw");
    let view = connect(
        &server,
        ClientConfig::new(ClientKind::View).with_update_on(UpdateOn::Manual),
    );
    let proxy = connect(&server, ClientConfig::new(ClientKind::Interactive));

    let payload = br#"{"msg_type":"push_update","update_type":"view","data":{"lines":["a","b"],"cursor":1}}"#;
    proxy.send_frame(payload).unwrap();
    assert_eq!(receive(&proxy), Message::Ack);

    let Message::Update { arch: None, data } = receive(&view) else {
        panic!("update expected");
    };
    assert_eq!(
        data,
        UpdateData::Raw(serde_json::json!({"lines": ["a", "b"], "cursor": 1}))
    );
}

#[test]
fn test_push_relays_payload_verbatim() {
    let (server, _adapter) = start_server("push-verbatim");
    let watcher = connect(
        &server,
        ClientConfig::new(ClientKind::Register).with_update_on(UpdateOn::Manual),
    );
    let proxy = connect(&server, ClientConfig::new(ClientKind::View));

    // a register-like payload with a field this crate doesn't know and without `next_instruction`
    let payload =
        br#"{"msg_type":"push_update","update_type":"register","data":{"regs":{"eax":1},"instr":"nop"}}"#;
    proxy.send_frame(payload).unwrap();
    assert_eq!(receive(&proxy), Message::Ack);

    let update: Value = serde_json::from_slice(&watcher.receive().unwrap()).unwrap();
    assert_eq!(update["msg_type"], "update");
    assert!(update["arch"].is_null());
    assert_eq!(update["data"], json!({"regs": {"eax": 1}, "instr": "nop"}));
    assert_eq!(
        serde_json::to_string(&update["data"]).unwrap(),
        r#"{"regs":{"eax":1},"instr":"nop"}"#
    );
}

#[test]
fn test_stalled_client_does_not_block_others() {
    let (mut server, _adapter) = start_server("stalled");

    // frame header promising 10 bytes, the body never comes
    let mut stalled = UnixStream::connect(server.socket_path()).unwrap();
    stalled.write_all(&10u32.to_be_bytes()).unwrap();
    wait_for("accept", || server.clients().len() == 1);

    let conn = connect(&server, ClientConfig::new(ClientKind::Stack));
    wait_for("stalled client dropped", || server.clients().len() == 1);
    assert_eq!(server.clients()[0].1, Some(ClientConfig::new(ClientKind::Stack)));

    assert_eq!(server.update_clients().delivered, 1);
    assert!(matches!(receive(&conn), Message::Update { .. }));

    // the server closed the stalled connection
    stalled
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(stalled.read(&mut [0u8; 1]).unwrap(), 0);

    let started = Instant::now();
    server.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_concurrent_update_and_relay_keep_frames_whole() {
    const ROUNDS: usize = 200;

    let (server, _adapter) = start_server("send-lock");
    let target = connect(&server, ClientConfig::new(ClientKind::Register));
    let proxy = connect(
        &server,
        ClientConfig::new(ClientKind::View).with_update_on(UpdateOn::Manual),
    );

    let relayed = json!({"regs": {"r0": 7}, "padding": "x".repeat(4096)});
    let push = Message::PushUpdate {
        update_type: ClientKind::Register,
        data: relayed.clone(),
    };

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..ROUNDS {
                assert_eq!(server.update_clients().delivered, 1);
            }
        });
        s.spawn(|| {
            for _ in 0..ROUNDS {
                proxy.send(&push).unwrap();
                assert_eq!(receive(&proxy), Message::Ack);
            }
        });

        let (mut stops, mut relays) = (0, 0);
        for _ in 0..ROUNDS * 2 {
            let body = target.receive().unwrap();
            let message = codec::decode(&body).unwrap();
            let Message::Update { arch, data } = message else {
                panic!("update expected, got {message:?}");
            };
            match arch {
                Some(_) => {
                    assert!(matches!(data, UpdateData::Registers { .. }));
                    stops += 1;
                }
                None => {
                    let raw: Value = serde_json::from_slice(&body).unwrap();
                    assert_eq!(raw["data"], relayed);
                    relays += 1;
                }
            }
        }
        assert_eq!((stops, relays), (ROUNDS, ROUNDS));
    });
    assert!(is_silent(&target));
}

#[test]
fn test_interactive_queries() {
    let (server, _adapter) = start_server("interactive");
    let conn = connect(&server, ClientConfig::new(ClientKind::Interactive));

    let ask = |query: Query| {
        conn.send(&Message::Interactive(query)).unwrap();
        match receive(&conn) {
            Message::Response(Response { value }) => value,
            other => panic!("response expected, got {other:?}"),
        }
    };

    let eax = Query::GetRegister {
        register: "eax".to_string(),
    };
    assert_eq!(
        ask(eax.clone()),
        Some(QueryValue::Register(RegisterValue::Int(1)))
    );
    assert_eq!(ask(eax), Some(QueryValue::Register(RegisterValue::Int(1))));

    let unknown = Query::GetRegister {
        register: "xyz".to_string(),
    };
    assert_eq!(ask(unknown.clone()), None);
    assert_eq!(ask(unknown), None);

    assert_eq!(
        ask(Query::GetMemory {
            start: 0x10,
            end: 0x14,
        }),
        Some(QueryValue::Memory(vec![0x10, 0x11, 0x12, 0x13]))
    );
    assert_eq!(ask(Query::GetMemory { start: 0x20, end: 0x10 }), None);
    assert_eq!(
        ask(Query::GetMemory {
            start: 0,
            end: u64::MAX,
        }),
        None
    );
}

#[test]
fn test_query_without_target() {
    let (server, adapter) = start_server("interactive-no-target");
    adapter.set_target(false);
    let conn = connect(&server, ClientConfig::new(ClientKind::Interactive));

    conn.send(&Message::Interactive(Query::GetRegister {
        register: "eax".to_string(),
    }))
    .unwrap();
    assert_eq!(receive(&conn), Message::Response(Response { value: None }));
}

#[test]
fn test_no_target_no_op() {
    let (server, adapter) = start_server("no-target");
    let conn = connect(&server, ClientConfig::new(ClientKind::Register));

    adapter.set_target(false);
    assert_eq!(server.update_clients(), DispatchStats::default());
    assert!(is_silent(&conn));

    adapter.set_target(true);
    assert_eq!(server.update_clients().delivered, 1);
    assert!(matches!(receive(&conn), Message::Update { .. }));
}

#[test]
fn test_arch_refreshed_once_per_dispatch() {
    let (server, adapter) = start_server("arch");
    let _conns: Vec<Connection> = (0..3)
        .map(|_| connect(&server, ClientConfig::new(ClientKind::Stack)))
        .collect();

    let before = adapter.arch_calls.load(Ordering::SeqCst);
    server.update_clients();
    assert_eq!(adapter.arch_calls.load(Ordering::SeqCst), before + 1);
}

#[test]
fn test_malformed_message_survivability() {
    let (server, _adapter) = start_server("malformed");
    let stack = connect(&server, ClientConfig::new(ClientKind::Stack));

    stack.send_frame(b"\x80\x04garbage").unwrap();
    stack.send_frame(br#"{"msg_type":"teleport"}"#).unwrap();

    // the same connection keeps working
    stack
        .send(&Message::Interactive(Query::GetRegister {
            register: "ebx".to_string(),
        }))
        .unwrap();
    assert_eq!(
        receive(&stack),
        Message::Response(Response {
            value: Some(QueryValue::Register(RegisterValue::Int(2))),
        })
    );

    // and so do new ones
    let late = connect(&server, ClientConfig::new(ClientKind::Register));
    server.update_clients();
    assert!(matches!(receive(&stack), Message::Update { .. }));
    assert!(matches!(receive(&late), Message::Update { .. }));
}

#[test]
fn test_unregistered_client_gets_nothing() {
    let (server, _adapter) = start_server("unregistered");
    let silent = Connection::connect(server.socket_path()).unwrap();
    wait_for("accept", || server.clients().len() == 1);
    assert_eq!(server.clients()[0].1, None);

    assert_eq!(server.update_clients().delivered, 0);
    assert!(is_silent(&silent));
}

#[test]
fn test_scenario_register_and_stack_clients() {
    let (server, _adapter) = start_server("scenario");
    let a = connect(&server, ClientConfig::new(ClientKind::Register));
    let b = connect(&server, ClientConfig::new(ClientKind::Stack));

    server.update_clients();

    let Message::Update { data, .. } = receive(&a) else {
        panic!("update expected");
    };
    let UpdateData::Registers { regs, .. } = data else {
        panic!("registers expected, got {data:?}");
    };
    assert_eq!(
        regs,
        BTreeMap::from([
            ("eax".to_string(), RegisterValue::Int(1)),
            ("ebx".to_string(), RegisterValue::Int(2)),
        ])
    );

    let Message::Update { data, .. } = receive(&b) else {
        panic!("update expected");
    };
    let UpdateData::Stack { data, sp } = data else {
        panic!("stack expected, got {data:?}");
    };
    assert_eq!(sp, 0x1000);
    assert_eq!(data.len(), STACK_LEN);

    assert!(is_silent(&a));
    assert!(is_silent(&b));
}
