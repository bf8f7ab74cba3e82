mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use lidr_net::protocol::{
    heartbeat_frame, heartbeat_kind, probe_frame_length, Heartbeat, FIXED_HEADER_LEN,
};
use lidr_net::{
    Connection, ConnectionConfig, EngineConfig, ErrorCode, FrameLength, ListenerConfig, Method,
    NetCallback, NetEngine, NetEvent, NetResult, ProtocolHeader,
};
use parking_lot::Mutex;
use rstest::rstest;

fn connection_to(addr: std::net::SocketAddr) -> ConnectionConfig {
    ConnectionConfig {
        connection_name: "outbound".to_string(),
        connection_remote_ip: addr.ip().to_string(),
        connection_remote_port: addr.port(),
        ..Default::default()
    }
}

/// Engine serving `server` on a loopback listener plus a connection to it served by
/// `client`, already established.
fn loopback(
    name: &str,
    server: Arc<dyn NetCallback>,
    client: Arc<dyn NetCallback>,
) -> (NetEngine, Connection) {
    let engine = NetEngine::new(engine_config(name), server).unwrap();
    engine.start().unwrap();
    let listener = engine.create_listener(&local_listener(name), None).unwrap();
    let addr = engine.listener_addr(listener).unwrap();
    let handle = engine
        .create_connection(&connection_to(addr), Some(client))
        .unwrap();
    let conn = engine.connection(handle).unwrap();
    assert!(wait_until(WAIT, || conn.is_connected()));
    (engine, conn)
}

#[rstest]
#[case(vec![100])]
#[case(vec![10, 40, 50])]
#[case(vec![1, 3, 12, 84])]
#[case(vec![16, 84])]
#[case(vec![99, 1])]
fn test_frame_delivered_once_whatever_the_split(#[case] chunks: Vec<usize>) {
    let server = Recorder::silent();
    let (engine, addr) = serve("split", engine_config("split"), server.clone());
    let request = frame(Method::ReadDir, 0, &[0xAB; 84]);
    assert_eq!(request.len(), 100);

    let mut client = connect(addr);
    let mut offset = 0;
    for chunk in chunks {
        write_all(&mut client, &request[offset..offset + chunk]);
        offset += chunk;
        thread::sleep(Duration::from_millis(20));
    }
    assert!(wait_until(WAIT, || server.frames().len() == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server.frames(), vec![request]);
    engine.stop().unwrap();
}

#[test]
fn test_back_to_back_frames_keep_order() {
    let server = Recorder::silent();
    let (engine, addr) = serve("batch", engine_config("batch"), server.clone());
    let frames: Vec<Vec<u8>> = (0..3u8)
        .map(|i| frame(Method::CreateFile, 0, &vec![i; 10 + i as usize]))
        .collect();
    let mut client = connect(addr);
    write_all(&mut client, &frames.concat());
    assert!(wait_until(WAIT, || server.frames().len() == 3));
    assert_eq!(server.frames(), frames);
    assert_eq!(engine.stats().frames_received, 3);
    engine.stop().unwrap();
}

/// Frame whose header length is below the fixed header.
fn short_header_frame() -> Vec<u8> {
    let mut bad = frame(Method::Login, 0, b"body");
    bad[8] = 4;
    bad
}

#[rstest]
#[case(b"XXXXXXXXXXXXXXXXXXXX".to_vec())]
#[case(short_header_frame())]
fn test_corrupt_stream_closes_with_violation(#[case] garbage: Vec<u8>) {
    let server = Recorder::silent();
    let (engine, addr) = serve("garbage", engine_config("garbage"), server.clone());
    let mut client = connect(addr);
    write_all(&mut client, &garbage);

    assert!(wait_until(WAIT, || server.disconnected() == 1));
    assert_eq!(
        server.lifecycle(),
        vec!["connected", "event:protocol violation", "disconnected"]
    );
    assert!(server.frames().is_empty());
    assert!(peer_closed(&mut client));
    assert_eq!(engine.stats().protocol_violations, 1);
    engine.stop().unwrap();
}

#[test]
fn test_handler_error_closes_connection() {
    let server = Arc::new(Recorder {
        reject: Some(b"bad".to_vec()),
        echo: true,
        ..Default::default()
    });
    let (engine, addr) = serve("reject", engine_config("reject"), server.clone());
    let mut client = connect(addr);
    let good = frame(Method::ReadDir, 0, b"good");
    write_all(&mut client, &good);
    assert_eq!(read_exact(&mut client, good.len()), good);

    write_all(&mut client, &frame(Method::ReadDir, 0, b"bad"));
    assert!(wait_until(WAIT, || server.disconnected() == 1));
    let lifecycle = server.lifecycle();
    assert_eq!(lifecycle.len(), 3, "{:?}", lifecycle);
    assert!(lifecycle[1].starts_with("event:handler failed"));
    assert!(peer_closed(&mut client));
    engine.stop().unwrap();
}

#[test]
fn test_ping_is_answered_with_pong() {
    let server = Recorder::silent();
    let (engine, addr) = serve("pong", engine_config("pong"), server.clone());
    let mut client = connect(addr);
    write_all(&mut client, &heartbeat_frame(false));
    let reply = read_exact(&mut client, FIXED_HEADER_LEN);
    assert_eq!(heartbeat_kind(&reply), Some(Heartbeat::Pong));
    assert!(server.frames().is_empty());
    engine.stop().unwrap();
}

#[test]
fn test_silent_peer_is_pinged_then_expired() {
    let config = EngineConfig {
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 300,
        ..engine_config("expire")
    };
    let server = Recorder::silent();
    let (engine, addr) = serve("expire", config, server.clone());
    let mut client = connect(addr);

    let ping = read_exact(&mut client, FIXED_HEADER_LEN);
    assert_eq!(heartbeat_kind(&ping), Some(Heartbeat::Ping));

    assert!(wait_until(WAIT, || server.disconnected() == 1));
    assert_eq!(
        server.lifecycle(),
        vec!["connected", "event:heartbeat timeout", "disconnected"]
    );
    assert!(peer_closed(&mut client));
    assert_eq!(engine.stats().heartbeat_timeouts, 1);
    engine.stop().unwrap();
}

#[test]
fn test_active_peer_is_kept_alive() {
    let config = EngineConfig {
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 300,
        ..engine_config("alive")
    };
    let server = Recorder::silent();
    let (engine, addr) = serve("alive", config, server.clone());
    let mut client = connect(addr);
    for _ in 0..12 {
        write_all(&mut client, &heartbeat_frame(false));
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(server.disconnected(), 0);
    assert_eq!(server.lifecycle(), vec!["connected"]);
    engine.stop().unwrap();
}

#[test]
fn test_listener_heartbeat_override() {
    let server = Recorder::silent();
    let engine = NetEngine::new(
        EngineConfig {
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 0,
            ..engine_config("override")
        },
        server.clone(),
    )
    .unwrap();
    engine.start().unwrap();
    let listener = engine
        .create_listener(
            &ListenerConfig {
                heartbeat_timeout_ms: Some(200),
                ..local_listener("override")
            },
            None,
        )
        .unwrap();
    let _client = connect(engine.listener_addr(listener).unwrap());
    assert!(wait_until(WAIT, || server.disconnected() == 1));
    assert_eq!(server.lifecycle()[1], "event:heartbeat timeout");
    engine.stop().unwrap();
}

#[test]
fn test_call_round_trip() {
    let client = Recorder::silent();
    let (engine, conn) = loopback("call", Recorder::echo(), client.clone());

    let response = conn
        .call_bytes(&frame(Method::GetFileInfo, 0, b"ping"), None)
        .unwrap();
    let header = ProtocolHeader::parse(&response).unwrap();
    assert_ne!(header.sequence, 0);
    assert_eq!(header.method_kind(), Some(Method::GetFileInfo));
    assert_eq!(&response[FIXED_HEADER_LEN..], b"ping");

    // responses never reach on_message
    assert!(client.frames().is_empty());
    let stats = engine.stats();
    assert_eq!(stats.calls_completed, 1);
    assert_eq!(stats.pending_calls, 0);
    engine.stop().unwrap();
}

#[test]
fn test_concurrent_calls_get_their_own_response() {
    let (engine, conn) = loopback("calls", Recorder::echo(), Recorder::silent());
    let callers: Vec<_> = (0..4u8)
        .map(|caller| {
            let conn = conn.clone();
            thread::spawn(move || {
                for round in 0..10u8 {
                    let payload = [caller, round, caller ^ round];
                    let response = conn
                        .call_bytes(&frame(Method::QueryShareTo, 0, &payload), None)
                        .unwrap();
                    assert_eq!(&response[FIXED_HEADER_LEN..], &payload);
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }
    assert_eq!(engine.stats().calls_completed, 40);
    engine.stop().unwrap();
}

#[test]
fn test_call_times_out_without_response() {
    let (engine, conn) = loopback("timeout", Recorder::silent(), Recorder::silent());
    let err = conn
        .call_bytes(
            &frame(Method::OpenFile, 0, b"nobody answers"),
            Some(Duration::from_millis(100)),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert_eq!(engine.stats().pending_calls, 0);
    assert!(conn.is_connected());
    engine.stop().unwrap();
}

#[test]
fn test_call_fails_when_connection_closes() {
    let server = Arc::new(Recorder {
        reject: Some(b"bad".to_vec()),
        ..Default::default()
    });
    let client = Recorder::silent();
    let (engine, conn) = loopback("closed", server, client.clone());
    let err = conn
        .call_bytes(
            &frame(Method::DeleteZone, 0, b"bad"),
            Some(Duration::from_secs(5)),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionClosed);
    assert!(wait_until(WAIT, || client.disconnected() == 1));
    assert_eq!(
        conn.send(b"late").unwrap_err().code(),
        ErrorCode::ConnectionClosed
    );
    engine.stop().unwrap();
}

/// Tries a blocking call from inside `on_message`.
#[derive(Default)]
struct Reentrant {
    outcome: Mutex<Option<ErrorCode>>,
}

impl NetCallback for Reentrant {
    fn on_message(&self, conn: &Connection, frame: &[u8]) -> NetResult<()> {
        let code = match conn.call_bytes(frame, Some(Duration::from_millis(10))) {
            Ok(_) => ErrorCode::Success,
            Err(err) => err.code(),
        };
        *self.outcome.lock() = Some(code);
        Ok(())
    }
}

#[test]
fn test_call_from_io_thread_is_rejected() {
    let server = Arc::new(Reentrant::default());
    let engine = NetEngine::new(engine_config("reentrant"), server.clone()).unwrap();
    engine.start().unwrap();
    let listener = engine
        .create_listener(&local_listener("reentrant"), None)
        .unwrap();
    let mut client = connect(engine.listener_addr(listener).unwrap());
    write_all(&mut client, &frame(Method::Login, 0, b""));
    assert!(wait_until(WAIT, || server.outcome.lock().is_some()));
    assert_eq!(*server.outcome.lock(), Some(ErrorCode::InvalidCall));
    engine.stop().unwrap();
}

#[test]
fn test_large_frame_survives_partial_writes() {
    let server = Recorder::echo();
    let engine = NetEngine::new(engine_config("large"), server.clone()).unwrap();
    engine.start().unwrap();
    let listener = engine
        .create_listener(
            &ListenerConfig {
                socket_buffer_bytes: Some(8 * 1024),
                ..local_listener("large")
            },
            None,
        )
        .unwrap();
    let mut client = connect(engine.listener_addr(listener).unwrap());
    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let request = frame(Method::CreateFile, 0, &payload);

    let writer = {
        let mut client = client.try_clone().unwrap();
        let request = request.clone();
        thread::spawn(move || write_all(&mut client, &request))
    };
    let echoed = read_exact(&mut client, request.len());
    writer.join().unwrap();
    assert!(echoed == request);
    assert!(wait_until(WAIT, || engine.stats().memory_in_use == 0));
    engine.stop().unwrap();
}

#[test]
fn test_sends_queued_while_connecting_are_delivered() {
    let server = Recorder::echo();
    let engine = NetEngine::new(engine_config("early"), server.clone()).unwrap();
    engine.start().unwrap();
    let listener = engine.create_listener(&local_listener("early"), None).unwrap();
    let addr = engine.listener_addr(listener).unwrap();

    let client = Recorder::silent();
    let handle = engine
        .create_connection(&connection_to(addr), Some(client.clone() as Arc<dyn NetCallback>))
        .unwrap();
    let conn = engine.connection(handle).unwrap();
    let mut message = conn.new_message(FIXED_HEADER_LEN as u32 + 5).unwrap();
    message.copy_from_slice(&frame(Method::CreateZone, 0, b"early"));
    conn.send_message(message).unwrap();

    assert!(wait_until(WAIT, || client.frames().len() == 1));
    assert_eq!(&client.frames()[0][FIXED_HEADER_LEN..], b"early");
    assert_eq!(conn.remote_addr(), Some(addr));
    assert!(!conn.is_inbound());
    engine.stop().unwrap();
}

/// Header-only frame announcing `total_length` bytes.
fn announcing(total_length: u32) -> Vec<u8> {
    let mut header = frame(Method::Login, 0, b"");
    header[4..8].copy_from_slice(&total_length.to_be_bytes());
    header
}

/// Virtual size of this process, where the platform reports it.
fn virtual_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmSize:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[test]
fn test_announced_length_is_not_preallocated() {
    let server = Recorder::silent();
    let (engine, addr) = serve("announce", engine_config("announce"), server.clone());
    let before = virtual_memory_kb();

    let mut clients: Vec<_> = (0..4).map(|_| connect(addr)).collect();
    for client in clients.iter_mut() {
        write_all(client, &announcing(u32::MAX - 1));
    }
    assert!(wait_until(WAIT, || engine.stats().bytes_received == 64));
    thread::sleep(Duration::from_millis(50));

    if let (Some(before), Some(after)) = (before, virtual_memory_kb()) {
        // each announcement alone would be close to 4 GiB
        let grown_kb = after.saturating_sub(before);
        assert!(grown_kb < 4 * 1024 * 1024, "grew by {} kB", grown_kb);
    }
    assert_eq!(server.disconnected(), 0);
    assert!(server.frames().is_empty());

    let mut other = connect(addr);
    write_all(&mut other, &heartbeat_frame(false));
    let reply = read_exact(&mut other, FIXED_HEADER_LEN);
    assert_eq!(heartbeat_kind(&reply), Some(Heartbeat::Pong));
    assert!(engine.is_running());
    engine.stop().unwrap();
    assert_eq!(server.disconnected(), 5);
}

/// Panics inside the callback for frames or prefixes starting with `!`.
#[derive(Default)]
struct Faulty {
    in_message_length: bool,
    recorder: Recorder,
}

impl NetCallback for Faulty {
    fn on_message_length(&self, conn: &Connection, data: &[u8]) -> FrameLength {
        let _ = conn;
        if self.in_message_length && data.first() == Some(&b'!') {
            panic!("boom");
        }
        probe_frame_length(data)
    }

    fn on_message(&self, conn: &Connection, frame: &[u8]) -> NetResult<()> {
        if frame.ends_with(b"!") {
            panic!("boom");
        }
        self.recorder.on_message(conn, frame)
    }

    fn on_event(&self, conn: &Connection, event: &NetEvent) {
        self.recorder.on_event(conn, event)
    }

    fn on_connected(&self, conn: &Connection) {
        self.recorder.on_connected(conn)
    }

    fn on_disconnected(&self, conn: &Connection) {
        self.recorder.on_disconnected(conn)
    }
}

#[rstest]
#[case::in_on_message(false, frame(Method::QueryZone, 0, b"!"))]
#[case::in_message_length(true, b"!garbage".to_vec())]
fn test_callback_panic_closes_only_that_connection(
    #[case] in_message_length: bool,
    #[case] trigger: Vec<u8>,
) {
    let callback = Arc::new(Faulty {
        in_message_length,
        recorder: Recorder {
            echo: true,
            ..Default::default()
        },
    });
    let engine = NetEngine::new(engine_config("faulty"), callback.clone()).unwrap();
    engine.start().unwrap();
    let listener = engine.create_listener(&local_listener("faulty"), None).unwrap();
    let addr = engine.listener_addr(listener).unwrap();

    let mut bystander = connect(addr);
    let mut victim = connect(addr);
    assert!(wait_until(WAIT, || callback.recorder.handles.lock().len() == 2));
    write_all(&mut victim, &trigger);

    assert!(wait_until(WAIT, || callback.recorder.disconnected() == 1));
    assert_eq!(
        callback.recorder.lifecycle(),
        vec![
            "connected",
            "connected",
            "event:handler failed: collaborator fault: boom",
            "disconnected"
        ]
    );
    assert!(peer_closed(&mut victim));

    let request = frame(Method::QueryZone, 0, b"still served");
    write_all(&mut bystander, &request);
    assert_eq!(read_exact(&mut bystander, request.len()), request);
    assert!(engine.is_running());
    engine.stop().unwrap();
}
