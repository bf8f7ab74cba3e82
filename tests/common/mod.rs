#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lidr_net::{
    Connection, ConnectionHandle, EngineConfig, ListenerConfig, Method, NetCallback, NetEngine,
    NetError, NetEvent, NetResult, ProtocolHeader,
};
use parking_lot::Mutex;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn engine_config(name: &str) -> EngineConfig {
    EngineConfig {
        net_engine_name: name.to_string(),
        io_thread_count: 2,
        heartbeat_interval_ms: 0,
        heartbeat_timeout_ms: 0,
        call_timeout_ms: 2000,
        ..Default::default()
    }
}

pub fn local_listener(name: &str) -> ListenerConfig {
    ListenerConfig {
        listener_name: name.to_string(),
        listener_ip: "127.0.0.1".to_string(),
        listener_port: 0,
        ..Default::default()
    }
}

pub fn frame(method: Method, sequence: u16, payload: &[u8]) -> Vec<u8> {
    ProtocolHeader::new(method, sequence, payload.len())
        .unwrap()
        .encode_frame(payload)
        .to_vec()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nodelay(true).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

pub fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// True once the peer closed: EOF or a reset.
pub fn peer_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return false
            }
            Err(_) => return true,
        }
    }
}

/// Callback recording everything the engine reports, optionally echoing frames.
#[derive(Default)]
pub struct Recorder {
    pub echo: bool,
    /// payload that makes `on_message` fail
    pub reject: Option<Vec<u8>>,
    pub frames: Mutex<Vec<Vec<u8>>>,
    pub lifecycle: Mutex<Vec<String>>,
    pub handles: Mutex<Vec<ConnectionHandle>>,
    pub disconnected: AtomicUsize,
}

impl Recorder {
    pub fn echo() -> Arc<Recorder> {
        Arc::new(Recorder {
            echo: true,
            ..Default::default()
        })
    }

    pub fn silent() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    pub fn lifecycle(&self) -> Vec<String> {
        self.lifecycle.lock().clone()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn first_handle(&self) -> Option<ConnectionHandle> {
        self.handles.lock().first().copied()
    }
}

impl NetCallback for Recorder {
    fn on_message(&self, conn: &Connection, frame: &[u8]) -> NetResult<()> {
        self.frames.lock().push(frame.to_vec());
        if let Some(reject) = &self.reject {
            if frame.ends_with(reject) {
                return Err(NetError::Handler("rejected payload".to_string()));
            }
        }
        if self.echo {
            conn.send(frame)?;
        }
        Ok(())
    }

    fn on_event(&self, _conn: &Connection, event: &NetEvent) {
        self.lifecycle.lock().push(format!("event:{}", event));
    }

    fn on_connected(&self, conn: &Connection) {
        self.handles.lock().push(conn.handle());
        self.lifecycle.lock().push("connected".to_string());
    }

    fn on_disconnected(&self, _conn: &Connection) {
        self.lifecycle.lock().push("disconnected".to_string());
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

/// Started engine with one loopback listener served by `callback`.
pub fn serve(name: &str, config: EngineConfig, callback: Arc<Recorder>) -> (NetEngine, SocketAddr) {
    let engine = NetEngine::new(EngineConfig {
        net_engine_name: name.to_string(),
        ..config
    }, callback)
    .unwrap();
    engine.start().unwrap();
    let listener = engine.create_listener(&local_listener(name), None).unwrap();
    let addr = engine.listener_addr(listener).unwrap();
    (engine, addr)
}

pub fn write_all(stream: &mut TcpStream, data: &[u8]) {
    stream.write_all(data).unwrap();
    stream.flush().unwrap();
}
