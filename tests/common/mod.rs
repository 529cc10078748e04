//! Shared test fixtures: an in-process mock memcached backend speaking the
//! binary protocol, and a raw frame-level client for talking to the router.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_std::io::prelude::{ReadExt, WriteExt};
use async_std::net::{TcpListener, TcpStream};
use async_std::task;

use memcached_router::protocol::{
    self, code, FrameDecoder, Item, Opcode, PacketHeader, Request,
};
use memcached_router::{Phase, ServerConfig, Status};

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<Vec<u8>, Entry>,
    next_cas: u64,
    /// Journal of (opcode, key) in arrival order.
    ops: Vec<(u8, Vec<u8>)>,
}

/// A frame-correct memcached stand-in listening on an ephemeral port.
pub struct MockBackend {
    port: u16,
    state: Arc<Mutex<State>>,
}

impl MockBackend {
    pub async fn spawn() -> MockBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = Arc::clone(&state);
        task::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    break;
                };
                task::spawn(serve_backend(conn, Arc::clone(&accept_state)));
            }
        });

        MockBackend { port, state }
    }

    pub fn host(&self) -> &str {
        "127.0.0.1"
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_config(&self, name: &str, status: Status, phase: Phase) -> ServerConfig {
        ServerConfig {
            name: name.to_owned(),
            host: self.host().to_owned(),
            port: self.port,
            status,
            phase,
        }
    }

    /// Opcodes and keys seen so far, in arrival order.
    pub fn ops(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn saw_op(&self, opcode: Opcode, key: &[u8]) -> bool {
        self.ops()
            .iter()
            .any(|(op, k)| *op == opcode as u8 && k == key)
    }

    /// Poll until the journal records `opcode` for `key`.
    pub async fn wait_for_op(&self, opcode: Opcode, key: &[u8]) -> bool {
        for _ in 0..100 {
            if self.saw_op(opcode, key) {
                return true;
            }
            task::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    pub fn value_of(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
    }
}

async fn serve_backend(mut conn: TcpStream, state: Arc<Mutex<State>>) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 4096];

    loop {
        let n = match conn.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&chunk[..n]);

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            let Ok(request) = protocol::parse_request(&frame) else {
                return;
            };
            let response = handle(&state, &request);
            if conn.write_all(&response).await.is_err() {
                return;
            }
        }
    }
}

fn handle(state: &Arc<Mutex<State>>, request: &Request<'_>) -> Vec<u8> {
    let mut state = state.lock().unwrap();
    state.ops.push((request.opcode, request.key.to_vec()));
    state.next_cas += 1;
    let cas = state.next_cas;

    match Opcode::from_u8(request.opcode) {
        Some(Opcode::Get) => match state.entries.get(request.key) {
            Some(entry) => {
                let entry = entry.clone();
                respond(
                    request,
                    code::OK_STATUS,
                    entry.cas,
                    &entry.flags.to_be_bytes(),
                    &entry.value,
                )
            }
            None => respond(request, code::STATUS_KEY_NOT_FOUND, 0, &[], &[]),
        },
        Some(Opcode::Set) => {
            let flags = extras_flags(request);
            state.entries.insert(
                request.key.to_vec(),
                Entry {
                    value: request.value.to_vec(),
                    flags,
                    cas,
                },
            );
            respond(request, code::OK_STATUS, cas, &[], &[])
        }
        Some(Opcode::Add) => {
            if state.entries.contains_key(request.key) {
                return respond(request, code::STATUS_KEY_EXISTS, 0, &[], &[]);
            }
            let flags = extras_flags(request);
            state.entries.insert(
                request.key.to_vec(),
                Entry {
                    value: request.value.to_vec(),
                    flags,
                    cas,
                },
            );
            respond(request, code::OK_STATUS, cas, &[], &[])
        }
        Some(Opcode::Replace) => {
            if !state.entries.contains_key(request.key) {
                return respond(request, code::STATUS_KEY_NOT_FOUND, 0, &[], &[]);
            }
            let flags = extras_flags(request);
            state.entries.insert(
                request.key.to_vec(),
                Entry {
                    value: request.value.to_vec(),
                    flags,
                    cas,
                },
            );
            respond(request, code::OK_STATUS, cas, &[], &[])
        }
        Some(Opcode::Delete) => {
            if state.entries.remove(request.key).is_none() {
                return respond(request, code::STATUS_KEY_NOT_FOUND, 0, &[], &[]);
            }
            respond(request, code::OK_STATUS, 0, &[], &[])
        }
        Some(Opcode::Increment) | Some(Opcode::Decrement) => {
            let delta = u64::from_be_bytes(request.extras[0..8].try_into().unwrap());
            let initial = u64::from_be_bytes(request.extras[8..16].try_into().unwrap());
            let current = match state.entries.get(request.key) {
                None => None,
                Some(entry) => match <[u8; 8]>::try_from(entry.value.as_slice()) {
                    Ok(bytes) => Some(u64::from_be_bytes(bytes)),
                    Err(_) => return respond(request, 0x0006, 0, &[], &[]),
                },
            };
            let counter = match (current, request.opcode) {
                (None, _) => initial,
                (Some(current), op) if op == Opcode::Increment as u8 => {
                    current.wrapping_add(delta)
                }
                (Some(current), _) => current.saturating_sub(delta),
            };
            state.entries.insert(
                request.key.to_vec(),
                Entry {
                    value: counter.to_be_bytes().to_vec(),
                    flags: 0,
                    cas,
                },
            );
            respond(request, code::OK_STATUS, cas, &[], &counter.to_be_bytes())
        }
        None => respond(request, code::STATUS_UNKNOWN_COMMAND, 0, &[], &[]),
    }
}

fn extras_flags(request: &Request<'_>) -> u32 {
    u32::from_be_bytes(request.extras[0..4].try_into().unwrap())
}

/// Build a response frame echoing the request's opaque, as memcached does.
fn respond(request: &Request<'_>, status: u16, cas: u64, extras: &[u8], value: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    let header = PacketHeader {
        magic: 0x81,
        opcode: request.opcode,
        extras_length: extras.len() as u8,
        vbucket_id_or_status: status,
        total_body_length: (extras.len() + value.len()) as u32,
        opaque: request.opaque,
        cas,
        ..Default::default()
    };
    header.write(&mut frame);
    frame.extend_from_slice(extras);
    frame.extend_from_slice(value);
    frame
}

/// Frame-level client used to drive the router the way a real memcached
/// client would.
pub struct TestClient {
    conn: TcpStream,
    decoder: FrameDecoder,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> TestClient {
        let conn = TcpStream::connect(addr).await.unwrap();
        conn.set_nodelay(true).unwrap();
        TestClient {
            conn,
            decoder: FrameDecoder::new(),
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.conn.write_all(bytes).await.unwrap();
    }

    pub async fn recv(&mut self) -> Item {
        let mut chunk = vec![0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return protocol::parse_response(frame).unwrap();
            }
            let n = self.conn.read(&mut chunk).await.unwrap();
            assert!(n > 0, "router closed the connection");
            self.decoder.extend(&chunk[..n]);
        }
    }

    pub async fn get(&mut self, key: &[u8], opaque: u32) -> Item {
        let mut frame = Vec::new();
        protocol::encode_keyed(&mut frame, Opcode::Get as u8, key, opaque);
        self.send_raw(&frame).await;
        self.recv().await
    }

    pub async fn set(&mut self, key: &[u8], value: &[u8], opaque: u32) -> Item {
        let mut frame = Vec::new();
        protocol::encode_store(&mut frame, Opcode::Set as u8, key, value, 0, 0, 0, opaque);
        self.send_raw(&frame).await;
        self.recv().await
    }

    pub async fn delete(&mut self, key: &[u8], opaque: u32) -> Item {
        let mut frame = Vec::new();
        protocol::encode_keyed(&mut frame, Opcode::Delete as u8, key, opaque);
        self.send_raw(&frame).await;
        self.recv().await
    }

    pub async fn incr(&mut self, key: &[u8], delta: u64, initial: u64, opaque: u32) -> Item {
        let mut frame = Vec::new();
        protocol::encode_counter(
            &mut frame,
            Opcode::Increment as u8,
            key,
            delta,
            initial,
            0,
            opaque,
        );
        self.send_raw(&frame).await;
        self.recv().await
    }
}
