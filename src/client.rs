//! Asynchronous client for one memcached backend.
//!
//! A client owns a single persistent TCP connection and multiplexes many
//! outstanding requests over it. Each request draws a fresh opaque from an
//! atomic counter, registers a single-shot completion slot in the inflight
//! table, and writes one contiguous frame; a dedicated reader task assembles
//! response frames and completes the matching slot. Correlation is solely by
//! opaque, so responses may interleave freely with later requests.

use std::collections::HashMap;
use std::fmt;
use std::net::Shutdown;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_std::channel::{self, Receiver, Sender};
use async_std::future;
use async_std::io::prelude::{ReadExt, WriteExt};
use async_std::net::TcpStream;
use async_std::task;

use crate::error::RouterError;
use crate::protocol::{self, Item, Opcode};
use crate::Result;

/// Pending completion slots, keyed by opaque. `closed` flips once the reader
/// has drained the table, so late callers fail fast instead of waiting on a
/// response that can never come.
#[derive(Default, Debug)]
struct InflightTable {
    slots: HashMap<u32, Sender<Result<Item>>>,
    closed: bool,
}

type Inflight = Arc<Mutex<InflightTable>>;

/// Handle to one backend connection. Cheap to clone; all clones share the
/// connection, the opaque counter and the inflight table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    /// Write side. The lock is held for exactly one `write_all`, so frames
    /// from concurrent callers never interleave on the socket.
    writer: async_std::sync::Mutex<TcpStream>,
    /// Kept so dropping the client tears the socket down, which unwinds the
    /// reader task and drains the inflight table.
    stream: TcpStream,
    sequence: AtomicU32,
    inflight: Inflight,
    pool: BufferPool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Client {
    /// Connect and start the reader task.
    pub async fn connect(host: &str, port: u16) -> Result<Client> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let inflight: Inflight = Arc::default();
        task::spawn(read_loop(stream.clone(), Arc::clone(&inflight)));

        Ok(Client {
            inner: Arc::new(Inner {
                writer: async_std::sync::Mutex::new(stream.clone()),
                stream,
                sequence: AtomicU32::new(0),
                inflight,
                pool: BufferPool::default(),
            }),
        })
    }

    /// Number of requests awaiting a response. Drops to zero once every
    /// request has completed, failed or been cancelled.
    pub fn pending_requests(&self) -> usize {
        self.inner.inflight.lock().unwrap().slots.len()
    }

    pub async fn get(&self, key: &[u8]) -> Result<Pending> {
        self.keyed(Opcode::Get, key).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<Pending> {
        self.keyed(Opcode::Delete, key).await
    }

    pub async fn set(
        &self,
        key: &[u8],
        value: &[u8],
        cas: u64,
        flags: u32,
        expiration: u32,
    ) -> Result<Pending> {
        self.store(Opcode::Set, key, value, cas, flags, expiration)
            .await
    }

    pub async fn add(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
    ) -> Result<Pending> {
        self.store(Opcode::Add, key, value, 0, flags, expiration)
            .await
    }

    pub async fn replace(
        &self,
        key: &[u8],
        value: &[u8],
        cas: u64,
        flags: u32,
        expiration: u32,
    ) -> Result<Pending> {
        self.store(Opcode::Replace, key, value, cas, flags, expiration)
            .await
    }

    pub async fn incr(
        &self,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<Pending> {
        self.counter(Opcode::Increment, key, delta, initial, expiration)
            .await
    }

    pub async fn decr(
        &self,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<Pending> {
        self.counter(Opcode::Decrement, key, delta, initial, expiration)
            .await
    }

    async fn keyed(&self, opcode: Opcode, key: &[u8]) -> Result<Pending> {
        let opaque = self.next_opaque();
        let mut buf = self.inner.pool.take();
        protocol::encode_keyed(&mut buf, opcode as u8, key, opaque);
        self.call(opaque, buf).await
    }

    async fn store(
        &self,
        opcode: Opcode,
        key: &[u8],
        value: &[u8],
        cas: u64,
        flags: u32,
        expiration: u32,
    ) -> Result<Pending> {
        let opaque = self.next_opaque();
        let mut buf = self.inner.pool.take();
        protocol::encode_store(&mut buf, opcode as u8, key, value, cas, flags, expiration, opaque);
        self.call(opaque, buf).await
    }

    async fn counter(
        &self,
        opcode: Opcode,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<Pending> {
        let opaque = self.next_opaque();
        let mut buf = self.inner.pool.take();
        protocol::encode_counter(&mut buf, opcode as u8, key, delta, initial, expiration, opaque);
        self.call(opaque, buf).await
    }

    /// Register the completion slot, then write. The order matters: on a
    /// pipelined link the response can arrive before `write_all` returns.
    async fn call(&self, opaque: u32, buf: Vec<u8>) -> Result<Pending> {
        let (tx, rx) = channel::bounded(1);
        {
            let mut inflight = self.inner.inflight.lock().unwrap();
            if inflight.closed {
                return Err(RouterError::ConnectionLost);
            }
            if inflight.slots.insert(opaque, tx).is_some() {
                log::warn!("opaque {opaque} displaced a still-pending request");
            }
        }

        let written = {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&buf).await
        };
        self.inner.pool.put(buf);

        if let Err(err) = written {
            self.inner.inflight.lock().unwrap().slots.remove(&opaque);
            return Err(err.into());
        }

        Ok(Pending {
            opaque,
            rx,
            inflight: Arc::clone(&self.inner.inflight),
        })
    }

    fn next_opaque(&self) -> u32 {
        // wrap-around is fine; the inflight window is far smaller than u32
        self.inner.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pending", &self.pending_requests())
            .finish()
    }
}

/// Single-shot completion handle for one request.
#[derive(Debug)]
pub struct Pending {
    opaque: u32,
    rx: Receiver<Result<Item>>,
    inflight: Inflight,
}

impl Pending {
    /// The opaque this request was sent with.
    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    /// Await the response.
    pub async fn item(self) -> Result<Item> {
        match self.rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(RouterError::ConnectionLost),
        }
    }

    /// Await the response with a deadline. On expiry the inflight entry is
    /// evicted, so a late response is dropped silently by the reader.
    pub async fn item_within(self, deadline: Duration) -> Result<Item> {
        match future::timeout(deadline, self.rx.recv()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::ConnectionLost),
            Err(_) => {
                self.inflight.lock().unwrap().slots.remove(&self.opaque);
                Err(RouterError::Timeout)
            }
        }
    }

    /// Abandon the request without waiting, evicting its inflight entry.
    pub fn cancel(self) {
        self.inflight.lock().unwrap().slots.remove(&self.opaque);
    }
}

/// Reusable write buffers, returned after each write syscall.
#[derive(Default)]
struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    const MAX_POOLED: usize = 64;

    fn take(&self) -> Vec<u8> {
        self.bufs.lock().unwrap().pop().unwrap_or_default()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut bufs = self.bufs.lock().unwrap();
        if bufs.len() < Self::MAX_POOLED {
            bufs.push(buf);
        }
    }
}

async fn read_loop(mut stream: TcpStream, inflight: Inflight) {
    let mut decoder = protocol::FrameDecoder::new();
    let mut chunk = vec![0u8; 4096];

    'conn: loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                log::debug!("backend read failed: {err}");
                break;
            }
        };
        decoder.extend(&chunk[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(err) = deliver(&inflight, frame) {
                        log::error!("dropping backend connection: {err}");
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!("dropping backend connection: {err}");
                    break 'conn;
                }
            }
        }
    }

    drain(&inflight);
}

fn deliver(inflight: &Inflight, frame: Vec<u8>) -> Result<()> {
    let item = protocol::parse_response(frame)?;
    let opaque = item.opaque();

    let slot = inflight.lock().unwrap().slots.remove(&opaque);
    match slot {
        Some(tx) => {
            // a dropped receiver means the caller went away; discard
            let _ = tx.try_send(Ok(item));
        }
        // late response to a cancelled or timed-out request
        None => log::debug!("no pending request for opaque {opaque}"),
    }
    Ok(())
}

/// Mark the table closed and complete every outstanding request with
/// `ConnectionLost`.
fn drain(inflight: &Inflight) {
    let slots: Vec<Sender<Result<Item>>> = {
        let mut table = inflight.lock().unwrap();
        table.closed = true;
        table.slots.drain().map(|(_, tx)| tx).collect()
    };
    for tx in slots {
        let _ = tx.try_send(Err(RouterError::ConnectionLost));
    }
}
