//! Client-facing proxy frontend.
//!
//! One listener task accepts connections; each connection gets its own task
//! that assembles request frames, dispatches them to the cluster in arrival
//! order, and writes the backend's raw response frame back with the opaque
//! rewritten to the client's own correlation tag. A malformed frame or a dead
//! backend closes that one client connection and nothing else.

use std::net::SocketAddr;
use std::sync::Arc;

use async_std::io::prelude::{ReadExt, WriteExt};
use async_std::net::{TcpListener, TcpStream};
use async_std::stream::StreamExt;
use async_std::task;
use byteorder::{BigEndian, ByteOrder};

use crate::cluster::Cluster;
use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::protocol::{self, code, FrameDecoder, Opcode};
use crate::Result;

pub struct Router {
    listener: TcpListener,
    cluster: Arc<Cluster>,
}

impl Router {
    /// Connect the backend fleet and bind the listening socket.
    pub async fn connect(addr: &str, servers: &[ServerConfig]) -> Result<Router> {
        let cluster = Cluster::connect(servers).await?;
        Router::bind(addr, cluster).await
    }

    pub async fn bind(addr: &str, cluster: Cluster) -> Result<Router> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Router {
            listener,
            cluster: Arc::new(cluster),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn cluster(&self) -> Arc<Cluster> {
        Arc::clone(&self.cluster)
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self) -> Result<()> {
        log::info!("listening on {}", self.listener.local_addr()?);
        let mut incoming = self.listener.incoming();
        while let Some(stream) = incoming.next().await {
            match stream {
                Ok(conn) => {
                    let cluster = Arc::clone(&self.cluster);
                    task::spawn(async move {
                        let peer = conn.peer_addr().ok();
                        if let Err(err) = serve_connection(cluster, conn).await {
                            log::debug!("client connection {peer:?} closed: {err}");
                        }
                    });
                }
                Err(err) => log::warn!("accept failed: {err}"),
            }
        }
        Ok(())
    }
}

async fn serve_connection(cluster: Arc<Cluster>, mut conn: TcpStream) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 4096];

    loop {
        let n = match conn.read(&mut chunk).await? {
            0 => return Ok(()),
            n => n,
        };
        decoder.extend(&chunk[..n]);

        while let Some(frame) = decoder.next_frame()? {
            let response = handle_frame(&cluster, &frame).await?;
            conn.write_all(&response).await?;
        }
    }
}

/// Dispatch one request frame and produce the frame to send back.
async fn handle_frame(cluster: &Cluster, frame: &[u8]) -> Result<Vec<u8>> {
    let request = protocol::parse_request(frame)?;

    let opcode = match Opcode::from_u8(request.opcode) {
        Some(opcode) => opcode,
        None => {
            log::warn!("rejecting unroutable opcode {:#04x}", request.opcode);
            let mut response = Vec::with_capacity(protocol::HEADER_LEN);
            protocol::encode_status_response(
                &mut response,
                request.opcode,
                code::STATUS_UNKNOWN_COMMAND,
                request.opaque,
            );
            return Ok(response);
        }
    };

    let item = match opcode {
        Opcode::Get => cluster.get(request.key).await?,
        Opcode::Set => {
            let (flags, expiration) = store_extras(request.extras)?;
            cluster
                .set(request.key, request.value, request.cas, flags, expiration)
                .await?
        }
        Opcode::Add => {
            let (flags, expiration) = store_extras(request.extras)?;
            cluster
                .add(request.key, request.value, flags, expiration)
                .await?
        }
        Opcode::Replace => {
            let (flags, expiration) = store_extras(request.extras)?;
            cluster
                .replace(request.key, request.value, request.cas, flags, expiration)
                .await?
        }
        Opcode::Delete => cluster.delete(request.key).await?,
        Opcode::Increment => {
            let (delta, initial, expiration) = counter_extras(request.extras)?;
            cluster
                .incr(request.key, delta, initial, expiration)
                .await?
        }
        Opcode::Decrement => {
            let (delta, initial, expiration) = counter_extras(request.extras)?;
            cluster
                .decr(request.key, delta, initial, expiration)
                .await?
        }
    };

    let mut response = item.raw;
    // the backend answered with our opaque; hand the client back its own
    BigEndian::write_u32(&mut response[12..16], request.opaque);
    Ok(response)
}

/// Split store extras into user flags and expiration.
fn store_extras(extras: &[u8]) -> Result<(u32, u32)> {
    if extras.len() < 8 {
        return Err(ProtocolError::BadFrame("store extras shorter than 8 bytes".into()).into());
    }
    let flags = BigEndian::read_u32(&extras[0..4]);
    let expiration = BigEndian::read_u32(&extras[4..8]);
    Ok((flags, expiration))
}

/// Split counter extras into delta, initial value and expiration.
fn counter_extras(extras: &[u8]) -> Result<(u64, u64, u32)> {
    if extras.len() < 20 {
        return Err(ProtocolError::BadFrame("counter extras shorter than 20 bytes".into()).into());
    }
    let delta = BigEndian::read_u64(&extras[0..8]);
    let initial = BigEndian::read_u64(&extras[8..16]);
    let expiration = BigEndian::read_u32(&extras[16..20]);
    Ok((delta, initial, expiration))
}
