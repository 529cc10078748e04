//! Consistent-hash ring and resharding transition planner.
//!
//! The ring is built once from the configured backend fleet and never mutates
//! afterwards; reconfiguration means building a new ring and letting the old
//! one's clients drop. Each backend occupies 100 virtual nodes placed by
//! CRC32; lookup binary-searches the sorted node table. During add/remove
//! transitions the planner pairs each slot with the backend owning the next
//! slot clockwise, so traffic can be poured into (or drained out of) a node
//! in phases without losing cached data.

use std::collections::HashSet;

use serde::Deserialize;

use crate::client::Client;
use crate::config::ServerConfig;
use crate::error::{ConfigError, RouterError};
use crate::Result;

/// Virtual nodes per backend.
const VIRTUAL_NODES: usize = 100;

/// Operator-declared intent for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Status {
    #[default]
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "add")]
    Adding,
    #[serde(rename = "delete")]
    Deleting,
}

/// Operator-declared migration progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Phase {
    #[serde(rename = "do")]
    DeleteOnly,
    #[serde(rename = "wo")]
    WriteOnly,
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
}

/// Effective traffic policy, derived from (Status, Phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    DeleteOnly,
    WriteOnly,
    ReadWrite,
}

/// One memcached backend and its connected client.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: Status,
    pub phase: Phase,
    pub mode: Mode,
    client: Option<Client>,
}

impl Backend {
    /// Connect the backend's client and derive its traffic mode.
    pub async fn connect(server: &ServerConfig) -> Result<Backend> {
        let client = Client::connect(&server.host, server.port).await?;
        Ok(Backend {
            name: server.name.clone(),
            host: server.host.clone(),
            port: server.port,
            status: server.status,
            phase: server.phase,
            mode: base_mode(server.status, server.phase),
            client: Some(client),
        })
    }

    pub fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or(RouterError::ClientGone)
    }

    #[cfg(test)]
    pub(crate) fn detached(name: &str, status: Status, phase: Phase) -> Backend {
        Backend {
            name: name.to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 0,
            status,
            phase,
            mode: base_mode(status, phase),
            client: None,
        }
    }
}

/// The mode a backend itself operates in.
fn base_mode(status: Status, phase: Phase) -> Mode {
    match (status, phase) {
        (Status::Normal, _) => Mode::ReadWrite,
        (Status::Adding, Phase::DeleteOnly) => Mode::DeleteOnly,
        (Status::Adding, Phase::WriteOnly) => Mode::WriteOnly,
        (Status::Adding, Phase::ReadWrite) => Mode::ReadWrite,
        // removal runs the add sequence in reverse: keep serving while the
        // sibling warms up, then hand reads over
        (Status::Deleting, Phase::DeleteOnly) => Mode::ReadWrite,
        (Status::Deleting, Phase::WriteOnly) => Mode::ReadWrite,
        (Status::Deleting, Phase::ReadWrite) => Mode::WriteOnly,
    }
}

/// The mode the slot's sibling operates in, given the owner's transition.
fn sibling_mode(status: Status, phase: Phase, siblings_own: Mode) -> Mode {
    match (status, phase) {
        (Status::Adding, Phase::DeleteOnly | Phase::WriteOnly) => siblings_own,
        (Status::Adding, Phase::ReadWrite) => Mode::WriteOnly,
        (Status::Deleting, Phase::DeleteOnly) => Mode::DeleteOnly,
        (Status::Deleting, Phase::WriteOnly) => Mode::WriteOnly,
        (Status::Deleting, Phase::ReadWrite) => Mode::ReadWrite,
        (Status::Normal, _) => siblings_own,
    }
}

/// A virtual-node slot. `next` pairs the slot with the backend owning the
/// next slot clockwise while the owner is in transition.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) hash: u32,
    pub(crate) server: usize,
    pub(crate) next: Option<Sibling>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Sibling {
    pub(crate) server: usize,
    pub(crate) mode: Mode,
}

#[derive(Debug)]
pub struct Ring {
    pub(crate) servers: Vec<Backend>,
    pub(crate) table: Vec<Node>,
}

impl Ring {
    /// Connect every configured backend and assemble the ring.
    pub async fn connect(servers: &[ServerConfig]) -> Result<Ring> {
        let mut backends = Vec::with_capacity(servers.len());
        for server in servers {
            let backend = Backend::connect(server).await?;
            log::info!(
                "backend {} connected at {}:{} ({:?})",
                backend.name,
                backend.host,
                backend.port,
                backend.mode
            );
            backends.push(backend);
        }
        Ring::assemble(backends)
    }

    /// Build the node table and run the transition planner.
    pub(crate) fn assemble(servers: Vec<Backend>) -> Result<Ring> {
        if servers.is_empty() {
            return Err(ConfigError::NoServers.into());
        }
        let mut names = HashSet::new();
        for server in &servers {
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::ConflictName(server.name.clone()).into());
            }
        }

        let mut table = Vec::with_capacity(servers.len() * VIRTUAL_NODES);
        for (index, server) in servers.iter().enumerate() {
            for i in 0..VIRTUAL_NODES {
                let hash = crc32fast::hash(format!("{}-{}", server.name, i).as_bytes());
                table.push(Node {
                    hash,
                    server: index,
                    next: None,
                });
            }
        }
        table.sort_by_key(|node| node.hash);

        let len = table.len();
        for i in 0..len {
            let owner = &servers[table[i].server];
            if owner.status == Status::Normal {
                continue;
            }
            let next_owner = table[(i + 1) % len].server;
            let mode = sibling_mode(owner.status, owner.phase, servers[next_owner].mode);
            table[i].next = Some(Sibling {
                server: next_owner,
                mode,
            });
        }

        Ok(Ring { servers, table })
    }

    /// The backend owning the key's slot.
    pub fn pick(&self, key: &[u8]) -> &Backend {
        &self.servers[self.pick_slot(key).server]
    }

    /// The key's slot: first virtual node clockwise from the key's hash,
    /// wrapping to the first slot past the top of the hash space.
    pub(crate) fn pick_slot(&self, key: &[u8]) -> &Node {
        let hash = crc32fast::hash(key);
        let index = self.table.partition_point(|node| node.hash <= hash);
        if index == self.table.len() {
            &self.table[0]
        } else {
            &self.table[index]
        }
    }

    pub fn servers(&self) -> &[Backend] {
        &self.servers
    }
}
