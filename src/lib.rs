//! Transparent proxy router for memcached.
//!
//! Sits between memcached clients and a fleet of backends, speaking the
//! binary protocol on both sides. Keys are placed with a CRC32 consistent-hash
//! ring; backends can be added or removed live by declaring a migration status
//! and phase in the config, which the ring's transition planner turns into
//! per-slot primary/secondary traffic policies. Each backend is driven over a
//! single pipelined connection with responses correlated by opaque.

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod protocol;
pub mod ring;
pub mod router;

pub type Result<T> = std::result::Result<T, error::RouterError>;

pub use client::{Client, Pending};
pub use cluster::Cluster;
pub use config::{Config, ServerConfig};
pub use protocol::Item;
pub use ring::{Backend, Mode, Phase, Ring, Status};
pub use router::Router;
