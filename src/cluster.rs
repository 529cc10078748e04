//! Per-operation fan-out over the ring.
//!
//! The cluster resolves each key to the slot's primary and optional secondary
//! backend and returns a single logical response: the primary's Item. The
//! secondary only ever sees shadow traffic — deletes to keep it coherent,
//! best-effort sets to keep a WriteOnly target warm — and its failures are
//! logged, never surfaced.

use async_std::task;

use crate::client::Pending;
use crate::config::ServerConfig;
use crate::protocol::Item;
use crate::ring::{Backend, Mode, Ring};
use crate::Result;

pub struct Cluster {
    ring: Ring,
}

/// The backends participating in one operation.
struct Route<'a> {
    primary: &'a Backend,
    secondary: Option<(&'a Backend, Mode)>,
}

impl Cluster {
    /// Connect all configured backends and build the ring.
    pub async fn connect(servers: &[ServerConfig]) -> Result<Cluster> {
        Ok(Cluster {
            ring: Ring::connect(servers).await?,
        })
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// The (primary, secondary) backend names an operation on `key` would
    /// reach. Diagnostic view of the routing decision.
    pub fn targets(&self, key: &[u8]) -> (&str, Option<&str>) {
        let route = self.route(key);
        (
            route.primary.name.as_str(),
            route.secondary.map(|(backend, _)| backend.name.as_str()),
        )
    }

    /// Reads go to the slot owner while it serves reads, otherwise to its
    /// sibling; the non-reading owner stays on as shadow-write secondary.
    fn route(&self, key: &[u8]) -> Route<'_> {
        let slot = self.ring.pick_slot(key);
        let owner = &self.ring.servers[slot.server];
        match (owner.mode, slot.next) {
            (Mode::ReadWrite, next) => Route {
                primary: owner,
                secondary: next.map(|sibling| (&self.ring.servers[sibling.server], sibling.mode)),
            },
            (mode, Some(sibling)) => Route {
                primary: &self.ring.servers[sibling.server],
                secondary: Some((owner, mode)),
            },
            (_, None) => unreachable!("planner pairs every non-read-write slot"),
        }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Item> {
        let route = self.route(key);
        route.primary.client()?.get(key).await?.item().await
    }

    pub async fn set(
        &self,
        key: &[u8],
        value: &[u8],
        cas: u64,
        flags: u32,
        expiration: u32,
    ) -> Result<Item> {
        let route = self.route(key);
        let pending = route
            .primary
            .client()?
            .set(key, value, cas, flags, expiration)
            .await?;
        self.finish_write(route, key, pending, expiration).await
    }

    pub async fn add(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
    ) -> Result<Item> {
        let route = self.route(key);
        let pending = route
            .primary
            .client()?
            .add(key, value, flags, expiration)
            .await?;
        self.finish_write(route, key, pending, expiration).await
    }

    pub async fn replace(
        &self,
        key: &[u8],
        value: &[u8],
        cas: u64,
        flags: u32,
        expiration: u32,
    ) -> Result<Item> {
        let route = self.route(key);
        let pending = route
            .primary
            .client()?
            .replace(key, value, cas, flags, expiration)
            .await?;
        self.finish_write(route, key, pending, expiration).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<Item> {
        let route = self.route(key);
        let pending = route.primary.client()?.delete(key).await?;

        // deletes reach both sides of a transition so neither serves stale data
        if let Some((secondary, _)) = route.secondary {
            match secondary.client() {
                Ok(client) => {
                    let client = client.clone();
                    let name = secondary.name.clone();
                    let key = key.to_vec();
                    task::spawn(async move {
                        let outcome = match client.delete(&key).await {
                            Ok(pending) => pending.item().await,
                            Err(err) => Err(err),
                        };
                        if let Err(err) = outcome {
                            log::warn!("shadow delete on {name} failed: {err}");
                        }
                    });
                }
                Err(err) => log::warn!("shadow delete on {} skipped: {err}", secondary.name),
            }
        }

        pending.item().await
    }

    pub async fn incr(
        &self,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<Item> {
        let route = self.route(key);
        let pending = route
            .primary
            .client()?
            .incr(key, delta, initial, expiration)
            .await?;
        self.finish_write(route, key, pending, expiration).await
    }

    pub async fn decr(
        &self,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<Item> {
        let route = self.route(key);
        let pending = route
            .primary
            .client()?
            .decr(key, delta, initial, expiration)
            .await?;
        self.finish_write(route, key, pending, expiration).await
    }

    /// Await the primary's response, then mirror it to a WriteOnly secondary.
    async fn finish_write(
        &self,
        route: Route<'_>,
        key: &[u8],
        pending: Pending,
        expiration: u32,
    ) -> Result<Item> {
        let item = pending.item().await?;
        self.mirror(&route, key, &item, expiration);
        Ok(item)
    }

    /// Best-effort set of the primary's response value to the secondary.
    ///
    /// Replicating the response rather than re-running the operation keeps a
    /// counter secondary in lock-step with the primary's authoritative value.
    fn mirror(&self, route: &Route<'_>, key: &[u8], item: &Item, expiration: u32) {
        let Some((secondary, mode)) = route.secondary else {
            return;
        };
        if mode != Mode::WriteOnly || item.err.is_some() {
            return;
        }
        let client = match secondary.client() {
            Ok(client) => client.clone(),
            Err(err) => {
                log::warn!("shadow write on {} skipped: {err}", secondary.name);
                return;
            }
        };
        let name = secondary.name.clone();
        let key = key.to_vec();
        let value = item.value.clone();
        task::spawn(async move {
            let outcome = match client.set(&key, &value, 0, 0, expiration).await {
                Ok(pending) => pending.item().await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(Item { err: Some(err), .. }) => {
                    log::warn!("shadow write on {name} rejected: {err}");
                }
                Ok(_) => {}
                Err(err) => log::warn!("shadow write on {name} failed: {err}"),
            }
        });
    }
}
