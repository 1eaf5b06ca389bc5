//! Protocol-agnostic idle-transport pool.
//!
//! It is tempting to auto-reconnect or retry at this layer. That cannot be
//! done correctly here: only protocol-aware callers know what a retry entails
//! (handshakes, protocol state resets), so the pool confines itself to
//! retaining warm transports and discarding broken or surplus ones.

use crate::resolve::Address;
use crate::transport::monitored::kill;
use crate::transport::{MonitoredTransport, Probe};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_IDLE_PER_ADDR: usize = 50;
pub const DEFAULT_MAX_IDLE_TOTAL: usize = 800;

/// Which idle transport to discard when a cap is hit.
///
/// `Freshest` discards the most recently parked transport, so long-lived warm
/// transports survive surplus churn. `Stalest` discards the transport idle
/// the longest, the classic LRU reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurplusEviction {
    Freshest,
    Stalest,
}

/// Tuning for one pool instance.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Idle age beyond which a parked transport is culled.
    pub idle_timeout: Duration,
    /// Idle cap per destination address, unless overridden below.
    pub max_idle_per_addr: usize,
    /// Idle cap across all destinations.
    pub max_idle_total: usize,
    /// Per-address overrides of `max_idle_per_addr`.
    pub per_addr_caps: HashMap<Address, usize>,
    pub eviction: SurplusEviction,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_idle_per_addr: DEFAULT_MAX_IDLE_PER_ADDR,
            max_idle_total: DEFAULT_MAX_IDLE_TOTAL,
            per_addr_caps: HashMap::new(),
            eviction: SurplusEviction::Freshest,
        }
    }
}

struct IdleEntry {
    transport: MonitoredTransport,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolInner {
    free_by_addr: HashMap<Address, Vec<IdleEntry>>,
    total_idle: usize,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_idle: usize,
    pub addresses: Vec<(Address, usize)>,
}

/// Idle pool for one credential identity.
///
/// Parked transports are deregistered from their server model's active set;
/// handing one back out re-registers it, so a transport is counted as in-use
/// or idle but never both. Culling is amortized into `acquire` — an idle
/// process does no background pool work.
pub struct SockPool {
    settings: PoolSettings,
    inner: Mutex<PoolInner>,
}

impl SockPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            // A panicking task cannot be allowed to wedge every future
            // acquire; the structures stay usable.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cap_for(&self, address: &Address) -> usize {
        self.settings
            .per_addr_caps
            .get(address)
            .copied()
            .unwrap_or(self.settings.max_idle_per_addr)
    }

    /// Pop a warm transport for `address`, most recently parked first.
    /// Returns `None` when nothing reusable is parked.
    pub fn acquire(&self, address: &Address) -> Option<MonitoredTransport> {
        self.cull();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entries = inner.free_by_addr.get_mut(address)?;
        let entry = entries.pop()?;
        let emptied = entries.is_empty();
        if emptied {
            inner.free_by_addr.remove(address);
        }
        inner.total_idle = inner.total_idle.saturating_sub(1);
        trace!(%address, id = entry.transport.id(), "reusing pooled transport");
        entry.transport.reregister();
        Some(entry.transport)
    }

    /// Park a transport for reuse, or discard it if it is not worth keeping.
    ///
    /// A readable transport is corrupted: either the peer closed it or it
    /// carries unconsumed bytes that would poison the next user. Either way
    /// it is killed, never parked.
    pub fn release(&self, transport: MonitoredTransport) {
        match transport.probe() {
            Probe::Corrupt => {
                debug!(id = transport.id(), "discarding readable transport on release");
                kill(transport);
                return;
            }
            Probe::Dead => {
                trace!(id = transport.id(), "discarding dead transport on release");
                return;
            }
            Probe::Clean => {}
        }
        let peer = match transport.peer_addr() {
            Ok(peer) => Address::from(peer),
            Err(_) => return,
        };

        transport.deregister();
        let victim = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let per_addr_len = {
                let entries = inner.free_by_addr.entry(peer).or_default();
                trace!(%peer, id = transport.id(), "parking transport");
                entries.push(IdleEntry {
                    transport,
                    idle_since: Instant::now(),
                });
                entries.len()
            };
            inner.total_idle += 1;

            let surplus = if per_addr_len >= self.cap_for(&peer) {
                inner
                    .free_by_addr
                    .get(&peer)
                    .and_then(|entries| pick_index(entries, self.settings.eviction))
                    .map(|idx| (peer, idx))
            } else if inner.total_idle >= self.settings.max_idle_total {
                pick_global(&inner.free_by_addr, self.settings.eviction)
            } else {
                None
            };

            surplus.and_then(|(address, idx)| {
                let entries = inner.free_by_addr.get_mut(&address)?;
                let entry = entries.remove(idx);
                let emptied = entries.is_empty();
                if emptied {
                    inner.free_by_addr.remove(&address);
                }
                inner.total_idle = inner.total_idle.saturating_sub(1);
                Some(entry)
            })
        };
        if let Some(entry) = victim {
            debug!(id = entry.transport.id(), "evicting surplus idle transport");
            kill(entry.transport);
        }
    }

    /// Drop parked transports that have aged out, lost their descriptor, or
    /// turned readable. Closes are handed off to the reactor; culling never
    /// blocks an acquire, and a cull problem is never the caller's problem.
    pub fn cull(&self) {
        let now = Instant::now();
        let mut killed: Vec<MonitoredTransport> = Vec::new();
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            for entries in inner.free_by_addr.values_mut() {
                let parked = std::mem::take(entries);
                for entry in parked {
                    if now.duration_since(entry.idle_since) > self.settings.idle_timeout {
                        killed.push(entry.transport);
                    } else if entry.transport.peer_addr().is_err() {
                        // Descriptor already gone; nothing worth closing.
                        continue;
                    } else if entry.transport.probe() != Probe::Clean {
                        killed.push(entry.transport);
                    } else {
                        entries.push(entry);
                    }
                }
            }
            inner.free_by_addr.retain(|_, entries| !entries.is_empty());
            inner.total_idle = inner.free_by_addr.values().map(Vec::len).sum();
        }
        if !killed.is_empty() {
            trace!(count = killed.len(), "culled idle transports");
        }
        for transport in killed {
            kill(transport);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let guard = self.lock();
        PoolStats {
            total_idle: guard.total_idle,
            addresses: guard
                .free_by_addr
                .iter()
                .map(|(address, entries)| (*address, entries.len()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for SockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.lock();
        f.debug_struct("SockPool")
            .field("total_idle", &guard.total_idle)
            .field("addresses", &guard.free_by_addr.len())
            .field("max_idle_total", &self.settings.max_idle_total)
            .finish()
    }
}

fn pick_index(entries: &[IdleEntry], policy: SurplusEviction) -> Option<usize> {
    match policy {
        SurplusEviction::Freshest => entries
            .iter()
            .enumerate()
            .max_by_key(|(_, entry)| entry.idle_since)
            .map(|(idx, _)| idx),
        SurplusEviction::Stalest => entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.idle_since)
            .map(|(idx, _)| idx),
    }
}

fn pick_global(
    free_by_addr: &HashMap<Address, Vec<IdleEntry>>,
    policy: SurplusEviction,
) -> Option<(Address, usize)> {
    let mut best: Option<(Address, usize, Instant)> = None;
    for (address, entries) in free_by_addr {
        let Some(idx) = pick_index(entries, policy) else {
            continue;
        };
        let stamp = entries[idx].idle_since;
        let better = match (&best, policy) {
            (None, _) => true,
            (Some((_, _, current)), SurplusEviction::Freshest) => stamp > *current,
            (Some((_, _, current)), SurplusEviction::Stalest) => stamp < *current,
        };
        if better {
            best = Some((*address, idx, stamp));
        }
    }
    best.map(|(address, idx, _)| (address, idx))
}
