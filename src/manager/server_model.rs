//! Per-endpoint observational state.

use crate::resolve::Address;
use crate::transport::monitored::TransportId;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Identity-only registry of in-use transports for one endpoint.
///
/// Entries are transport ids, not transports: the set counts, it does not
/// own. Transports insert and remove themselves (see
/// [`crate::transport::MonitoredTransport`]), and both operations tolerate a
/// poisoned lock so a panicking task cannot wedge the accounting.
#[derive(Debug, Default)]
pub struct ActiveSet {
    entries: Mutex<HashMap<TransportId, Instant>>,
}

impl ActiveSet {
    pub(crate) fn insert(&self, id: TransportId) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(id, Instant::now());
    }

    pub(crate) fn remove(&self, id: TransportId) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: TransportId) -> bool {
        match self.entries.lock() {
            Ok(entries) => entries.contains_key(&id),
            Err(poisoned) => poisoned.into_inner().contains_key(&id),
        }
    }
}

/// Estimate of the state of one upstream endpoint.
///
/// "Endpoint" is whatever accepts the connections; in practice that can be a
/// whole pool of machines behind one address. Only in-use counts and the most
/// recent dial failure are tracked; exact server-side state is unknowable
/// from here.
pub struct ServerModel {
    address: Address,
    last_error: Mutex<Option<Instant>>,
    active: Arc<ActiveSet>,
}

impl ServerModel {
    fn new(address: Address) -> Self {
        Self {
            address,
            last_error: Mutex::new(None),
            active: Arc::new(ActiveSet::default()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Most recent exhausted-retry dial failure; `None` when the endpoint
    /// has never failed.
    pub fn last_error(&self) -> Option<Instant> {
        match self.last_error.lock() {
            Ok(slot) => *slot,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Stamp the failure clock. Only ever moves forward: the stamp is always
    /// `Instant::now()`.
    pub fn record_failure(&self) {
        let mut slot = match self.last_error.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Instant::now());
    }

    pub fn active(&self) -> &Arc<ActiveSet> {
        &self.active
    }

    /// Number of transports currently checked out against this endpoint.
    pub fn in_use(&self) -> usize {
        self.active.len()
    }
}

impl std::fmt::Debug for ServerModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerModel")
            .field("address", &self.address)
            .field("in_use", &self.in_use())
            .field("last_error_age", &self.last_error().map(|at| at.elapsed()))
            .finish()
    }
}

/// Address-keyed directory of server models; a lookup miss materializes a
/// fresh model with an empty active set and no failure history.
#[derive(Debug, Default)]
pub struct ServerModelDirectory {
    models: DashMap<Address, Arc<ServerModel>>,
}

impl ServerModelDirectory {
    pub fn get(&self, address: Address) -> Arc<ServerModel> {
        let entry = self
            .models
            .entry(address)
            .or_insert_with(|| Arc::new(ServerModel::new(address)));
        Arc::clone(entry.value())
    }

    /// Lookup without materializing.
    pub fn peek(&self, address: Address) -> Option<Arc<ServerModel>> {
        self.models.get(&address).map(|model| Arc::clone(&model))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn directory_materializes_on_miss() {
        let directory = ServerModelDirectory::default();
        assert!(directory.peek(addr(80)).is_none());

        let model = directory.get(addr(80));
        assert_eq!(model.address(), addr(80));
        assert_eq!(model.in_use(), 0);
        assert!(model.last_error().is_none());
        assert_eq!(directory.len(), 1);

        // Same model on repeat lookups.
        let again = directory.get(addr(80));
        assert!(Arc::ptr_eq(&model, &again));
    }

    #[test]
    fn failure_stamp_moves_forward() {
        let directory = ServerModelDirectory::default();
        let model = directory.get(addr(81));

        model.record_failure();
        let first = model.last_error().unwrap();
        model.record_failure();
        let second = model.last_error().unwrap();
        assert!(second >= first);
    }

    #[test]
    fn active_set_counts_by_id() {
        let set = ActiveSet::default();
        set.insert(7);
        set.insert(8);
        set.insert(7);
        assert_eq!(set.len(), 2);
        set.remove(7);
        set.remove(7);
        assert_eq!(set.len(), 1);
        assert!(set.contains(8));
    }
}
