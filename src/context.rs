//! Ambient collaborators for a connection manager: the address-group
//! registry, its reverse map, the ops-config snapshot, the default
//! credential, and telemetry handles. Held explicitly, never as a global.

use crate::config::{Config, EndpointConfig, OpsConfig};
use crate::credential::Credential;
use crate::resolve::{Address, AddressGroup};
use crate::telemetry::Telemetry;
use crate::utils::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct Context {
    address_groups: RwLock<HashMap<String, AddressGroup>>,
    revmap: RwLock<HashMap<Address, String>>,
    ops_config: RwLock<OpsConfig>,
    default_credential: RwLock<Option<Arc<Credential>>>,
    pub telemetry: Telemetry,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            address_groups: RwLock::new(HashMap::new()),
            revmap: RwLock::new(HashMap::new()),
            ops_config: RwLock::new(OpsConfig::default()),
            default_credential: RwLock::new(None),
            telemetry: Telemetry::new(),
        })
    }

    /// Build a context from a validated configuration snapshot.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        config.validate()?;
        let context = Context::new();
        context.set_ops_config(config.endpoints.clone());
        for (name, group) in &config.groups {
            context.insert_address_group(name.clone(), group.address_group()?);
        }
        Ok(context)
    }

    /// Register (or replace) the address group for a logical name. The
    /// group's addresses also feed the reverse map used to recover a name
    /// from a raw address.
    pub fn insert_address_group(&self, name: impl Into<String>, group: AddressGroup) {
        let name = name.into();
        {
            let mut revmap = match self.revmap.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            revmap.retain(|_, owner| *owner != name);
            for address in group.addresses() {
                revmap.insert(address, name.clone());
            }
        }
        let mut groups = match self.address_groups.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        groups.insert(name, group);
    }

    pub fn remove_address_group(&self, name: &str) {
        {
            let mut revmap = match self.revmap.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            revmap.retain(|_, owner| owner != name);
        }
        let mut groups = match self.address_groups.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        groups.remove(name);
    }

    pub fn address_group(&self, name: &str) -> Option<AddressGroup> {
        let groups = match self.address_groups.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        groups.get(name).cloned()
    }

    /// Logical name for a raw address, when one of the registered groups
    /// contains it. Used only for config and telemetry keying.
    pub fn name_for(&self, address: &Address) -> Option<String> {
        let revmap = match self.revmap.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        revmap.get(address).cloned()
    }

    /// Fresh endpoint parameters; consulted on every acquire so a config
    /// swap takes effect immediately.
    pub fn endpoint_config(&self, name: Option<&str>) -> EndpointConfig {
        let ops_config = match self.ops_config.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ops_config.get_endpoint_config(name)
    }

    pub fn set_ops_config(&self, ops_config: OpsConfig) {
        let mut slot = match self.ops_config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = ops_config;
    }

    pub fn default_credential(&self) -> Option<Arc<Credential>> {
        let slot = match self.default_credential.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
    }

    pub fn set_default_credential(&self, credential: Option<Arc<Credential>>) {
        let mut slot = match self.default_credential.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = credential;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups = match self.address_groups.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        f.debug_struct("Context")
            .field("address_groups", &groups)
            .finish_non_exhaustive()
    }
}
