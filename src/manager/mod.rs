//! Top-level orchestrator turning a logical upstream name into a live,
//! pooled, timeout-configured, optionally TLS-wrapped transport.
//!
//! All services of the crate compose here: name resolution, transient
//! markdown, socket throttling, per-acquire timeouts, and credentials.
//! Routing every outbound connection through one manager also keeps future
//! changes (fallback schemes, address multiplexing) in one place.

pub mod server_model;

use crate::config::{Config, EndpointConfig};
use crate::context::Context;
use crate::credential::{Credential, CredentialKey, CredentialSpec};
use crate::pool::{PoolSettings, PoolStats, SockPool};
use crate::resolve::{Address, AddressGroup};
use crate::telemetry::EventSeverity;
use crate::transport::monitored::kill;
use crate::transport::{dial, MonitoredTransport, Transport};
use crate::utils::error::{Result, UplinkError};
use crate::utils::system;
use serde_json::json;
use self::server_model::ServerModelDirectory;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How long an endpoint stays excluded after dial retries exhaust.
pub const TRANSIENT_MARKDOWN_DURATION: Duration = Duration::from_secs(10);

/// Tuning for one connection manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Cap on in-use transports across all candidates of one acquire.
    pub max_connections: usize,
    pub markdown_duration: Duration,
    /// Template for the per-credential idle pools.
    pub pool: PoolSettings,
    /// Keepalive period for dialed streams; `None` disables it.
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_connections: system::default_max_connections(),
            markdown_duration: TRANSIENT_MARKDOWN_DURATION,
            pool: PoolSettings::default(),
            tcp_keepalive: None,
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: if config.manager.max_connections == 0 {
                system::default_max_connections()
            } else {
                config.manager.max_connections
            },
            markdown_duration: Duration::from_millis(config.manager.markdown_duration_ms),
            pool: config.pool.settings(),
            tcp_keepalive: config.manager.tcp_keepalive_secs.map(Duration::from_secs),
        }
    }
}

/// What to connect to: a logical name resolved through the context, or an
/// already-resolved address.
#[derive(Debug, Clone)]
pub enum Target {
    Name(String),
    Addr(Address),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

impl From<Address> for Target {
    fn from(address: Address) -> Self {
        Target::Addr(address)
    }
}

impl From<SocketAddr> for Target {
    fn from(address: SocketAddr) -> Self {
        Target::Addr(Address::from(address))
    }
}

struct PoolSlot {
    /// `None` marks the anonymous sentinel slot, which never expires.
    owner: Option<Weak<Credential>>,
    pool: Arc<SockPool>,
}

/// Credential-keyed pool table.
///
/// Identity keys are pointer-derived, so every lookup first prunes slots
/// whose credential has been dropped; a reused allocation can then never
/// alias a dead credential's pool, and credential lifetime drives pool
/// lifetime.
struct PoolTable {
    settings: PoolSettings,
    slots: Mutex<HashMap<CredentialKey, PoolSlot>>,
}

impl PoolTable {
    fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CredentialKey, PoolSlot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pool_for(&self, key: CredentialKey, owner: Option<&Arc<Credential>>) -> Arc<SockPool> {
        let mut slots = self.lock();
        prune(&mut slots);
        let slot = slots.entry(key).or_insert_with(|| PoolSlot {
            owner: owner.map(Arc::downgrade),
            pool: Arc::new(SockPool::new(self.settings.clone())),
        });
        Arc::clone(&slot.pool)
    }

    fn existing(&self, key: CredentialKey) -> Option<Arc<SockPool>> {
        let mut slots = self.lock();
        prune(&mut slots);
        slots.get(&key).map(|slot| Arc::clone(&slot.pool))
    }
}

fn prune(slots: &mut HashMap<CredentialKey, PoolSlot>) {
    slots.retain(|_, slot| {
        slot.owner
            .as_ref()
            .map_or(true, |weak| weak.strong_count() > 0)
    });
}

/// Public entry point for outbound connections.
pub struct ConnectionManager {
    context: Arc<Context>,
    settings: ManagerSettings,
    server_models: ServerModelDirectory,
    pools: PoolTable,
}

impl ConnectionManager {
    pub fn new(context: Arc<Context>) -> Self {
        Self::with_settings(context, ManagerSettings::default())
    }

    pub fn with_settings(context: Arc<Context>, settings: ManagerSettings) -> Self {
        Self {
            context,
            pools: PoolTable::new(settings.pool.clone()),
            settings,
            server_models: ServerModelDirectory::default(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn server_models(&self) -> &ServerModelDirectory {
        &self.server_models
    }

    /// Idle-pool snapshot for one credential identity.
    pub fn pool_stats(&self, key: CredentialKey) -> Option<PoolStats> {
        self.pools.existing(key).map(|pool| pool.stats())
    }

    /// Resolve `target`, enforce limits, and return a transport with the
    /// endpoint's response timeout already applied.
    ///
    /// With a single candidate the underlying dial or handshake error is
    /// propagated verbatim; with several, every candidate is tried in
    /// weighted tier order and a combined failure is returned only when all
    /// of them fail.
    pub async fn get_connection(
        &self,
        target: impl Into<Target>,
        credential: CredentialSpec,
    ) -> Result<MonitoredTransport> {
        let (name, group) = match target.into() {
            Target::Name(name) => match self.context.address_group(&name) {
                Some(group) => (Some(name), group),
                None => return Err(UplinkError::NameNotFound(name)),
            },
            Target::Addr(address) => {
                (self.context.name_for(&address), AddressGroup::single(address))
            }
        };
        let endpoint = self.context.endpoint_config(name.as_deref());

        let in_use: usize = group
            .addresses()
            .map(|address| self.server_models.get(address).in_use())
            .sum();
        if in_use >= self.settings.max_connections {
            let label = name.as_deref().unwrap_or("-");
            self.context.telemetry.tick("net.out_of_sockets");
            self.context
                .telemetry
                .tick(&format!("net.out_of_sockets.{label}"));
            return Err(UplinkError::OutOfSockets {
                name: label.to_string(),
                in_use,
            });
        }

        let ordering = group.attempt_order();
        let single_candidate = ordering.len() == 1;
        let mut failures = Vec::new();
        for address in ordering {
            match self
                .connect_to_address(name.as_deref(), &credential, &endpoint, address)
                .await
            {
                Ok(transport) => return Ok(transport),
                Err(err) if single_candidate => return Err(err),
                Err(err) => {
                    debug!(%address, error = %err, "connect candidate failed");
                    failures.push((address, err));
                }
            }
        }
        Err(UplinkError::MultiConnectFailure(failures))
    }

    async fn connect_to_address(
        &self,
        name: Option<&str>,
        credential: &CredentialSpec,
        endpoint: &EndpointConfig,
        address: Address,
    ) -> Result<MonitoredTransport> {
        let model = self.server_models.get(address);

        let credential = match credential {
            CredentialSpec::None => None,
            CredentialSpec::Ambient => self.context.default_credential(),
            CredentialSpec::Explicit(credential) => Some(Arc::clone(credential)),
        };
        let key = credential
            .as_ref()
            .map(Credential::key)
            .unwrap_or(CredentialKey::Anonymous);
        let pool = self.pools.pool_for(key, credential.as_ref());

        if let Some(mut transport) = pool.acquire(&address) {
            transport.set_timeout(endpoint.response_timeout());
            debug!(%address, id = transport.id(), "reusing pooled connection");
            return Ok(transport);
        }

        if endpoint.transient_markdown_enabled {
            if let Some(last_error) = model.last_error() {
                if last_error.elapsed() < self.settings.markdown_duration {
                    trace!(%address, "endpoint is inside its markdown window");
                    return Err(UplinkError::MarkedDown(address));
                }
            }
        }

        let mut failed: u32 = 0;
        let stream = loop {
            trace!(%address, attempt = failed + 1, "dialing");
            match dial(
                &address,
                endpoint.connect_timeout(),
                self.settings.tcp_keepalive,
            )
            .await
            {
                Ok(stream) => break stream,
                Err(err) => {
                    if failed >= endpoint.max_connect_retry {
                        model.record_failure();
                        if endpoint.transient_markdown_enabled {
                            let label = name.unwrap_or("-");
                            self.context.telemetry.tick("net.markdowns");
                            self.context
                                .telemetry
                                .tick(&format!("net.markdowns.{label}.{address}"));
                            self.context.telemetry.event(
                                EventSeverity::Error,
                                "TMARKDOWN",
                                2,
                                json!({ "name": label, "addr": address.to_string() }),
                            );
                            warn!(%address, name = label, "marking endpoint down");
                        }
                        return Err(UplinkError::Io(err));
                    }
                    failed += 1;
                }
            }
        };

        let transport = match &credential {
            Some(credential) => Transport::Tls(Box::new(credential.wrap(stream, &address).await?)),
            None => Transport::Plain(stream),
        };
        let mut transport = MonitoredTransport::register(transport, model.active(), key);
        transport.set_timeout(endpoint.response_timeout());
        debug!(%address, id = transport.id(), "opened connection");
        Ok(transport)
    }

    /// Return a transport to its credential's pool. The pool decides whether
    /// it is retained; a transport whose credential is already gone is
    /// closed instead.
    pub fn release_connection(&self, transport: MonitoredTransport) {
        match self.pools.existing(transport.identity()) {
            Some(pool) => pool.release(transport),
            None => {
                debug!(id = transport.id(), "releasing transport with no surviving pool");
                kill(transport);
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("max_connections", &self.settings.max_connections)
            .field("server_models", &self.server_models.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_config() -> Arc<rustls::ClientConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let roots = rustls::RootCertStore::empty();
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    #[test]
    fn pool_table_prunes_dead_credentials() {
        let table = PoolTable::new(PoolSettings::default());
        let credential = Credential::new(bare_config());
        let key = Credential::key(&credential);

        let pool = table.pool_for(key, Some(&credential));
        let same = table.existing(key).unwrap();
        assert!(Arc::ptr_eq(&pool, &same));

        drop(credential);
        assert!(table.existing(key).is_none());
    }

    #[test]
    fn anonymous_slot_never_expires() {
        let table = PoolTable::new(PoolSettings::default());
        let pool = table.pool_for(CredentialKey::Anonymous, None);
        let same = table.existing(CredentialKey::Anonymous).unwrap();
        assert!(Arc::ptr_eq(&pool, &same));
    }

    #[test]
    fn target_conversions() {
        assert!(matches!(Target::from("pay"), Target::Name(_)));
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert!(matches!(Target::from(addr), Target::Addr(_)));
    }
}
