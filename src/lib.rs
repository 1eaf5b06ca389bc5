// uplink - client-side outbound connection manager for named upstream services
//
// The main entry point is ConnectionManager::get_connection(), which promptly
// either returns a live transport or fails with an UplinkError. Along the way
// it provides name resolution, transient markdown of failing endpoints,
// socket throttling, per-endpoint timeouts, and credential handling.

pub mod config;
pub mod context;
pub mod credential;
pub mod manager;
pub mod pool;
pub mod resolve;
pub mod telemetry;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, EndpointConfig, OpsConfig};
pub use context::Context;
pub use credential::{Credential, CredentialKey, CredentialSpec};
pub use manager::{
    ConnectionManager, ManagerSettings, Target, TRANSIENT_MARKDOWN_DURATION,
};
pub use pool::{PoolSettings, PoolStats, SockPool, SurplusEviction};
pub use resolve::{Address, AddressGroup};
pub use transport::MonitoredTransport;
pub use utils::error::{Result, UplinkError};
pub use utils::system::{default_max_connections, FALLBACK_MAX_CONNECTIONS};
