use crate::pool::{
    PoolSettings, SurplusEviction, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_IDLE_PER_ADDR,
    DEFAULT_MAX_IDLE_TOTAL,
};
use crate::resolve::{Address, AddressGroup};
use crate::utils::error::{Result, UplinkError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub endpoints: OpsConfig,
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_idle_per_addr")]
    pub max_idle_per_addr: usize,
    #[serde(default = "default_max_idle_total")]
    pub max_idle_total: usize,
    #[serde(default = "default_eviction")]
    pub eviction: SurplusEviction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Process-wide cap on in-use outbound connections. Zero derives the cap
    /// from the file-descriptor soft limit.
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default = "default_markdown_duration_ms")]
    pub markdown_duration_ms: u64,
    /// TCP keepalive period for dialed streams; absent disables keepalive.
    #[serde(default)]
    pub tcp_keepalive_secs: Option<u64>,
}

/// Per-endpoint operational parameters, keyed by logical name with a
/// fallback for unknown endpoints. This is the ops-config surface consulted
/// on every acquire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpsConfig {
    #[serde(default)]
    pub default: EndpointConfig,
    #[serde(default)]
    pub named: HashMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-operation deadline applied to handed-out transports. Zero
    /// disables the deadline.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Additional dial attempts after the first failure.
    #[serde(default = "default_max_connect_retry")]
    pub max_connect_retry: u32,
    #[serde(default)]
    pub transient_markdown_enabled: bool,
}

/// Declarative address group: tiers of weighted members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub tiers: Vec<Vec<GroupMember>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

// Default values
fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_millis() as u64
}

fn default_max_idle_per_addr() -> usize {
    DEFAULT_MAX_IDLE_PER_ADDR
}

fn default_max_idle_total() -> usize {
    DEFAULT_MAX_IDLE_TOTAL
}

fn default_eviction() -> SurplusEviction {
    SurplusEviction::Freshest
}

fn default_markdown_duration_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_max_connect_retry() -> u32 {
    2
}

fn default_weight() -> f64 {
    1.0
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            max_idle_per_addr: default_max_idle_per_addr(),
            max_idle_total: default_max_idle_total(),
            eviction: default_eviction(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            markdown_duration_ms: default_markdown_duration_ms(),
            tcp_keepalive_secs: None,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            max_connect_retry: default_max_connect_retry(),
            transient_markdown_enabled: false,
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_idle_per_addr: self.max_idle_per_addr,
            max_idle_total: self.max_idle_total,
            per_addr_caps: HashMap::new(),
            eviction: self.eviction,
        }
    }
}

impl OpsConfig {
    /// Endpoint parameters for `name`, falling back to the default section
    /// when the name is unknown or absent.
    pub fn get_endpoint_config(&self, name: Option<&str>) -> EndpointConfig {
        name.and_then(|name| self.named.get(name))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl EndpointConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        (self.response_timeout_ms > 0).then(|| Duration::from_millis(self.response_timeout_ms))
    }
}

impl GroupConfig {
    pub fn address_group(&self) -> Result<AddressGroup> {
        AddressGroup::new(
            self.tiers
                .iter()
                .map(|tier| {
                    tier.iter()
                        .map(|member| (member.weight, Address::new(member.ip, member.port)))
                        .collect()
                })
                .collect(),
        )
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| UplinkError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| UplinkError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_idle_per_addr == 0 {
            return Err(UplinkError::Config(
                "pool.max_idle_per_addr must be at least 1".to_string(),
            ));
        }
        if self.pool.max_idle_total == 0 {
            return Err(UplinkError::Config(
                "pool.max_idle_total must be at least 1".to_string(),
            ));
        }
        if self.manager.markdown_duration_ms == 0 {
            return Err(UplinkError::Config(
                "manager.markdown_duration_ms must be at least 1".to_string(),
            ));
        }

        for (name, group) in &self.groups {
            group.address_group().map_err(|e| {
                UplinkError::Config(format!("invalid address group '{}': {}", name, e))
            })?;
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
idle_timeout_ms = 250
max_idle_per_addr = 50
max_idle_total = 800
eviction = "freshest"  # Options: "freshest", "stalest"

[manager]
max_connections = 0  # 0 derives the cap from the fd soft limit
markdown_duration_ms = 10000
# tcp_keepalive_secs = 30

[endpoints.default]
connect_timeout_ms = 5000
response_timeout_ms = 30000
max_connect_retry = 2
transient_markdown_enabled = false

[endpoints.named.paymentserv]
connect_timeout_ms = 2000
response_timeout_ms = 10000
max_connect_retry = 1
transient_markdown_enabled = true

[groups.paymentserv]
tiers = [
    [
        { ip = "10.0.1.10", port = 8080, weight = 2.0 },
        { ip = "10.0.1.11", port = 8080, weight = 1.0 },
    ],
    [
        { ip = "10.1.1.10", port = 8080 },
    ],
]
"#;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| UplinkError::Config(format!("Failed to write example config: {}", e)))?;

        Ok(())
    }
}
