use anyhow::{anyhow, Context, Result};
use openraft::SnapshotPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "RAFTKV_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: Option<String>,

    /// Gossip address; its host is also the RPC bind host.
    pub bind_addr: String,
    pub rpc_port: u16,
    pub advertise_host: Option<String>,

    pub data_dir: PathBuf,

    pub bootstrap: bool,
    pub start_join_addrs: Vec<String>,

    pub raft: RaftSettings,
    pub gossip: GossipSettings,
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
    pub heartbeat_interval_ms: Option<u64>,
    pub election_timeout_min_ms: Option<u64>,
    pub election_timeout_max_ms: Option<u64>,
    pub snapshot_threshold: u64,
    pub snapshot_retain: usize,
    pub apply_timeout_secs: u64,
    pub max_pool: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipSettings {
    pub interval_ms: u64,
    pub fanout: usize,
    pub failure_timeout_ms: u64,
    pub reap_timeout_secs: u64,
    pub join_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Mutual TLS on consensus connections.
    pub peer: bool,
    /// TLS on the client RPC surface.
    pub rpc: bool,
    /// Name to verify peer certificates against instead of the dialed host.
    pub server_name: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            bind_addr: "0.0.0.0:8401".to_string(),
            rpc_port: 8400,
            advertise_host: None,
            data_dir: PathBuf::from("/var/lib/raftkv"),
            bootstrap: false,
            start_join_addrs: Vec::new(),
            raft: RaftSettings::default(),
            gossip: GossipSettings::default(),
            tls: TlsSettings::default(),
        }
    }
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: None,
            election_timeout_min_ms: None,
            election_timeout_max_ms: None,
            snapshot_threshold: 5000,
            snapshot_retain: 3,
            apply_timeout_secs: 30,
            max_pool: 5,
        }
    }
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            fanout: 3,
            failure_timeout_ms: 5000,
            reap_timeout_secs: 30,
            join_timeout_secs: 5,
            reconcile_interval_secs: 10,
        }
    }
}

impl RaftSettings {
    /// Raft engine settings; timings left unset keep the engine defaults.
    pub fn to_raft_config(&self) -> openraft::Config {
        let mut config = crate::replicator::default_raft_config();
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval = ms;
        }
        if let Some(ms) = self.election_timeout_min_ms {
            config.election_timeout_min = ms;
        }
        if let Some(ms) = self.election_timeout_max_ms {
            config.election_timeout_max = ms;
        }
        config.snapshot_policy = SnapshotPolicy::LogsSinceLast(self.snapshot_threshold);
        config
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }
}

impl TlsSettings {
    pub fn enabled(&self) -> bool {
        self.peer || self.rpc
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {:?}", path))?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override fields from `RAFTKV_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

        if let Some(name) = var("NODE_NAME") {
            self.node_name = Some(name);
        }
        if let Some(addr) = var("BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(port) = var("RPC_PORT") {
            self.rpc_port = port
                .parse()
                .with_context(|| format!("invalid {}RPC_PORT {:?}", ENV_PREFIX, port))?;
        }
        if let Some(host) = var("ADVERTISE_HOST") {
            self.advertise_host = Some(host);
        }
        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = var("BOOTSTRAP") {
            self.bootstrap = parse_bool(&flag)
                .ok_or_else(|| anyhow!("invalid {}BOOTSTRAP {:?}", ENV_PREFIX, flag))?;
        }
        if let Some(addrs) = var("JOIN") {
            self.start_join_addrs = addrs
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    /// Configured name, else the host name, else a random id.
    pub fn effective_node_name(&self) -> String {
        self.node_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
        })
    }

    pub fn bind_host(&self) -> &str {
        self.bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.bind_addr)
    }

    pub fn rpc_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host(), self.rpc_port)
    }

    /// Host other nodes use to reach this one.
    pub fn advertise_host(&self) -> String {
        match &self.advertise_host {
            Some(host) => host.clone(),
            None => {
                let host = self.bind_host();
                if host == "0.0.0.0" || host == "::" || host == "[::]" || host.is_empty() {
                    "127.0.0.1".to_string()
                } else {
                    host.to_string()
                }
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
