use raftkv::config::{NodeConfig, ENV_PREFIX};
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_defaults() {
    let config = NodeConfig::default();
    assert_eq!(config.bind_addr, "0.0.0.0:8401");
    assert_eq!(config.rpc_port, 8400);
    assert!(!config.bootstrap);
    assert!(config.start_join_addrs.is_empty());
    assert_eq!(config.rpc_bind_addr(), "0.0.0.0:8400");
    assert_eq!(config.advertise_host(), "127.0.0.1");
    assert!(!config.tls.enabled());

    let raft = config.raft.to_raft_config();
    assert_eq!(raft.heartbeat_interval, 500);
    assert_eq!(config.raft.apply_timeout().as_secs(), 30);
}

#[test]
fn test_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("raftkv.toml");

    let mut config = NodeConfig::default();
    config.node_name = Some("node-a".to_string());
    config.bootstrap = true;
    config.start_join_addrs = vec!["10.0.0.2:8401".to_string()];
    config.raft.heartbeat_interval_ms = Some(100);
    config.tls.peer = true;
    config.save(&path).unwrap();

    let loaded = NodeConfig::load(&path).unwrap();
    assert_eq!(loaded.node_name.as_deref(), Some("node-a"));
    assert!(loaded.bootstrap);
    assert_eq!(loaded.start_join_addrs, vec!["10.0.0.2:8401"]);
    assert_eq!(loaded.raft.to_raft_config().heartbeat_interval, 100);
    assert!(loaded.tls.enabled());
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("raftkv.toml");
    std::fs::write(&path, "rpc_port = 9000\n[gossip]\nfanout = 5\n").unwrap();

    let config = NodeConfig::load(&path).unwrap();
    assert_eq!(config.rpc_port, 9000);
    assert_eq!(config.gossip.fanout, 5);
    assert_eq!(config.gossip.interval_ms, 200);
    assert_eq!(config.bind_addr, "0.0.0.0:8401");
}

#[test]
fn test_load_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    assert!(NodeConfig::load(dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_env_overrides() {
    let mut config = NodeConfig::default();
    config
        .apply_env_from(env(&[
            ("NODE_NAME", "node-b"),
            ("BIND_ADDR", "10.1.1.1:7000"),
            ("RPC_PORT", "7001"),
            ("DATA_DIR", "/tmp/raftkv-b"),
            ("BOOTSTRAP", "yes"),
            ("JOIN", "10.1.1.2:7000, 10.1.1.3:7000,"),
        ]))
        .unwrap();

    assert_eq!(config.effective_node_name(), "node-b");
    assert_eq!(config.bind_host(), "10.1.1.1");
    assert_eq!(config.rpc_bind_addr(), "10.1.1.1:7001");
    assert_eq!(config.advertise_host(), "10.1.1.1");
    assert_eq!(config.data_dir, PathBuf::from("/tmp/raftkv-b"));
    assert!(config.bootstrap);
    assert_eq!(
        config.start_join_addrs,
        vec!["10.1.1.2:7000", "10.1.1.3:7000"]
    );
}

#[test]
fn test_empty_env_values_are_ignored() {
    let mut config = NodeConfig::default();
    config.node_name = Some("kept".to_string());
    config
        .apply_env_from(env(&[("NODE_NAME", ""), ("ADVERTISE_HOST", "node.example")]))
        .unwrap();

    assert_eq!(config.node_name.as_deref(), Some("kept"));
    assert_eq!(config.advertise_host(), "node.example");
}

#[test]
fn test_invalid_env_values() {
    let mut config = NodeConfig::default();
    assert!(config.apply_env_from(env(&[("RPC_PORT", "http")])).is_err());
    assert!(config.apply_env_from(env(&[("BOOTSTRAP", "maybe")])).is_err());
}

#[test]
fn test_generated_node_name() {
    let config = NodeConfig::default();
    assert!(!config.effective_node_name().is_empty());
}
