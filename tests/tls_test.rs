use raftkv::config::TlsSettings;
use raftkv::mux::Mux;
use raftkv::replicator::{StreamLayer, RAFT_RPC};
use raftkv::tls::*;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn localhost() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn loopback() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

#[test]
fn test_common_name_of_node_and_ca() {
    let ca = CaCertificate::generate("prod").unwrap();
    let node_cert = ca.sign_node("db-7", &localhost(), &loopback()).unwrap();

    assert_eq!(common_name(&ca.cert_pem).unwrap(), "raftkv CA - prod");
    assert_eq!(common_name(&node_cert.cert_pem).unwrap(), "db-7");
}

#[test]
fn test_common_name_rejects_garbage() {
    assert!(common_name("not a certificate").is_err());

    let bogus = "-----BEGIN CERTIFICATE-----\naGVsbG8gd29ybGQ=\n-----END CERTIFICATE-----\n";
    assert!(common_name(bogus).is_err());
}

#[test]
fn test_ca_certificate_generate() {
    let ca = CaCertificate::generate("test-cluster").unwrap();
    assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
    assert_eq!(common_name(&ca.cert_pem).unwrap(), "raftkv CA - test-cluster");
}

#[test]
fn test_ca_certificate_save_load() {
    let temp_dir = TempDir::new().unwrap();
    let cert_path = temp_dir.path().join("ca.crt");
    let key_path = temp_dir.path().join("ca.key");

    let ca = CaCertificate::generate("test-cluster").unwrap();
    ca.save(&cert_path, &key_path).unwrap();

    let loaded = CaCertificate::load(&cert_path, &key_path).unwrap();
    assert_eq!(ca.cert_pem, loaded.cert_pem);

    // A reloaded CA still issues certificates clients accept.
    let node_cert = loaded.sign_node("node-1", &localhost(), &[]).unwrap();
    client_config(&node_cert, &ca.cert_pem).unwrap();
}

#[test]
fn test_ca_sign_node() {
    let ca = CaCertificate::generate("test-cluster").unwrap();
    let node_cert = ca.sign_node("node-1", &localhost(), &loopback()).unwrap();

    assert_eq!(node_cert.node_name, "node-1");
    assert!(node_cert.cert_pem.contains("BEGIN CERTIFICATE"));
    assert!(node_cert.key_pem.contains("BEGIN PRIVATE KEY"));
    assert!(!node_cert.cert_der().unwrap().as_ref().is_empty());
}

#[test]
fn test_sign_node_skips_invalid_sans() {
    let ca = CaCertificate::generate("test-cluster").unwrap();
    let node_cert = ca
        .sign_node(
            "node-1",
            &["node1.local".to_string(), "nödé.local".to_string()],
            &["127.0.0.1".to_string(), "not-an-ip".to_string()],
        )
        .unwrap();

    assert_eq!(common_name(&node_cert.cert_pem).unwrap(), "node-1");
}

#[test]
fn test_node_certificate_save_load() {
    let temp_dir = TempDir::new().unwrap();
    let cert_path = temp_dir.path().join("node.crt");
    let key_path = temp_dir.path().join("node.key");

    let ca = CaCertificate::generate("test-cluster").unwrap();
    let node_cert = ca.sign_node("node-1", &[], &[]).unwrap();
    node_cert.save(&cert_path, &key_path).unwrap();

    let loaded = NodeCertificate::load(&cert_path, &key_path).unwrap();
    assert_eq!(node_cert.cert_pem, loaded.cert_pem);
    assert_eq!(node_cert.key_pem, loaded.key_pem);
    assert_eq!(loaded.node_name, "node-1");
}

#[test]
fn test_server_and_client_configs() {
    let ca = CaCertificate::generate("test-cluster").unwrap();
    let node_cert = ca.sign_node("node-1", &localhost(), &[]).unwrap();

    server_config(&node_cert, &ca.cert_pem).unwrap();
    client_config(&node_cert, &ca.cert_pem).unwrap();
}

#[test]
fn test_tls_material_from_settings() {
    let temp_dir = TempDir::new().unwrap();
    let ca = CaCertificate::generate("test-cluster").unwrap();
    ca.save(temp_dir.path().join("ca.crt"), temp_dir.path().join("ca.key"))
        .unwrap();
    let node_cert = ca.sign_node("node-1", &localhost(), &loopback()).unwrap();
    node_cert
        .save(temp_dir.path().join("node-1.crt"), temp_dir.path().join("node-1.key"))
        .unwrap();

    let disabled = TlsSettings::default();
    assert!(TlsMaterial::from_settings(&disabled).unwrap().is_none());

    let missing = TlsSettings {
        peer: true,
        ..Default::default()
    };
    assert!(TlsMaterial::from_settings(&missing).is_err());

    let settings = TlsSettings {
        ca_file: Some(temp_dir.path().join("ca.crt")),
        cert_file: Some(temp_dir.path().join("node-1.crt")),
        key_file: Some(temp_dir.path().join("node-1.key")),
        peer: true,
        ..Default::default()
    };
    assert!(TlsMaterial::from_settings(&settings).unwrap().is_some());
}

#[tokio::test]
async fn test_stream_layer_mutual_tls() {
    let ca = CaCertificate::generate("test-cluster").unwrap();
    let node_cert = ca.sign_node("node-1", &localhost(), &loopback()).unwrap();
    let server_tls = server_config(&node_cert, &ca.cert_pem).unwrap();
    let client_tls = client_config(&node_cert, &ca.cert_pem).unwrap();

    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let addr = mux.local_addr().to_string();
    let raft_listener = mux.match_first_byte(RAFT_RPC);
    let _default = mux.any();
    mux.serve().unwrap();

    let layer = StreamLayer::new(raft_listener)
        .with_server_tls(server_tls)
        .with_client_tls(client_tls, None);
    assert!(layer.is_tls());

    let (accepted, dialed) = tokio::join!(layer.accept(), layer.dial(&addr, Duration::from_secs(5)));
    let (mut server_conn, _) = accepted.unwrap();
    let mut client_conn = dialed.unwrap();

    client_conn.write_all(b"ping").await.unwrap();
    client_conn.flush().await.unwrap();
    let mut buf = [0u8; 4];
    server_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    mux.close();
}

#[tokio::test]
async fn test_stream_layer_rejects_foreign_ca() {
    let ca = CaCertificate::generate("cluster-a").unwrap();
    let other_ca = CaCertificate::generate("cluster-b").unwrap();
    let node_cert = ca.sign_node("node-1", &localhost(), &loopback()).unwrap();
    let stranger = other_ca.sign_node("node-2", &localhost(), &loopback()).unwrap();

    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let addr = mux.local_addr().to_string();
    let raft_listener = mux.match_first_byte(RAFT_RPC);
    mux.serve().unwrap();

    let server = StreamLayer::new(raft_listener)
        .with_server_tls(server_config(&node_cert, &ca.cert_pem).unwrap());

    let stranger_layer = {
        let mut other_mux = Mux::bind("127.0.0.1:0").await.unwrap();
        let listener = other_mux.match_first_byte(RAFT_RPC);
        StreamLayer::new(listener)
            .with_client_tls(client_config(&stranger, &other_ca.cert_pem).unwrap(), None)
    };

    let (accepted, dialed) = tokio::join!(
        server.accept(),
        stranger_layer.dial(&addr, Duration::from_secs(5))
    );
    assert!(accepted.is_err() || dialed.is_err());

    mux.close();
}

#[tokio::test]
async fn test_stalled_handshake_does_not_hold_up_other_peers() {
    let ca = CaCertificate::generate("test-cluster").unwrap();
    let node_cert = ca.sign_node("node-1", &localhost(), &loopback()).unwrap();

    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let addr = mux.local_addr().to_string();
    let raft_listener = mux.match_first_byte(RAFT_RPC);
    mux.serve().unwrap();

    let layer = StreamLayer::new(raft_listener)
        .with_server_tls(server_config(&node_cert, &ca.cert_pem).unwrap())
        .with_client_tls(client_config(&node_cert, &ca.cert_pem).unwrap(), None);

    // Sends the marker, then never says anything else.
    let mut stalled = tokio::net::TcpStream::connect(&addr).await.unwrap();
    stalled.write_all(&[RAFT_RPC]).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), layer.accept_incoming())
        .await
        .unwrap()
        .unwrap();
    let pending = tokio::spawn(first.establish());

    let accept_next = async { layer.accept_incoming().await.unwrap().establish().await };
    let (accepted, dialed) = tokio::time::timeout(
        Duration::from_secs(3),
        async { tokio::join!(accept_next, layer.dial(&addr, Duration::from_secs(5))) },
    )
    .await
    .unwrap();
    let mut server_conn = accepted.unwrap();
    let mut client_conn = dialed.unwrap();

    client_conn.write_all(b"ping").await.unwrap();
    client_conn.flush().await.unwrap();
    let mut buf = [0u8; 4];
    server_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(stalled);
    let abandoned = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(abandoned.is_err());

    mux.close();
}
