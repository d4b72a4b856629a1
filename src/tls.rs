use crate::config::TlsSettings;
use anyhow::{anyhow, Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;

const ORGANIZATION: &str = "raftkv";

/// Certificate and key of one node, signed by the cluster CA. Used for
/// both the server and the client side of mutual TLS.
#[derive(Clone)]
pub struct NodeCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub node_name: String,
}

pub struct CaCertificate {
    key_pair: KeyPair,
    cn: String,
    pub cert_pem: String,
}

impl CaCertificate {
    fn make_ca_params(cn: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;
        params
    }

    pub fn generate(cluster: &str) -> Result<Self> {
        let cn = format!("raftkv CA - {}", cluster);
        let params = Self::make_ca_params(&cn);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            key_pair,
            cn,
            cert_pem: cert.pem(),
        })
    }

    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref())
            .with_context(|| format!("failed to read CA certificate {:?}", cert_path.as_ref()))?;
        let key_pem = std::fs::read_to_string(key_path.as_ref())
            .with_context(|| format!("failed to read CA key {:?}", key_path.as_ref()))?;
        let key_pair = KeyPair::from_pem(&key_pem)?;
        let cn = common_name(&cert_pem)?;

        Ok(Self {
            key_pair,
            cn,
            cert_pem,
        })
    }

    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, self.key_pair.serialize_pem())?;
        Ok(())
    }

    /// Issue a certificate valid for `node_name` plus the given host names
    /// and IP addresses, usable as both TLS server and client.
    pub fn sign_node(
        &self,
        node_name: &str,
        hostnames: &[String],
        ips: &[String],
    ) -> Result<NodeCertificate> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_name);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        let mut sans = vec![SanType::DnsName(node_name.try_into()?)];
        for hostname in hostnames {
            if let Ok(name) = hostname.as_str().try_into() {
                sans.push(SanType::DnsName(name));
            }
        }
        for ip in ips {
            if let Ok(addr) = ip.parse() {
                sans.push(SanType::IpAddress(addr));
            }
        }
        params.subject_alt_names = sans;

        let node_key = KeyPair::generate()?;

        // Same key and subject as the stored CA, so the issuer matches.
        let ca_cert = Self::make_ca_params(&self.cn).self_signed(&self.key_pair)?;
        let cert = params.signed_by(&node_key, &ca_cert, &self.key_pair)?;

        Ok(NodeCertificate {
            cert_pem: cert.pem(),
            key_pem: node_key.serialize_pem(),
            node_name: node_name.to_string(),
        })
    }
}

impl NodeCertificate {
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref())
            .with_context(|| format!("failed to read certificate {:?}", cert_path.as_ref()))?;
        let key_pem = std::fs::read_to_string(key_path.as_ref())
            .with_context(|| format!("failed to read key {:?}", key_path.as_ref()))?;
        let node_name = common_name(&cert_pem)?;

        Ok(Self {
            cert_pem,
            key_pem,
            node_name,
        })
    }

    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, &self.key_pem)?;
        Ok(())
    }

    pub fn cert_der(&self) -> Result<CertificateDer<'static>> {
        let pem = pem::parse(&self.cert_pem)?;
        Ok(CertificateDer::from(pem.contents().to_vec()))
    }

    pub fn key_der(&self) -> Result<PrivateKeyDer<'static>> {
        let pem = pem::parse(&self.key_pem)?;
        Ok(PrivateKeyDer::Pkcs8(pem.contents().to_vec().into()))
    }
}

pub fn common_name(pem_str: &str) -> Result<String> {
    let pem = pem::parse(pem_str)?;
    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents())
        .map_err(|e| anyhow!("failed to parse certificate: {:?}", e))?;

    for attr in cert.subject().iter_common_name() {
        if let Ok(cn) = attr.as_str() {
            return Ok(cn.to_string());
        }
    }

    Err(anyhow!("no CN found in certificate"))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(ca_cert_pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let ca_pem = pem::parse(ca_cert_pem)?;
    roots.add(CertificateDer::from(ca_pem.contents().to_vec()))?;
    Ok(roots)
}

/// Server side of mutual TLS: clients must present a certificate signed by
/// the cluster CA.
pub fn server_config(node_cert: &NodeCertificate, ca_cert_pem: &str) -> Result<Arc<ServerConfig>> {
    let provider = provider();
    let roots = Arc::new(root_store(ca_cert_pem)?);

    let client_verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
        .build()
        .map_err(|e| anyhow!("failed to build client verifier: {}", e))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(vec![node_cert.cert_der()?], node_cert.key_der()?)
        .map_err(|e| anyhow!("failed to build server config: {}", e))?;

    Ok(Arc::new(config))
}

pub fn client_config(node_cert: &NodeCertificate, ca_cert_pem: &str) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store(ca_cert_pem)?)
        .with_client_auth_cert(vec![node_cert.cert_der()?], node_cert.key_der()?)
        .map_err(|e| anyhow!("failed to build client config: {}", e))?;

    Ok(Arc::new(config))
}

/// TLS configs built from the node's configured certificate files.
pub struct TlsMaterial {
    pub server: Arc<ServerConfig>,
    pub client: Arc<ClientConfig>,
}

impl TlsMaterial {
    pub fn from_settings(settings: &TlsSettings) -> Result<Option<Self>> {
        if !settings.enabled() {
            return Ok(None);
        }
        let (Some(ca_file), Some(cert_file), Some(key_file)) =
            (&settings.ca_file, &settings.cert_file, &settings.key_file)
        else {
            return Err(anyhow!("tls enabled but ca_file, cert_file or key_file is missing"));
        };

        let ca_pem = std::fs::read_to_string(ca_file)
            .with_context(|| format!("failed to read CA certificate {:?}", ca_file))?;
        let node_cert = NodeCertificate::load(cert_file, key_file)?;

        Ok(Some(Self {
            server: server_config(&node_cert, &ca_pem)?,
            client: client_config(&node_cert, &ca_pem)?,
        }))
    }
}
