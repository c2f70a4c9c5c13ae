//! Root certificate authority and per-host leaf issuance.
//!
//! The root credential is loaded once at startup from two PEM files and is
//! never regenerated while the proxy runs. Leaf certificates are minted on
//! demand for each intercepted hostname and signed by the root key.

use crate::error::ProxyError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 365;
const ROOT_VALIDITY_DAYS: i64 = 3650;
const SERIAL_LEN: usize = 16;

/// The trusted signing pair. Owned exclusively by [`CertificateAuthority`].
pub struct RootCredential {
    cert_der: CertificateDer<'static>,
    // Re-signed copy of the root used only as rcgen's issuer handle; it
    // carries the on-disk subject and key, so signatures chain to the file.
    issuer: Certificate,
    key: KeyPair,
}

impl RootCredential {
    /// Accepts a PKCS#8 key or a PKCS#1 (`BEGIN RSA PRIVATE KEY`) RSA key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, ProxyError> {
        let key = root_key_pair(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| ProxyError::CaUnavailable(format!("Unparsable root certificate: {}", e)))?;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| ProxyError::CaUnavailable(format!("Root key does not fit certificate: {}", e)))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::CaUnavailable("No certificate found in root PEM".to_string()))?
            .map_err(|e| ProxyError::CaUnavailable(format!("Failed to read root certificate: {}", e)))?;

        Ok(Self {
            cert_der,
            issuer,
            key,
        })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

fn root_key_pair(key_pem: &str) -> Result<KeyPair, ProxyError> {
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| ProxyError::CaUnavailable(format!("Failed to read root private key: {}", e)))?
        .ok_or_else(|| ProxyError::CaUnavailable("No private key found in root key PEM".to_string()))?;

    let pkcs8 = match key {
        PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der().to_vec(),
        PrivateKeyDer::Pkcs1(der) => rsa_pkcs1_to_pkcs8(der.secret_pkcs1_der()),
        _ => {
            return Err(ProxyError::CaUnavailable(
                "Unsupported root key encoding, convert it with `openssl pkcs8 -topk8 -nocrypt`"
                    .to_string(),
            ));
        }
    };

    KeyPair::try_from(pkcs8.as_slice())
        .map_err(|e| ProxyError::CaUnavailable(format!("Unparsable root private key: {}", e)))
}

// AlgorithmIdentifier { rsaEncryption, NULL }
const RSA_ALGORITHM_ID: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// Wrap an RSAPrivateKey in a version 0 PrivateKeyInfo.
fn rsa_pkcs1_to_pkcs8(pkcs1: &[u8]) -> Vec<u8> {
    let mut info = vec![0x02, 0x01, 0x00];
    info.extend_from_slice(RSA_ALGORITHM_ID);
    info.extend(der_tlv(0x04, pkcs1));
    der_tlv(0x30, &info)
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

/// A signed leaf certificate and its private key for one hostname.
#[derive(Debug, Clone)]
pub struct LeafCredential {
    pub hostname: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial: Vec<u8>,
    cert_chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl LeafCredential {
    /// Leaf first, then the root, as presented during the handshake.
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        self.cert_chain.clone()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }
}

pub struct CertificateAuthority {
    root: RootCredential,
    leaf_validity: ChronoDuration,
    issued: AtomicU64,
}

impl CertificateAuthority {
    pub fn new(root: RootCredential) -> Self {
        Self {
            root,
            leaf_validity: ChronoDuration::days(DEFAULT_LEAF_VALIDITY_DAYS as i64),
            issued: AtomicU64::new(0),
        }
    }

    /// Load the root credential from PEM files. Missing or unparsable files
    /// yield [`ProxyError::CaUnavailable`].
    pub fn load(key_path: &Path, cert_path: &Path) -> Result<Self, ProxyError> {
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            ProxyError::CaUnavailable(format!("Cannot read {}: {}", key_path.display(), e))
        })?;
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            ProxyError::CaUnavailable(format!("Cannot read {}: {}", cert_path.display(), e))
        })?;

        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        info!("Root certificate loaded from {}", cert_path.display());
        Ok(ca)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, ProxyError> {
        Ok(Self::new(RootCredential::from_pem(cert_pem, key_pem)?))
    }

    pub fn with_leaf_validity_days(mut self, days: u32) -> Self {
        self.leaf_validity = ChronoDuration::days(days.max(1) as i64);
        self
    }

    pub fn root(&self) -> &RootCredential {
        &self.root
    }

    /// Number of leaf certificates signed so far.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Mint a leaf certificate for `hostname`, signed by the root key.
    pub fn issue_leaf(&self, hostname: &str) -> Result<LeafCredential, ProxyError> {
        let hostname = hostname.trim().trim_start_matches('[').trim_end_matches(']');
        if hostname.is_empty() {
            return Err(ProxyError::issuance(hostname, "empty hostname"));
        }

        let key_pair = KeyPair::generate().map_err(|e| ProxyError::issuance(hostname, e))?;

        let not_before = Utc::now();
        let not_after = not_before + self.leaf_validity;
        let serial = random_serial();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![subject_alt_name(hostname)?];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.not_before = to_offset(not_before).map_err(|e| ProxyError::issuance(hostname, e))?;
        params.not_after = to_offset(not_after).map_err(|e| ProxyError::issuance(hostname, e))?;
        params.use_authority_key_identifier_extension = true;

        let cert = params
            .signed_by(&key_pair, &self.root.issuer, &self.root.key)
            .map_err(|e| ProxyError::issuance(hostname, e))?;

        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!("Issued leaf certificate for {} (serial {})", hostname, hex(&serial));

        Ok(LeafCredential {
            hostname: hostname.to_string(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            not_before,
            not_after,
            serial,
            cert_chain: vec![cert.der().clone(), self.root.cert_der.clone()],
            key_der: key_pair.serialize_der(),
        })
    }
}

/// PEM material for a freshly generated self-signed root.
pub struct GeneratedRoot {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Create a self-signed root suitable for signing leaf certificates.
pub fn generate_root(common_name: &str) -> Result<GeneratedRoot, ProxyError> {
    let key = KeyPair::generate().map_err(|e| ProxyError::CaUnavailable(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Splice Proxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from_slice(&random_serial()));

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key)
        .map_err(|e| ProxyError::CaUnavailable(e.to_string()))?;

    Ok(GeneratedRoot {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Write a new root to disk when either file is missing. Returns whether a
/// root was generated.
pub fn ensure_root_files(cert_path: &Path, key_path: &Path) -> Result<bool, ProxyError> {
    if cert_path.exists() && key_path.exists() {
        return Ok(false);
    }

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }

    let root = generate_root("Splice Proxy Root CA")?;
    std::fs::write(cert_path, &root.cert_pem)?;
    write_private_key(key_path, &root.key_pem)?;

    info!("Generated root certificate at {}", cert_path.display());
    Ok(true)
}

#[cfg(unix)]
fn write_private_key(path: &Path, pem: &str) -> Result<(), ProxyError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, pem: &str) -> Result<(), ProxyError> {
    std::fs::write(path, pem)?;
    Ok(())
}

fn subject_alt_name(hostname: &str) -> Result<SanType, ProxyError> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let dns = Ia5String::try_from(hostname.to_string())
        .map_err(|e| ProxyError::issuance(hostname, e))?;
    Ok(SanType::DnsName(dns))
}

fn random_serial() -> Vec<u8> {
    let mut serial = vec![0u8; SERIAL_LEN];
    rand::thread_rng().fill_bytes(&mut serial);
    // positive and without a leading zero octet
    serial[0] = (serial[0] & 0x7f) | 0x01;
    serial
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime, time::error::ComponentRange> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
