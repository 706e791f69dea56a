//! CA material and per-host leaf certificate forging.
//!
//! Leaves chain to the configured CA and carry fixed fields: validity from
//! the epoch through 2049-12-31, a 20-byte random serial, and a SAN per
//! requested host (IP-parseable hosts as IP SANs, the rest as DNS SANs).
//! The serial bytes double as the seed of the deterministic CSPRNG that
//! generates the leaf key, so key material is reproducible per CA and
//! seed while every fresh mint still gets a fresh identity.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use p256::pkcs8::DecodePrivateKey as _;
use p256::pkcs8::EncodePrivateKey as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs1::EncodeRsaPrivateKey as _;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::info;

use super::error::{MitmError, Result};
use super::rand::CounterRng;

const LEAF_ORGANIZATION: &str = "Internet Widgits Pty Ltd";
const SERIAL_LEN: usize = 20;
const RSA_LEAF_BITS: usize = 2048;

/// The CA private key, either RSA or EC P-256. Any other key type is
/// rejected at load time.
#[derive(Debug)]
pub enum CaKey {
    Rsa(RsaPrivateKey),
    Ecdsa(p256::SecretKey),
}

impl CaKey {
    /// Serialize the way the CSPRNG key derivation expects: PKCS#1 for
    /// RSA, SEC1 for EC.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        match self {
            CaKey::Rsa(key) => Ok(key
                .to_pkcs1_der()
                .map_err(|e| MitmError::KeyMarshal(e.to_string()))?
                .as_bytes()
                .to_vec()),
            CaKey::Ecdsa(key) => Ok(key
                .to_sec1_der()
                .map_err(|e| MitmError::KeyMarshal(e.to_string()))?
                .to_vec()),
        }
    }

    fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let doc = match self {
            CaKey::Rsa(key) => rsa::pkcs8::EncodePrivateKey::to_pkcs8_der(key),
            CaKey::Ecdsa(key) => key.to_pkcs8_der(),
        };
        Ok(doc
            .map_err(|e| MitmError::KeyMarshal(e.to_string()))?
            .as_bytes()
            .to_vec())
    }
}

/// Immutable CA certificate + private key, loaded once at startup and
/// shared read-only with the forge.
pub struct CaMaterial {
    cert_der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
    key: CaKey,
}

impl fmt::Debug for CaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.key {
            CaKey::Rsa(_) => "rsa",
            CaKey::Ecdsa(_) => "ecdsa-p256",
        };
        f.debug_struct("CaMaterial").field("key", &kind).finish()
    }
}

impl CaMaterial {
    /// Load CA material from PEM-encoded certificate and private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = parse_ca_key_pem(key_pem)?;
        let pkcs8 = key.to_pkcs8_der()?;
        let key_pair = KeyPair::try_from(pkcs8.as_slice())
            .map_err(|e| MitmError::CaParse(format!("CA key not usable for signing: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| MitmError::CaParse(format!("failed to parse CA certificate: {e}")))?;
        let cert_der = first_cert_der(cert_pem)?;
        Ok(Self {
            cert_der,
            issuer,
            key,
        })
    }

    /// Load CA material from PEM files on disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Generate an ephemeral self-signed P-256 CA. Used when MITM is
    /// enabled without configured CA files.
    pub fn generate() -> Result<Self> {
        info!("no CA configured, generating an ephemeral P-256 CA");
        let secret = p256::SecretKey::random(&mut OsRng);
        let pkcs8 = secret
            .to_pkcs8_der()
            .map_err(|e| MitmError::KeyMarshal(e.to_string()))?;
        let key_pair = KeyPair::try_from(pkcs8.as_bytes())
            .map_err(|e| MitmError::CaParse(format!("generated key not usable: {e}")))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "slimprox");
        dn.push(DnType::CommonName, "slimprox ephemeral CA");
        params.distinguished_name = dn;
        params.not_before = date_time_ymd(2024, 1, 1);
        params.not_after = date_time_ymd(2049, 12, 31);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| MitmError::CaParse(format!("failed to self-sign CA: {e}")))?;
        let cert_pem = cert.pem();
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| MitmError::CaParse(format!("failed to build issuer: {e}")))?;
        Ok(Self {
            cert_der,
            issuer,
            key: CaKey::Ecdsa(secret),
        })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn key(&self) -> &CaKey {
        &self.key
    }

    fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

/// A forged leaf: DER chain `[leaf, ca]` plus the leaf private key, ready
/// to hand to the TLS server layer.
pub struct ForgedCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl fmt::Debug for ForgedCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForgedCert")
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl ForgedCert {
    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }
}

/// Mint a leaf certificate for `hosts`, signed by `ca`.
///
/// The 20 serial bytes come from the OS RNG and seed the deterministic
/// CSPRNG that generates the leaf key: RSA-2048 when the CA key is RSA,
/// P-256 when it is EC.
pub fn sign_host(ca: &CaMaterial, hosts: &[&str]) -> Result<ForgedCert> {
    let first_host = *hosts
        .first()
        .ok_or_else(|| MitmError::cert_generation("", "no hosts requested"))?;

    let mut serial = [0u8; SERIAL_LEN];
    OsRng
        .try_fill_bytes(&mut serial)
        .map_err(|e| MitmError::Rng(e.to_string()))?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));
    params.not_before = date_time_ymd(1970, 1, 1);
    params.not_after = date_time_ymd(2049, 12, 31);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    let mut cn_set = false;
    for host in hosts {
        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            let dns_name = (*host)
                .try_into()
                .map_err(|_| MitmError::cert_generation(*host, "host is not a valid DNS name"))?;
            params.subject_alt_names.push(SanType::DnsName(dns_name));
            if !cn_set {
                dn.push(DnType::CommonName, *host);
                cn_set = true;
            }
        }
    }
    params.distinguished_name = dn;

    let mut csprng = CounterRng::from_ca_key(ca.key(), &serial)?;
    let leaf_pkcs8: Vec<u8> = match ca.key() {
        CaKey::Rsa(_) => {
            let key = RsaPrivateKey::new(&mut csprng, RSA_LEAF_BITS)
                .map_err(|e| MitmError::cert_generation(first_host, e.to_string()))?;
            rsa::pkcs8::EncodePrivateKey::to_pkcs8_der(&key)
                .map_err(|e| MitmError::KeyMarshal(e.to_string()))?
                .as_bytes()
                .to_vec()
        }
        CaKey::Ecdsa(_) => {
            let key = p256::SecretKey::random(&mut csprng);
            key.to_pkcs8_der()
                .map_err(|e| MitmError::KeyMarshal(e.to_string()))?
                .as_bytes()
                .to_vec()
        }
    };
    let leaf_key = KeyPair::try_from(leaf_pkcs8.as_slice())
        .map_err(|e| MitmError::cert_generation(first_host, e.to_string()))?;

    let cert = params
        .signed_by(&leaf_key, ca.issuer())
        .map_err(|e| MitmError::cert_generation(first_host, e.to_string()))?;

    Ok(ForgedCert {
        chain: vec![
            CertificateDer::from(cert.der().to_vec()),
            ca.cert_der().clone(),
        ],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_pkcs8)),
    })
}

/// Parse a PEM private key into a [`CaKey`], rejecting unsupported types.
fn parse_ca_key_pem(key_pem: &str) -> Result<CaKey> {
    let mut reader = key_pem.as_bytes();
    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| MitmError::CaParse(format!("bad key PEM: {e}")))?;
        match item {
            rustls_pemfile::Item::Pkcs1Key(der) => {
                let key = RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
                    .map_err(|e| MitmError::CaParse(format!("bad RSA key: {e}")))?;
                return Ok(CaKey::Rsa(key));
            }
            rustls_pemfile::Item::Sec1Key(der) => {
                let key = p256::SecretKey::from_sec1_der(der.secret_sec1_der())
                    .map_err(|e| MitmError::CaParse(format!("bad EC key: {e}")))?;
                return Ok(CaKey::Ecdsa(key));
            }
            rustls_pemfile::Item::Pkcs8Key(der) => {
                if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der()) {
                    return Ok(CaKey::Rsa(key));
                }
                if let Ok(key) = p256::SecretKey::from_pkcs8_der(der.secret_pkcs8_der()) {
                    return Ok(CaKey::Ecdsa(key));
                }
                return Err(MitmError::UnsupportedKeyType(
                    "PKCS#8 key is neither RSA nor P-256".to_string(),
                ));
            }
            _ => continue,
        }
    }
    Err(MitmError::CaParse("no private key found in PEM".to_string()))
}

fn first_cert_der(cert_pem: &str) -> Result<CertificateDer<'static>> {
    let mut reader = cert_pem.as_bytes();
    let result = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| MitmError::CaParse("no certificate found in PEM".to_string()))?
        .map_err(|e| MitmError::CaParse(format!("bad certificate PEM: {e}")));
    result
}
