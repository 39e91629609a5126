use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509NameBuilder, X509Builder, X509};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{Error, Result};

/// Leaf certificate issued for one hostname. Never replaced once cached.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub hostname: String,
    pub cert: X509,
    pub key: PKey<Private>,
    pub ca_cert: X509,
}

type CertSlot = Arc<OnceCell<Arc<CertificateRecord>>>;

/// Signs per-host leaf certificates with a CA key pair supplied by the caller.
#[derive(Clone)]
pub struct CertificateAuthority {
    inner: Arc<CaInner>,
}

struct CaInner {
    cert: X509,
    key: PKey<Private>,
    leaf_key: PKey<Private>,
    cache: Mutex<HashMap<String, CertSlot>>,
    generated: AtomicUsize,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.inner.cert.subject_name())
            .field("generated", &self.generation_count())
            .finish()
    }
}

impl CertificateAuthority {
    pub fn new(cert: X509, key: PKey<Private>) -> Result<Self> {
        // Leaf certificates share one key pair; only the signed certificate differs per host.
        let leaf_key = PKey::from_rsa(Rsa::generate(2048)?)?;
        Ok(Self {
            inner: Arc::new(CaInner {
                cert,
                key,
                leaf_key,
                cache: Mutex::new(HashMap::new()),
                generated: AtomicUsize::new(0),
            }),
        })
    }

    /// Fresh in-memory CA, for tests and for runs without a configured CA.
    pub fn generate() -> Result<Self> {
        let (cert, key) = generate_ca_cert()?;
        Self::new(cert, key)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert = X509::from_pem(cert_pem)?;
        let key = PKey::private_key_from_pem(key_pem)?;
        if !cert.public_key()?.public_eq(&key) {
            return Err(Error::certificate("CA certificate and key do not match"));
        }
        Self::new(cert, key)
    }

    pub fn load<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_pem = fs::read(cert_path)?;
        let key_pem = fs::read(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Loads the CA from disk, generating and writing a new one when either file is missing.
    pub fn load_or_generate<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let (cert_path, key_path) = (cert_path.as_ref(), key_path.as_ref());
        if cert_path.exists() && key_path.exists() {
            return Self::load(cert_path, key_path);
        }

        let (cert, key) = generate_ca_cert()?;
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(cert_path, cert.to_pem()?)?;
        fs::write(key_path, key.private_key_to_pem_pkcs8()?)?;
        debug!("Wrote new CA certificate to {}", cert_path.display());
        Self::new(cert, key)
    }

    pub fn ca_cert(&self) -> &X509 {
        &self.inner.cert
    }

    pub fn ca_cert_pem(&self) -> Result<Vec<u8>> {
        Ok(self.inner.cert.to_pem()?)
    }

    /// Returns the cached leaf for `hostname`, generating it on first use. Concurrent callers
    /// for the same name wait on a single generation.
    pub async fn cert_for_host(&self, hostname: &str) -> Result<Arc<CertificateRecord>> {
        let hostname = normalize_host(hostname);
        let slot = {
            let mut cache = self
                .inner
                .cache
                .lock()
                .map_err(|_| Error::internal("certificate cache poisoned"))?;
            Arc::clone(cache.entry(hostname.clone()).or_default())
        };

        let record = slot
            .get_or_try_init(|| async {
                let inner = Arc::clone(&self.inner);
                let name = hostname.clone();
                let record = tokio::task::spawn_blocking(move || inner.issue(&name))
                    .await
                    .map_err(|e| Error::internal(format!("certificate task failed: {}", e)))??;
                self.inner.generated.fetch_add(1, Ordering::SeqCst);
                debug!("Generated certificate for {}", hostname);
                Ok::<_, Error>(Arc::new(record))
            })
            .await?;
        Ok(Arc::clone(record))
    }

    /// Number of leaf certificates generated so far.
    pub fn generation_count(&self) -> usize {
        self.inner.generated.load(Ordering::SeqCst)
    }

    pub fn cache_size(&self) -> usize {
        self.inner
            .cache
            .lock()
            .map(|cache| cache.values().filter(|slot| slot.initialized()).count())
            .unwrap_or(0)
    }
}

impl CaInner {
    fn issue(&self, hostname: &str) -> Result<CertificateRecord> {
        let mut cert_builder = X509Builder::new()?;
        cert_builder.set_version(2)?;
        let serial = random_serial()?;
        cert_builder.set_serial_number(&serial)?;

        // Backdated a day to tolerate clock skew on the client.
        let not_before = Asn1Time::from_unix(chrono::Utc::now().timestamp() - 86_400)?;
        let not_after = Asn1Time::days_from_now(365)?;
        cert_builder.set_not_before(&not_before)?;
        cert_builder.set_not_after(&not_after)?;

        let mut name_builder = X509NameBuilder::new()?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, hostname)?;
        let subject_name = name_builder.build();
        cert_builder.set_subject_name(&subject_name)?;
        cert_builder.set_issuer_name(self.cert.subject_name())?;
        cert_builder.set_pubkey(&self.leaf_key)?;

        cert_builder.append_extension(BasicConstraints::new().build()?)?;
        cert_builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        cert_builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

        let subject_key_identifier = SubjectKeyIdentifier::new()
            .build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(subject_key_identifier)?;

        let authority_key_identifier = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(authority_key_identifier)?;

        let mut san_builder = SubjectAlternativeName::new();
        if hostname.parse::<IpAddr>().is_ok() {
            san_builder.ip(hostname);
        } else {
            san_builder.dns(hostname);
            if !hostname.starts_with("*.") {
                san_builder.dns(&format!("*.{}", hostname));
            }
        }
        let san = san_builder.build(&cert_builder.x509v3_context(Some(&self.cert), None))?;
        cert_builder.append_extension(san)?;

        cert_builder.sign(&self.key, MessageDigest::sha256())?;

        Ok(CertificateRecord {
            hostname: hostname.to_string(),
            cert: cert_builder.build(),
            key: self.leaf_key.clone(),
            ca_cert: self.cert.clone(),
        })
    }
}

fn generate_ca_cert() -> Result<(X509, PKey<Private>)> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut cert_builder = X509Builder::new()?;
    cert_builder.set_version(2)?;
    let serial = random_serial()?;
    cert_builder.set_serial_number(&serial)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365 * 10)?;
    cert_builder.set_not_before(&not_before)?;
    cert_builder.set_not_after(&not_after)?;

    let mut name_builder = X509NameBuilder::new()?;
    name_builder.append_entry_by_nid(Nid::COMMONNAME, "mockproxy CA")?;
    name_builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, "mockproxy")?;
    let name = name_builder.build();

    cert_builder.set_subject_name(&name)?;
    cert_builder.set_issuer_name(&name)?;
    cert_builder.set_pubkey(&key)?;

    cert_builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    cert_builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;

    let subject_key_identifier =
        SubjectKeyIdentifier::new().build(&cert_builder.x509v3_context(None, None))?;
    cert_builder.append_extension(subject_key_identifier)?;

    cert_builder.sign(&key, MessageDigest::sha256())?;

    Ok((cert_builder.build(), key))
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_host_cert_generation() {
        let ca = CertificateAuthority::generate().unwrap();

        let record = ca.cert_for_host("example.com").await.unwrap();
        assert_eq!(record.cert.version(), 2);
        assert_eq!(ca.cache_size(), 1);

        // Second request is served from cache
        let again = ca.cert_for_host("EXAMPLE.com").await.unwrap();
        assert_eq!(record.cert.to_der().unwrap(), again.cert.to_der().unwrap());
        assert_eq!(ca.generation_count(), 1);

        ca.cert_for_host("test.com").await.unwrap();
        assert_eq!(ca.cache_size(), 2);
        assert_eq!(ca.generation_count(), 2);
    }

    #[tokio::test]
    async fn test_leaf_is_signed_by_ca() {
        let ca = CertificateAuthority::generate().unwrap();
        let record = ca.cert_for_host("127.0.0.1").await.unwrap();

        let ca_key = ca.ca_cert().public_key().unwrap();
        assert!(record.cert.verify(&ca_key).unwrap());

        let sans = record.cert.subject_alt_names().unwrap();
        assert!(sans.iter().any(|san| san.ipaddress() == Some(&[127, 0, 0, 1][..])));
    }

    #[tokio::test]
    async fn test_serial_numbers_are_unique() {
        let ca = CertificateAuthority::generate().unwrap();
        let a = ca.cert_for_host("a.example").await.unwrap();
        let b = ca.cert_for_host("b.example").await.unwrap();

        let serial = |cert: &X509| cert.serial_number().to_bn().unwrap().to_vec();
        assert_ne!(serial(&a.cert), serial(&b.cert));
        assert_ne!(serial(&a.cert), serial(ca.ca_cert()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_generate_once() {
        let ca = CertificateAuthority::generate().unwrap();

        let lookups = (0..16).map(|_| {
            let ca = ca.clone();
            tokio::spawn(async move { ca.cert_for_host("race.example").await })
        });
        let records = futures_util::future::join_all(lookups).await;

        let first = records[0].as_ref().unwrap().as_ref().unwrap().cert.to_der().unwrap();
        for record in &records {
            let der = record.as_ref().unwrap().as_ref().unwrap().cert.to_der().unwrap();
            assert_eq!(der, first);
        }
        assert_eq!(ca.generation_count(), 1);
    }

    #[test]
    fn test_load_or_generate_persists_key_pair() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("ca.pem");
        let key_path = temp_dir.path().join("ca.key");

        let first = CertificateAuthority::load_or_generate(&cert_path, &key_path).unwrap();
        let second = CertificateAuthority::load_or_generate(&cert_path, &key_path).unwrap();
        assert_eq!(
            first.ca_cert().to_der().unwrap(),
            second.ca_cert().to_der().unwrap()
        );
    }

    #[test]
    fn test_mismatched_pem_rejected() {
        let a = CertificateAuthority::generate().unwrap();
        let (_, other_key) = generate_ca_cert().unwrap();
        let result = CertificateAuthority::from_pem(
            &a.ca_cert_pem().unwrap(),
            &other_key.private_key_to_pem_pkcs8().unwrap(),
        );
        assert!(matches!(result, Err(Error::Certificate(_))));
    }
}
