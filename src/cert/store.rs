//! Certificate store (L5): load/validate/renew/backup the device
//! identity key-pair.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair,
    SanType,
};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::CertificateConfig;
use crate::error::{CoreError, CoreResult};
use crate::service::Service;

/// Parsed leaf of a device certificate.
#[derive(Debug, Clone)]
pub struct CertificateLeaf {
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial: Vec<u8>,
    pub raw: Vec<u8>,
}

impl CertificateLeaf {
    pub fn device_id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.raw);
        hasher.finalize().into()
    }

    fn parse(der: &[u8]) -> CoreResult<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| CoreError::CertParse(e.to_string()))?;
        let not_before = cert.validity().not_before.to_datetime();
        let not_after = cert.validity().not_after.to_datetime();
        Ok(Self {
            subject: cert.subject().to_string(),
            not_before: DateTime::from_timestamp(not_before.unix_timestamp(), 0)
                .unwrap_or_else(Utc::now),
            not_after: DateTime::from_timestamp(not_after.unix_timestamp(), 0)
                .unwrap_or_else(Utc::now),
            serial: cert.raw_serial().to_vec(),
            raw: der.to_vec(),
        })
    }
}

/// The on-disk cert+key pair and its parsed leaf.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub leaf: CertificateLeaf,
}

#[derive(Debug, Clone)]
pub enum CertEvent {
    Renewed { cert_path: PathBuf, not_after: DateTime<Utc> },
    Regenerated { cert_path: PathBuf },
}

/// Candidate key-file suffix conventions, tried in order, for a given
/// cert-file path.
fn key_path_candidates(cert_path: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(stem) = cert_path.file_stem().and_then(|s| s.to_str()) {
        let dir = cert_path.parent().unwrap_or_else(|| Path::new("."));
        candidates.push(dir.join(format!("{stem}.key")));
        if let Some(renamed) = stem.strip_suffix("-cert") {
            candidates.push(dir.join(format!("{renamed}-key.pem")));
        }
        if stem == "cert" {
            candidates.push(dir.join("key.pem"));
        }
        if stem == "https-cert" {
            candidates.push(dir.join("https-key.pem"));
        }
    }
    candidates
}

pub struct CertStore {
    cert_path: PathBuf,
    common_name: String,
    lifetime_days: i64,
    renewal_window_days: i64,
    backup_retention: Duration,
    current: RwLock<Option<CertificateRecord>>,
    events: broadcast::Sender<CertEvent>,
    on_renew: RwLock<Option<Arc<dyn Fn(&CertificateRecord) + Send + Sync>>>,
}

impl CertStore {
    pub fn new(cert_path: impl Into<PathBuf>, config: &CertificateConfig) -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self {
            cert_path: cert_path.into(),
            common_name: config.common_name.clone(),
            lifetime_days: config.lifetime_days,
            renewal_window_days: config.renewal_window_days,
            backup_retention: config.backup_retention,
            current: RwLock::new(None),
            events: tx,
            on_renew: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CertEvent> {
        self.events.subscribe()
    }

    pub async fn set_on_renew(&self, callback: Arc<dyn Fn(&CertificateRecord) + Send + Sync>) {
        *self.on_renew.write().await = Some(callback);
    }

    /// Loads and parses the cert/key pair at `cert_path`, trying the
    /// ordered list of key-file suffix conventions.
    #[instrument(skip(self))]
    pub async fn load(&self) -> CoreResult<CertificateRecord> {
        let candidates = key_path_candidates(&self.cert_path);
        let cert_pem = tokio::fs::read(&self.cert_path)
            .await
            .map_err(|_| CoreError::CertMissing)?;

        let mut key_path = None;
        for candidate in &candidates {
            if tokio::fs::metadata(candidate).await.is_ok() {
                key_path = Some(candidate.clone());
                break;
            }
        }
        let key_path = key_path.ok_or(CoreError::CertMissing)?;
        let key_pem = tokio::fs::read(&key_path)
            .await
            .map_err(|_| CoreError::CertMissing)?;

        let der = parse_first_cert_der(&cert_pem)?;
        let leaf = CertificateLeaf::parse(&der)?;

        validate_keypair(&key_pem, &der)?;

        let record = CertificateRecord {
            cert_path: self.cert_path.clone(),
            key_path,
            leaf,
        };
        *self.current.write().await = Some(record.clone());
        Ok(record)
    }

    /// True iff `leaf.notAfter - now <= renewal_window_days`.
    pub fn needs_renewal(&self, leaf: &CertificateLeaf, now: DateTime<Utc>) -> bool {
        leaf.not_after - now <= chrono::Duration::days(self.renewal_window_days)
    }

    /// Atomically (write-temp + rename) generates a new self-signed
    /// ECDSA P-256 certificate, replacing the current cert/key pair.
    #[instrument(skip(self))]
    pub async fn renew(&self) -> CoreResult<CertificateRecord> {
        let key_path = {
            let current = self.current.read().await;
            current
                .as_ref()
                .map(|r| r.key_path.clone())
                .unwrap_or_else(|| self.cert_path.with_extension("key"))
        };

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| CoreError::CertParse(format!("cert params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.clone());
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(self.lifetime_days);
        if let Ok(san) = Ia5String::try_from(self.common_name.clone()) {
            params.subject_alt_names = vec![SanType::DnsName(san)];
        }
        params.extended_key_usages =
            vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CoreError::CertParse(format!("key generation: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CoreError::CertParse(format!("self-sign: {e}")))?;

        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        write_atomic(&self.cert_path, cert_pem.as_bytes()).await?;
        write_atomic(&key_path, key_pem.as_bytes()).await?;

        let leaf = CertificateLeaf::parse(cert.der())?;
        let record = CertificateRecord {
            cert_path: self.cert_path.clone(),
            key_path,
            leaf,
        };
        *self.current.write().await = Some(record.clone());

        if let Some(cb) = self.on_renew.read().await.as_ref() {
            cb(&record);
        }
        let _ = self.events.send(CertEvent::Renewed {
            cert_path: record.cert_path.clone(),
            not_after: record.leaf.not_after,
        });
        info!(not_after = %record.leaf.not_after, "certificate renewed");
        Ok(record)
    }

    /// Copies the current cert/key files under `cert-backups/cert-<ts>.pem`
    /// (and `key-<ts>.pem`), preserving permission bits. Returns the
    /// timestamp used.
    pub async fn backup(&self) -> CoreResult<String> {
        let record = {
            let current = self.current.read().await;
            current.clone().ok_or(CoreError::CertMissing)?
        };
        let ts = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let backup_dir = record
            .cert_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("cert-backups");
        tokio::fs::create_dir_all(&backup_dir).await?;

        copy_preserving_permissions(&record.cert_path, &backup_dir.join(format!("cert-{ts}.pem")))
            .await?;
        copy_preserving_permissions(&record.key_path, &backup_dir.join(format!("key-{ts}.pem")))
            .await?;
        Ok(ts)
    }

    /// Replaces the current cert/key with the backup taken at `ts`,
    /// first saving the existing files with a `.restore-backup` suffix.
    pub async fn restore(&self, ts: &str) -> CoreResult<CertificateRecord> {
        let record = {
            let current = self.current.read().await;
            current.clone().ok_or(CoreError::CertMissing)?
        };
        let backup_dir = record
            .cert_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("cert-backups");
        let backup_cert = backup_dir.join(format!("cert-{ts}.pem"));
        let backup_key = backup_dir.join(format!("key-{ts}.pem"));

        copy_preserving_permissions(
            &record.cert_path,
            &record.cert_path.with_file_name(format!(
                "{}.restore-backup",
                record.cert_path.file_name().unwrap().to_string_lossy()
            )),
        )
        .await?;
        copy_preserving_permissions(
            &record.key_path,
            &record.key_path.with_file_name(format!(
                "{}.restore-backup",
                record.key_path.file_name().unwrap().to_string_lossy()
            )),
        )
        .await?;

        copy_preserving_permissions(&backup_cert, &record.cert_path).await?;
        copy_preserving_permissions(&backup_key, &record.key_path).await?;

        self.load().await
    }

    /// Lists backup timestamps found in `cert-backups/`, oldest first.
    pub async fn list_backups(&self) -> CoreResult<Vec<String>> {
        let dir = self.backups_dir();
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(ts) = name.strip_prefix("cert-").and_then(|s| s.strip_suffix(".pem")) {
                out.push(ts.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn backups_dir(&self) -> PathBuf {
        self.cert_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("cert-backups")
    }

    /// Removes backup files older than `backup_retention`, returning the
    /// count removed.
    pub async fn purge_old_backups(&self) -> CoreResult<usize> {
        let dir = self.backups_dir();
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age > self.backup_retention {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Periodic renewal-check service (default every 6 h): load; regenerate
/// on missing/invalid; renew when within the renewal window.
pub struct CertRenewalService {
    store: Arc<CertStore>,
    check_interval: Duration,
}

impl CertRenewalService {
    pub fn new(store: Arc<CertStore>, config: &CertificateConfig) -> Self {
        Self { store, check_interval: config.check_interval }
    }
}

#[async_trait]
impl Service for CertRenewalService {
    fn name(&self) -> &str {
        "cert-renewal"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            match self.store.load().await {
                Ok(record) if self.store.needs_renewal(&record.leaf, Utc::now()) => {
                    self.store.renew().await?;
                }
                Ok(_) => {}
                Err(CoreError::CertMissing) | Err(CoreError::CertInvalid) => {
                    warn!("certificate missing or invalid, regenerating");
                    self.store.renew().await?;
                }
                Err(e) => return Err(e.into()),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
    }
}

fn parse_first_cert_der(pem_bytes: &[u8]) -> CoreResult<Vec<u8>> {
    let mut reader = std::io::BufReader::new(pem_bytes);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| CoreError::CertParse(e.to_string()))?;
    certs
        .into_iter()
        .next()
        .map(|c| c.as_ref().to_vec())
        .ok_or_else(|| CoreError::CertParse("no certificate found in PEM".to_string()))
}

/// Verifies `key_pem` parses as a private key whose public component
/// matches `cert_der`'s subject public key, not merely that it parses
/// as *some* valid key.
fn validate_keypair(key_pem: &[u8], cert_der: &[u8]) -> CoreResult<()> {
    let key_pem_str = std::str::from_utf8(key_pem).map_err(|_| CoreError::CertInvalid)?;
    let key_pair = KeyPair::from_pem(key_pem_str).map_err(|_| CoreError::CertInvalid)?;

    let (_, cert) =
        x509_parser::parse_x509_certificate(cert_der).map_err(|_| CoreError::CertInvalid)?;

    if key_pair.public_key_der().as_slice() != cert.public_key().raw {
        return Err(CoreError::CertInvalid);
    }
    Ok(())
}

async fn write_atomic(path: &Path, contents: &[u8]) -> CoreResult<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn copy_preserving_permissions(src: &Path, dst: &Path) -> CoreResult<()> {
    tokio::fs::copy(src, dst).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = tokio::fs::metadata(src).await?.permissions();
        let mode = perms.mode();
        tokio::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertificateConfig;
    use tempfile::tempdir;

    fn test_config() -> CertificateConfig {
        CertificateConfig {
            common_name: "test-device".to_string(),
            ..Default::default()
        }
    }

    async fn generate_cert_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let store = CertStore::new(dir.join("cert.pem"), &test_config());
        store.renew().await.unwrap();
        (dir.join("cert.pem"), dir.join("cert.key"))
    }

    #[tokio::test]
    async fn renew_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let (cert_path, _key_path) = generate_cert_pair(dir.path()).await;
        let store = CertStore::new(cert_path, &test_config());
        let record = store.load().await.unwrap();
        assert!(!record.leaf.raw.is_empty());
    }

    #[tokio::test]
    async fn needs_renewal_detects_near_expiry() {
        let dir = tempdir().unwrap();
        let (cert_path, _) = generate_cert_pair(dir.path()).await;
        let store = CertStore::new(cert_path, &test_config());
        let record = store.load().await.unwrap();
        assert!(!store.needs_renewal(&record.leaf, Utc::now()));
        assert!(store.needs_renewal(
            &record.leaf,
            record.leaf.not_after - chrono::Duration::days(1)
        ));
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips() {
        let dir = tempdir().unwrap();
        let (cert_path, _) = generate_cert_pair(dir.path()).await;
        let store = CertStore::new(cert_path.clone(), &test_config());
        store.load().await.unwrap();
        let ts = store.backup().await.unwrap();
        let backup_dir = dir.path().join("cert-backups");
        assert!(backup_dir.join(format!("cert-{ts}.pem")).exists());
        store.restore(&ts).await.unwrap();
        assert!(cert_path.exists());
    }

    #[tokio::test]
    async fn load_missing_cert_errors() {
        let dir = tempdir().unwrap();
        let store = CertStore::new(dir.path().join("nope.pem"), &test_config());
        let result = store.load().await;
        assert!(matches!(result, Err(CoreError::CertMissing)));
    }

    #[tokio::test]
    async fn mismatched_key_fails_validation() {
        let dir = tempdir().unwrap();
        let (cert_path, key_path) = generate_cert_pair(dir.path()).await;

        let other_dir = tempdir().unwrap();
        generate_cert_pair(other_dir.path()).await;
        let foreign_key = tokio::fs::read(other_dir.path().join("cert.key")).await.unwrap();
        tokio::fs::write(&key_path, &foreign_key).await.unwrap();

        let store = CertStore::new(cert_path, &test_config());
        let result = store.load().await;
        assert!(matches!(result, Err(CoreError::CertInvalid)));
    }
}
