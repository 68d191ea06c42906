//! Certificate pinning & TLS identity verification (L6).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::cert::store::CertificateLeaf;
use crate::error::{CoreError, CoreResult};

pub type DeviceId = [u8; 32];

fn cert_hash_hex(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hex::encode(hasher.finalize())
}

/// DeviceID -> set of accepted hex-encoded SHA-256 cert hashes.
#[derive(Default)]
pub struct PinStore {
    pins: RwLock<HashMap<DeviceId, HashSet<String>>>,
}

impl PinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pin(&self, device: DeviceId, cert_raw: &[u8]) {
        let hash = cert_hash_hex(cert_raw);
        self.pins.write().await.entry(device).or_default().insert(hash);
    }

    pub async fn unpin(&self, device: DeviceId, cert_raw: &[u8]) {
        let hash = cert_hash_hex(cert_raw);
        if let Some(set) = self.pins.write().await.get_mut(&device) {
            set.remove(&hash);
        }
    }

    pub async fn is_pinned(&self, device: DeviceId, cert_raw: &[u8]) -> bool {
        let hash = cert_hash_hex(cert_raw);
        self.pins
            .read()
            .await
            .get(&device)
            .map(|set| set.contains(&hash))
            .unwrap_or(false)
    }

    pub async fn has_pins(&self, device: DeviceId) -> bool {
        self.pins
            .read()
            .await
            .get(&device)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub async fn clear(&self, device: DeviceId) {
        self.pins.write().await.remove(&device);
    }
}

/// Minimal view of a completed TLS handshake's peer state, sufficient to
/// run the five-step verification protocol.
pub struct PeerTlsState {
    pub peer_certs: Vec<CertificateLeaf>,
    pub expected_device: DeviceId,
    pub now: DateTime<Utc>,
}

/// Verifies a peer's TLS identity against the configured device-id and
/// pin store. Read-only and safe for many concurrent handshakes.
pub async fn verify(pins: &PinStore, state: &PeerTlsState) -> CoreResult<()> {
    let leaf = state.peer_certs.first().ok_or(CoreError::NoPeerCert)?;

    let expected = leaf.device_id();
    if expected != state.expected_device {
        return Err(CoreError::IdentityMismatch);
    }

    if state.now < leaf.not_before {
        return Err(CoreError::NotYetValid);
    }
    if state.now > leaf.not_after {
        return Err(CoreError::Expired);
    }

    // Self-signed leaf: the only signature check possible without a CA
    // chain is that the signature verifies against the leaf's own public
    // key, and that the extended key usage extension covers both roles
    // a peer connection can play.
    verify_self_signature(leaf)?;

    if pins.has_pins(state.expected_device).await
        && !pins.is_pinned(state.expected_device, &leaf.raw).await
    {
        return Err(CoreError::PinMismatch);
    }

    Ok(())
}

/// Self-signed leaf check: the signature must verify against the leaf's
/// own public key, and the extended key usage extension must cover both
/// server-auth and client-auth, since either side of a connection may
/// act as the TLS server.
fn verify_self_signature(leaf: &CertificateLeaf) -> CoreResult<()> {
    let (_, cert) = x509_parser::parse_x509_certificate(&leaf.raw)
        .map_err(|_| CoreError::SignatureInvalid)?;
    cert.verify_signature(None)
        .map_err(|_| CoreError::SignatureInvalid)?;

    let eku = cert
        .extended_key_usage()
        .map_err(|_| CoreError::SignatureInvalid)?
        .ok_or(CoreError::SignatureInvalid)?;
    if !eku.value.server_auth || !eku.value.client_auth {
        return Err(CoreError::SignatureInvalid);
    }

    Ok(())
}

/// Helper for constructing a `DeviceId` from an already-parsed leaf,
/// shared by the discovery and connection layers.
pub fn device_id_of(raw_cert_der: &[u8]) -> DeviceId {
    let mut hasher = Sha256::new();
    hasher.update(raw_cert_der);
    hasher.finalize().into()
}

#[allow(dead_code)]
pub(crate) type ArcPinStore = Arc<PinStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_leaf(raw: &[u8]) -> CertificateLeaf {
        CertificateLeaf {
            subject: "test".to_string(),
            not_before: Utc::now() - chrono::Duration::days(1),
            not_after: Utc::now() + chrono::Duration::days(1),
            serial: vec![1, 2, 3],
            raw: raw.to_vec(),
        }
    }

    #[tokio::test]
    async fn pin_unpin_round_trips_to_unchanged_set() {
        let store = PinStore::new();
        let device = [9u8; 32];
        let cert = b"cert-bytes";
        assert!(!store.has_pins(device).await);
        store.pin(device, cert).await;
        assert!(store.is_pinned(device, cert).await);
        store.unpin(device, cert).await;
        assert!(!store.is_pinned(device, cert).await);
        assert!(!store.has_pins(device).await);
    }

    #[tokio::test]
    async fn verify_rejects_empty_cert_list() {
        let pins = PinStore::new();
        let state = PeerTlsState {
            peer_certs: vec![],
            expected_device: [0u8; 32],
            now: Utc::now(),
        };
        let result = verify(&pins, &state).await;
        assert!(matches!(result, Err(CoreError::NoPeerCert)));
    }

    #[tokio::test]
    async fn verify_rejects_expired_certificate() {
        let pins = PinStore::new();
        let mut leaf = fake_leaf(b"some-cert");
        leaf.not_after = Utc::now() - chrono::Duration::days(1);
        let device = leaf.device_id();
        let state = PeerTlsState {
            peer_certs: vec![leaf],
            expected_device: device,
            now: Utc::now(),
        };
        let result = verify(&pins, &state).await;
        assert!(matches!(result, Err(CoreError::Expired)));
    }
}
