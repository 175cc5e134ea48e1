//! Attestation provider contract.
//!
//! The Noise responder binds its static public key to a TEE attestation
//! by placing the key in the first 32 bytes of the quote's report data.
//! Quote generation itself (TDX/SEV-SNP kernel interfaces, signing
//! service roundtrips) lives behind this trait; the gateway only needs
//! the static key and a serializable attestation document.

use crate::config::GatewayConfig;
use crate::noise;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kerf_core::{KerfError, KerfResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Length of a raw X25519 key.
pub const KEY_LEN: usize = 32;

/// Report data is a 64-byte blob; the static public key occupies the
/// first 32 bytes.
pub const REPORT_DATA_LEN: usize = 64;

/// The attestation document sent as the payload of the first outbound
/// handshake message, serialized as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationDocument {
    /// Platform identifier: "TDX" or "SEV-SNP".
    pub platform: String,
    /// Platform attestation: a signed JWT for TDX, a base64 raw report
    /// for SEV-SNP.
    pub attestation: String,
    /// Signed manifest JSON (image version, measurements).
    pub manifest: String,
    /// Signature bundle JSON for the manifest.
    #[serde(rename = "manifestBundle")]
    pub manifest_bundle: String,
}

/// Source of the Noise static key and the attestation bound to it.
pub trait AttestationProvider: Send + Sync {
    /// The 32-byte X25519 static private key for the Noise responder.
    fn static_private_key(&self) -> &[u8; KEY_LEN];

    /// The 32-byte X25519 static public key embedded in report data.
    fn static_public_key(&self) -> &[u8; KEY_LEN];

    /// The attestation document for the current key. Providers may
    /// cache and refresh internally; the session asks once per
    /// handshake.
    fn signed_attestation(&self) -> KerfResult<AttestationDocument>;
}

/// Report data for a public key: the key followed by zero padding.
pub fn report_data_for(public_key: &[u8; KEY_LEN]) -> [u8; REPORT_DATA_LEN] {
    let mut report_data = [0u8; REPORT_DATA_LEN];
    report_data[..KEY_LEN].copy_from_slice(public_key);
    report_data
}

/// Provider backed by an on-disk (or ephemeral) keypair, with the
/// attestation blob standing in for a platform quote. Used where no TEE
/// quote device is available and in tests.
pub struct StaticAttestationProvider {
    private_key: [u8; KEY_LEN],
    public_key: [u8; KEY_LEN],
    document: AttestationDocument,
}

impl StaticAttestationProvider {
    pub fn new(
        private_key: [u8; KEY_LEN],
        public_key: [u8; KEY_LEN],
        platform: &str,
        manifest: String,
        manifest_bundle: String,
    ) -> Self {
        let document = AttestationDocument {
            platform: platform.to_string(),
            attestation: BASE64.encode(report_data_for(&public_key)),
            manifest,
            manifest_bundle,
        };
        Self {
            private_key,
            public_key,
            document,
        }
    }

    /// Build a provider from the gateway config: keypair from
    /// `key_path` (64 bytes, private || public) or freshly generated,
    /// manifests read from disk when present.
    pub fn from_config(config: &GatewayConfig) -> KerfResult<Self> {
        let (private_key, public_key) = match &config.attestation_key_path {
            Some(path) => load_keypair(path)?,
            None => {
                warn!("no attestation key path configured, generating ephemeral keypair");
                generate_keypair()?
            }
        };

        let manifest = read_json_or_empty(&config.manifest_path);
        let manifest_bundle = read_json_or_empty(&config.manifest_bundle_path);

        info!(
            platform = %config.attestation_platform,
            "attestation provider initialized"
        );

        Ok(Self::new(
            private_key,
            public_key,
            &config.attestation_platform,
            manifest,
            manifest_bundle,
        ))
    }
}

impl AttestationProvider for StaticAttestationProvider {
    fn static_private_key(&self) -> &[u8; KEY_LEN] {
        &self.private_key
    }

    fn static_public_key(&self) -> &[u8; KEY_LEN] {
        &self.public_key
    }

    fn signed_attestation(&self) -> KerfResult<AttestationDocument> {
        Ok(self.document.clone())
    }
}

fn load_keypair(path: &Path) -> KerfResult<([u8; KEY_LEN], [u8; KEY_LEN])> {
    let raw = std::fs::read(path)?;
    if raw.len() != KEY_LEN * 2 {
        return Err(KerfError::Attestation(format!(
            "keypair file {} must hold {} bytes, found {}",
            path.display(),
            KEY_LEN * 2,
            raw.len()
        )));
    }
    let mut private_key = [0u8; KEY_LEN];
    let mut public_key = [0u8; KEY_LEN];
    private_key.copy_from_slice(&raw[..KEY_LEN]);
    public_key.copy_from_slice(&raw[KEY_LEN..]);
    Ok((private_key, public_key))
}

fn generate_keypair() -> KerfResult<([u8; KEY_LEN], [u8; KEY_LEN])> {
    let keypair = snow::Builder::new(
        noise::NOISE_PATTERN
            .parse()
            .map_err(|e| KerfError::Crypto(format!("noise pattern: {e}")))?,
    )
    .generate_keypair()
    .map_err(|e| KerfError::Crypto(format!("keypair generation failed: {e}")))?;

    let mut private_key = [0u8; KEY_LEN];
    let mut public_key = [0u8; KEY_LEN];
    private_key.copy_from_slice(&keypair.private);
    public_key.copy_from_slice(&keypair.public);
    Ok((private_key, public_key))
}

fn read_json_or_empty(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "manifest not readable, sending empty object");
            "{}".to_string()
        }
    }
}
