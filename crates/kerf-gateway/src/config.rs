//! Gateway configuration: TOML file + CLI overrides.

use crate::streaming::StreamLimits;
use kerf_core::{KerfError, KerfResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub attestation: AttestationSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Shared secret for bearer token verification. Required: the
    /// upgrade is rejected for every client without it.
    #[serde(default)]
    pub jwt_secret: String,
}

/// `[attestation]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AttestationSection {
    /// TEE platform identifier advertised in the handshake payload.
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Path to a 64-byte static X25519 keypair file (private || public).
    /// An ephemeral keypair is generated when absent.
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,
    #[serde(default = "default_manifest_bundle_path")]
    pub manifest_bundle_path: String,
}

impl Default for AttestationSection {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            key_path: None,
            manifest_path: default_manifest_path(),
            manifest_bundle_path: default_manifest_bundle_path(),
        }
    }
}

/// One OpenAI-compatible chat upstream. The route becomes
/// `POST /v1/{name}/chat/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatUpstream {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// `[upstream]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default)]
    pub chat: Vec<ChatUpstream>,
    #[serde(default = "default_docling_url")]
    pub docling_url: String,
    #[serde(default)]
    pub docling_enabled: bool,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            chat: Vec::new(),
            docling_url: default_docling_url(),
            docling_enabled: false,
        }
    }
}

/// `[limits]` section of the config TOML: stream registry bounds.
///
/// The pre-create pending bound and the post-create out-of-order bound
/// are deliberately independent knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_active_streams")]
    pub max_active_streams: usize,
    #[serde(default = "default_max_pending_streams")]
    pub max_pending_streams: usize,
    #[serde(default = "default_max_pending_chunks")]
    pub max_pending_chunks: usize,
    #[serde(default = "default_max_out_of_order")]
    pub max_out_of_order: usize,
    #[serde(default = "default_max_stream_bytes")]
    pub max_stream_bytes: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_active_streams: default_max_active_streams(),
            max_pending_streams: default_max_pending_streams(),
            max_pending_chunks: default_max_pending_chunks(),
            max_out_of_order: default_max_out_of_order(),
            max_stream_bytes: default_max_stream_bytes(),
        }
    }
}

fn default_port() -> u16 {
    4430
}
fn default_platform() -> String {
    "TDX".to_string()
}
fn default_manifest_path() -> String {
    "/run/kerf/manifest.json".to_string()
}
fn default_manifest_bundle_path() -> String {
    "/run/kerf/manifest.bundle.json".to_string()
}
fn default_docling_url() -> String {
    "http://127.0.0.1:5001".to_string()
}
fn default_max_active_streams() -> usize {
    10
}
fn default_max_pending_streams() -> usize {
    16
}
fn default_max_pending_chunks() -> usize {
    256
}
fn default_max_out_of_order() -> usize {
    64
}
fn default_max_stream_bytes() -> u64 {
    50 * 1024 * 1024
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub jwt_secret: String,
    pub attestation_platform: String,
    pub attestation_key_path: Option<PathBuf>,
    pub manifest_path: PathBuf,
    pub manifest_bundle_path: PathBuf,
    pub chat_upstreams: Vec<ChatUpstream>,
    pub docling_url: String,
    pub docling_enabled: bool,
    pub stream_limits: StreamLimits,
}

impl GatewayConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing config file falls back to defaults; a missing JWT
    /// secret is an error since every upgrade would be rejected.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_jwt_secret: Option<&str>,
    ) -> KerfResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| KerfError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let jwt_secret = cli_jwt_secret
            .map(|s| s.to_string())
            .unwrap_or(file_config.auth.jwt_secret);
        if jwt_secret.is_empty() {
            return Err(KerfError::Other(
                "jwt secret is not configured (set [auth] jwt_secret or --jwt-secret)".into(),
            ));
        }

        let limits = &file_config.limits;

        Ok(Self {
            port: cli_port.unwrap_or(file_config.server.port),
            jwt_secret,
            attestation_platform: file_config.attestation.platform,
            attestation_key_path: file_config
                .attestation
                .key_path
                .as_deref()
                .map(expand_tilde_str),
            manifest_path: expand_tilde_str(&file_config.attestation.manifest_path),
            manifest_bundle_path: expand_tilde_str(&file_config.attestation.manifest_bundle_path),
            chat_upstreams: file_config.upstream.chat,
            docling_url: file_config.upstream.docling_url,
            docling_enabled: file_config.upstream.docling_enabled,
            stream_limits: StreamLimits {
                max_active_streams: limits.max_active_streams,
                max_pending_streams: limits.max_pending_streams,
                max_pending_chunks: limits.max_pending_chunks,
                max_out_of_order: limits.max_out_of_order,
                max_stream_bytes: limits.max_stream_bytes,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
