//! Centralized configuration for tgctl.
//!
//! Tunable constants live in unit structs with associated consts. Per-instance
//! settings come from a JSON configuration document and are wrapped in an
//! [`InstanceConfig`] value that is constructed once per command invocation and
//! passed by reference to everything that needs it.

use crate::error::{Result, TgError};
use crate::platform;
use crate::transport::resultset::ResultsetGeometry;
use crate::transport::wire::WireGeometry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Supervisor polling and timeout configuration.
pub struct SupervisorConfig;

impl SupervisorConfig {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);
    pub const KILL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SERVER_BINARY_NAME: &'static str = "tgserver";
}

/// Server-side lifecycle configuration.
pub struct ServerConfig;

impl ServerConfig {
    /// How long a failed boot keeps `boot_error` visible before cleaning up.
    pub const BOOT_ERROR_LINGER: Duration = Duration::from_millis(500);
    /// Lock acquisition retries while only a prober holds the lock.
    pub const LOCK_RETRY_ATTEMPTS: u32 = 20;
    pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
    /// Grace period for sessions to finish during a graceful shutdown.
    pub const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
    /// Cache lifetime of process statistics.
    pub const STATS_CACHE_TTL: Duration = Duration::from_secs(1);
}

/// Shared-memory transport configuration.
pub struct TransportConfig;

impl TransportConfig {
    /// Upper bound for a single blocking wait before liveness is re-checked.
    pub const WAIT_QUANTUM: Duration = Duration::from_millis(50);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_SESSIONS: u32 = 32;
    pub const DEFAULT_SLOT_COUNT: u32 = 16;
    pub const DEFAULT_FRAME_COUNT: u32 = 64;
    pub const DEFAULT_FRAME_PAYLOAD: u32 = 4096;
    pub const DEFAULT_RESULTSET_WIRES: u32 = 8;
    pub const DEFAULT_RESULTSET_CHUNK_COUNT: u32 = 8;
    pub const DEFAULT_RESULTSET_CHUNK_PAYLOAD: u32 = 16 * 1024;
    pub const DEFAULT_EXPIRATION_SECS: u64 = 300;
    /// Hard cap on a reassembled message body.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
}

/// Naming of shared-memory segments.
pub struct ShmConfig;

impl ShmConfig {
    pub const STATUS_SEGMENT_PREFIX: &'static str = "tgctl-";
    pub const STATUS_SEGMENT_SUFFIX: &'static str = ".stat";
    pub const RESULTSET_SEGMENT_SUFFIX: &'static str = "-rs";
    pub const LOCK_FILE_SUFFIX: &'static str = ".pid";
}

/// Session limits section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSection {
    /// Size of the connection admission pool.
    pub max_sessions: u32,
    /// Concurrent outstanding requests per session (K).
    pub slot_count: u32,
    /// Seconds a session survives without an expiration extension.
    pub expiration_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_sessions: TransportConfig::DEFAULT_MAX_SESSIONS,
            slot_count: TransportConfig::DEFAULT_SLOT_COUNT,
            expiration_secs: TransportConfig::DEFAULT_EXPIRATION_SECS,
        }
    }
}

/// Wire geometry section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireSection {
    pub frame_count: u32,
    pub frame_payload: u32,
    pub resultset_wires: u32,
    pub resultset_chunk_count: u32,
    pub resultset_chunk_payload: u32,
}

impl Default for WireSection {
    fn default() -> Self {
        Self {
            frame_count: TransportConfig::DEFAULT_FRAME_COUNT,
            frame_payload: TransportConfig::DEFAULT_FRAME_PAYLOAD,
            resultset_wires: TransportConfig::DEFAULT_RESULTSET_WIRES,
            resultset_chunk_count: TransportConfig::DEFAULT_RESULTSET_CHUNK_COUNT,
            resultset_chunk_payload: TransportConfig::DEFAULT_RESULTSET_CHUNK_PAYLOAD,
        }
    }
}

/// Authentication section of the configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthenticationSection {
    pub enabled: bool,
    /// Bearer tokens accepted when authentication is enabled.
    pub tokens: Vec<String>,
}

/// On-disk configuration document. Every field has a default, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigDocument {
    pub database_name: String,
    pub shm_dir: Option<PathBuf>,
    pub lock_dir: Option<PathBuf>,
    pub data_location: Option<PathBuf>,
    pub session: SessionSection,
    pub wire: WireSection,
    pub authentication: AuthenticationSection,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            database_name: "tgdb".to_string(),
            shm_dir: None,
            lock_dir: None,
            data_location: None,
            session: SessionSection::default(),
            wire: WireSection::default(),
            authentication: AuthenticationSection::default(),
        }
    }
}

/// A loaded, validated configuration bound to its canonical file path.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    config_path: PathBuf,
    digest: String,
    document: ConfigDocument,
    shm_dir: PathBuf,
    lock_dir: PathBuf,
}

impl InstanceConfig {
    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| TgError::Config {
            message: format!("cannot read configuration file {}: {}", path.display(), e),
        })?;

        let document = if text.trim().is_empty() {
            ConfigDocument::default()
        } else {
            serde_json::from_str(&text).map_err(|e| TgError::Config {
                message: format!("cannot parse configuration file {}: {}", path.display(), e),
            })?
        };

        Self::from_document(path, document)
    }

    /// Bind an in-memory document to a configuration path. The path must exist
    /// because the digest is computed over its canonical form.
    pub fn from_document(path: impl AsRef<Path>, document: ConfigDocument) -> Result<Self> {
        let path = path.as_ref();
        let config_path = path.canonicalize().map_err(|e| TgError::Config {
            message: format!("cannot canonicalize {}: {}", path.display(), e),
        })?;

        validate(&document)?;

        let digest = Self::digest_of(&config_path);
        let shm_dir = document
            .shm_dir
            .clone()
            .unwrap_or_else(platform::default_shm_dir);
        let lock_dir = match &document.lock_dir {
            Some(dir) => dir.clone(),
            None => config_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir),
        };

        debug!(
            "Loaded configuration {} (digest {}, database {})",
            config_path.display(),
            digest,
            document.database_name
        );

        Ok(Self {
            config_path,
            digest,
            document,
            shm_dir,
            lock_dir,
        })
    }

    /// Digest naming shared resources for a canonical configuration path.
    pub fn digest_of(canonical_path: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_path.to_string_lossy().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn database_name(&self) -> &str {
        &self.document.database_name
    }

    pub fn shm_dir(&self) -> &Path {
        &self.shm_dir
    }

    pub fn data_location(&self) -> Option<&Path> {
        self.document.data_location.as_deref()
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.document.session.expiration_secs)
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.lock_dir.join(format!(
            "{}{}",
            self.document.database_name,
            ShmConfig::LOCK_FILE_SUFFIX
        ))
    }

    pub fn status_segment_path(&self) -> PathBuf {
        self.shm_dir.join(format!(
            "{}{}{}",
            ShmConfig::STATUS_SEGMENT_PREFIX,
            self.digest,
            ShmConfig::STATUS_SEGMENT_SUFFIX
        ))
    }

    pub fn admission_segment_path(&self) -> PathBuf {
        self.shm_dir.join(&self.document.database_name)
    }

    pub fn session_segment_path(&self, session_id: u64) -> PathBuf {
        self.shm_dir
            .join(format!("{}-{}", self.document.database_name, session_id))
    }

    pub fn resultset_segment_path(&self, session_id: u64) -> PathBuf {
        self.shm_dir.join(format!(
            "{}-{}{}",
            self.document.database_name,
            session_id,
            ShmConfig::RESULTSET_SEGMENT_SUFFIX
        ))
    }

    pub fn wire_geometry(&self) -> WireGeometry {
        WireGeometry {
            slot_count: self.document.session.slot_count,
            frame_count: self.document.wire.frame_count,
            frame_payload: self.document.wire.frame_payload,
        }
    }

    pub fn resultset_geometry(&self) -> ResultsetGeometry {
        ResultsetGeometry {
            wire_count: self.document.wire.resultset_wires,
            chunk_count: self.document.wire.resultset_chunk_count,
            chunk_payload: self.document.wire.resultset_chunk_payload,
        }
    }
}

fn validate(document: &ConfigDocument) -> Result<()> {
    let name = &document.database_name;
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(TgError::Validation {
            field: "database_name".to_string(),
            message: format!("'{}' is not a valid segment name", name),
        });
    }

    let session = &document.session;
    if session.max_sessions == 0 {
        return Err(TgError::Validation {
            field: "session.max_sessions".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if session.slot_count == 0 || session.slot_count > u32::from(u16::MAX) {
        return Err(TgError::Validation {
            field: "session.slot_count".to_string(),
            message: format!("must be within 1..={}", u16::MAX),
        });
    }
    if session.expiration_secs == 0 {
        return Err(TgError::Validation {
            field: "session.expiration_secs".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    let wire = &document.wire;
    if wire.frame_count < 2 || wire.frame_payload < 64 {
        return Err(TgError::Validation {
            field: "wire".to_string(),
            message: "rings need at least 2 frames of at least 64 bytes".to_string(),
        });
    }
    if wire.resultset_wires == 0 || wire.resultset_chunk_count == 0 || wire.resultset_chunk_payload == 0
    {
        return Err(TgError::Validation {
            field: "wire.resultset".to_string(),
            message: "resultset wires, chunk count and chunk size must be non-zero".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tgctl.json");
        std::fs::write(&path, "").unwrap();

        let config = InstanceConfig::load(&path).unwrap();
        assert_eq!(config.database_name(), "tgdb");
        assert_eq!(config.document().session, SessionSection::default());
        assert_eq!(
            config.lock_file_path(),
            dir.path().canonicalize().unwrap().join("tgdb.pid")
        );
    }

    #[test]
    fn test_digest_is_stable_across_path_spellings() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("etc");
        std::fs::create_dir_all(&sub).unwrap();
        let path = sub.join("tgctl.json");
        std::fs::write(&path, "{}").unwrap();

        let direct = InstanceConfig::load(&path).unwrap();
        let dotted = InstanceConfig::load(sub.join("..").join("etc").join("tgctl.json")).unwrap();

        assert_eq!(direct.digest(), dotted.digest());
        assert_eq!(direct.status_segment_path(), dotted.status_segment_path());
        assert_eq!(direct.digest().len(), 64);
    }

    #[test]
    fn test_segment_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tgctl.json");
        std::fs::write(
            &path,
            r#"{"database_name": "orders", "shm_dir": "/tmp/shm-test"}"#,
        )
        .unwrap();

        let config = InstanceConfig::load(&path).unwrap();
        assert_eq!(
            config.admission_segment_path(),
            PathBuf::from("/tmp/shm-test/orders")
        );
        assert_eq!(
            config.session_segment_path(7),
            PathBuf::from("/tmp/shm-test/orders-7")
        );
        assert_eq!(
            config.resultset_segment_path(7),
            PathBuf::from("/tmp/shm-test/orders-7-rs")
        );
        let status = config.status_segment_path();
        let name = status.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("tgctl-"));
        assert!(name.ends_with(".stat"));
    }

    #[test]
    fn test_invalid_database_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tgctl.json");
        std::fs::write(&path, r#"{"database_name": "a/b"}"#).unwrap();

        let err = InstanceConfig::load(&path).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = InstanceConfig::load("/nonexistent/tgctl.json").unwrap_err();
        assert!(err.is_config_error());
    }
}
