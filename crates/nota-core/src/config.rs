//! Service configuration.
//!
//! `OtaConfig` is the on-disk TOML form; `Settings` is what the running
//! session reads.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::reply::{Metadata, ReplyFormat};
use crate::protocol::UpdateKind;
use crate::storage::{StagedStorage, StorageSink, VerifyingStorage};

/// Default storage capacity: 1 MiB.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Which storage sink receives the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Buffer, verify MD5 and commit on close.
    #[default]
    Verifying,
    /// Program a staging region word by word, copy it over on apply.
    Staged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Largest accepted image in bytes.
    pub capacity: usize,
    /// Where a committed program image is written.
    pub image_path: Option<String>,
    /// Where a committed filesystem image is written.
    pub filesystem_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            capacity: DEFAULT_CAPACITY,
            image_path: None,
            filesystem_path: None,
        }
    }
}

impl StorageConfig {
    /// Construct the configured sink.
    pub fn build(&self) -> Box<dyn StorageSink> {
        match self.backend {
            StorageBackend::Verifying => {
                let mut sink = VerifyingStorage::new(self.capacity);
                if let Some(path) = &self.image_path {
                    sink = sink.with_output(UpdateKind::Flash, path);
                }
                if let Some(path) = &self.filesystem_path {
                    sink = sink.with_output(UpdateKind::Filesystem, path);
                }
                Box::new(sink)
            }
            StorageBackend::Staged => {
                let mut sink = StagedStorage::new(self.capacity);
                if let Some(path) = &self.image_path {
                    sink = sink.with_image_file(path);
                }
                Box::new(sink)
            }
        }
    }
}

/// Configuration file for an OTA endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// TCP port; 0 selects the protocol default.
    pub port: u16,
    /// Empty selects a name derived from the MAC address.
    pub hostname: String,
    pub platform: String,
    pub board: String,
    pub firmware_version: String,
    /// Plaintext password. Only its MD5 is kept in memory.
    pub password: Option<String>,
    /// MD5 of the password, used when `password` is absent.
    pub password_hash: Option<String>,
    pub reboot_on_success: bool,
    pub reply_format: ReplyFormat,
    /// Answer UDP discovery probes.
    pub discovery: bool,
    pub storage: StorageConfig,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            port: 0,
            hostname: String::new(),
            platform: String::new(),
            board: String::new(),
            firmware_version: String::new(),
            password: None,
            password_hash: None,
            reboot_on_success: true,
            reply_format: ReplyFormat::default(),
            discovery: false,
            storage: StorageConfig::default(),
        }
    }
}

impl OtaConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OtaConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Identity and policy of a running endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub port: u16,
    pub hostname: String,
    pub platform: String,
    pub board: String,
    pub firmware_version: String,
    /// Lowercase hex MD5 of the password. `None` disables authentication.
    pub password_digest: Option<String>,
    pub reboot_on_success: bool,
    pub reply_format: ReplyFormat,
}

impl Settings {
    pub fn metadata(&self) -> Metadata<'_> {
        Metadata {
            hostname: &self.hostname,
            platform: &self.platform,
            board: &self.board,
            firmware_version: &self.firmware_version,
            format: self.reply_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: OtaConfig = toml::from_str(
            r#"
            hostname = "bench-node"
            password = "admin"

            [storage]
            backend = "staged"
            "#,
        )
        .unwrap();
        assert_eq!(config.hostname, "bench-node");
        assert_eq!(config.port, 0);
        assert!(config.reboot_on_success);
        assert_eq!(config.storage.backend, StorageBackend::Staged);
        assert_eq!(config.storage.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.reply_format, ReplyFormat::Extended);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nota.toml");
        let config = OtaConfig {
            port: 9000,
            board: "blackpill".into(),
            reply_format: ReplyFormat::Legacy,
            discovery: true,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(OtaConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_build_backend() {
        let storage = StorageConfig {
            backend: StorageBackend::Staged,
            capacity: 4096,
            ..Default::default()
        };
        let sink = storage.build();
        assert_eq!(sink.capacity(), 4096);
        assert!(!sink.verifies_digest());

        let sink = StorageConfig::default().build();
        assert!(sink.verifies_digest());
    }
}
