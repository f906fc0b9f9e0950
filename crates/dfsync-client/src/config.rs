use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use dfsync_storage::CHECKSUM_CHUNK_SIZE;

/// Extensions synchronized when no whitelist is configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "png", "gif", "txt", "xlsx", "docx", "md", "psd"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub mount_path: PathBuf,
    pub client_id: String,
    pub deadline_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub chunk_size: usize,
    pub extensions: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::from("127.0.0.1:42001"),
            mount_path: PathBuf::from("/tmp/dfs-client"),
            client_id: default_client_id(),
            deadline_timeout_ms: 10_000,
            poll_interval_ms: 3_000,
            chunk_size: CHECKSUM_CHUNK_SIZE,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

/// `<hostname>-<uuid v4>`.
pub fn default_client_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| String::from("dfs-client"));
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.server_addr, "127.0.0.1:42001");
        assert_eq!(config.deadline_timeout_ms, 10_000);
        assert_eq!(config.poll_interval_ms, 3_000);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.extensions.len(), 8);
        assert!(config.extensions.contains(&"md".to_string()));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = default_client_id();
        let b = default_client_id();
        assert_ne!(a, b);
        assert!(a.len() > 36);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            server_addr = "10.0.0.5:42001"
            client_id = "laptop"
            extensions = ["txt"]
            "#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_addr, "10.0.0.5:42001");
        assert_eq!(config.client_id, "laptop");
        assert_eq!(config.extensions, vec!["txt".to_string()]);
        assert_eq!(config.poll_interval_ms, 3_000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"deadline_timeout_ms": 500, "mount_path": "/mnt/dfs"}}"#).unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.deadline_timeout_ms, 500);
        assert_eq!(config.mount_path, PathBuf::from("/mnt/dfs"));
    }
}
