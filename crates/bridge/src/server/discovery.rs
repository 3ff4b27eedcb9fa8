//! Discovery file management for the REPL server.
//!
//! Each running server writes `<server_id>.json` into the discovery directory
//! so clients can find its port without configuration. The file is removed
//! when the server stops.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use prepl_protocol::{DiscoveryFile, PROTOCOL_VERSION};

/// Owns one discovery file for the lifetime of a server.
pub struct DiscoveryManager {
    path: PathBuf,
    discovery: DiscoveryFile,
}

impl DiscoveryManager {
    /// Create the manager and write the discovery file.
    pub fn new(
        dir: &Path,
        server_id: &str,
        port: u16,
        host_title: &str,
        mode: &str,
    ) -> std::io::Result<Self> {
        let discovery = DiscoveryFile {
            server_id: server_id.to_string(),
            port,
            pid: std::process::id(),
            host_title: host_title.to_string(),
            mode: mode.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            protocol_version: PROTOCOL_VERSION,
        };
        let manager = Self {
            path: discovery_file_path(dir, server_id),
            discovery,
        };
        manager.write()?;
        Ok(manager)
    }

    pub fn discovery(&self) -> &DiscoveryFile {
        &self.discovery
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the discovery file atomically (write to temp, then rename).
    fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            let json = serde_json::to_string_pretty(&self.discovery)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)
    }

    /// Remove the discovery file (called on shutdown).
    pub fn cleanup(&self) -> std::io::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for DiscoveryManager {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Path of a server's discovery file inside `dir`.
pub fn discovery_file_path(dir: &Path, server_id: &str) -> PathBuf {
    dir.join(format!("{}.json", server_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let servers = dir.path().join("servers");

        let manager = DiscoveryManager::new(&servers, "abc", 4242, "Demo", "edit").unwrap();
        let path = manager.path().to_path_buf();
        assert_eq!(path, servers.join("abc.json"));

        let parsed: DiscoveryFile =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.port, 4242);
        assert_eq!(parsed.mode, "edit");
        assert_eq!(parsed.pid, std::process::id());
        assert!(chrono::DateTime::parse_from_rfc3339(&parsed.created_at).is_ok());

        // No temp file left behind
        assert!(!path.with_extension("json.tmp").exists());

        drop(manager);
        assert!(!path.exists());
    }
}
