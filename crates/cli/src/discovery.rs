//! Finding running servers through their discovery files.
//!
//! Mirrors the server side in `prepl-bridge` (`server/discovery.rs`): one
//! `<server_id>.json` per running server in the discovery directory.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, FixedOffset};
use prepl_protocol::DiscoveryFile;

/// A discovered server, with its creation time parsed for sorting and display.
#[derive(Debug, Clone)]
pub struct RunningServer {
    pub discovery: DiscoveryFile,
    pub created_at: Option<DateTime<FixedOffset>>,
}

impl RunningServer {
    fn new(discovery: DiscoveryFile) -> Self {
        let created_at = DateTime::parse_from_rfc3339(&discovery.created_at).ok();
        Self {
            discovery,
            created_at,
        }
    }

    pub fn short_id(&self) -> &str {
        let id = &self.discovery.server_id;
        id.get(..8).unwrap_or(id)
    }
}

/// Check if a process is still running.
fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid as i32, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to another user
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// List live servers in `dir`, most recent first.
///
/// Discovery files left behind by dead processes are removed. Unreadable or
/// foreign files are skipped.
pub fn list_servers(dir: &Path) -> io::Result<Vec<RunningServer>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut servers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let Ok(contents) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(discovery) = serde_json::from_str::<DiscoveryFile>(&contents) else {
            continue;
        };
        if is_process_alive(discovery.pid) {
            servers.push(RunningServer::new(discovery));
        } else {
            log::debug!("Removing stale discovery file {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }

    servers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(servers)
}

/// Find a server by id or id prefix.
pub fn find_server(dir: &Path, id_prefix: &str) -> io::Result<Option<RunningServer>> {
    let servers = list_servers(dir)?;

    if let Some(server) = servers.iter().find(|s| s.discovery.server_id == id_prefix) {
        return Ok(Some(server.clone()));
    }

    let mut matches: Vec<_> = servers
        .into_iter()
        .filter(|s| s.discovery.server_id.starts_with(id_prefix))
        .collect();

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        n => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("ambiguous server id '{}' matches {} servers", id_prefix, n),
        )),
    }
}
