// REPL server settings
// Loaded from ~/.config/prepl/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `server.port`.
pub const ENV_PORT: &str = "PREPL_PORT";

/// Environment variable overriding `server.bindAddress`.
pub const ENV_BIND: &str = "PREPL_BIND";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Server
    #[serde(rename = "server.enabled")]
    pub server_enabled: bool,

    #[serde(rename = "server.bindAddress")]
    pub bind_address: String,

    #[serde(rename = "server.port")]
    pub port: u16, // 0 = pick a free port

    #[serde(rename = "server.maxConnections")]
    pub max_connections: usize,

    #[serde(rename = "server.writeDiscoveryFile")]
    pub write_discovery_file: bool,

    // Callback queue
    #[serde(rename = "queue.warnThreshold")]
    pub queue_warn_threshold: usize,

    // Evaluation limits
    #[serde(rename = "eval.instructionLimit")]
    pub instruction_limit: i64,

    #[serde(rename = "eval.timeoutSecs")]
    pub eval_timeout_secs: u64,

    #[serde(rename = "eval.maxOutputLines")]
    pub max_output_lines: usize,

    // Host round trips (host:get, host:keys)
    #[serde(rename = "host.replyTimeoutMs")]
    pub host_reply_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Server
            server_enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 8,
            write_discovery_file: true,
            // Queue
            queue_warn_threshold: 1024,
            // Eval
            instruction_limit: 100_000_000,
            eval_timeout_secs: 30,
            max_output_lines: 5_000,
            // Host
            host_reply_timeout_ms: 2_000,
        }
    }
}

impl Settings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        crate::paths::config_dir().join("settings.json")
    }

    /// Load settings from disk, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();

        if !path.exists() {
            let settings = Self::default();
            settings.create_default_file();
            return settings;
        }

        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("{}; using default settings", e);
                Self::default()
            }
        }
    }

    /// Load settings from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {}", path.display(), e))?;
        Self::parse(&contents)
            .map_err(|e| format!("Error parsing {}: {}", path.display(), e))
    }

    /// Parse settings JSON. Lines starting with `//` are comments.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");

        serde_json::from_str(&cleaned).map_err(|e| e.to_string())
    }

    /// Apply `PREPL_PORT` / `PREPL_BIND` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup (environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup(ENV_PORT) {
            match port.trim().parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => log::warn!("Ignoring invalid {}={:?}", ENV_PORT, port),
            }
        }
        if let Some(bind) = lookup(ENV_BIND) {
            let bind = bind.trim();
            if !bind.is_empty() {
                self.bind_address = bind.to_string();
            }
        }
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_secs(self.eval_timeout_secs)
    }

    pub fn host_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.host_reply_timeout_ms)
    }

    /// Create default settings file with comments
    fn create_default_file(&self) {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::warn!("Error creating config directory: {}", e);
                return;
            }
        }

        if let Err(e) = fs::write(&path, DEFAULT_SETTINGS_FILE) {
            log::warn!("Error writing default settings.json: {}", e);
        }
    }

    /// Get the config file path for display/opening
    pub fn config_path_display() -> String {
        Self::config_path().to_string_lossy().to_string()
    }
}

const DEFAULT_SETTINGS_FILE: &str = r#"{
    // REPL server (port 0 = pick a free port; see the discovery file)
    "server.enabled": true,
    "server.bindAddress": "127.0.0.1",
    "server.port": 0,
    "server.maxConnections": 8,
    "server.writeDiscoveryFile": true,

    // Log a warning when this many host callbacks are waiting
    "queue.warnThreshold": 1024,

    // Evaluation limits, per request
    "eval.instructionLimit": 100000000,
    "eval.timeoutSecs": 30,
    "eval.maxOutputLines": 5000,

    // How long host:get() waits for the host to drain its queue
    "host.replyTimeoutMs": 2000
}
"#;
