// Well-known locations for settings and discovery files

use std::path::PathBuf;

/// Application directory name under the platform config/state roots.
pub const APP_DIR: &str = "prepl";

/// Directory holding `settings.json`.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Platform-specific directory for server discovery files.
///
/// - Linux: `$XDG_STATE_HOME/prepl/servers` or `~/.local/state/prepl/servers`
/// - macOS: `~/Library/Application Support/prepl/servers`
/// - Windows: `%LOCALAPPDATA%\prepl\servers`
pub fn discovery_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let base = std::env::var("XDG_STATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local/state")
            });
        base.join(APP_DIR).join("servers")
    }

    #[cfg(target_os = "macos")]
    {
        let base = dirs::data_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("Library/Application Support")
        });
        base.join(APP_DIR).join("servers")
    }

    #[cfg(target_os = "windows")]
    {
        let base = dirs::data_local_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("C:\\"))
                .join("AppData\\Local")
        });
        base.join(APP_DIR).join("servers")
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        std::env::temp_dir().join(APP_DIR).join("servers")
    }
}
