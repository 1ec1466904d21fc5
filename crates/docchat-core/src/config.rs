use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DocchatError, Result};

/// Top-level configuration for docchat.
///
/// Loaded from `~/.docchat/config.toml` by default. Every section is
/// optional and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocchatConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl DocchatConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: DocchatConfig = toml::from_str(&content)?;
        config.clamp_intervals();
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Replace a zero poll interval with the default.
    ///
    /// `reveal_delay_ms = 0` stays valid and means "no pacing".
    pub fn clamp_intervals(&mut self) {
        if self.poller.interval_ms == 0 {
            let fallback = PollerConfig::default().interval_ms;
            warn!(fallback, "poller.interval_ms must be positive, using default");
            self.poller.interval_ms = fallback;
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| DocchatError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Apply `DOCCHAT_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("DOCCHAT_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!(value = %port, "Ignoring invalid DOCCHAT_PORT"),
            }
        }
        if let Some(url) = lookup("DOCCHAT_BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend.base_url = url.trim().to_string();
            }
        }
        if let Some(dir) = lookup("DOCCHAT_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.general.data_dir = dir;
            }
        }
    }

    /// Data directory with a leading `~` expanded to the home directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Path of the SQLite database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.resolved_data_dir().join("docchat.db")
    }
}

/// Expand `~/` (or `~\`) to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path.starts_with("~/") || path.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&path[2..])
    } else {
        PathBuf::from(path)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite store.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.docchat/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the API binds on 127.0.0.1.
    pub port: u16,
    /// Requests per second allowed on authenticated routes.
    pub rate_limit_per_sec: u64,
    /// Origins allowed by CORS.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            rate_limit_per_sec: 100,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

/// Indexing backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the crawl/index/chat service.
    pub base_url: String,
    /// `top_k` sent with chat queries that do not set one.
    pub default_top_k: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            default_top_k: 3,
        }
    }
}

/// Document status poller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Milliseconds between status fetches.
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_ms: 2000 }
    }
}

/// Chat reply settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Delay between revealed words of a streamed reply.
    pub reveal_delay_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            reveal_delay_ms: 100,
        }
    }
}

/// Local auth provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of an access token.
    pub session_ttl_hours: u32,
    /// Confirm e-mail addresses at sign-up.
    pub auto_confirm: bool,
    /// Minimum accepted password length.
    pub min_password_len: usize,
    /// Argon2 memory cost in KiB.
    pub hash_memory_kib: u32,
    /// Argon2 iteration count.
    pub hash_iterations: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: 24,
            auto_confirm: false,
            min_password_len: 6,
            hash_memory_kib: 19_456,
            hash_iterations: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = DocchatConfig::default();
        assert_eq!(config.general.data_dir, "~/.docchat/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.rate_limit_per_sec, 100);
        assert_eq!(config.backend.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.backend.default_top_k, 3);
        assert_eq!(config.poller.interval_ms, 2000);
        assert_eq!(config.chat.reveal_delay_ms, 100);
        assert_eq!(config.auth.session_ttl_hours, 24);
        assert!(!config.auth.auto_confirm);
        assert_eq!(config.auth.min_password_len, 6);
    }

    #[test]
    fn test_load_valid_config() {
        let file = create_temp_config(
            r#"
[general]
data_dir = "/tmp/docchat"
log_level = "debug"

[server]
port = 4100
rate_limit_per_sec = 5

[backend]
base_url = "http://indexer:9000"
default_top_k = 8

[poller]
interval_ms = 500
"#,
        );
        let config = DocchatConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/tmp/docchat");
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.server.rate_limit_per_sec, 5);
        assert_eq!(config.backend.base_url, "http://indexer:9000");
        assert_eq!(config.backend.default_top_k, 8);
        assert_eq!(config.poller.interval_ms, 500);
        // Untouched sections keep defaults.
        assert_eq!(config.chat.reveal_delay_ms, 100);
        assert_eq!(config.auth.session_ttl_hours, 24);
    }

    #[test]
    fn test_load_partial_section_uses_defaults() {
        let file = create_temp_config("[server]\nport = 8080\n");
        let config = DocchatConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.rate_limit_per_sec, 100);
        assert_eq!(config.server.allowed_origins.len(), 2);
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("[server\nport = ");
        let result = DocchatConfig::load(file.path());
        assert!(matches!(result, Err(DocchatError::Config(_))));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = DocchatConfig::load(Path::new("/does/not/exist/config.toml"));
        assert!(matches!(result, Err(DocchatError::Io(_))));
    }

    #[test]
    fn test_zero_poll_interval_falls_back_to_default() {
        let file = create_temp_config("[poller]\ninterval_ms = 0\n\n[chat]\nreveal_delay_ms = 0\n");
        let config = DocchatConfig::load(file.path()).unwrap();
        assert_eq!(config.poller.interval_ms, 2000);
        assert_eq!(config.chat.reveal_delay_ms, 0);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DocchatConfig::default();
        config.server.port = 5555;
        config.auth.auto_confirm = true;
        config.save(&path).unwrap();

        let loaded = DocchatConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 5555);
        assert!(loaded.auth.auto_confirm);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DOCCHAT_PORT", "4321"),
            ("DOCCHAT_BACKEND_URL", " http://10.0.0.2:8000 "),
            ("DOCCHAT_DATA_DIR", "/srv/docchat"),
        ]
        .into_iter()
        .collect();

        let mut config = DocchatConfig::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 4321);
        assert_eq!(config.backend.base_url, "http://10.0.0.2:8000");
        assert_eq!(config.general.data_dir, "/srv/docchat");
        assert_eq!(config.database_path(), PathBuf::from("/srv/docchat/docchat.db"));
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let mut config = DocchatConfig::default();
        config.apply_overrides_from(|key| {
            (key == "DOCCHAT_PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/var/lib/docchat"), PathBuf::from("/var/lib/docchat"));
        let expanded = expand_home("~/.docchat/data");
        assert!(expanded.ends_with(".docchat/data"));
        assert!(!expanded.starts_with("~"));
    }
}
