//! Configuration loading from `~/.wimble/config.toml` with defaults.

use std::path::{Path, PathBuf};
use tracing::info;
use wimble_types::config::NodeConfig;

/// Load node configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file is not fatal: a warning is logged
/// and the defaults are used.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    wimble_home().join("config.toml")
}

/// Get the default wimble home directory.
pub fn wimble_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".wimble")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wimble_types::config::SecurityMode;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
listen_addr = "0.0.0.0:9000"
security = "insecure"
seed = 42
log_level = "debug"
"#
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.security, SecurityMode::Insecure);
        assert_eq!(config.effective_seed(), Some(42));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.dial_timeout_secs, 10);
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "security = \"maybe\"\n").unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with(".wimble/config.toml"));
    }
}
