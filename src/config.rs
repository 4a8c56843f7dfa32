//! Runtime configuration, merged from (highest to lowest precedence) CLI flags, environment
//! variables, an optional JSON config file, and built-in defaults.

use getset::Getters;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

fn default_state_root() -> PathBuf {
    PathBuf::from("/run/ociproxd")
}

fn default_binary() -> String {
    "crun".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Shape of the optional on-disk config file; every field is optional so a file only needs to
/// override what it cares about.
struct FileConfig {
    state_root: Option<PathBuf>,
    default_runtime: Option<String>,
    oci_binary: Option<String>,
    oci_library: Option<PathBuf>,
    lxc_binary: Option<String>,
    lxc_template: Option<String>,
    lxc_storage: Option<String>,
    remote_hosts: Option<Vec<String>>,
    remote_node: Option<String>,
    remote_token: Option<String>,
    remote_tls_verify: Option<bool>,
    log_level: Option<String>,
}

#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct Config {
    state_root: PathBuf,
    default_runtime: Option<String>,
    oci_binary: String,
    oci_library: Option<PathBuf>,
    lxc_binary: String,
    lxc_template: String,
    lxc_storage: String,
    remote_hosts: Vec<String>,
    remote_node: String,
    remote_token: String,
    remote_tls_verify: bool,
    log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            default_runtime: None,
            oci_binary: default_binary(),
            oci_library: None,
            lxc_binary: "pct".to_string(),
            lxc_template: String::new(),
            lxc_storage: "local".to_string(),
            remote_hosts: Vec::new(),
            remote_node: String::new(),
            remote_token: String::new(),
            remote_tls_verify: true,
            log_level: "info".to_string(),
        }
    }
}

/// Overrides supplied directly on the command line; these win over everything else.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub state_root: Option<PathBuf>,
    pub default_runtime: Option<String>,
    pub log_level: Option<String>,
}

impl Config {
    /// Loads config-file settings (if `CONFIG_PATH`/`config_path` names a readable file),
    /// layers environment variable overrides on top, then CLI overrides on top of that.
    pub fn load(config_path: Option<&std::path::Path>, overrides: CliOverrides) -> Self {
        let mut config = Config::default();

        let path = config_path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("CONFIG_PATH").map(PathBuf::from));
        if let Some(path) = path {
            if let Ok(contents) = fs::read_to_string(&path) {
                if let Ok(file) = serde_json::from_str::<FileConfig>(&contents) {
                    config.apply_file(file);
                }
            }
        }

        config.apply_env();

        if let Some(root) = overrides.state_root {
            config.state_root = root;
        }
        if let Some(runtime) = overrides.default_runtime {
            config.default_runtime = Some(runtime);
        }
        if let Some(level) = overrides.log_level {
            config.log_level = level;
        }

        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.state_root {
            self.state_root = v;
        }
        if let Some(v) = file.default_runtime {
            self.default_runtime = Some(v);
        }
        if let Some(v) = file.oci_binary {
            self.oci_binary = v;
        }
        if let Some(v) = file.oci_library {
            self.oci_library = Some(v);
        }
        if let Some(v) = file.lxc_binary {
            self.lxc_binary = v;
        }
        if let Some(v) = file.lxc_template {
            self.lxc_template = v;
        }
        if let Some(v) = file.lxc_storage {
            self.lxc_storage = v;
        }
        if let Some(v) = file.remote_hosts {
            self.remote_hosts = v;
        }
        if let Some(v) = file.remote_node {
            self.remote_node = v;
        }
        if let Some(v) = file.remote_token {
            self.remote_token = v;
        }
        if let Some(v) = file.remote_tls_verify {
            self.remote_tls_verify = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("STATE_ROOT") {
            self.state_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DEFAULT_RUNTIME") {
            self.default_runtime = Some(v);
        }
        if let Ok(v) = std::env::var("REMOTE_TOKEN") {
            self.remote_token = v;
        }
        if let Ok(v) = std::env::var("REMOTE_NODE") {
            self.remote_node = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_supplied() {
        let config = Config::load(None, CliOverrides::default());
        assert_eq!(config.state_root(), &default_state_root());
        assert_eq!(config.oci_binary(), "crun");
    }

    #[test]
    fn file_config_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"state-root": "/tmp/state", "default-runtime": "lxc"}"#).unwrap();

        let config = Config::load(Some(&path), CliOverrides::default());
        assert_eq!(config.state_root(), &PathBuf::from("/tmp/state"));
        assert_eq!(config.default_runtime().as_deref(), Some("lxc"));
    }

    #[test]
    fn cli_override_wins_over_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"state-root": "/tmp/state"}"#).unwrap();

        let overrides = CliOverrides {
            state_root: Some(PathBuf::from("/tmp/override")),
            ..Default::default()
        };
        let config = Config::load(Some(&path), overrides);
        assert_eq!(config.state_root(), &PathBuf::from("/tmp/override"));
    }
}
