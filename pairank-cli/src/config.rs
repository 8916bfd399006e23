/// Config file loading and creation for pairank CLI.
///
/// Config lives at ~/.config/pairank/config.toml.
/// All fields are optional. CLI args override config values.
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::bail;

#[derive(Deserialize, Default, Debug, PartialEq)]
pub struct PairankConfig {
    pub store: Option<PathBuf>,
    pub user: Option<String>,
    pub max_comparisons: Option<u32>,
    pub retries: Option<u32>,
}

const DEFAULT_CONFIG_TEMPLATE: &str = "\
# pairank configuration
# All values here can be overridden by CLI flags.

# Where rankings are stored (JSON file)
# store = \"~/.config/pairank/store.json\"

# Whose ranking to work on
# user = \"me\"

# Max comparisons per placement before the position is accepted as-is
# max_comparisons = 10

# Attempts per row write before a save is reported as failed
# retries = 3
";

fn config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| bail("HOME environment variable not set"));
    PathBuf::from(home).join(".config").join("pairank")
}

/// Returns the default config path: ~/.config/pairank/config.toml
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Returns the default store path: ~/.config/pairank/store.json
pub fn default_store_path() -> PathBuf {
    config_dir().join("store.json")
}

/// Expand a leading `~/` to $HOME.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(rest),
            Err(_) => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Load config from a file path. Returns default (all None) if file doesn't exist.
pub fn load_config(path: &Path) -> PairankConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)
            .unwrap_or_else(|e| bail(format!("Failed to parse config at {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => PairankConfig::default(),
        Err(e) => bail(format!("Failed to read config at {}: {e}", path.display())),
    }
}

/// Create the default config file at `path`. Errors if it already exists.
pub fn create_default_config(path: &Path) {
    if path.exists() {
        bail(format!("Config file already exists at {}", path.display()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| bail(format!("Failed to create directory {}: {e}", parent.display())));
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)
        .unwrap_or_else(|e| bail(format!("Failed to write config to {}: {e}", path.display())));
}
