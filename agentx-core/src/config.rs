use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File name searched for in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "ssh-agentx.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `agent.sock`.  A fresh temporary directory is used
    /// when unset.
    #[serde(default, alias = "socketDir")]
    pub socketdir: Option<PathBuf>,
    #[serde(default)]
    pub yubikey: YubiKeyConfig,
    /// Identity rules keyed by an arbitrary section name (`[gpg.work]`).
    #[serde(default)]
    pub gpg: BTreeMap<String, IdentityRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YubiKeyConfig {
    #[serde(default)]
    pub enable: bool,
    /// Log every hardware extension request at `info` instead of `debug`.
    #[serde(default, alias = "enableLog")]
    pub enablelog: bool,
    /// Slot selected at startup; empty means the authentication slot.
    #[serde(default, alias = "defaultSlot")]
    pub defaultslot: String,
    /// Explicit pinentry program, overriding `gpg-agent.conf` and `PATH`.
    #[serde(default)]
    pub pinentry: Option<PathBuf>,
    /// Template for the pinentry description.  Supports `{{serial}}` and
    /// `{{retries}}`.
    #[serde(default = "default_pin_description", alias = "pinDescription")]
    pub pindescription: String,
}

impl Default for YubiKeyConfig {
    fn default() -> Self {
        Self {
            enable: false,
            enablelog: false,
            defaultslot: String::new(),
            pinentry: None,
            pindescription: default_pin_description(),
        }
    }
}

/// Derive an OpenPGP identity for every added SSH key whose comment equals
/// `matchcomment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRule {
    #[serde(alias = "matchComment", alias = "match_comment")]
    pub matchcomment: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl Config {
    /// Parse a TOML document.  `origin` is only used in error messages.
    pub fn from_toml(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read and parse `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Identity rules in section-name order.
    pub fn identity_rules(&self) -> Vec<IdentityRule> {
        self.gpg.values().cloned().collect()
    }
}

/// Candidate config locations, most specific first: the working directory,
/// then `$XDG_CONFIG_HOME/ssh-agentx/` (or `~/.config/ssh-agentx/`).
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(".").join(CONFIG_FILE_NAME)];
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")));
    if let Some(base) = base {
        paths.push(base.join("ssh-agentx").join(CONFIG_FILE_NAME));
    }
    paths
}

/// First existing entry of [`search_paths`].
pub fn find_config() -> Option<PathBuf> {
    search_paths().into_iter().find(|p| p.is_file())
}

fn default_pin_description() -> String {
    "YubiKey serial number: {{serial}} ({{retries}} tries remaining)".to_string()
}
