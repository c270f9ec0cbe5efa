use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::UserDirectory;
use crate::resource::Anchor;
use crate::vfs::{LocalProvider, MemoryXattrStore};

fn default_port() -> u16 {
    445
}

/// Server configuration loaded from TOML file.
/// See config.toml.example for format.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// TCP port to listen on (default 445, use 4450 for non-root)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Server name advertised in the NTLM challenge
    pub server_name: String,
    /// List of shared directories
    pub shares: Vec<ShareConfig>,
    /// Configured user accounts
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// A single shared directory configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ShareConfig {
    /// Share name as seen by clients (e.g. "Public")
    pub name: String,
    /// Local filesystem path to share
    pub path: PathBuf,
}

/// A configured user account.
#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    /// Shares this user sees; all of them when absent.
    #[serde(default)]
    pub shares: Option<Vec<String>>,
}

impl Config {
    fn user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.username == name)
    }
}

impl UserDirectory for Config {
    fn password(&self, user: &str) -> Option<String> {
        self.user(user).map(|u| u.password.clone())
    }

    /// One anchor per visible share, each with its own local provider,
    /// followed by the named-pipe share.
    fn anchors_for(&self, user: &str) -> Vec<Anchor> {
        let allowed = self.user(user).and_then(|u| u.shares.as_ref());
        let mut anchors: Vec<Anchor> = self
            .shares
            .iter()
            .filter(|share| {
                allowed.map_or(true, |names| names.iter().any(|n| n.eq_ignore_ascii_case(&share.name)))
            })
            .map(|share| {
                Anchor::new(
                    share.name.clone(),
                    share.path.clone(),
                    Arc::new(LocalProvider::new(share.path.clone())),
                    Arc::new(MemoryXattrStore::new()),
                )
            })
            .collect();
        anchors.push(Anchor::named_pipe());
        anchors
    }
}

/// Parse a TOML configuration.
pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let config: Config = toml::from_str(content)?;
    if config.shares.is_empty() {
        anyhow::bail!("No shares configured");
    }
    Ok(config)
}

/// Load and parse the TOML configuration file.
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path))?;
    parse_config(&content).with_context(|| format!("Failed to parse config file '{}'", path))
}
