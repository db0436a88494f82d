//! Codefresh CLI config
//!
//! Account credentials not given on the command line are read from the
//! Codefresh CLI config file, `~/.cfconfig`:
//!
//! ```yaml
//! contexts:
//!   default:
//!     name: default
//!     token: <api key>
//!     url: https://g.codefresh.io
//! current-context: default
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gitops_pilot_core::{AccountSettings, Secret};
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

pub const CFCONFIG_FILE: &str = ".cfconfig";

#[derive(Debug, Clone, Deserialize)]
pub struct CfConfig {
    #[serde(default)]
    pub contexts: BTreeMap<String, CfContext>,
    #[serde(rename = "current-context", default)]
    pub current_context: String,
}

#[derive(Clone, Deserialize)]
pub struct CfContext {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub url: String,
}

impl std::fmt::Debug for CfContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CfContext")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl CfConfig {
    /// Settings of the current context
    pub fn current(&self) -> Result<AccountSettings, ConfigError> {
        let context = self
            .contexts
            .get(&self.current_context)
            .ok_or_else(|| ConfigError::ContextNotFound(self.current_context.clone()))?;
        Ok(AccountSettings {
            host: context.url.clone(),
            token: Secret::new(context.token.clone()),
        })
    }
}

/// `$HOME/.cfconfig`
pub fn default_cfconfig_path() -> Result<PathBuf, ConfigError> {
    dirs_next::home_dir()
        .map(|home| home.join(CFCONFIG_FILE))
        .ok_or(ConfigError::NoHomeDirectory)
}

pub fn load_cfconfig(path: &Path) -> Result<CfConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Merge account flags with the config file.
///
/// Flags win field by field. With neither flags nor a config file there is
/// no account, which is not an error.
pub fn resolve_account(
    host: Option<String>,
    token: Option<String>,
    config_path: &Path,
) -> Result<Option<AccountSettings>, ConfigError> {
    let host = host.filter(|h| !h.is_empty());
    let token = token.filter(|t| !t.is_empty());

    if let (Some(host), Some(token)) = (&host, &token) {
        return Ok(Some(AccountSettings {
            host: host.clone(),
            token: Secret::new(token.clone()),
        }));
    }

    let from_file = match load_cfconfig(config_path) {
        Ok(config) => Some(config.current()?),
        Err(ConfigError::NotFound(path)) if host.is_none() && token.is_none() => {
            debug!(%path, "no codefresh config, running without an account");
            return Ok(None);
        }
        Err(ConfigError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let host = host.or_else(|| from_file.as_ref().map(|a| a.host.clone()));
    let token = token
        .map(Secret::new)
        .or_else(|| from_file.as_ref().map(|a| a.token.clone()));

    match (host, token) {
        (Some(host), Some(token)) if !host.is_empty() && !token.is_empty() => {
            Ok(Some(AccountSettings { host, token }))
        }
        _ if from_file.is_none() => Err(ConfigError::Missing(
            "codefresh host and token (flags or ~/.cfconfig)".to_string(),
        )),
        _ => Err(ConfigError::Invalid(format!(
            "current context in {} has no url or token",
            config_path.display()
        ))),
    }
}
