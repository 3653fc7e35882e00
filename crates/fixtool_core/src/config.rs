use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fixes::{DEFAULT_GROUP_PREFIX, DEFAULT_ID_PREFIX};

pub const DEFAULT_USER_AGENT: &str = "fixtool/0.1";
pub const DEFAULT_REPOSITORY_URL: &str = "https://github.com/Open-Wine-Components/ULWGL-protonfixes";
pub const DEFAULT_API_URL: &str = "https://ulwgl.openwinecomponents.org/ulwgl_api.php";
pub const DEFAULT_LIBRARY_GROUP: &str = "gamefixes-steam";
pub const DEFAULT_LIBRARY_PROVIDER: &str = "steam";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FixtoolConfig {
    #[serde(default)]
    pub sources: SourcesSection,
    #[serde(default)]
    pub fixes: FixesSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourcesSection {
    pub repository_url: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FixesSection {
    pub id_prefix: Option<String>,
    pub group_prefix: Option<String>,
    pub library_group: Option<String>,
    pub library_provider: Option<String>,
}

impl FixtoolConfig {
    /// Resolve the fix repository URL: env FIXTOOL_REPOSITORY_URL > config > default.
    pub fn repository_url(&self) -> String {
        env_or("FIXTOOL_REPOSITORY_URL", self.sources.repository_url.as_deref())
            .unwrap_or_else(|| DEFAULT_REPOSITORY_URL.to_string())
    }

    /// Resolve the catalog API URL: env FIXTOOL_API_URL > config > default.
    pub fn api_url(&self) -> String {
        env_or("FIXTOOL_API_URL", self.sources.api_url.as_deref())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    /// Resolve user agent: env FIXTOOL_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_or("FIXTOOL_USER_AGENT", self.sources.user_agent.as_deref())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn id_prefix(&self) -> &str {
        self.fixes.id_prefix.as_deref().unwrap_or(DEFAULT_ID_PREFIX)
    }

    pub fn group_prefix(&self) -> &str {
        self.fixes
            .group_prefix
            .as_deref()
            .unwrap_or(DEFAULT_GROUP_PREFIX)
    }

    pub fn library_group(&self) -> &str {
        self.fixes
            .library_group
            .as_deref()
            .unwrap_or(DEFAULT_LIBRARY_GROUP)
    }

    pub fn library_provider(&self) -> &str {
        self.fixes
            .library_provider
            .as_deref()
            .unwrap_or(DEFAULT_LIBRARY_PROVIDER)
    }
}

/// Load and parse a FixtoolConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<FixtoolConfig> {
    if !config_path.exists() {
        return Ok(FixtoolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: FixtoolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn render_default_config() -> String {
    format!(
        "# fixtool configuration (materialized by `fixtool init`)\n\n[sources]\n# repository_url = \"{DEFAULT_REPOSITORY_URL}\"\n# api_url = \"{DEFAULT_API_URL}\"\n# user_agent = \"{DEFAULT_USER_AGENT}\"\n\n[fixes]\nid_prefix = \"{DEFAULT_ID_PREFIX}\"\ngroup_prefix = \"{DEFAULT_GROUP_PREFIX}\"\nlibrary_group = \"{DEFAULT_LIBRARY_GROUP}\"\nlibrary_provider = \"{DEFAULT_LIBRARY_PROVIDER}\"\n"
    )
}

fn env_or(key: &str, configured: Option<&str>) -> Option<String> {
    lookup_or(|key| env::var(key).ok(), key, configured)
}

fn lookup_or<F>(lookup_env: F, key: &str, configured: Option<&str>) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup_env(key) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    configured.map(str::to_string)
}
