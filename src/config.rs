//! Project configuration loaded from shipyard.toml.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
/// Top-level shipyard.toml representation.
pub struct ProjectConfig {
    pub app: AppSection,
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub hooks: HooksSection,
}

#[derive(Debug, Deserialize)]
/// Application identity and default target.
pub struct AppSection {
    pub name: String,
    /// Default deploy target; overridable on the command line.
    pub host: Option<String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
/// Env values may be scalars or arrays; arrays are comma-joined at injection.
pub enum EnvValue {
    One(String),
    Many(Vec<String>),
}

impl EnvValue {
    pub fn render(&self) -> String {
        match self {
            EnvValue::One(value) => value.clone(),
            EnvValue::Many(values) => values.join(","),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
/// Build overrides; everything is detected when absent.
pub struct BuildSection {
    pub runtime: Option<String>,
    pub dockerfile: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// How a hook command is executed on the target.
pub enum HookKind {
    /// Runs in a subshell that first sources /etc/{app}/env.
    Shell,
    /// Invokes `{release}/bin/{app} eval '…'`.
    Eval,
}

#[derive(Debug, Deserialize, Clone)]
/// One user-declared hook command.
pub struct HookCommand {
    pub kind: HookKind,
    pub command: String,
}

#[derive(Debug, Deserialize, Default)]
/// Hook lists per stage.
pub struct HooksSection {
    #[serde(default)]
    pub pre_deploy: Vec<HookCommand>,
    #[serde(default)]
    pub migrate: Vec<HookCommand>,
    #[serde(default)]
    pub post_deploy: Vec<HookCommand>,
}

/// Load shipyard.toml from disk.
pub fn load_project_config(path: &Path) -> Result<ProjectConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| Error::Config(format!("failed to read {}: {}", path.display(), err)))?;
    toml::from_str(&raw).map_err(|err| Error::Config(format!("failed to parse shipyard.toml: {}", err)))
}

/// Resolve the config path: explicit flag, else shipyard.toml beside the project.
pub fn resolve_config_path(explicit: Option<&Path>, project_dir: &Path) -> Result<std::path::PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let candidate = project_dir.join("shipyard.toml");
    if candidate.exists() {
        return Ok(candidate);
    }
    Err(Error::Config(format!(
        "shipyard.toml not found in {}; pass --config",
        project_dir.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() -> Result<()> {
        let raw = r#"
[app]
name = "chat"
host = "h1"
domains = ["chat.example.com", "www.chat.example.com"]

[env]
POOL_SIZE = "10"
ALLOWED_ORIGINS = ["https://a.example.com", "https://b.example.com"]

[build]
runtime = "phoenix"

[[hooks.migrate]]
kind = "eval"
command = "Chat.Release.migrate()"

[[hooks.post_deploy]]
kind = "shell"
command = "curl -fsS https://ping.example.com/deploy"
"#;
        let config: ProjectConfig =
            toml::from_str(raw).map_err(|err| Error::Config(err.to_string()))?;
        assert_eq!(config.app.name, "chat");
        assert_eq!(config.app.domains.len(), 2);
        assert_eq!(
            config.env.get("ALLOWED_ORIGINS").map(EnvValue::render),
            Some("https://a.example.com,https://b.example.com".to_string())
        );
        assert_eq!(config.hooks.migrate.len(), 1);
        assert_eq!(config.hooks.migrate[0].kind, HookKind::Eval);
        assert_eq!(config.hooks.post_deploy.len(), 1);
        Ok(())
    }

    #[test]
    fn minimal_config_defaults() -> Result<()> {
        let config: ProjectConfig = toml::from_str("[app]\nname = \"site\"\n")
            .map_err(|err| Error::Config(err.to_string()))?;
        assert!(config.app.host.is_none());
        assert!(config.env.is_empty());
        assert!(config.hooks.pre_deploy.is_empty());
        assert!(config.build.runtime.is_none());
        Ok(())
    }
}
