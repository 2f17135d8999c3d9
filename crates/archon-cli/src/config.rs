//! Configuration resolution for the archon CLI.
//!
//! Paths and defaults resolve through the chain: CLI flag > env var >
//! config file (`~/.config/archon/config.toml`) > built-in default.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use archon_core::duration::parse_duration;
use archon_postbox::AgentId;

/// Environment variable names.
pub const ENV_POSTBOX_ROOT: &str = "ARCHON_POSTBOX_ROOT";
pub const ENV_ARCHIVE_ROOT: &str = "ARCHON_ARCHIVE_ROOT";
pub const ENV_LOG_DIR: &str = "ARCHON_LOG_DIR";
pub const ENV_PLAN_TIMEOUT: &str = "ARCHON_PLAN_TIMEOUT";

/// Optional config file contents.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    /// Per-agent trigger commands, e.g.
    /// `CA = ["systemctl", "kick", "agent-ca"]`. Fired after each
    /// assignment enqueue so the agent observes its inbox promptly.
    #[serde(default)]
    pub triggers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PathsSection {
    pub postbox_root: Option<PathBuf>,
    pub archive_root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DefaultsSection {
    /// Plan timeout as a `\d+[smhd]` duration string.
    pub plan_timeout: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct ArchonConfig {
    pub postbox_root: PathBuf,
    pub archive_root: PathBuf,
    pub log_dir: PathBuf,
    pub plan_timeout: Duration,
    pub trigger_commands: HashMap<AgentId, Vec<String>>,
}

/// Flag-level overrides collected from the CLI.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub postbox_root: Option<PathBuf>,
    pub archive_root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub plan_timeout: Option<String>,
}

/// The archon config directory, XDG layout.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("archon");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("archon")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn load_config_file() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
}

impl ArchonConfig {
    /// Resolve the effective configuration.
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self> {
        let file = load_config_file()?;

        let postbox_root = overrides
            .postbox_root
            .clone()
            .or_else(|| std::env::var(ENV_POSTBOX_ROOT).ok().map(PathBuf::from))
            .or(file.paths.postbox_root)
            .unwrap_or_else(|| PathBuf::from("postbox"));
        let archive_root = overrides
            .archive_root
            .clone()
            .or_else(|| std::env::var(ENV_ARCHIVE_ROOT).ok().map(PathBuf::from))
            .or(file.paths.archive_root)
            .unwrap_or_else(|| PathBuf::from("archive"));
        let log_dir = overrides
            .log_dir
            .clone()
            .or_else(|| std::env::var(ENV_LOG_DIR).ok().map(PathBuf::from))
            .or(file.paths.log_dir)
            .unwrap_or_else(|| PathBuf::from("logs"));

        let timeout_text = overrides
            .plan_timeout
            .clone()
            .or_else(|| std::env::var(ENV_PLAN_TIMEOUT).ok())
            .or(file.defaults.plan_timeout);
        let plan_timeout = match timeout_text {
            Some(text) => parse_duration(&text)
                .with_context(|| format!("invalid plan timeout {text:?}"))?,
            None => Duration::from_secs(3600),
        };

        let mut trigger_commands = HashMap::new();
        for (agent, command) in file.triggers {
            let Ok(agent) = agent.parse::<AgentId>() else {
                bail!("config [triggers]: unknown agent {agent:?}");
            };
            trigger_commands.insert(agent, command);
        }

        Ok(Self {
            postbox_root,
            archive_root,
            log_dir,
            plan_timeout,
            trigger_commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_override_wins() {
        let overrides = ConfigOverrides {
            postbox_root: Some(PathBuf::from("/tmp/pb")),
            plan_timeout: Some("2h".to_owned()),
            ..ConfigOverrides::default()
        };
        let config = ArchonConfig::resolve(&overrides).unwrap();
        assert_eq!(config.postbox_root, PathBuf::from("/tmp/pb"));
        assert_eq!(config.plan_timeout, Duration::from_secs(7200));
    }

    #[test]
    fn defaults_apply_without_overrides() {
        // Env vars may leak in from the caller's shell; only assert the
        // built-in fallbacks when they are unset.
        if std::env::var(ENV_POSTBOX_ROOT).is_err() && std::env::var(ENV_PLAN_TIMEOUT).is_err() {
            let config = ArchonConfig::resolve(&ConfigOverrides::default()).unwrap();
            assert_eq!(config.postbox_root, PathBuf::from("postbox"));
            assert_eq!(config.plan_timeout, Duration::from_secs(3600));
        }
    }

    #[test]
    fn invalid_timeout_is_an_error() {
        let overrides = ConfigOverrides {
            plan_timeout: Some("soon".to_owned()),
            ..ConfigOverrides::default()
        };
        assert!(ArchonConfig::resolve(&overrides).is_err());
    }

    #[test]
    fn config_file_schema_parses() {
        let file: ConfigFile = toml::from_str(
            r#"
[paths]
postbox_root = "/var/lib/archon/postbox"

[defaults]
plan_timeout = "30m"

[triggers]
CA = ["systemctl", "kick", "agent-ca"]
"#,
        )
        .unwrap();
        assert_eq!(
            file.paths.postbox_root,
            Some(PathBuf::from("/var/lib/archon/postbox"))
        );
        assert_eq!(file.defaults.plan_timeout.as_deref(), Some("30m"));
        assert_eq!(file.triggers["CA"], vec!["systemctl", "kick", "agent-ca"]);
    }
}
