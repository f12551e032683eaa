//! TOML configuration for the Deckhand host, with defaults matching the
//! built-in policy tables.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use deckhand_sandbox::{CommandPolicy, CommandRule, PathPolicy};
use deckhand_tools::ToolLimits;
use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "deckhand.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeckhandConfig {
    pub store: StoreConfig,
    pub plugins: PluginsConfig,
    pub commands: CommandsConfig,
    pub paths: PathPolicy,
    pub limits: ToolLimits,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".deckhand/deckhand.db"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub root: PathBuf,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("plugins"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
    /// Extra programs (or overrides) merged into the built-in table.
    pub programs: BTreeMap<String, CommandRule>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: deckhand_sandbox::COMMAND_TIMEOUT_MS_DEFAULT,
            max_output_bytes: deckhand_sandbox::COMMAND_MAX_OUTPUT_BYTES_DEFAULT,
            programs: BTreeMap::new(),
        }
    }
}

/// Loads the config from `path`, falling back to `./deckhand.toml` when
/// present, and to compiled-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<DeckhandConfig> {
    let candidate = match path {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default_path = PathBuf::from(CONFIG_FILE_NAME);
            default_path.exists().then_some(default_path)
        }
    };
    let Some(candidate) = candidate else {
        return Ok(DeckhandConfig::default());
    };
    let raw = std::fs::read_to_string(&candidate)
        .with_context(|| format!("failed to read config file {}", candidate.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", candidate.display()))
}

pub fn command_policy(commands: &CommandsConfig) -> CommandPolicy {
    let mut policy = CommandPolicy::host_operations();
    policy.timeout_ms = commands.timeout_ms;
    policy.max_output_bytes = commands.max_output_bytes;
    for (program, rule) in &commands.programs {
        policy.insert(program.clone(), rule.clone());
    }
    policy
}
