use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::{controller::scheduler::RunTiming, error::ControllerError, knowledge::KnowledgeValue};

/// Agent identity inside the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent id, `0..processes`.
    #[serde(default)]
    pub id: u64,
    /// Number of agents in the swarm.
    #[serde(default = "default_processes")]
    pub processes: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: 0,
            processes: default_processes(),
        }
    }
}

/// Named behavior plus its construction arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSpec {
    /// Registered name.
    pub name: String,
    /// Arguments handed to the factory.
    #[serde(default)]
    pub args: Vec<KnowledgeValue>,
}

impl BehaviorSpec {
    /// Behavior without arguments.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

/// Log sink settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// JSON-lines log file; relative paths resolve against the config file.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Most verbose level written to the file.
    #[serde(default)]
    pub level: LogLevel,
}

/// Complete controller configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Agent identity.
    #[serde(default)]
    pub agent: AgentSection,
    /// Loop timing.
    #[serde(default)]
    pub timing: RunTiming,
    /// Platform to start with.
    #[serde(default)]
    pub platform: Option<BehaviorSpec>,
    /// Algorithm to start with.
    #[serde(default)]
    pub algorithm: Option<BehaviorSpec>,
    /// Accents, in execution order.
    #[serde(default)]
    pub accents: Vec<BehaviorSpec>,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ControllerConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading controller config {}", path.display()))?;
        let mut config =
            Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if let Some(log_path) = config.logging.path.as_mut() {
            if log_path.is_relative() {
                *log_path = source_dir.join(&*log_path);
            }
        }
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.agent.processes == 0 {
            return Err(ControllerError::Config("agent.processes must be >= 1".into()));
        }
        if self.agent.id >= self.agent.processes {
            return Err(ControllerError::Config(format!(
                "agent.id {} must be below agent.processes {}",
                self.agent.id, self.agent.processes
            )));
        }
        if let Some(accent) = self.accents.iter().find(|accent| accent.name.is_empty()) {
            return Err(ControllerError::Config(format!(
                "accent with args {:?} has no name",
                accent.args
            )));
        }
        self.timing.validate()
    }
}

const fn default_processes() -> u64 {
    1
}
