//! Runtime configuration for rigger.
//!
//! `Config` resolves all well-known paths under the project's `.rigger/`
//! directory and loads tunables from an optional `rigger.toml` at the
//! project root.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// Phase-defining inputs covered by the content digest
    pub inputs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub rollback_file: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub toml: RiggerToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let toml = RiggerToml::load_or_default(&project_dir)?;

        let inputs_dir = project_dir.join(&toml.inputs.dir);
        let state_dir = project_dir.join(".rigger");
        let state_file = state_dir.join("state.json");
        let lock_file = state_dir.join("rigger.lock");
        let rollback_file = state_dir.join("rollback.json");
        let log_dir = state_dir.join("logs");

        Ok(Self {
            project_dir,
            inputs_dir,
            state_dir,
            state_file,
            lock_file,
            rollback_file,
            log_dir,
            verbose,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.lock.timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.toml.lock.poll_interval_ms)
    }

    pub fn heal_verify_delay(&self) -> Duration {
        Duration::from_secs(self.toml.heal.verify_delay_secs)
    }
}

/// Contents of `rigger.toml`. Every field has a default so the file is
/// optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RiggerToml {
    pub lock: LockSettings,
    pub heal: HealSettings,
    pub recovery: RecoverySettings,
    pub platform: PlatformSettings,
    pub commands: CommandSettings,
    pub inputs: InputSettings,
}

impl RiggerToml {
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join("rigger.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config: {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self { timeout_secs: 60, poll_interval_ms: 500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealSettings {
    /// Delay before the single bounded re-check of a restarted consumer
    pub verify_delay_secs: u64,
}

impl Default for HealSettings {
    fn default() -> Self {
        Self { verify_delay_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Default choice when no operator is attached: "abort" or "skip"
    pub default: String,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self { default: "abort".to_string() }
    }
}

/// Commands driving system generations (capture/rollback/probe).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    /// Prints the current generation identifier
    pub generation_cmd: String,
    /// Invoked as `<switch_cmd> <generation>` to activate a generation
    pub switch_cmd: String,
    /// Health probe command; exit 0 means healthy
    pub probe_cmd: String,
    /// Directory backing the rollback point
    pub backup_root: String,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            generation_cmd: "rigger-generation".to_string(),
            switch_cmd: "rigger-switch".to_string(),
            probe_cmd: "rigger-probe".to_string(),
            backup_root: "/var/lib/rigger/backup".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub package_manager: String,
    pub kubectl: String,
    /// Invoked as `<build> <unit>` to rebuild an artifact unit
    pub build: String,
    /// Invoked as `<publish> <unit> <tag>` to push a rebuilt artifact
    pub publish: String,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            package_manager: "apt-get".to_string(),
            kubectl: "kubectl".to_string(),
            build: "rigger-build".to_string(),
            publish: "rigger-publish".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    /// Digest-covered inputs directory, relative to the project
    pub dir: String,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self { dir: "templates".to_string() }
    }
}
