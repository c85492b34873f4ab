use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// Directory script `source` paths are resolved against.
    #[serde(default = "ScriptsConfig::default_root")]
    pub root: PathBuf,
    #[serde(default = "ScriptsConfig::default_definitions")]
    pub definitions: PathBuf,
    /// Where pool and runtime state are persisted between runs.
    #[serde(default = "ScriptsConfig::default_state")]
    pub state: PathBuf,
    #[serde(default = "ScriptsConfig::default_scope")]
    pub scope: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleConfig {
    #[serde(default = "BattleConfig::default_target")]
    pub target: u32,
    #[serde(default = "BattleConfig::default_damage")]
    pub damage: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub battle: BattleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfigOverrides {
    pub scripts_root: Option<PathBuf>,
    pub definitions: Option<PathBuf>,
    pub state: Option<PathBuf>,
    pub damage: Option<i64>,
    pub log_level: Option<String>,
}

impl ScriptsConfig {
    fn default_root() -> PathBuf {
        PathBuf::from("assets/scripts")
    }

    fn default_definitions() -> PathBuf {
        PathBuf::from("config/scripts.json")
    }

    fn default_state() -> PathBuf {
        PathBuf::from("target/script_state.json")
    }

    fn default_scope() -> String {
        "core".to_string()
    }
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            definitions: Self::default_definitions(),
            state: Self::default_state(),
            scope: Self::default_scope(),
        }
    }
}

impl BattleConfig {
    const fn default_target() -> u32 {
        1
    }

    const fn default_damage() -> i64 {
        100
    }
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self { target: Self::default_target(), damage: Self::default_damage() }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: Self::default_level() }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Logging is not up yet when the config is read, so failures go to stderr.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) {
        if let Some(root) = &overrides.scripts_root {
            self.scripts.root = root.clone();
        }
        if let Some(definitions) = &overrides.definitions {
            self.scripts.definitions = definitions.clone();
        }
        if let Some(state) = &overrides.state {
            self.scripts.state = state.clone();
        }
        if let Some(damage) = overrides.damage {
            self.battle.damage = damage;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
    }
}

impl AppConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.scripts_root.is_some() {
            fields.push("scripts");
        }
        if self.definitions.is_some() {
            fields.push("definitions");
        }
        if self.state.is_some() {
            fields.push("state");
        }
        if self.damage.is_some() {
            fields.push("damage");
        }
        if self.log_level.is_some() {
            fields.push("log_level");
        }
        fields
    }
}
