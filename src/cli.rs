use crate::config::AppConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

const SUPPORTED_FLAGS: &str = "--config, --scripts, --definitions, --state, --damage, --log-level";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    scripts_root: Option<PathBuf>,
    definitions: Option<PathBuf>,
    state: Option<PathBuf>,
    damage: Option<i64>,
    log_level: Option<String>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Supported flags: {SUPPORTED_FLAGS}.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "scripts" => overrides.scripts_root = Some(PathBuf::from(value)),
                "definitions" => overrides.definitions = Some(PathBuf::from(value)),
                "state" => overrides.state = Some(PathBuf::from(value)),
                "damage" => {
                    overrides.damage =
                        Some(value.parse::<i64>().with_context(|| format!("Invalid damage '{value}'"))?);
                }
                "log-level" => overrides.log_level = Some(value),
                _ => bail!("Unknown flag '{flag}'. Supported flags: {SUPPORTED_FLAGS}."),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    pub fn into_config_overrides(self) -> AppConfigOverrides {
        AppConfigOverrides {
            scripts_root: self.scripts_root,
            definitions: self.definitions,
            state: self.state,
            damage: self.damage,
            log_level: self.log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paths_and_damage() {
        let args = ["app", "--config", "app.json", "--scripts", "mods", "--damage", "23450"];
        let overrides = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(overrides.config_path(), Some(Path::new("app.json")));
        let config = overrides.into_config_overrides();
        assert_eq!(config.scripts_root, Some(PathBuf::from("mods")));
        assert_eq!(config.damage, Some(23450));
        assert_eq!(config.state, None);
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["app", "--damage", "1", "--log-level", "warn", "--damage", "-4"];
        let overrides = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(overrides.damage, Some(-4));
        assert_eq!(overrides.log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["app", "--state"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags_and_bad_numbers() {
        let err = CliOverrides::parse(["app", "--width", "800"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
        let err = CliOverrides::parse(["app", "--damage", "lots"]).unwrap_err();
        assert!(err.to_string().contains("Invalid damage"), "damage must be numeric");
        assert!(CliOverrides::parse(["app", "positional"]).is_err());
    }
}
