use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assets::FsResourceLoader;
use crate::config::AppConfig;
use crate::environment::Environment;
use crate::events::{ApplyDamage, EventBus};
use crate::pool::ScriptPool;
use crate::script_registry::ScriptRegistry;
use crate::scripts::HostRegistry;
use crate::services::{ServiceDirectory, ServiceDirectoryHandle};

/// On-disk layout of the state file written after every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub pool: Value,
    #[serde(default)]
    pub runtime: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub scripts: Vec<String>,
    pub battle_effects: Vec<String>,
    pub active_contexts: Vec<String>,
    pub target: u32,
    pub requested_damage: i64,
    pub applied_damage: Option<i64>,
    pub script_errors: BTreeMap<String, String>,
}

/// Loads every configured script, raises one `ApplyDamage` and persists script state.
pub fn run(config: &AppConfig) -> Result<RunReport> {
    let hosts = Rc::new(HostRegistry::with_defaults());
    hosts.validate().context("Invalid script host configuration")?;

    let loader = FsResourceLoader::new(&config.scripts.root);
    let mut registry = ScriptRegistry::new(hosts, Box::new(loader));
    load_definitions(&mut registry, &config.scripts.definitions, &config.scripts.scope)?;

    let services = ServiceDirectoryHandle::new(ServiceDirectory::new());
    registry.perform_registration(&mut services.borrow_mut()).context("Script registration failed")?;

    let persisted = read_state(&config.scripts.state)?;
    let mut pool = ScriptPool::new(EventBus::new()).with_services(services.clone());
    pool.load_state(persisted.pool);

    let mut script_errors = BTreeMap::new();
    for script in registry.iter() {
        if let Err(err) = pool.get_context(script) {
            tracing::error!(script = script.identifier(), error = %err, "failed to start script");
            script_errors.insert(script.identifier().to_string(), err.to_string());
        }
    }

    let mut event = ApplyDamage::new(config.battle.target, config.battle.damage);
    let bus = pool.event_bus().clone();
    bus.dispatch(&pool, &mut event);
    tracing::info!(target_unit = event.target, applied = ?event.applied(), "damage event finished");

    for script in registry.iter() {
        let Some(context) = pool.context(script) else { continue };
        if let Some(error) = context.last_error() {
            script_errors.insert(script.identifier().to_string(), error);
        }
    }

    let state = PersistedState {
        pool: pool.save_state().context("Saving pool state")?,
        runtime: registry.save_state().context("Saving script runtime state")?,
    };
    write_state(&config.scripts.state, &state)?;

    let battle_effects = services.borrow().battle_effects().map(str::to_string).collect();
    Ok(RunReport {
        scripts: registry.iter().map(|script| script.identifier().to_string()).collect(),
        battle_effects,
        active_contexts: pool.active_scripts().into_iter().map(str::to_string).collect(),
        target: event.target,
        requested_damage: config.battle.damage,
        applied_damage: event.applied(),
        script_errors,
    })
}

fn load_definitions(registry: &mut ScriptRegistry, path: &Path, scope: &str) -> Result<()> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no script definitions found");
        return Ok(());
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read script definitions {}", path.display()))?;
    let document: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse script definitions {}", path.display()))?;
    let loaded = registry
        .load_from_json(scope, &document)
        .with_context(|| format!("Failed to load script definitions {}", path.display()))?;
    tracing::info!(path = %path.display(), loaded, "loaded script definitions");
    Ok(())
}

pub fn read_state(path: &Path) -> Result<PersistedState> {
    if !path.exists() {
        return Ok(PersistedState::default());
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read script state {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse script state {}", path.display()))
}

fn write_state(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(state).context("Serializing script state")?;
    fs::write(path, json).with_context(|| format!("Failed to write script state {}", path.display()))
}
