use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::assets::ResourceLoader;
use crate::error::ScriptError;
use crate::pool::ScriptPool;
use crate::services::{Implements, ServiceDirectory};

pub mod bindings;
pub mod erm;
pub mod rhai_host;

pub use erm::ErmHost;
pub use rhai_host::{RhaiContext, RhaiHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptLanguage {
    Erm,
    Rhai,
}

impl ScriptLanguage {
    pub fn from_source_path(path: &str) -> Result<Self, ScriptError> {
        let extension = Path::new(path).extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("erm") => Ok(ScriptLanguage::Erm),
            Some("rhai") => Ok(ScriptLanguage::Rhai),
            _ => Err(ScriptError::UnknownLanguage { path: path.to_string() }),
        }
    }
}

/// One live, stateful instance of a compiled script.
pub trait Context {
    fn name(&self) -> &str;

    /// Initializes the context from a previously saved state blob (`{}` when there is none).
    fn run(&self, state: &Value) -> Result<(), ScriptError>;

    fn save_state(&self) -> Result<Value, ScriptError>;

    fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, ScriptError>;

    fn last_error(&self) -> Option<String>;
}

/// A scripting-language backend.
pub trait ScriptHost {
    fn language(&self) -> ScriptLanguage;

    /// Language of the compiled artifact when it is source text for another host.
    fn stages_into(&self) -> Option<ScriptLanguage> {
        None
    }

    fn compile(&self, name: &str, source: &str) -> Result<String, ScriptError>;

    fn create_context_for(&self, script: &Script, pool: &ScriptPool) -> Result<Rc<dyn Context>, ScriptError>;

    fn register_capability(&self, services: &mut ServiceDirectory, script: &Script) -> Result<(), ScriptError> {
        match script.implements() {
            Implements::Anything => Ok(()),
            Implements::BattleEffect => self.register_battle_effect(services, script),
        }
    }

    fn register_battle_effect(&self, services: &mut ServiceDirectory, script: &Script) -> Result<(), ScriptError> {
        services.register_battle_effect(script.identifier());
        Ok(())
    }
}

/// Language tag to host mapping used to resolve which backend owns a source file.
#[derive(Default)]
pub struct HostRegistry {
    hosts: BTreeMap<ScriptLanguage, Rc<dyn ScriptHost>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert(Rc::new(ErmHost::new()));
        registry.insert(Rc::new(RhaiHost::new()));
        registry
    }

    pub fn insert(&mut self, host: Rc<dyn ScriptHost>) -> Option<Rc<dyn ScriptHost>> {
        self.hosts.insert(host.language(), host)
    }

    pub fn get(&self, language: ScriptLanguage) -> Result<Rc<dyn ScriptHost>, ScriptError> {
        self.hosts.get(&language).cloned().ok_or(ScriptError::MissingHost(language))
    }

    pub fn resolve(&self, source_path: &str) -> Result<Rc<dyn ScriptHost>, ScriptError> {
        self.get(ScriptLanguage::from_source_path(source_path)?)
    }

    /// Checks that every staging host targets a registered host that does not stage again.
    pub fn validate(&self) -> Result<(), ScriptError> {
        for (language, host) in &self.hosts {
            let Some(target) = host.stages_into() else { continue };
            if self.get(target)?.stages_into().is_some() {
                return Err(ScriptError::StagingCycle { from: *language, to: target });
            }
        }
        Ok(())
    }
}

/// Identity of one loaded script instance. Two loads of the same identifier get distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptKey(Uuid);

impl ScriptKey {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStage {
    Defined,
    Resolved,
    Compiled,
}

/// Definition form: `{ "source": path, "implements": symbol }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub source: String,
    #[serde(default, skip_serializing_if = "Implements::is_anything")]
    pub implements: Implements,
}

/// Runtime-state form, carrying the compiled code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRuntimeState {
    pub source_path: String,
    pub source_text: String,
    pub code: String,
    #[serde(default)]
    pub implements: Implements,
}

pub struct Script {
    key: ScriptKey,
    identifier: String,
    source_path: String,
    source_text: String,
    code: Option<String>,
    host: Option<Rc<dyn ScriptHost>>,
    implements: Implements,
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("identifier", &self.identifier)
            .field("source_path", &self.source_path)
            .field("language", &self.language())
            .field("stage", &self.stage())
            .field("implements", &self.implements)
            .finish()
    }
}

impl Script {
    pub fn new(identifier: impl Into<String>, source_path: impl Into<String>, implements: Implements) -> Self {
        Self {
            key: ScriptKey::new(),
            identifier: identifier.into(),
            source_path: source_path.into(),
            source_text: String::new(),
            code: None,
            host: None,
            implements,
        }
    }

    /// Builds a compiled script from its definition: resolve the host, read the source, compile.
    pub fn from_definition(
        identifier: impl Into<String>,
        definition: &ScriptDefinition,
        hosts: &HostRegistry,
        loader: &dyn ResourceLoader,
    ) -> Result<Self, ScriptError> {
        let mut script = Self::new(identifier, definition.source.clone(), definition.implements);
        script.resolve_host(hosts)?;
        script.source_text = loader.load_text(&script.source_path)?;
        script.compile(hosts)?;
        Ok(script)
    }

    /// Restores a script from runtime state without recompiling.
    pub fn from_runtime_state(
        identifier: impl Into<String>,
        state: ScriptRuntimeState,
        hosts: &HostRegistry,
    ) -> Result<Self, ScriptError> {
        let mut script = Self::new(identifier, state.source_path, state.implements);
        script.resolve_host(hosts)?;
        if let Some(target) = script.host.as_ref().and_then(|host| host.stages_into()) {
            script.host = Some(hosts.get(target)?);
        }
        script.source_text = state.source_text;
        script.code = Some(state.code);
        Ok(script)
    }

    pub fn key(&self) -> ScriptKey {
        self.key
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn source(&self) -> &str {
        &self.source_text
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source_text = source.into();
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn implements(&self) -> Implements {
        self.implements
    }

    pub fn language(&self) -> Option<ScriptLanguage> {
        self.host.as_ref().map(|host| host.language())
    }

    pub fn stage(&self) -> ScriptStage {
        match (&self.host, &self.code) {
            (Some(_), Some(_)) => ScriptStage::Compiled,
            (Some(_), None) => ScriptStage::Resolved,
            _ => ScriptStage::Defined,
        }
    }

    pub fn resolve_host(&mut self, hosts: &HostRegistry) -> Result<(), ScriptError> {
        self.host = Some(hosts.resolve(&self.source_path)?);
        self.code = None;
        Ok(())
    }

    /// Compiles the current source. A host that stages into another language hands its output
    /// to that host, which becomes the script's host; a second hop is rejected.
    pub fn compile(&mut self, hosts: &HostRegistry) -> Result<(), ScriptError> {
        let host = self.host.clone().ok_or_else(|| ScriptError::NotCompiled { name: self.identifier.clone() })?;
        // A failed compile leaves the script `Resolved`.
        self.code = None;
        let code = host.compile(&self.source_path, &self.source_text)?;
        let Some(target_language) = host.stages_into() else {
            self.code = Some(code);
            return Ok(());
        };

        let target = hosts.get(target_language)?;
        if target.stages_into().is_some() {
            return Err(ScriptError::StagingCycle { from: host.language(), to: target_language });
        }
        let staged = target.compile(&self.identifier, &code)?;
        tracing::debug!(
            script = %self.identifier,
            from = ?host.language(),
            to = ?target_language,
            "staged compilation"
        );
        self.host = Some(target);
        self.source_text = code;
        self.code = Some(staged);
        Ok(())
    }

    pub fn create_context(&self, pool: &ScriptPool) -> Result<Rc<dyn Context>, ScriptError> {
        match (&self.host, self.stage()) {
            (Some(host), ScriptStage::Compiled) => host.create_context_for(self, pool),
            _ => Err(ScriptError::NotCompiled { name: self.identifier.clone() }),
        }
    }

    pub fn perform_registration(&self, services: &mut ServiceDirectory) -> Result<(), ScriptError> {
        let Some(host) = self.host.as_ref().filter(|_| self.stage() == ScriptStage::Compiled) else {
            tracing::warn!(script = %self.identifier, "skipping registration of uncompiled script");
            return Ok(());
        };
        host.register_capability(services, self)
    }

    pub fn to_definition(&self) -> ScriptDefinition {
        ScriptDefinition { source: self.source_path.clone(), implements: self.implements }
    }

    pub fn to_runtime_state(&self) -> Result<ScriptRuntimeState, ScriptError> {
        let code = self.code.clone().ok_or_else(|| ScriptError::NotCompiled { name: self.identifier.clone() })?;
        Ok(ScriptRuntimeState {
            source_path: self.source_path.clone(),
            source_text: self.source_text.clone(),
            code,
            implements: self.implements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryResourceLoader;
    use crate::events::EventBus;

    struct LoopingHost(ScriptLanguage, ScriptLanguage);

    impl ScriptHost for LoopingHost {
        fn language(&self) -> ScriptLanguage {
            self.0
        }

        fn stages_into(&self) -> Option<ScriptLanguage> {
            Some(self.1)
        }

        fn compile(&self, _name: &str, source: &str) -> Result<String, ScriptError> {
            Ok(source.to_string())
        }

        fn create_context_for(&self, _script: &Script, _pool: &ScriptPool) -> Result<Rc<dyn Context>, ScriptError> {
            Err(ScriptError::NotExecutable(self.0))
        }
    }

    fn looping_hosts() -> HostRegistry {
        let mut hosts = HostRegistry::new();
        hosts.insert(Rc::new(LoopingHost(ScriptLanguage::Erm, ScriptLanguage::Rhai)));
        hosts.insert(Rc::new(LoopingHost(ScriptLanguage::Rhai, ScriptLanguage::Erm)));
        hosts
    }

    #[test]
    fn language_is_resolved_from_extension() {
        assert_eq!(ScriptLanguage::from_source_path("battle/a.ERM").expect("erm"), ScriptLanguage::Erm);
        assert_eq!(ScriptLanguage::from_source_path("b.rhai").expect("rhai"), ScriptLanguage::Rhai);
        assert!(matches!(
            ScriptLanguage::from_source_path("c.lua"),
            Err(ScriptError::UnknownLanguage { path }) if path == "c.lua"
        ));
        assert!(ScriptLanguage::from_source_path("no_extension").is_err());
    }

    #[test]
    fn stages_advance_from_defined_to_compiled() {
        let hosts = HostRegistry::with_defaults();
        let mut script = Script::new("core:plain", "plain.rhai", Implements::Anything);
        assert_eq!(script.stage(), ScriptStage::Defined);
        script.resolve_host(&hosts).expect("host resolves");
        assert_eq!(script.stage(), ScriptStage::Resolved);
        script.set_source("fn init() { this.ready = true; }");
        script.compile(&hosts).expect("compiles");
        assert_eq!(script.stage(), ScriptStage::Compiled);
        assert_eq!(script.language(), Some(ScriptLanguage::Rhai));
    }

    #[test]
    fn failed_recompile_drops_stale_code() {
        let hosts = HostRegistry::with_defaults();
        let mut script = Script::new("core:retry", "retry.rhai", Implements::Anything);
        script.resolve_host(&hosts).expect("host resolves");
        script.set_source("fn before_apply_damage(event) { event }");
        script.compile(&hosts).expect("compiles");
        assert_eq!(script.stage(), ScriptStage::Compiled);

        script.set_source("fn broken( {");
        assert!(matches!(script.compile(&hosts), Err(ScriptError::Compile { .. })));
        assert_eq!(script.stage(), ScriptStage::Resolved);
        assert_eq!(script.code(), None);
        assert!(matches!(script.to_runtime_state(), Err(ScriptError::NotCompiled { .. })));
        let pool = ScriptPool::new(EventBus::new());
        assert!(matches!(script.create_context(&pool), Err(ScriptError::NotCompiled { .. })));

        script.set_source("fn init() {}");
        script.compile(&hosts).expect("recompiles once fixed");
        assert_eq!(script.code(), Some("fn init() {}"));
    }

    #[test]
    fn uncompiled_script_cannot_create_context() {
        let script = Script::new("core:idle", "idle.rhai", Implements::Anything);
        let pool = ScriptPool::new(EventBus::new());
        assert!(matches!(script.create_context(&pool), Err(ScriptError::NotCompiled { .. })));
    }

    #[test]
    fn chained_staging_is_rejected() {
        let hosts = looping_hosts();
        assert!(matches!(hosts.validate(), Err(ScriptError::StagingCycle { .. })));
        let mut script = Script::new("core:loop", "loop.erm", Implements::Anything);
        script.resolve_host(&hosts).expect("host resolves");
        script.set_source("!?PI;");
        let err = script.compile(&hosts).expect_err("second hop fails");
        assert!(matches!(err, ScriptError::StagingCycle { from: ScriptLanguage::Erm, to: ScriptLanguage::Rhai }));
        assert_eq!(script.stage(), ScriptStage::Resolved);
    }

    #[test]
    fn compile_errors_propagate_from_definition_loading() {
        let hosts = HostRegistry::with_defaults();
        let loader = MemoryResourceLoader::new().with_file("broken.rhai", "fn init( {");
        let definition = ScriptDefinition { source: "broken.rhai".into(), implements: Implements::Anything };
        let err = Script::from_definition("core:broken", &definition, &hosts, &loader).expect_err("malformed");
        assert!(matches!(err, ScriptError::Compile { .. }));
    }

    #[test]
    fn runtime_state_restores_the_staged_host() {
        let hosts = HostRegistry::with_defaults();
        let loader = MemoryResourceLoader::new().with_file("bonus.erm", "!?PI;\n!!VRv1:S3;\n");
        let definition = ScriptDefinition { source: "bonus.erm".into(), implements: Implements::Anything };
        let script = Script::from_definition("core:bonus", &definition, &hosts, &loader).expect("compiles");
        let state = script.to_runtime_state().expect("compiled");
        assert_eq!(state.source_path, "bonus.erm");

        let restored = Script::from_runtime_state("core:bonus", state.clone(), &hosts).expect("restores");
        assert_eq!(restored.language(), Some(ScriptLanguage::Rhai));
        assert_eq!(restored.code(), Some(state.code.as_str()));
        assert_ne!(restored.key(), script.key());
    }

    #[test]
    fn definition_serializes_with_symbolic_implements() {
        let definition = ScriptDefinition { source: "fx.rhai".into(), implements: Implements::BattleEffect };
        let json = serde_json::to_value(&definition).expect("serialize");
        assert_eq!(json, serde_json::json!({ "source": "fx.rhai", "implements": "BATTLE_EFFECT" }));
        let plain: ScriptDefinition = serde_json::from_value(serde_json::json!({ "source": "a.erm" })).expect("parse");
        assert_eq!(plain.implements, Implements::Anything);
    }
}
