use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::assets::ResourceLoader;
use crate::error::ScriptError;
use crate::scripts::{HostRegistry, Script, ScriptDefinition, ScriptRuntimeState};
use crate::services::ServiceDirectory;

const RUNTIME_SCRIPTS_KEY: &str = "scripts";

/// `name` for the core scope, `scope:name` otherwise.
pub fn normalize_identifier(scope: &str, name: &str) -> String {
    if scope.is_empty() || scope == "core" {
        name.to_string()
    } else {
        format!("{scope}:{name}")
    }
}

/// Catalog of every loaded script, keyed by identifier.
pub struct ScriptRegistry {
    hosts: Rc<HostRegistry>,
    loader: Box<dyn ResourceLoader>,
    objects: BTreeMap<String, Rc<Script>>,
}

impl ScriptRegistry {
    pub fn new(hosts: Rc<HostRegistry>, loader: Box<dyn ResourceLoader>) -> Self {
        Self { hosts, loader, objects: BTreeMap::new() }
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn resolve_script(&self, identifier: &str) -> Option<Rc<Script>> {
        let script = self.objects.get(identifier).cloned();
        if script.is_none() {
            tracing::error!(script = identifier, "script not found");
        }
        script
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Script>> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Loads one definition. Scripts in an unknown language are skipped and yield `Ok(None)`.
    pub fn load_object(&mut self, scope: &str, name: &str, data: &Value) -> Result<Option<Rc<Script>>, ScriptError> {
        let identifier = normalize_identifier(scope, name);
        let definition: ScriptDefinition = serde_json::from_value(data.clone())
            .map_err(|err| ScriptError::InvalidDefinition { name: identifier.clone(), message: err.to_string() })?;

        let script = match Script::from_definition(identifier.clone(), &definition, &self.hosts, self.loader.as_ref()) {
            Ok(script) => Rc::new(script),
            Err(ScriptError::UnknownLanguage { path }) => {
                tracing::error!(script = %identifier, source = %path, "unknown script language, skipping");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if self.objects.insert(identifier.clone(), script.clone()).is_some() {
            tracing::debug!(script = %identifier, "replaced existing script definition");
        }
        Ok(Some(script))
    }

    pub fn load_definitions<'a, I>(&mut self, definitions: I) -> Result<usize, ScriptError>
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a Value)>,
    {
        let mut loaded = 0;
        for (scope, name, data) in definitions {
            if self.load_object(scope, name, data)?.is_some() {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Loads a `{ "<id>": definition }` document. Keys already written as `scope:name` keep their scope.
    pub fn load_from_json(&mut self, scope: &str, document: &Value) -> Result<usize, ScriptError> {
        let entries = document.as_object().ok_or_else(|| ScriptError::InvalidDefinition {
            name: scope.to_string(),
            message: "script definitions must be a JSON object".to_string(),
        })?;
        let definitions = entries.iter().map(|(key, data)| match key.split_once(':') {
            Some((key_scope, name)) => (key_scope, name, data),
            None => (scope, key.as_str(), data),
        });
        self.load_definitions(definitions)
    }

    pub fn load_legacy_object(&mut self, _scope: &str, _name: &str, _data: &Value) -> Result<(), ScriptError> {
        Err(ScriptError::UnsupportedOperation("legacy script definitions"))
    }

    pub fn perform_registration(&self, services: &mut ServiceDirectory) -> Result<(), ScriptError> {
        for script in self.objects.values() {
            script.perform_registration(services)?;
        }
        tracing::info!(scripts = self.objects.len(), "registered script capabilities");
        Ok(())
    }

    pub fn save_definitions(&self) -> Result<Value, ScriptError> {
        let mut out = Map::new();
        for (identifier, script) in &self.objects {
            let definition = serde_json::to_value(script.to_definition())
                .map_err(|err| ScriptError::InvalidDefinition { name: identifier.clone(), message: err.to_string() })?;
            out.insert(identifier.clone(), definition);
        }
        Ok(Value::Object(out))
    }

    /// Runtime-state form, `{ "scripts": { "<id>": { sourcePath, sourceText, code, implements } } }`.
    pub fn save_state(&self) -> Result<Value, ScriptError> {
        let mut scripts = Map::new();
        for (identifier, script) in &self.objects {
            let state = serde_json::to_value(script.to_runtime_state()?)
                .map_err(|err| ScriptError::InvalidDefinition { name: identifier.clone(), message: err.to_string() })?;
            scripts.insert(identifier.clone(), state);
        }
        let mut out = Map::new();
        out.insert(RUNTIME_SCRIPTS_KEY.to_string(), Value::Object(scripts));
        Ok(Value::Object(out))
    }

    /// Restores scripts from runtime state without reading or recompiling their sources.
    pub fn load_state(&mut self, data: &Value) -> Result<usize, ScriptError> {
        let Some(scripts) = data.get(RUNTIME_SCRIPTS_KEY).and_then(Value::as_object) else {
            return Ok(0);
        };
        let mut loaded = 0;
        for (identifier, entry) in scripts {
            let state: ScriptRuntimeState = serde_json::from_value(entry.clone())
                .map_err(|err| ScriptError::InvalidDefinition { name: identifier.clone(), message: err.to_string() })?;
            match Script::from_runtime_state(identifier.clone(), state, &self.hosts) {
                Ok(script) => {
                    self.objects.insert(identifier.clone(), Rc::new(script));
                    loaded += 1;
                }
                Err(ScriptError::UnknownLanguage { path }) => {
                    tracing::error!(script = %identifier, source = %path, "unknown script language, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryResourceLoader;
    use crate::scripts::ScriptStage;
    use serde_json::json;

    fn registry(loader: MemoryResourceLoader) -> ScriptRegistry {
        ScriptRegistry::new(Rc::new(HostRegistry::with_defaults()), Box::new(loader))
    }

    #[test]
    fn identifiers_drop_the_core_scope() {
        assert_eq!(normalize_identifier("core", "fireball"), "fireball");
        assert_eq!(normalize_identifier("", "fireball"), "fireball");
        assert_eq!(normalize_identifier("mod", "fireball"), "mod:fireball");
    }

    #[test]
    fn unknown_language_is_skipped() {
        let mut registry = registry(MemoryResourceLoader::new().with_file("a.lua", "x = 1"));
        let loaded = registry.load_object("core", "a", &json!({ "source": "a.lua" })).expect("not fatal");
        assert!(loaded.is_none());
        assert!(registry.is_empty());
        assert!(registry.resolve_script("a").is_none());
    }

    #[test]
    fn missing_source_and_bad_definitions_propagate() {
        let mut registry = registry(MemoryResourceLoader::new());
        assert!(matches!(
            registry.load_object("core", "gone", &json!({ "source": "gone.rhai" })),
            Err(ScriptError::ResourceNotFound { .. })
        ));
        assert!(matches!(
            registry.load_object("core", "odd", &json!({ "source": "odd.rhai", "implements": "SPELL" })),
            Err(ScriptError::InvalidDefinition { .. })
        ));
        assert!(matches!(
            registry.load_legacy_object("core", "old", &json!({})),
            Err(ScriptError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn later_definitions_overwrite_earlier_ones() {
        let loader = MemoryResourceLoader::new()
            .with_file("one.rhai", "fn init() { this.version = 1; }")
            .with_file("two.rhai", "fn init() { this.version = 2; }");
        let mut registry = registry(loader);
        registry.load_object("mod", "pick", &json!({ "source": "one.rhai" })).expect("first");
        registry.load_object("mod", "pick", &json!({ "source": "two.rhai" })).expect("second");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve_script("mod:pick").expect("present").source_path(), "two.rhai");
    }

    #[test]
    fn document_keys_may_carry_their_own_scope() {
        let loader = MemoryResourceLoader::new()
            .with_file("a.rhai", "fn init() {}")
            .with_file("b.erm", "!?PI;");
        let mut registry = registry(loader);
        let document = json!({ "alpha": { "source": "a.rhai" }, "mod:beta": { "source": "b.erm" } });
        assert_eq!(registry.load_from_json("core", &document).expect("loads"), 2);
        assert!(registry.resolve_script("alpha").is_some());
        assert_eq!(registry.resolve_script("mod:beta").expect("scoped").stage(), ScriptStage::Compiled);
        assert!(registry.load_from_json("core", &json!([])).is_err());
    }

    #[test]
    fn runtime_state_round_trips_without_sources() {
        let loader = MemoryResourceLoader::new().with_file("fx.rhai", "fn apply_effect(t) { t }");
        let mut saved_from = registry(loader);
        saved_from
            .load_object("core", "fx", &json!({ "source": "fx.rhai", "implements": "BATTLE_EFFECT" }))
            .expect("loads");
        let state = saved_from.save_state().expect("saves");
        assert_eq!(state["scripts"]["fx"]["sourcePath"], json!("fx.rhai"));
        assert_eq!(state["scripts"]["fx"]["implements"], json!("BATTLE_EFFECT"));

        let mut restored = registry(MemoryResourceLoader::new());
        assert_eq!(restored.load_state(&state).expect("restores"), 1);
        let mut services = ServiceDirectory::new();
        restored.perform_registration(&mut services).expect("registers");
        assert_eq!(services.battle_effects().collect::<Vec<_>>(), vec!["fx"]);
        assert_eq!(
            restored.save_definitions().expect("definitions"),
            json!({ "fx": { "source": "fx.rhai", "implements": "BATTLE_EFFECT" } })
        );
    }
}
