use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::Span;

use crate::environment::Environment;
use crate::error::ScriptError;
use crate::events::EventBus;
use crate::scripts::{Context, Script, ScriptKey};
use crate::services::ServiceDirectoryHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeMode {
    Save,
    Load,
}

struct CachedContext {
    name: String,
    context: Rc<dyn Context>,
    sequence: u64,
}

/// Per-simulation cache of live script contexts plus the state they persist by script name.
pub struct ScriptPool {
    bus: EventBus,
    services: Option<ServiceDirectoryHandle>,
    game: Option<Rc<dyn Any>>,
    battle: Option<Rc<dyn Any>>,
    span: Span,
    cache: HashMap<ScriptKey, CachedContext>,
    state: Map<String, Value>,
    next_sequence: u64,
}

impl ScriptPool {
    pub fn new(bus: EventBus) -> Self {
        let span = tracing::info_span!("script_pool", bus = bus.id().get());
        Self {
            bus,
            services: None,
            game: None,
            battle: None,
            span,
            cache: HashMap::new(),
            state: Map::new(),
            next_sequence: 0,
        }
    }

    pub fn with_services(mut self, services: ServiceDirectoryHandle) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_game(mut self, game: Rc<dyn Any>) -> Self {
        self.game = Some(game);
        self
    }

    pub fn with_battle(mut self, battle: Rc<dyn Any>) -> Self {
        self.battle = Some(battle);
        self
    }

    /// Returns the script's context, creating and initializing it on first use.
    pub fn get_context(&mut self, script: &Script) -> Result<Rc<dyn Context>, ScriptError> {
        if let Some(cached) = self.cache.get(&script.key()) {
            return Ok(cached.context.clone());
        }

        let _span = self.span.enter();
        let context = script.create_context(self)?;
        let saved = self.state.get(script.identifier()).cloned().unwrap_or_else(|| Value::Object(Map::new()));
        context.run(&saved)?;
        tracing::debug!(script = script.identifier(), "created script context");

        self.next_sequence += 1;
        self.cache.insert(
            script.key(),
            CachedContext { name: script.identifier().to_string(), context: context.clone(), sequence: self.next_sequence },
        );
        Ok(context)
    }

    /// Cached context for the script, without creating one.
    pub fn context(&self, script: &Script) -> Option<Rc<dyn Context>> {
        self.cache.get(&script.key()).map(|cached| cached.context.clone())
    }

    pub fn active_scripts(&self) -> Vec<&str> {
        let mut active: Vec<&CachedContext> = self.cache.values().collect();
        active.sort_by_key(|cached| cached.sequence);
        active.into_iter().map(|cached| cached.name.as_str()).collect()
    }

    pub fn serialize_state(&mut self, mode: SerializeMode, data: &mut Value) -> Result<(), ScriptError> {
        match mode {
            SerializeMode::Save => {
                let mut active: Vec<&CachedContext> = self.cache.values().collect();
                active.sort_by_key(|cached| cached.sequence);
                let mut snapshots = Vec::with_capacity(active.len());
                for cached in active {
                    snapshots.push((cached.name.clone(), cached.context.save_state()?));
                }

                if !data.is_object() {
                    *data = Value::Object(Map::new());
                }
                for (name, snapshot) in snapshots {
                    self.state.insert(name.clone(), snapshot.clone());
                    if let Value::Object(out) = data {
                        out.insert(name, snapshot);
                    }
                }
            }
            SerializeMode::Load => self.replace_state(data),
        }
        Ok(())
    }

    pub fn save_state(&mut self) -> Result<Value, ScriptError> {
        let mut data = Value::Object(Map::new());
        self.serialize_state(SerializeMode::Save, &mut data)?;
        Ok(data)
    }

    pub fn load_state(&mut self, data: Value) {
        self.replace_state(&data);
    }

    fn replace_state(&mut self, data: &Value) {
        self.state = match data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                tracing::warn!(kind = json_kind(other), "ignoring pool state that is not an object");
                Map::new()
            }
        };
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Environment for ScriptPool {
    fn services(&self) -> Option<&ServiceDirectoryHandle> {
        self.services.as_ref()
    }

    fn game(&self) -> Option<&dyn Any> {
        self.game.as_deref()
    }

    fn battle(&self) -> Option<&dyn Any> {
        self.battle.as_deref()
    }

    fn logger(&self) -> &Span {
        &self.span
    }

    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}
