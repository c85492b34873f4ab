use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use serde_json::Value;

use crate::environment::Environment;
use crate::error::ScriptError;
use crate::events::{EventBus, Phase, Subscription};
use crate::pool::ScriptPool;
use crate::scripts::bindings::{EventBindings, ScriptHandler};
use crate::scripts::{Context, Script, ScriptHost, ScriptLanguage};
use crate::services::ServiceDirectory;

const INIT_FN: &str = "init";
const BATTLE_EFFECT_FN: &str = "apply_effect";

/// Rhai backend. Compiled ASTs are cached by a hash of their source text.
pub struct RhaiHost {
    engine: Rc<Engine>,
    bindings: Rc<EventBindings>,
    cache: RefCell<HashMap<blake3::Hash, AST>>,
}

impl Default for RhaiHost {
    fn default() -> Self {
        Self::new()
    }
}

impl RhaiHost {
    pub fn new() -> Self {
        Self::with_bindings(EventBindings::with_defaults())
    }

    pub fn with_bindings(bindings: EventBindings) -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        register_api(&mut engine);
        Self { engine: Rc::new(engine), bindings: Rc::new(bindings), cache: RefCell::new(HashMap::new()) }
    }

    pub fn cached_ast_count(&self) -> usize {
        self.cache.borrow().len()
    }

    fn parse(&self, name: &str, source: &str) -> Result<AST, ScriptError> {
        let hash = blake3::hash(source.as_bytes());
        if let Some(ast) = self.cache.borrow().get(&hash) {
            return Ok(ast.clone());
        }
        let ast = self.engine.compile(source).map_err(|err| ScriptError::compile(name, err))?;
        self.cache.borrow_mut().insert(hash, ast.clone());
        Ok(ast)
    }

    fn compiled_ast(&self, script: &Script) -> Result<AST, ScriptError> {
        let code = script.code().ok_or_else(|| ScriptError::NotCompiled { name: script.identifier().to_string() })?;
        self.parse(script.identifier(), code)
    }
}

impl ScriptHost for RhaiHost {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Rhai
    }

    fn compile(&self, name: &str, source: &str) -> Result<String, ScriptError> {
        self.parse(name, source)?;
        Ok(source.to_string())
    }

    fn create_context_for(&self, script: &Script, pool: &ScriptPool) -> Result<Rc<dyn Context>, ScriptError> {
        let ast = self.compiled_ast(script)?;
        let context = RhaiContext::new(script.identifier(), self.engine.clone(), ast, self.bindings.clone(), pool);
        Ok(Rc::new(context))
    }

    fn register_battle_effect(&self, services: &mut ServiceDirectory, script: &Script) -> Result<(), ScriptError> {
        let ast = self.compiled_ast(script)?;
        if !ast.iter_functions().any(|function| function.name == BATTLE_EFFECT_FN) {
            return Err(ScriptError::InvalidDefinition {
                name: script.identifier().to_string(),
                message: format!("battle effects must define `{BATTLE_EFFECT_FN}`"),
            });
        }
        services.register_battle_effect(script.identifier());
        Ok(())
    }
}

fn register_api(engine: &mut Engine) {
    engine.register_fn("log", |message: &str| tracing::info!(source = "script", "{message}"));
    engine.register_fn("warn", |message: &str| tracing::warn!(source = "script", "{message}"));
    engine.on_print(|text| tracing::info!(source = "script", "{text}"));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(source = source.unwrap_or("script"), position = %pos, "{text}")
    });
}

struct RhaiState {
    name: String,
    engine: Rc<Engine>,
    ast: AST,
    scope: Scope<'static>,
    state: Dynamic,
    last_error: Option<String>,
}

impl RhaiState {
    fn defines(&self, function: &str, arity: usize) -> bool {
        self.ast.iter_functions().any(|meta| meta.name == function && meta.params.len() == arity)
    }

    fn call_dynamic(&mut self, function: &str, args: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
        let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(&mut self.state);
        self.engine.call_fn_with_options::<Dynamic>(options, &mut self.scope, &self.ast, function, args)
    }

    fn fail(&mut self, message: String) -> ScriptError {
        self.last_error = Some(message.clone());
        ScriptError::runtime(self.name.clone(), message)
    }
}

/// A live Rhai script. Top-level statements run once per `run`; the script's persistent
/// state is the map bound to `this` inside its functions.
pub struct RhaiContext {
    inner: Rc<RefCell<RhaiState>>,
    bindings: Rc<EventBindings>,
    bus: EventBus,
    name: String,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl RhaiContext {
    fn new(name: &str, engine: Rc<Engine>, ast: AST, bindings: Rc<EventBindings>, pool: &ScriptPool) -> Self {
        let state = RhaiState {
            name: name.to_string(),
            engine,
            ast,
            scope: Scope::new(),
            state: Dynamic::from_map(Map::new()),
            last_error: None,
        };
        Self {
            inner: Rc::new(RefCell::new(state)),
            bindings,
            bus: pool.event_bus().clone(),
            name: name.to_string(),
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    fn bind_handlers(&self) {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let inner = self.inner.borrow();
        for binding in self.bindings.iter() {
            for phase in [Phase::Before, Phase::After] {
                let function = EventBindings::handler_name(phase, binding.name());
                if !inner.defines(&function, 1) {
                    continue;
                }
                let handler = script_handler(Rc::downgrade(&self.inner));
                subscriptions.push(binding.bind(&self.bus, phase, function, handler));
            }
        }
    }
}

fn script_handler(state: Weak<RefCell<RhaiState>>) -> ScriptHandler {
    Rc::new(move |env: &dyn Environment, function: &str, payload: Value| -> Option<Value> {
        let state = state.upgrade()?;
        let Ok(mut state) = state.try_borrow_mut() else {
            tracing::warn!(handler = function, "script is busy, skipping re-entrant handler");
            return None;
        };
        let _span = env.logger().enter();
        let argument = match rhai::serde::to_dynamic(&payload) {
            Ok(argument) => argument,
            Err(err) => {
                tracing::error!(script = %state.name, handler = function, error = %err, "event payload conversion failed");
                return None;
            }
        };
        match state.call_dynamic(function, vec![argument]) {
            Ok(result) if result.is_map() => match rhai::serde::from_dynamic::<Value>(&result) {
                Ok(value) => Some(value),
                Err(err) => {
                    let message = err.to_string();
                    tracing::error!(script = %state.name, handler = function, error = %message, "handler result conversion failed");
                    state.last_error = Some(message);
                    None
                }
            },
            Ok(_) => None,
            Err(err) => {
                let message = err.to_string();
                tracing::error!(script = %state.name, handler = function, error = %message, "script handler failed");
                state.last_error = Some(message);
                None
            }
        }
    })
}

impl Context for RhaiContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, saved: &Value) -> Result<(), ScriptError> {
        self.subscriptions.borrow_mut().clear();
        {
            let mut guard = self.inner.borrow_mut();
            let state = &mut *guard;
            let restored = match saved {
                Value::Object(_) => rhai::serde::to_dynamic(saved),
                _ => Ok(Dynamic::from_map(Map::new())),
            };
            state.state = match restored {
                Ok(restored) => restored,
                Err(err) => return Err(state.fail(err.to_string())),
            };
            state.scope = Scope::new();
            state.last_error = None;
            let engine = state.engine.clone();
            if let Err(err) = engine.run_ast_with_scope(&mut state.scope, &state.ast) {
                return Err(state.fail(err.to_string()));
            }
            if state.defines(INIT_FN, 0) {
                if let Err(err) = state.call_dynamic(INIT_FN, Vec::new()) {
                    return Err(state.fail(err.to_string()));
                }
            }
        }
        self.bind_handlers();
        Ok(())
    }

    fn save_state(&self) -> Result<Value, ScriptError> {
        let state = self.inner.borrow();
        rhai::serde::from_dynamic::<Value>(&state.state).map_err(|err| ScriptError::runtime(self.name.clone(), err))
    }

    fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        let mut state = self.inner.borrow_mut();
        let args = args
            .iter()
            .map(rhai::serde::to_dynamic)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| state.fail(err.to_string()))?;
        let result = state.call_dynamic(function, args).map_err(|err| state.fail(err.to_string()))?;
        rhai::serde::from_dynamic::<Value>(&result).map_err(|err| state.fail(err.to_string()))
    }

    fn last_error(&self) -> Option<String> {
        self.inner.borrow().last_error.clone()
    }
}
