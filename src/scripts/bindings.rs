use std::marker::PhantomData;
use std::rc::Rc;

use serde_json::Value;

use crate::environment::Environment;
use crate::error::ScriptError;
use crate::events::{ApplyDamage, Event, EventBus, Phase, Subscription};

/// An event kind scripts may listen to, exposed to them as a JSON-shaped payload.
pub trait ScriptEvent: Event {
    /// Name scripts use for the kind, e.g. `apply_damage` for `before_apply_damage`.
    const NAME: &'static str;

    fn to_value(&self) -> Value;

    fn apply_value(&mut self, value: Value) -> Result<(), ScriptError>;
}

/// Script-side callback for one handler function. Returns a replacement payload, if any.
pub type ScriptHandler = Rc<dyn Fn(&dyn Environment, &str, Value) -> Option<Value>>;

pub trait EventBinding {
    fn name(&self) -> &'static str;

    fn bind(&self, bus: &EventBus, phase: Phase, function: String, handler: ScriptHandler) -> Subscription;
}

struct TypedBinding<E>(PhantomData<fn() -> E>);

impl<E: ScriptEvent> EventBinding for TypedBinding<E> {
    fn name(&self) -> &'static str {
        E::NAME
    }

    fn bind(&self, bus: &EventBus, phase: Phase, function: String, handler: ScriptHandler) -> Subscription {
        match phase {
            Phase::Before => bus.subscribe_before::<E, _>(move |env, _bus, event| {
                let Some(updated) = handler(env, &function, event.to_value()) else { return };
                if let Err(err) = event.apply_value(updated) {
                    tracing::error!(handler = %function, error = %err, "script returned an invalid event payload");
                }
            }),
            Phase::After => bus.subscribe_after::<E, _>(move |env, _bus, event| {
                handler(env, &function, event.to_value());
            }),
        }
    }
}

/// Event kinds a host wires script handlers to.
pub struct EventBindings {
    bindings: Vec<Box<dyn EventBinding>>,
}

impl Default for EventBindings {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl EventBindings {
    pub fn empty() -> Self {
        Self { bindings: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut bindings = Self::empty();
        bindings.register::<ApplyDamage>();
        bindings
    }

    pub fn register<E: ScriptEvent>(&mut self) {
        if self.bindings.iter().any(|binding| binding.name() == E::NAME) {
            return;
        }
        self.bindings.push(Box::new(TypedBinding::<E>(PhantomData)));
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn EventBinding> {
        self.bindings.iter().map(|binding| binding.as_ref())
    }

    pub fn handler_name(phase: Phase, event: &str) -> String {
        match phase {
            Phase::Before => format!("before_{event}"),
            Phase::After => format!("after_{event}"),
        }
    }
}
