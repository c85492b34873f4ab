use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::Environment;
use crate::error::ScriptError;
use crate::events::{Event, EventBus};
use crate::scripts::bindings::ScriptEvent;

/// Damage about to be dealt to a battle unit. Before-listeners may rewrite `damage_amount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyDamage {
    pub damage_amount: i64,
    pub target: u32,
    applied: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct ApplyDamageFields {
    damage_amount: i64,
    target: u32,
}

impl ApplyDamage {
    pub fn new(target: u32, damage_amount: i64) -> Self {
        Self { damage_amount, target, applied: None }
    }

    /// Damage actually dealt by `execute`, once the event has run.
    pub fn applied(&self) -> Option<i64> {
        self.applied
    }
}

impl Event for ApplyDamage {
    fn execute(&mut self, env: &dyn Environment, _bus: &EventBus) {
        let _span = env.logger().enter();
        tracing::debug!(target_unit = self.target, amount = self.damage_amount, "applying damage");
        self.applied = Some(self.damage_amount);
    }
}

impl ScriptEvent for ApplyDamage {
    const NAME: &'static str = "apply_damage";

    fn to_value(&self) -> Value {
        serde_json::to_value(ApplyDamageFields { damage_amount: self.damage_amount, target: self.target })
            .unwrap_or(Value::Null)
    }

    fn apply_value(&mut self, value: Value) -> Result<(), ScriptError> {
        let fields: ApplyDamageFields = serde_json::from_value(value)
            .map_err(|err| ScriptError::runtime(Self::NAME, format!("invalid event fields: {err}")))?;
        self.damage_amount = fields.damage_amount;
        self.target = fields.target;
        Ok(())
    }
}
