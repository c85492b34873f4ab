use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Extension point a script declares it provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Implements {
    #[default]
    Anything,
    BattleEffect,
}

impl Implements {
    pub const SYMBOLS: &'static [&'static str] = &["ANYTHING", "BATTLE_EFFECT"];

    pub fn is_anything(&self) -> bool {
        matches!(self, Implements::Anything)
    }

    pub fn label(self) -> &'static str {
        match self {
            Implements::Anything => Self::SYMBOLS[0],
            Implements::BattleEffect => Self::SYMBOLS[1],
        }
    }
}

/// Directory of capability providers, filled while scripts register themselves.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    providers: BTreeMap<Implements, BTreeSet<String>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_battle_effect(&mut self, script: impl Into<String>) {
        self.providers.entry(Implements::BattleEffect).or_default().insert(script.into());
    }

    pub fn battle_effects(&self) -> impl Iterator<Item = &str> {
        self.providers(Implements::BattleEffect)
    }

    pub fn providers(&self, capability: Implements) -> impl Iterator<Item = &str> {
        self.providers.get(&capability).into_iter().flat_map(|names| names.iter().map(String::as_str))
    }
}

#[derive(Clone, Default)]
pub struct ServiceDirectoryHandle(Rc<RefCell<ServiceDirectory>>);

impl ServiceDirectoryHandle {
    pub fn new(directory: ServiceDirectory) -> Self {
        Self(Rc::new(RefCell::new(directory)))
    }

    pub fn borrow(&self) -> Ref<'_, ServiceDirectory> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, ServiceDirectory> {
        self.0.borrow_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implements_uses_fixed_symbol_table() {
        let encoded = serde_json::to_string(&Implements::BattleEffect).expect("serialize");
        assert_eq!(encoded, "\"BATTLE_EFFECT\"");
        let decoded: Implements = serde_json::from_str("\"ANYTHING\"").expect("deserialize");
        assert!(decoded.is_anything());
        assert!(serde_json::from_str::<Implements>("\"SPELL\"").is_err());
        assert_eq!(Implements::BattleEffect.label(), "BATTLE_EFFECT");
    }

    #[test]
    fn battle_effect_providers_are_listed_once() {
        let mut directory = ServiceDirectory::new();
        directory.register_battle_effect("mod:fireball");
        directory.register_battle_effect("frost");
        directory.register_battle_effect("mod:fireball");
        assert_eq!(directory.battle_effects().collect::<Vec<_>>(), vec!["frost", "mod:fireball"]);
        assert_eq!(directory.providers(Implements::Anything).count(), 0);
    }
}
