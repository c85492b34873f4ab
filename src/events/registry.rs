use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::environment::Environment;
use crate::events::{BusId, Event, EventBus};

pub type BeforeListener<E> = dyn Fn(&dyn Environment, &EventBus, &mut E);
pub type AfterListener<E> = dyn Fn(&dyn Environment, &EventBus, &E);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

struct Entry<L: ?Sized> {
    ordinal: u64,
    listener: Rc<L>,
}

struct BusListeners<E: Event> {
    before: Vec<Entry<BeforeListener<E>>>,
    after: Vec<Entry<AfterListener<E>>>,
}

impl<E: Event> Default for BusListeners<E> {
    fn default() -> Self {
        Self { before: Vec::new(), after: Vec::new() }
    }
}

impl<E: Event> BusListeners<E> {
    fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

/// Listeners captured at the start of one dispatch.
pub struct Snapshot<E: Event> {
    pub before: SmallVec<[Rc<BeforeListener<E>>; 4]>,
    pub after: SmallVec<[Rc<AfterListener<E>>; 4]>,
}

/// Ordered before/after listeners of one event kind, partitioned by bus.
pub struct SubscriptionRegistry<E: Event> {
    buses: HashMap<BusId, BusListeners<E>>,
    next_ordinal: u64,
}

impl<E: Event> Default for SubscriptionRegistry<E> {
    fn default() -> Self {
        Self { buses: HashMap::new(), next_ordinal: 0 }
    }
}

impl<E: Event> SubscriptionRegistry<E> {
    pub fn add_before(&mut self, bus: BusId, listener: Rc<BeforeListener<E>>) -> u64 {
        let ordinal = self.allocate_ordinal();
        self.buses.entry(bus).or_default().before.push(Entry { ordinal, listener });
        ordinal
    }

    pub fn add_after(&mut self, bus: BusId, listener: Rc<AfterListener<E>>) -> u64 {
        let ordinal = self.allocate_ordinal();
        self.buses.entry(bus).or_default().after.push(Entry { ordinal, listener });
        ordinal
    }

    pub fn snapshot(&self, bus: BusId) -> Option<Snapshot<E>> {
        let listeners = self.buses.get(&bus)?;
        Some(Snapshot {
            before: listeners.before.iter().map(|entry| entry.listener.clone()).collect(),
            after: listeners.after.iter().map(|entry| entry.listener.clone()).collect(),
        })
    }

    pub fn listener_count(&self, bus: BusId) -> usize {
        self.buses.get(&bus).map_or(0, |listeners| listeners.before.len() + listeners.after.len())
    }

    fn allocate_ordinal(&mut self) -> u64 {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        ordinal
    }

    fn remove_entry(&mut self, bus: BusId, phase: Phase, ordinal: u64) -> Option<Box<dyn Any>> {
        let listeners = self.buses.get_mut(&bus)?;
        let removed: Option<Box<dyn Any>> = match phase {
            Phase::Before => {
                let index = listeners.before.iter().position(|entry| entry.ordinal == ordinal)?;
                Some(Box::new(listeners.before.remove(index).listener))
            }
            Phase::After => {
                let index = listeners.after.iter().position(|entry| entry.ordinal == ordinal)?;
                Some(Box::new(listeners.after.remove(index).listener))
            }
        };
        if listeners.is_empty() {
            self.buses.remove(&bus);
        }
        removed
    }
}

trait ErasedRegistry {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn take(&mut self, bus: BusId, phase: Phase, ordinal: u64) -> Option<Box<dyn Any>>;
    fn take_bus(&mut self, bus: BusId) -> Option<Box<dyn Any>>;
}

impl<E: Event> ErasedRegistry for SubscriptionRegistry<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn take(&mut self, bus: BusId, phase: Phase, ordinal: u64) -> Option<Box<dyn Any>> {
        self.remove_entry(bus, phase, ordinal)
    }

    fn take_bus(&mut self, bus: BusId) -> Option<Box<dyn Any>> {
        self.buses.remove(&bus).map(|listeners| Box::new(listeners) as Box<dyn Any>)
    }
}

/// Kind-keyed table of subscription registries shared by every bus of one hub.
///
/// Removal hands the dropped listeners back to the caller so they are released after the
/// table borrow ends; a listener may own other subscriptions whose drop re-enters the table.
#[derive(Default)]
pub struct SubscriptionTable {
    registries: HashMap<TypeId, Box<dyn ErasedRegistry>>,
}

impl SubscriptionTable {
    pub fn registry<E: Event>(&self) -> Option<&SubscriptionRegistry<E>> {
        self.registries.get(&TypeId::of::<E>()).and_then(|registry| registry.as_any().downcast_ref())
    }

    pub fn registry_mut<E: Event>(&mut self) -> &mut SubscriptionRegistry<E> {
        self.registries
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(SubscriptionRegistry::<E>::default()))
            .as_any_mut()
            .downcast_mut()
            .expect("registry keyed by its own TypeId")
    }

    pub fn kind_count(&self) -> usize {
        self.registries.len()
    }

    pub(crate) fn take(&mut self, kind: TypeId, bus: BusId, phase: Phase, ordinal: u64) -> Option<Box<dyn Any>> {
        self.registries.get_mut(&kind)?.take(bus, phase, ordinal)
    }

    pub(crate) fn take_bus(&mut self, bus: BusId) -> Vec<Box<dyn Any>> {
        self.registries.values_mut().filter_map(|registry| registry.take_bus(bus)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;

    impl Event for Ping {
        fn execute(&mut self, _env: &dyn Environment, _bus: &EventBus) {}
    }

    #[test]
    fn registry_is_created_lazily_per_kind() {
        let mut table = SubscriptionTable::default();
        assert!(table.registry::<Ping>().is_none());
        let bus = BusId::next();
        table.registry_mut::<Ping>().add_before(bus, Rc::new(|_: &dyn Environment, _: &EventBus, _: &mut Ping| {}));
        assert_eq!(table.kind_count(), 1);
        assert_eq!(table.registry::<Ping>().expect("registry exists").listener_count(bus), 1);
    }

    #[test]
    fn ordinals_keep_registration_order_across_phases() {
        let mut registry = SubscriptionRegistry::<Ping>::default();
        let bus = BusId::next();
        let first = registry.add_before(bus, Rc::new(|_: &dyn Environment, _: &EventBus, _: &mut Ping| {}));
        let second = registry.add_after(bus, Rc::new(|_: &dyn Environment, _: &EventBus, _: &Ping| {}));
        let third = registry.add_before(bus, Rc::new(|_: &dyn Environment, _: &EventBus, _: &mut Ping| {}));
        assert!(first < second && second < third);
        let snapshot = registry.snapshot(bus).expect("bus has listeners");
        assert_eq!(snapshot.before.len(), 2);
        assert_eq!(snapshot.after.len(), 1);
    }

    #[test]
    fn removing_last_listener_forgets_the_bus() {
        let mut table = SubscriptionTable::default();
        let bus = BusId::next();
        let ordinal = table.registry_mut::<Ping>().add_after(bus, Rc::new(|_: &dyn Environment, _: &EventBus, _: &Ping| {}));
        assert!(table.take(TypeId::of::<Ping>(), bus, Phase::Before, ordinal).is_none());
        assert!(table.take(TypeId::of::<Ping>(), bus, Phase::After, ordinal).is_some());
        assert!(table.registry::<Ping>().expect("registry kept").snapshot(bus).is_none());
    }
}
