use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::environment::Environment;

pub mod apply_damage;
pub mod registry;

pub use apply_damage::ApplyDamage;
pub use registry::{AfterListener, BeforeListener, Phase, SubscriptionRegistry, SubscriptionTable};

/// One occurrence dispatched through an [`EventBus`]. Each implementing type is its own event kind.
pub trait Event: 'static {
    fn execute(&mut self, env: &dyn Environment, bus: &EventBus);
}

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(u64);

impl BusId {
    pub(crate) fn next() -> Self {
        Self(NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus#{}", self.0)
    }
}

/// Owner of a subscription table. Buses created from the same hub share the table but never
/// observe each other's listeners.
#[derive(Default)]
pub struct EventHub {
    table: Rc<RefCell<SubscriptionTable>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_bus(&self) -> EventBus {
        let id = BusId::next();
        tracing::trace!(%id, "event bus created");
        EventBus { inner: Rc::new(BusInner { id, table: self.table.clone() }) }
    }

    pub fn kind_count(&self) -> usize {
        self.table.borrow().kind_count()
    }
}

struct BusInner {
    id: BusId,
    table: Rc<RefCell<SubscriptionTable>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let released = self.table.borrow_mut().take_bus(self.id);
        tracing::trace!(id = %self.id, kinds = released.len(), "event bus dropped");
        drop(released);
    }
}

/// Cheap handle to one dispatch namespace. Clones address the same bus; dropping the last clone
/// removes every subscription made on it.
#[derive(Clone)]
pub struct EventBus {
    inner: Rc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("id", &self.inner.id).finish()
    }
}

impl PartialEq for EventBus {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for EventBus {}

impl EventBus {
    pub fn new() -> Self {
        EventHub::new().create_bus()
    }

    pub fn id(&self) -> BusId {
        self.inner.id
    }

    pub fn subscribe_before<E, F>(&self, listener: F) -> Subscription
    where
        E: Event,
        F: Fn(&dyn Environment, &EventBus, &mut E) + 'static,
    {
        let listener: Rc<BeforeListener<E>> = Rc::new(listener);
        let ordinal = self.inner.table.borrow_mut().registry_mut::<E>().add_before(self.id(), listener);
        self.subscription::<E>(Phase::Before, ordinal)
    }

    pub fn subscribe_after<E, F>(&self, listener: F) -> Subscription
    where
        E: Event,
        F: Fn(&dyn Environment, &EventBus, &E) + 'static,
    {
        let listener: Rc<AfterListener<E>> = Rc::new(listener);
        let ordinal = self.inner.table.borrow_mut().registry_mut::<E>().add_after(self.id(), listener);
        self.subscription::<E>(Phase::After, ordinal)
    }

    /// Runs before-listeners, the event body and after-listeners, in that order.
    ///
    /// The listener set is captured up front: subscriptions added or removed by a listener take
    /// effect from the next dispatch on.
    pub fn dispatch<E: Event>(&self, env: &dyn Environment, event: &mut E) {
        let snapshot = self.inner.table.borrow().registry::<E>().and_then(|registry| registry.snapshot(self.id()));
        let Some(snapshot) = snapshot else {
            event.execute(env, self);
            return;
        };
        for listener in &snapshot.before {
            listener(env, self, event);
        }
        event.execute(env, self);
        for listener in &snapshot.after {
            listener(env, self, event);
        }
    }

    pub fn listener_count<E: Event>(&self) -> usize {
        self.inner.table.borrow().registry::<E>().map_or(0, |registry| registry.listener_count(self.id()))
    }

    fn subscription<E: Event>(&self, phase: Phase, ordinal: u64) -> Subscription {
        Subscription {
            table: Rc::downgrade(&self.inner.table),
            kind: TypeId::of::<E>(),
            bus: self.id(),
            phase,
            ordinal,
            active: true,
        }
    }
}

/// Removal handle for one listener. Dropping it unsubscribes; [`Subscription::detach`] keeps the
/// listener registered for as long as the bus lives.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    table: Weak<RefCell<SubscriptionTable>>,
    kind: TypeId,
    bus: BusId,
    phase: Phase,
    ordinal: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let removed = table.borrow_mut().take(self.kind, self.bus, self.phase, self.ordinal);
        drop(removed);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("bus", &self.bus)
            .field("phase", &self.phase)
            .field("ordinal", &self.ordinal)
            .finish()
    }
}
