use std::any::Any;

use tracing::Span;

use crate::events::EventBus;
use crate::services::ServiceDirectoryHandle;

/// Simulation-facing accessors handed to events, listeners and script contexts.
///
/// The scripting core forwards an environment without looking inside it; only events and host
/// bindings downcast `game`/`battle` to concrete simulation types.
pub trait Environment {
    fn services(&self) -> Option<&ServiceDirectoryHandle> {
        None
    }

    fn game(&self) -> Option<&dyn Any> {
        None
    }

    fn battle(&self) -> Option<&dyn Any> {
        None
    }

    fn logger(&self) -> &Span;

    fn event_bus(&self) -> &EventBus;
}

/// Environment with nothing but a bus and a log span, used by tools and tests.
pub struct BusEnvironment {
    bus: EventBus,
    span: Span,
}

impl BusEnvironment {
    pub fn new(bus: EventBus) -> Self {
        let span = tracing::info_span!("environment", bus = bus.id().get());
        Self { bus, span }
    }
}

impl Environment for BusEnvironment {
    fn logger(&self) -> &Span {
        &self.span
    }

    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}
