//! Forwards daemon log records to event listeners as `logging` events.

use std::cell::Cell;
use std::fmt;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{Event, EventBus};

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// `tracing` layer publishing every record at or above `max_level`.
pub struct EventForwardLayer {
    bus: EventBus,
    max_level: Level,
}

impl EventForwardLayer {
    pub fn new(bus: EventBus, max_level: Level) -> Self {
        Self { bus, max_level }
    }
}

impl<S: Subscriber> Layer<S> for EventForwardLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.max_level || self.bus.listener_count() == 0 {
            return;
        }

        // Records emitted while publishing must not loop back into the bus
        if FORWARDING.with(|f| f.replace(true)) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        visitor
            .context
            .insert("target".into(), event.metadata().target().into());

        self.bus.publish(Event::logging(
            &level.as_str().to_lowercase(),
            visitor.message,
            visitor.context,
        ));

        FORWARDING.with(|f| f.set(false));
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    context: Map<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.context.insert(field.name().into(), value.into());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.context.insert(field.name().into(), rendered.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn log_records_become_logging_events() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let subscriber =
            tracing_subscriber::registry().with(EventForwardLayer::new(bus.clone(), Level::INFO));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(operation = "op-1", "Operation created");
            tracing::debug!("too verbose to forward");
        });

        let event = sub.try_recv().expect("logging event");
        assert_eq!(event.event_type, EventType::Logging);
        assert_eq!(event.metadata["level"], "info");
        assert_eq!(event.metadata["message"], "Operation created");
        assert_eq!(event.metadata["context"]["operation"], "op-1");
        assert!(sub.try_recv().is_none());
    }
}
