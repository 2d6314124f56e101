//! Capturing `tracing` layer for unit tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

/// A captured event or span with its fields rendered as strings.
#[derive(Debug, Clone, Default)]
pub(crate) struct Captured {
    pub name: String,
    pub fields: BTreeMap<String, String>,
}

impl Captured {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Captures {
    events: Arc<Mutex<Vec<Captured>>>,
    spans: Arc<Mutex<Vec<Captured>>>,
}

impl Captures {
    /// Events whose message equals `message`.
    pub fn named(&self, message: &str) -> Vec<Captured> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.name == message)
            .cloned()
            .collect()
    }

    /// Events whose message contains `fragment`.
    pub fn containing(&self, fragment: &str) -> Vec<Captured> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.name.contains(fragment))
            .cloned()
            .collect()
    }

    /// Spans opened with the given name, fields as recorded so far.
    pub fn spans(&self, name: &str) -> Vec<Captured> {
        self.spans
            .lock()
            .iter()
            .filter(|span| span.name == name)
            .cloned()
            .collect()
    }
}

/// Install a capturing subscriber for the current thread.
pub(crate) fn capture() -> (Captures, tracing::subscriber::DefaultGuard) {
    let captures = Captures::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer {
        captures: captures.clone(),
    });
    let guard = tracing::subscriber::set_default(subscriber);
    (captures, guard)
}

struct CaptureLayer {
    captures: Captures,
}

/// Index into `Captures::spans`, stored in span extensions.
struct SpanSlot(usize);

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        let mut spans = self.captures.spans.lock();
        spans.push(Captured {
            name: attrs.metadata().name().to_string(),
            fields: visitor.fields,
        });
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanSlot(spans.len() - 1));
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let Some(slot) = span.extensions().get::<SpanSlot>().map(|slot| slot.0) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if let Some(captured) = self.captures.spans.lock().get_mut(slot) {
            captured.fields.extend(visitor.fields);
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let name = visitor.fields.remove("message").unwrap_or_default();
        self.captures.events.lock().push(Captured {
            name,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}
