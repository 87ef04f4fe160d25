//! Tracing layer writing gateway events to a component's JSONL file.
//!
//! Correlation fields (`peer`, `session`, `endpoint`, `key`, `worker`,
//! `generation`) recorded on a span are kept in the span's extensions and
//! copied onto every event logged inside it, including values filled in
//! later with `Span::record`. The innermost value wins.

use std::fmt::Write as FmtWrite;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::entry::{JsonLogEntry, LogContext};
use super::writer::ComponentLogWriter;

/// Correlation fields of one span
struct SpanContext(LogContext);

/// A tracing layer appending one [`JsonLogEntry`] per event.
pub struct JsonlLayer {
    writer: Arc<ComponentLogWriter>,
}

impl JsonlLayer {
    /// Open today's log file for `component` under `logs_dir`.
    pub fn new(logs_dir: impl AsRef<Path>, component: impl Into<String>) -> std::io::Result<Self> {
        let writer = ComponentLogWriter::new(logs_dir, component)?;
        Ok(Self {
            writer: Arc::new(writer),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        let (span_ctx, _) = visitor.split();
        span.extensions_mut().insert(SpanContext(span_ctx));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        let (recorded, _) = visitor.split();

        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanContext>() {
            Some(SpanContext(existing)) => existing.merge(&recorded),
            None => extensions.insert(SpanContext(recorded)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut log_ctx = LogContext::default();
        let mut span_names = Vec::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(SpanContext(span_ctx)) = span.extensions().get::<SpanContext>() {
                    log_ctx.merge(span_ctx);
                }
                span_names.push(span.name());
            }
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message.take().unwrap_or_default();

        let mut fields = Map::new();
        for (name, value) in visitor.fields {
            if let Some(value) = log_ctx.absorb(&name, value) {
                fields.insert(name, value);
            }
        }

        let mut entry = JsonLogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.component(),
            metadata.target(),
            message,
        )
        .with_context(log_ctx);
        if !fields.is_empty() {
            entry = entry.with_fields(Value::Object(fields));
        }
        if !span_names.is_empty() {
            entry = entry.with_span(span_names.join(" > "));
        }

        // Logging must never panic the caller
        let _ = self.writer.write(&entry);
    }
}

/// Collects the message and fields of a span or event as JSON values
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    /// Separate correlation fields from the rest
    fn split(self) -> (LogContext, Map<String, Value>) {
        let mut ctx = LogContext::default();
        let mut rest = Map::new();
        for (name, value) in self.fields {
            if let Some(value) = ctx.absorb(&name, value) {
                rest.insert(name, value);
            }
        }
        (ctx, rest)
    }

    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}
