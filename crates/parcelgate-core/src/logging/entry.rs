//! One line of a gateway JSONL log.
//!
//! Besides the free-form `fields`, an entry carries a [`LogContext`] lifted
//! out of the event and its enclosing spans, so every line of a collection
//! session can be found by peer, session, endpoint or parcel key without
//! knowing which span logged it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation fields shared by the gateway's spans and events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogContext {
    /// Remote address of a collection connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,

    /// Id of a collection session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    /// Authenticated endpoint ids, comma separated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Stored parcel key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parcel: Option<String>,

    /// Worker name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Worker process generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
}

impl LogContext {
    /// Take a recorded field if it is a correlation field.
    ///
    /// Returns the value back when the name is not one of ours.
    pub fn absorb(&mut self, name: &str, value: Value) -> Option<Value> {
        let slot = match name {
            "peer" => &mut self.peer,
            "session" => &mut self.session,
            "endpoint" => &mut self.endpoint,
            "key" | "parcel" => &mut self.parcel,
            "worker" => &mut self.worker,
            "generation" => {
                return match value.as_u64() {
                    Some(generation) => {
                        self.generation = Some(generation);
                        None
                    }
                    None => Some(value),
                };
            }
            _ => return Some(value),
        };
        *slot = Some(match value {
            Value::String(s) => s,
            other => other.to_string(),
        });
        None
    }

    /// Overlay the fields set in `inner` onto this context
    pub fn merge(&mut self, inner: &LogContext) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        take(&mut self.peer, &inner.peer);
        take(&mut self.session, &inner.session);
        take(&mut self.endpoint, &inner.endpoint);
        take(&mut self.parcel, &inner.parcel);
        take(&mut self.worker, &inner.worker);
        if inner.generation.is_some() {
            self.generation = inner.generation;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == LogContext::default()
    }
}

/// A single log entry in JSONL format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,

    pub level: String,

    /// Process that wrote the line ("gateway", "collect")
    pub component: String,

    /// Module path of the event
    pub target: String,

    pub msg: String,

    #[serde(default, skip_serializing_if = "LogContext::is_empty")]
    pub ctx: LogContext,

    /// Remaining structured fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Span path, root first (e.g. "collection > handshake")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    /// Create a new log entry with the current timestamp.
    pub fn new(
        level: impl Into<String>,
        component: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            component: component.into(),
            target: target.into(),
            msg: msg.into(),
            ctx: LogContext::default(),
            fields: None,
            span: None,
        }
    }

    pub fn with_context(mut self, ctx: LogContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Whether this line was logged inside collection session `session`
    pub fn in_session(&self, session: &str) -> bool {
        self.ctx.session.as_deref() == Some(session)
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
