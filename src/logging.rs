use std::collections::BTreeMap;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::logbus::{LogBus, LogLevel};

/// Collects one event's fields into a message plus a side map, the way
/// `tracing-bunyan-formatter` and friends do it.
struct JsonVisitor {
    message: Option<String>,
    fields: BTreeMap<String, serde_json::Value>,
}

impl JsonVisitor {
    fn new() -> Self {
        JsonVisitor {
            message: None,
            fields: BTreeMap::new(),
        }
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::json!(value));
    }
}

/// Forwards every `tracing` event into the shared log bus (§4.8), mirroring
/// events into a structured sink alongside the usual console/file output so
/// the HTTP surface and the console both end up reading the same events.
pub struct LogBusLayer {
    bus: LogBus,
}

impl LogBusLayer {
    pub fn new(bus: LogBus) -> Self {
        LogBusLayer { bus }
    }
}

impl<S: Subscriber> Layer<S> for LogBusLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::new();
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            Level::DEBUG | Level::TRACE => LogLevel::Debug,
        };

        let message = visitor
            .message
            .unwrap_or_else(|| event.metadata().name().to_string());
        let details = if visitor.fields.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&visitor.fields).unwrap_or_default())
        };

        self.bus.log(level, event.metadata().target().to_string(), message, details);
    }
}

/// Initializes the global subscriber: ANSI console output plus the
/// `LogBusLayer` that mirrors every event into `bus` for `GET /api/logs`
/// (§4.8). The persisted file tee is `bus`'s own job — the caller is
/// expected to have already run `bus` through `LogBus::with_file_tee`
/// before it gets here, so the `inlogic_<YYYYMMDD_HHMMSS>.log` pipe-delimited
/// format in §6 is the only file this process writes, rather than a second,
/// differently-shaped log file layered on top.
pub fn init_tracing(bus: LogBus) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = tracing_subscriber::fmt::layer().with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(LogBusLayer::new(bus))
        .init();
}
