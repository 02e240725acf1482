//! Logging setup and the log-store layer.
//!
//! A station logs to three sinks:
//! - the console, filtered by `RUST_LOG` or `--verbose`;
//! - an optional hourly rotating file at `debug`;
//! - [`StoreLayer`], which writes `info`-or-more-severe events into the
//!   station's log store as JSON documents for the log coordinator to
//!   replicate. Warnings and errors carry a `context` array with the most
//!   recent records of every level.
//!
//! Each sink has its own filter, so a quiet console never starves the
//! store layer.

use crate::config::LogFileConfig;
use crate::error::{StationError, StationResult};
use cansat_replication::MemoryStore;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Prefix of rotating log file names.
pub const LOG_FILE_PREFIX: &str = "CanSatGS";

/// Builds the stdout filter: `RUST_LOG` if set, otherwise `info`, or
/// `debug` when `verbose`.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Opens the hourly rotating log for `station`.
pub fn file_appender(
    config: &LogFileConfig,
    station: &str,
) -> StationResult<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(format!("{LOG_FILE_PREFIX}-{station}"))
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(&config.directory)
        .map_err(|err| StationError::LogFile(format!("{}: {}", config.directory.display(), err)))
}

/// Builds the station subscriber.
///
/// `console` gets [`env_filter`], `file` gets everything at `debug` and
/// above, and `store` sees every level so its context ring stays complete.
pub fn station_subscriber<W>(
    verbose: bool,
    console: W,
    file: Option<NonBlocking>,
    store: StoreLayer,
) -> impl Subscriber + for<'a> LookupSpan<'a> + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let console = tracing_subscriber::fmt::layer()
        .with_writer(console)
        .with_filter(env_filter(verbose));
    let file = file.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(LevelFilter::DEBUG)
    });

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(store.with_filter(LevelFilter::TRACE))
}

/// Tracing layer that stores log records in a [`MemoryStore`].
pub struct StoreLayer {
    store: MemoryStore,
    recent: Mutex<VecDeque<Value>>,
    context_size: usize,
}

impl StoreLayer {
    /// Creates a layer writing to `store` and keeping `context_size` recent
    /// records for warnings and errors.
    pub fn new(store: MemoryStore, context_size: usize) -> Self {
        Self {
            store,
            recent: Mutex::new(VecDeque::with_capacity(context_size)),
            context_size,
        }
    }

    fn remember(&self, record: Value) {
        if self.context_size == 0 {
            return;
        }
        let mut recent = self.recent.lock();
        if recent.len() == self.context_size {
            recent.pop_front();
        }
        recent.push_back(record);
    }
}

impl fmt::Debug for StoreLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLayer")
            .field("store", &self.store.name())
            .field("context_size", &self.context_size)
            .finish()
    }
}

/// Fields recorded on a span, kept in the span's extensions.
struct SpanFields(Map<String, Value>);

impl<S> Layer<S> for StoreLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        values.record(&mut visitor);

        let mut extensions = span.extensions_mut();
        if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
            fields.extend(visitor.fields);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut spans = Vec::new();
        let mut fields = Map::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                spans.push(Value::from(span.name()));
                if let Some(SpanFields(span_fields)) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.clone());
                }
            }
        }
        fields.extend(visitor.fields);

        let mut record = json!({
            "time_ms": now_ms(),
            "level": level.as_str(),
            "target": metadata.target(),
            "msg": visitor.message.unwrap_or_default(),
            "spans": spans,
            "fields": fields,
        });

        if level <= Level::INFO {
            let mut stored = record.clone();
            if level <= Level::WARN {
                let context: Vec<Value> = self.recent.lock().iter().cloned().collect();
                stored["context"] = Value::Array(context);
            }
            self.store.insert(stored);
        }

        if let Some(object) = record.as_object_mut() {
            object.remove("spans");
        }
        self.remember(record);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::from(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::from(value.to_string()));
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
