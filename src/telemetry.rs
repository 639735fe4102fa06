//! Logging setup
//!
//! JSON events to stdout, an optional daily-rolling file, and optional
//! shipping of every event to an HTTP collector.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tfmt, EnvFilter, Layer};

/// Entries waiting for the shipper beyond this are dropped
pub const WEBHOOK_QUEUE: usize = 1024;

/// Per-request timeout of the shipping client
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Targets never shipped; the HTTP client would otherwise log about its own
/// deliveries.
const QUIET_TARGETS: &[&str] = &["reqwest", "hyper", "h2", "rustls", "tower"];

/// Logging options
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `info` or `itemkv=debug,tower_http=warn`
    pub log_level: String,
    /// Directory for the daily-rolling `itemkv.log`
    pub log_dir: Option<PathBuf>,
    /// Collector receiving one JSON POST per event
    pub webhook_url: Option<String>,
    /// Sent verbatim as the `Authorization` header
    pub webhook_token: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            webhook_url: None,
            webhook_token: None,
        }
    }
}

/// Install the global subscriber.
///
/// Must run inside a tokio runtime when a webhook is configured. Keep the
/// returned guard alive for as long as file logging should flush.
pub fn init_logging(config: &TelemetryConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = None;
    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "itemkv.log");
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(tfmt::layer().json().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    let webhook_layer = match &config.webhook_url {
        Some(url) if !url.is_empty() => {
            Some(WebhookLayer::spawn(url.clone(), config.webhook_token.clone())?)
        }
        _ => None,
    };
    let shipping = webhook_layer.is_some();

    tracing_subscriber::registry()
        .with(filter)
        .with(tfmt::layer().json().with_writer(std::io::stdout))
        .with(file_layer)
        .with(webhook_layer)
        .try_init()?;

    tracing::debug!(
        file = config.log_dir.is_some(),
        webhook = shipping,
        "Logging initialized"
    );
    Ok(guard)
}

/// Layer forwarding every event, as a flat JSON object, to a background
/// shipping task
#[derive(Debug, Clone)]
pub struct WebhookLayer {
    tx: mpsc::Sender<Value>,
}

impl WebhookLayer {
    /// Start the shipping task on the current tokio runtime
    pub fn spawn(url: String, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        let (tx, rx) = mpsc::channel(WEBHOOK_QUEUE);
        tokio::spawn(ship(client, url, token, rx));
        Ok(Self { tx })
    }

    pub(crate) fn from_sender(tx: mpsc::Sender<Value>) -> Self {
        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for WebhookLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if QUIET_TARGETS.iter().any(|quiet| target.starts_with(quiet)) {
            return;
        }
        // Full or closed queue: the entry is dropped
        let _ = self.tx.try_send(event_entry(event));
    }
}

async fn ship(
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    mut rx: mpsc::Receiver<Value>,
) {
    while let Some(entry) = rx.recv().await {
        let mut request = client.post(&url).json(&entry);
        if let Some(token) = &token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        match request.send().await {
            Ok(resp) if !resp.status().is_success() => {
                eprintln!("log webhook returned {}", resp.status());
            }
            Ok(_) => {}
            Err(e) => eprintln!("log webhook failed: {}", e),
        }
    }
}

fn event_entry(event: &Event<'_>) -> Value {
    let meta = event.metadata();
    let mut fields = Map::new();
    fields.insert(
        "time".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    fields.insert(
        "level".to_string(),
        Value::String(meta.level().as_str().to_ascii_lowercase()),
    );
    fields.insert("target".to_string(), Value::String(meta.target().to_string()));
    event.record(&mut JsonVisitor(&mut fields));
    Value::Object(fields)
}

struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl JsonVisitor<'_> {
    fn put(&mut self, field: &Field, value: Value) {
        let name = match field.name() {
            "message" => "msg",
            other => other,
        };
        self.0.insert(name.to_string(), value);
    }
}

impl Visit for JsonVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.put(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{:?}", value)));
    }
}
