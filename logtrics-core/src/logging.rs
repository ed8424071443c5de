//! Logging system with console and syslog sink selection.
//!
//! Console logging goes through a non-blocking stdout writer. Syslog
//! logging is a custom [`Layer`] that forwards formatted events to the
//! local syslog daemon with mapped severities.

use std::{
    io,
    sync::Mutex,
};

use syslog::{Facility, Formatter3164, LoggerBackend};
use tracing::{
    Event, Level, Subscriber, info,
    field::{Field, Visit},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogSink, Logging};

/// Holds the writer guards so buffered log lines are flushed on drop.
pub struct Logger {
    _guards: Vec<WorkerGuard>,
}

impl Logger {
    /// Initialize the global subscriber according to the logging config.
    pub fn init(conf: &Logging) -> io::Result<Self> {
        let mut guards = Vec::new();
        let filter = || {
            EnvFilter::from_default_env().add_directive(conf.level.as_level().into())
        };

        match conf.sink {
            LogSink::Console => {
                let (non_blocking, guard) = tracing_appender::non_blocking(io::stdout());
                guards.push(guard);
                let layer = fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(false)
                    .with_filter(filter());
                Registry::default().with(layer).init();
            }
            LogSink::Syslog => {
                let layer = SyslogLayer::new()?.with_filter(filter());
                Registry::default().with(layer).init();
            }
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            sink = %conf.sink,
            "logging initialized"
        );
        Ok(Self { _guards: guards })
    }
}

/// Layer that writes events to the local syslog daemon.
struct SyslogLayer {
    logger: Mutex<syslog::Logger<LoggerBackend, Formatter3164>>,
}

impl SyslogLayer {
    fn new() -> io::Result<Self> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: "logtrics".to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Self {
            logger: Mutex::new(logger),
        })
    }
}

impl<S> Layer<S> for SyslogLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldExtractor::new();
        event.record(&mut visitor);

        let mut line = visitor.message.unwrap_or_default();
        for (key, value) in visitor.fields {
            line.push_str(&format!(" {key}={value}"));
        }

        let Ok(mut logger) = self.logger.lock() else {
            return;
        };
        let _ = match *event.metadata().level() {
            Level::ERROR => logger.err(line),
            Level::WARN => logger.warning(line),
            Level::INFO => logger.info(line),
            Level::DEBUG | Level::TRACE => logger.debug(line),
        };
    }
}

/// Field visitor to extract the message and structured fields.
struct FieldExtractor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldExtractor {
    fn new() -> Self {
        Self {
            message: None,
            fields: Vec::new(),
        }
    }
}

impl Visit for FieldExtractor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}").trim_matches('"').to_string());
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .push((field.name().to_string(), value.to_string()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .push((field.name().to_string(), value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .push((field.name().to_string(), value.to_string()));
    }
}
