#![allow(clippy::missing_errors_doc)]

pub mod error;

pub mod config;

pub mod logging;

pub mod parser;

pub mod graphite {
    pub mod flusher;
    pub use flusher::Graphite;

    pub mod metrics;
    pub use metrics::{Counter, Gauge, Meter, Metric, MetricsRegistry, Timer};
}

pub mod reader {
    pub mod event;
    pub use event::{LogEvent, LogReader};

    pub mod console;
    pub use console::Console;

    pub mod tcp;
    pub use tcp::Tcp;

    pub mod udp;
    pub use udp::Udp;
}

pub mod script {
    pub mod bindings;

    pub mod logtric;
    pub use logtric::Logtric;

    pub mod scheduler;
    pub use scheduler::SchedulerSpec;

    pub mod script;
    pub use script::{Script, ScriptJob};
}

pub mod app;
pub use app::Application;

pub use config::Configuration;
pub use error::LogtricsError;
pub use logging::Logger;
