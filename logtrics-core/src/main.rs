//! logtrics binary entry point.
//!
//! Parses logs from console, UDP or TCP sources with Lua-scripted rules
//! to generate metrics, log messages and synthetic events.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use logtrics_core::{
    Application, Configuration, Logger,
    config::{LogLevel, LogSink, Mode},
    reader::{Console, LogReader, Tcp, Udp},
};

/// Default config path.
const DEFAULT_CONFIG_PATH: &str = "/etc/logtrics/logtrics.toml";

/// Default location from where all the scripts are read.
const DEFAULT_SCRIPT_DIR: &str = "/etc/logtrics/scripts/";

#[derive(Parser, Debug)]
#[command(
    name = "logtrics",
    version,
    about = "logtrics provides a way to parse logs, to generate metrics, notify and more"
)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Comma separated reader modes, choices are "console", "udp", "tcp"
    #[arg(short, long, value_delimiter = ',')]
    modes: Vec<Mode>,

    /// Per-script event queue capacity (0 degrades to inline dispatch)
    #[arg(long = "buffer.size")]
    buffer_size: Option<usize>,

    /// Lua script file path
    #[arg(short = 'f', long = "script.file")]
    script_file: Option<PathBuf>,

    /// Lua scripts directory
    #[arg(short = 'd', long = "script.dir")]
    script_dir: Option<PathBuf>,

    /// Logging level
    #[arg(long = "logging.level")]
    logging_level: Option<LogLevel>,

    /// Logging type, choices are "syslog", "console"
    #[arg(long = "logging.type")]
    logging_type: Option<LogSink>,

    /// UDP server listening host
    #[arg(long = "udp.host")]
    udp_host: Option<String>,

    /// UDP server listening port
    #[arg(long = "udp.port")]
    udp_port: Option<u16>,

    /// TCP server listening host
    #[arg(long = "tcp.host")]
    tcp_host: Option<String>,

    /// TCP server listening port
    #[arg(long = "tcp.port")]
    tcp_port: Option<u16>,

    /// Graphite server host
    #[arg(long = "graphite.host")]
    graphite_host: Option<String>,

    /// Graphite server port
    #[arg(long = "graphite.port")]
    graphite_port: Option<u16>,

    /// Graphite flush interval in seconds
    #[arg(long = "graphite.interval")]
    graphite_interval: Option<u64>,

    /// If enabled, flushed metrics are also logged
    #[arg(long = "graphite.debug")]
    graphite_debug: Option<bool>,
}

impl Cli {
    /// Explicitly passed flags win over config file values.
    fn apply(&self, conf: &mut Configuration) {
        if !self.modes.is_empty() {
            conf.modes = self.modes.clone();
        }
        if let Some(size) = self.buffer_size {
            conf.buffer_size = size;
        }
        if let Some(file) = &self.script_file {
            conf.script_file = Some(file.clone());
        }
        if let Some(dir) = &self.script_dir {
            conf.script_dir = Some(dir.clone());
        }
        if let Some(level) = self.logging_level {
            conf.logging.level = level;
        }
        if let Some(sink) = self.logging_type {
            conf.logging.sink = sink;
        }
        if let Some(host) = &self.udp_host {
            conf.udp.host = host.clone();
        }
        if let Some(port) = self.udp_port {
            conf.udp.port = port;
        }
        if let Some(host) = &self.tcp_host {
            conf.tcp.host = host.clone();
        }
        if let Some(port) = self.tcp_port {
            conf.tcp.port = port;
        }
        if let Some(host) = &self.graphite_host {
            conf.graphite.host = host.clone();
        }
        if let Some(port) = self.graphite_port {
            conf.graphite.port = port;
        }
        if let Some(interval) = self.graphite_interval {
            conf.graphite.interval = interval;
        }
        if let Some(debug) = self.graphite_debug {
            conf.graphite.debug = debug;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut conf = Configuration::load(&cli.config)
        .await
        .context("failed to load configuration")?;
    cli.apply(&mut conf);
    if conf.script_file.is_none() && conf.script_dir.is_none() {
        conf.script_dir = Some(PathBuf::from(DEFAULT_SCRIPT_DIR));
    }
    if conf.modes.is_empty() {
        bail!("need at least one application mode");
    }

    let _logger = Logger::init(&conf.logging).context("failed to initialize logging")?;

    let mut readers: Vec<Box<dyn LogReader>> = Vec::new();
    for mode in &conf.modes {
        match mode {
            Mode::Console => readers.push(Box::new(Console::new(&conf))),
            Mode::Udp => readers.push(Box::new(Udp::new(&conf))),
            Mode::Tcp => readers.push(Box::new(Tcp::new(&conf))),
        }
    }

    let cancel = CancellationToken::new();
    let app = Application::new(conf.clone(), readers, cancel.clone())
        .context("failed to initialize application")?;

    setup_shutdown_handler(cancel.clone());

    if conf.buffer_size > 0 {
        app.run_async().await.context("application runtime error")?;
    } else {
        app.run().await.context("application runtime error")?;
    }

    info!("application exited cleanly");
    Ok(())
}

/// Cancel every component on Ctrl+C or SIGTERM.
fn setup_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                result = ctrl_c => {
                    if let Err(e) = result {
                        error!(error = %e, "failed to listen for Ctrl+C");
                    }
                }
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = ctrl_c.await {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}
