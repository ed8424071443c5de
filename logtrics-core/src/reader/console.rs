//! Interactive console reader.

use std::{
    io::{self, Write},
    path::PathBuf,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc::UnboundedSender,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::Configuration,
    error::LogtricsError,
    reader::event::{LogEvent, LogReader},
};

/// Prompt written before each console read.
pub const CONSOLE_PROMPT: &str = " logtrics » ";

/// Reads log lines interactively from stdin.
pub struct Console {
    history: Option<PathBuf>,
}

impl Console {
    pub fn new(conf: &Configuration) -> Self {
        Self {
            history: conf.console.history.clone(),
        }
    }
}

#[async_trait]
impl LogReader for Console {
    async fn start(
        &mut self,
        cancel: CancellationToken,
        tx: UnboundedSender<LogEvent>,
    ) -> Result<(), LogtricsError> {
        let history = self.history.take();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                print!("{CONSOLE_PROMPT}");
                let _ = io::stdout().flush();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("terminating console");
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let line = line.trim().to_string();
                            if let Some(path) = &history {
                                append_history(path, &line).await;
                            }
                            let _ = tx.send(LogEvent::new("console", line));
                        }
                        Ok(None) => {
                            debug!("console input closed");
                            break;
                        }
                        Err(e) => {
                            let _ = tx.send(LogEvent::error("console", e));
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

/// Best-effort append of a completed line to the history file.
async fn append_history(path: &PathBuf, line: &str) {
    if line.is_empty() {
        return;
    }
    let open = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;
    if let Ok(mut file) = open {
        let _ = file.write_all(format!("{line}\n").as_bytes()).await;
    }
}
