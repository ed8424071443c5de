//! Application: reader composition and event fan-out.
//!
//! Readers and script-emitted events feed one ingest channel. In sync
//! mode the dispatcher loop runs every script inline per event; in async
//! mode each script gets a bounded queue and a worker task, and the
//! queue is the backpressure boundary. Scheduler ticks travel the same
//! serialization domain as events in both modes.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Configuration,
    error::LogtricsError,
    reader::event::{LogEvent, LogReader},
    script::{Script, ScriptJob},
};

/// Composes the readers and scripts and owns the dispatch loop.
pub struct Application {
    readers: Vec<Box<dyn LogReader>>,
    scripts: Vec<Arc<Script>>,
    conf: Configuration,
    event_tx: UnboundedSender<LogEvent>,
    event_rx: UnboundedReceiver<LogEvent>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("readers", &self.readers.len())
            .field("scripts", &self.scripts)
            .field("conf", &self.conf)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl Application {
    /// Discovers and loads every rule file. Any load failure is fatal.
    pub fn new(
        conf: Configuration,
        readers: Vec<Box<dyn LogReader>>,
        cancel: CancellationToken,
    ) -> Result<Self, LogtricsError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut scripts = Vec::new();
        for path in script_files(&conf)? {
            let script = Script::load(&path, &conf, event_tx.clone(), cancel.clone())?;
            info!(script = %path.display(), logtrics = script.logtrics().len(), "script loaded");
            scripts.push(Arc::new(script));
        }

        Ok(Self {
            readers,
            scripts,
            conf,
            event_tx,
            event_rx,
            cancel,
        })
    }

    /// The ingest side of the dispatcher; readers and `emit` feed it.
    pub fn event_sender(&self) -> UnboundedSender<LogEvent> {
        self.event_tx.clone()
    }

    pub fn scripts(&self) -> &[Arc<Script>] {
        &self.scripts
    }

    async fn start_readers(&mut self) -> Result<(), LogtricsError> {
        for reader in &mut self.readers {
            reader
                .start(self.cancel.clone(), self.event_tx.clone())
                .await?;
        }
        Ok(())
    }

    /// Runs the application in sync mode: every event is dispatched
    /// inline to each script in order. Blocks until cancellation.
    pub async fn run(mut self) -> Result<(), LogtricsError> {
        self.start_readers().await?;

        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<(usize, usize)>();
        for (script_idx, script) in self.scripts.iter().enumerate() {
            for (logtric_idx, logtric) in script.logtrics().iter().enumerate() {
                if let Some(spec) = logtric.scheduler() {
                    spawn_sync_ticker(
                        spec.interval(),
                        self.cancel.clone(),
                        tick_tx.clone(),
                        script_idx,
                        logtric_idx,
                    );
                }
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = self.event_rx.recv() => {
                    if let Some(err) = &event.err {
                        warn!(source = %event.source, error = %err, "dropping reader error event");
                        continue;
                    }
                    for script in &self.scripts {
                        script.run(&event);
                    }
                }
                Some((script_idx, logtric_idx)) = tick_rx.recv() => {
                    if let Some(script) = self.scripts.get(script_idx) {
                        script.run_tick(logtric_idx);
                    }
                }
            }
        }
        debug!("dispatcher terminated");
        Ok(())
    }

    /// Runs the application in async mode: one bounded queue and one
    /// worker per script. Blocks until cancellation, then waits for the
    /// workers to drain their queues.
    pub async fn run_async(mut self) -> Result<(), LogtricsError> {
        self.start_readers().await?;

        let capacity = self.conf.buffer_size.max(1);
        let mut senders = Vec::with_capacity(self.scripts.len());
        let mut workers = Vec::with_capacity(self.scripts.len());

        for script in &self.scripts {
            let (job_tx, job_rx) = mpsc::channel::<ScriptJob>(capacity);

            for (logtric_idx, logtric) in script.logtrics().iter().enumerate() {
                if let Some(spec) = logtric.scheduler() {
                    spawn_async_ticker(
                        spec.interval(),
                        self.cancel.clone(),
                        job_tx.clone(),
                        logtric_idx,
                    );
                }
            }

            let worker = Arc::clone(script);
            workers.push(tokio::spawn(async move {
                worker.run_async(job_rx).await;
            }));
            senders.push(job_tx);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = self.event_rx.recv() => {
                    if let Some(err) = &event.err {
                        warn!(source = %event.source, error = %err, "dropping reader error event");
                        continue;
                    }
                    for sender in &senders {
                        // Blocks when the queue is full; this is the
                        // backpressure boundary.
                        let _ = sender.send(ScriptJob::Event(event.clone())).await;
                    }
                }
            }
        }

        // Closing the queues lets the workers drain and exit.
        drop(senders);
        for worker in workers {
            let _ = worker.await;
        }
        debug!("dispatcher terminated");
        Ok(())
    }
}

fn spawn_sync_ticker(
    interval: Duration,
    cancel: CancellationToken,
    tick_tx: UnboundedSender<(usize, usize)>,
    script_idx: usize,
    logtric_idx: usize,
) {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if tick_tx.send((script_idx, logtric_idx)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_async_ticker(
    interval: Duration,
    cancel: CancellationToken,
    job_tx: Sender<ScriptJob>,
    logtric_idx: usize,
) {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if job_tx
                        .send(ScriptJob::Tick { logtric: logtric_idx })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });
}

/// Resolves the rule files to load: `scriptfile` wins, otherwise the
/// script directory is walked for `*.lua` files.
fn script_files(conf: &Configuration) -> Result<Vec<PathBuf>, LogtricsError> {
    if let Some(file) = &conf.script_file {
        return Ok(vec![file.clone()]);
    }
    let dir = conf
        .script_dir
        .as_ref()
        .ok_or_else(|| LogtricsError::config_invalid("script file or directory required"))?;

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "lua"))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(LogtricsError::config_invalid(format!(
            "no scripts found in {}",
            dir.display()
        )));
    }
    Ok(files)
}
