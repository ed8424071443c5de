//! A loaded rule file and its worker loop.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use mlua::{Lua, Table};
use tokio::sync::mpsc::{Receiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    config::Configuration,
    error::LogtricsError,
    reader::event::LogEvent,
    script::logtric::Logtric,
};

/// One unit of work delivered to a script worker.
#[derive(Debug, Clone)]
pub enum ScriptJob {
    Event(LogEvent),
    Tick { logtric: usize },
}

/// One rule file, one interpreter state, one or more logtrics.
///
/// All registrations happen during load; the logtric list is frozen
/// before the first event is delivered.
#[derive(Debug)]
pub struct Script {
    path: PathBuf,
    lua: Lua,
    logtrics: Vec<Logtric>,
}

impl Script {
    /// Evaluates the rule file in a fresh interpreter state.
    ///
    /// The only global installed before evaluation is `logtrics`, which
    /// collects declarations. Any script error or malformed declaration
    /// fails the load.
    pub fn load(
        path: &Path,
        conf: &Configuration,
        emit_tx: UnboundedSender<LogEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, LogtricsError> {
        let lua = Lua::new();
        let collected: Arc<Mutex<Vec<Logtric>>> = Arc::new(Mutex::new(Vec::new()));

        let register = {
            let collected = Arc::clone(&collected);
            let conf = conf.clone();
            let script_name = path.display().to_string();
            lua.create_function(move |_, table: Table| {
                let logtric =
                    Logtric::new(&script_name, &conf, &table, emit_tx.clone(), cancel.clone())?;
                collected.lock().unwrap().push(logtric);
                Ok(())
            })?
        };
        lua.globals().set("logtrics", register)?;

        let source = std::fs::read_to_string(path)
            .map_err(|e| LogtricsError::script_load(path, mlua::Error::external(e)))?;
        lua.load(source.as_str())
            .set_name(path.display().to_string())
            .exec()
            .map_err(|source| LogtricsError::script_load(path, source))?;

        let logtrics = std::mem::take(&mut *collected.lock().unwrap());
        Ok(Self {
            path: path.to_path_buf(),
            lua,
            logtrics,
        })
    }

    /// Dispatches the event to every logtric in declaration order.
    /// A failing logtric is logged and does not halt its siblings.
    pub fn run(&self, event: &LogEvent) {
        debug!(script = %self.path.display(), "executing script");
        for idx in 0..self.logtrics.len() {
            if let Err(e) = self.run_logtric(idx, event) {
                error!(error = %e, "script execution error");
            }
        }
    }

    pub(crate) fn run_logtric(&self, idx: usize, event: &LogEvent) -> Result<(), LogtricsError> {
        match self.logtrics.get(idx) {
            Some(logtric) => logtric.run(&self.lua, event),
            None => Ok(()),
        }
    }

    /// Invokes the scheduler handler of one logtric.
    pub fn run_tick(&self, idx: usize) {
        if let Some(logtric) = self.logtrics.get(idx) {
            if let Err(e) = logtric.run_tick(&self.lua) {
                error!(error = %e, "scheduler execution error");
            }
        }
    }

    /// Worker loop for the async dispatch path.
    ///
    /// Consumes jobs until every sender is gone, draining the queue
    /// fully before returning.
    pub async fn run_async(&self, mut jobs: Receiver<ScriptJob>) {
        while let Some(job) = jobs.recv().await {
            match job {
                ScriptJob::Event(event) => {
                    debug!(source = %event.source, "log event received from reader");
                    self.run(&event);
                }
                ScriptJob::Tick { logtric } => self.run_tick(logtric),
            }
        }
        debug!(script = %self.path.display(), "script worker drained");
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logtrics(&self) -> &[Logtric] {
        &self.logtrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    use tempfile::NamedTempFile;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn write_script(source: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(source.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    /// Renders an error with its full source chain; load and handler
    /// failures wrap the underlying cause in interpreter errors.
    fn chain(err: &LogtricsError) -> String {
        use std::error::Error as _;
        let mut out = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }

    fn load(
        source: &str,
        conf: &Configuration,
    ) -> (
        Result<Script, LogtricsError>,
        UnboundedReceiver<LogEvent>,
        NamedTempFile,
    ) {
        let file = write_script(source);
        let (tx, rx) = mpsc::unbounded_channel();
        let script = Script::load(file.path(), conf, tx, CancellationToken::new());
        (script, rx, file)
    }

    const GREETER: &str = r#"
        logtrics {
            name = "greeter",
            parser = { type = "re2", expression = [[^hello (?P<who>\w+)$]] },
            handler = function(ev)
                emit(ev._source .. "|" .. ev._line .. "|" .. ev.who)
            end,
        }
    "#;

    #[tokio::test]
    async fn test_match_invokes_handler_with_captures() {
        let (script, mut rx, _file) = load(GREETER, &Configuration::default());
        let script = script.unwrap();
        assert_eq!(script.logtrics().len(), 1);
        assert_eq!(script.logtrics()[0].name(), "greeter");

        script.run(&LogEvent::new("console", "hello world"));
        let emitted = rx.try_recv().unwrap();
        assert_eq!(emitted.source, "greeter");
        assert_eq!(emitted.line, "console|hello world|world");
    }

    #[tokio::test]
    async fn test_non_match_skips_handler() {
        let (script, mut rx, _file) = load(GREETER, &Configuration::default());
        let script = script.unwrap();
        script.run(&LogEvent::new("console", "goodbye world"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_logtric_does_not_halt_siblings() {
        let source = r#"
            logtrics {
                name = "broken",
                parser = { type = "re2", expression = [[.*]] },
                handler = function(ev) undefined_function() end,
            }
            logtrics {
                name = "alive",
                parser = { type = "re2", expression = [[.*]] },
                handler = function(ev) emit("still here") end,
            }
        "#;
        let (script, mut rx, _file) = load(source, &Configuration::default());
        let script = script.unwrap();
        script.run(&LogEvent::new("console", "anything"));
        let emitted = rx.try_recv().unwrap();
        assert_eq!(emitted.source, "alive");
        assert_eq!(emitted.line, "still here");
    }

    #[tokio::test]
    async fn test_handler_error_carries_names() {
        let source = r#"
            logtrics {
                name = "broken",
                parser = { type = "re2", expression = [[.*]] },
                handler = function(ev) undefined_function() end,
            }
        "#;
        let (script, _rx, _file) = load(source, &Configuration::default());
        let script = script.unwrap();
        let err = script
            .run_logtric(0, &LogEvent::new("console", "anything"))
            .unwrap_err();
        match err {
            LogtricsError::HandlerFailed {
                script: s, logtric, ..
            } => {
                assert!(!s.is_empty());
                assert_eq!(logtric, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_logging_binding_requires_arguments() {
        let source = r#"
            logtrics {
                name = "chatty",
                parser = { type = "re2", expression = [[.*]] },
                handler = function(ev) info() end,
            }
        "#;
        let (script, _rx, _file) = load(source, &Configuration::default());
        let script = script.unwrap();
        let err = script
            .run_logtric(0, &LogEvent::new("console", "x"))
            .unwrap_err();
        assert!(matches!(err, LogtricsError::HandlerFailed { .. }));
    }

    #[tokio::test]
    async fn test_syntax_error_fails_load() {
        let (script, _rx, _file) = load("logtrics {", &Configuration::default());
        assert!(matches!(
            script.unwrap_err(),
            LogtricsError::ScriptLoad { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_declaration_key_fails_load() {
        let source = r#"
            logtrics {
                parser = { type = "re2", expression = [[.*]] },
                handler = function(ev) end,
                frequency = 10,
            }
        "#;
        let (script, _rx, _file) = load(source, &Configuration::default());
        let err = script.unwrap_err();
        assert!(chain(&err).contains("invalid key [frequency]"));
    }

    #[tokio::test]
    async fn test_immutable_key_fails_load() {
        let source = r#"
            logtrics {
                parser = { type = "re2", expression = [[.*]] },
                handler = function(ev) end,
                udp = { host = "0.0.0.0" },
            }
        "#;
        let (script, _rx, _file) = load(source, &Configuration::default());
        let err = script.unwrap_err();
        assert!(chain(&err).contains("modification is not supported"));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_load() {
        let source = r#"
            logtrics {
                parser = { type = "re2", expression = [[.*]] },
            }
        "#;
        let (script, _rx, _file) = load(source, &Configuration::default());
        assert!(script.is_err());
    }

    #[tokio::test]
    async fn test_unknown_parser_kind_fails_load() {
        let source = r#"
            logtrics {
                parser = { type = "glob", expression = "*" },
                handler = function(ev) end,
            }
        "#;
        let (script, _rx, _file) = load(source, &Configuration::default());
        let err = script.unwrap_err();
        assert!(chain(&err).contains("unknown parser kind"));
    }

    #[tokio::test]
    async fn test_overlay_leaves_base_config_untouched() {
        let source = r#"
            logtrics {
                name = "tuned",
                parser = { type = "re2", expression = [[.*]] },
                handler = function(ev) end,
                graphite = { host = "metrics.internal", port = 2003, interval = 5 },
                logging = { level = "debug" },
            }
        "#;
        let base = Configuration::default();
        let (script, _rx, _file) = load(source, &base);
        let script = script.unwrap();

        let effective = script.logtrics()[0].config();
        assert_eq!(effective.graphite.host, "metrics.internal");
        assert_eq!(effective.graphite.port, 2003);
        assert_eq!(effective.graphite.interval, 5);
        assert_eq!(
            effective.logging.level,
            crate::config::LogLevel::Debug
        );
        // The base configuration is immutable.
        assert_eq!(base.graphite.host, "127.0.0.1");
        assert_eq!(base.graphite.port, 2024);
        assert_eq!(base.logging.level, crate::config::LogLevel::Info);
    }

    #[tokio::test]
    async fn test_counter_binding_updates_registry() {
        let source = r#"
            logtrics {
                name = "counting",
                parser = { type = "re2", expression = [[^hit$]] },
                handler = function(ev)
                    graphite():counter("hits"):inc(1)
                end,
            }
        "#;
        let mut conf = Configuration::default();
        conf.graphite.interval = 3600;
        let (script, _rx, _file) = load(source, &conf);
        let script = script.unwrap();

        for _ in 0..5 {
            script.run(&LogEvent::new("console", "hit"));
        }

        let graphite = script.logtrics()[0].graphite().unwrap();
        let counter = graphite.registry().counter("hits").unwrap();
        assert_eq!(counter.value(), 5);
    }

    #[tokio::test]
    async fn test_empty_metric_name_raises() {
        let source = r#"
            logtrics {
                name = "invalid",
                parser = { type = "re2", expression = [[.*]] },
                handler = function(ev)
                    graphite():counter(""):inc(1)
                end,
            }
        "#;
        let mut conf = Configuration::default();
        conf.graphite.interval = 3600;
        let (script, _rx, _file) = load(source, &conf);
        let script = script.unwrap();
        let err = script
            .run_logtric(0, &LogEvent::new("console", "x"))
            .unwrap_err();
        assert!(chain(&err).contains("invalid metric name"));
    }

    #[tokio::test]
    async fn test_worker_preserves_event_order_and_drains() {
        let source = r#"
            logtrics {
                name = "fwd",
                parser = { type = "re2", expression = [[^evt (?P<n>\d+)$]] },
                handler = function(ev) emit("event " .. ev.n) end,
                scheduler = { interval = 60, handler = function() emit("tick") end },
            }
        "#;
        let (script, mut rx, _file) = load(source, &Configuration::default());
        let script = script.unwrap();

        let (job_tx, job_rx) = mpsc::channel(16);
        let worker = tokio::spawn(async move {
            script.run_async(job_rx).await;
        });

        for n in 1..=3 {
            job_tx
                .send(ScriptJob::Event(LogEvent::new("test", format!("evt {n}"))))
                .await
                .unwrap();
            job_tx.send(ScriptJob::Tick { logtric: 0 }).await.unwrap();
        }
        // Dropping the sender lets the worker drain and exit.
        drop(job_tx);
        worker.await.unwrap();

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            lines.push(event.line);
        }
        assert_eq!(
            lines,
            vec!["event 1", "tick", "event 2", "tick", "event 3", "tick"]
        );
    }
}
