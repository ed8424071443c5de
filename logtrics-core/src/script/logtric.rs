//! A single parser-plus-handler rule declared in a rule file.

use std::sync::Arc;

use mlua::{Function, Lua, Table, Value};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::{Configuration, GraphiteConfig, Logging},
    error::LogtricsError,
    graphite::Graphite,
    parser::{PARSER_KIND_RE2, Parser},
    reader::event::LogEvent,
    script::{bindings, scheduler::SchedulerSpec},
};

/// One rule instance: parser, handler, optional scheduler and the
/// effective per-instance configuration.
///
/// The interpreter state is owned by the enclosing script; a logtric is
/// only ever entered through that script's serialization domain.
#[derive(Debug)]
pub struct Logtric {
    name: String,
    script: String,
    parser: Parser,
    handler: Function,
    scheduler: Option<SchedulerSpec>,
    config: Configuration,
    graphite: Arc<OnceCell<Arc<Graphite>>>,
    emit_tx: UnboundedSender<LogEvent>,
    cancel: CancellationToken,
}

impl Logtric {
    /// Builds a logtric from a declaration table.
    pub(crate) fn new(
        script: &str,
        conf: &Configuration,
        table: &Table,
        emit_tx: UnboundedSender<LogEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, LogtricsError> {
        let name = match table.get::<Option<String>>("name")? {
            Some(name) if !name.is_empty() => name,
            _ => "?".to_string(),
        };

        let merged = overlay(conf, table)?;

        let parser_table = table
            .get::<Option<Table>>("parser")?
            .ok_or_else(|| LogtricsError::config_invalid("parser not found"))?;
        let kind = parser_table
            .get::<Option<String>>("type")?
            .unwrap_or_else(|| PARSER_KIND_RE2.to_string());
        let expression = parser_table
            .get::<Option<String>>("expression")?
            .or_else(|| merged.expression.clone())
            .ok_or_else(|| LogtricsError::config_invalid("parser expression not found"))?;
        let parser = Parser::new(&kind, &expression)?;

        let handler = table
            .get::<Option<Function>>("handler")?
            .ok_or_else(|| LogtricsError::config_invalid("handler not found"))?;

        let scheduler = match table.get::<Option<Table>>("scheduler")? {
            Some(spec) => Some(SchedulerSpec::from_table(&spec)?),
            None => None,
        };

        Ok(Self {
            name,
            script: script.to_string(),
            parser,
            handler,
            scheduler,
            config: merged,
            graphite: Arc::new(OnceCell::new()),
            emit_tx,
            cancel,
        })
    }

    /// Runs the event through the parser and, on match, the handler.
    pub fn run(&self, lua: &Lua, event: &LogEvent) -> Result<(), LogtricsError> {
        bindings::install(lua, self)?;

        let Some(captures) = self.parser.captures(&event.line) else {
            debug!(unit = %self.unit(), "expression doesn't match");
            return Ok(());
        };

        let arg = lua.create_table()?;
        arg.set("_source", event.source.as_str())?;
        arg.set("_line", event.line.as_str())?;
        for (key, value) in captures {
            arg.set(key, value)?;
        }

        self.handler
            .call::<()>(arg)
            .map_err(|source| LogtricsError::handler_failed(&self.script, &self.name, source))
    }

    /// Invokes the scheduler handler with no arguments, if one is declared.
    pub fn run_tick(&self, lua: &Lua) -> Result<(), LogtricsError> {
        let Some(spec) = &self.scheduler else {
            return Ok(());
        };
        bindings::install(lua, self)?;
        spec.handler()
            .call::<()>(())
            .map_err(|source| LogtricsError::handler_failed(&self.script, &self.name, source))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log unit tag, `<script>:[<name>]`.
    pub fn unit(&self) -> String {
        format!("{}:[{}]", self.script, self.name)
    }

    /// The effective configuration (base overlaid with declaration keys).
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn scheduler(&self) -> Option<&SchedulerSpec> {
        self.scheduler.as_ref()
    }

    /// The lazily created graphite unit, if any handler has used it.
    pub fn graphite(&self) -> Option<&Arc<Graphite>> {
        self.graphite.get()
    }

    pub(crate) fn graphite_cell(&self) -> Arc<OnceCell<Arc<Graphite>>> {
        Arc::clone(&self.graphite)
    }

    pub(crate) fn emit_sender(&self) -> UnboundedSender<LogEvent> {
        self.emit_tx.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Applies the declaration's overlay keys to a copy of the base config.
/// The base stays untouched.
fn overlay(conf: &Configuration, table: &Table) -> Result<Configuration, LogtricsError> {
    let mut merged = conf.clone();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair?;
        let Value::String(key) = key else {
            return Err(LogtricsError::config_invalid(
                "declaration keys must be strings",
            ));
        };
        let key = key.to_string_lossy();
        match key.as_str() {
            "name" | "parser" | "handler" | "scheduler" => {}
            "graphite" => update_graphite(&mut merged.graphite, &value)?,
            "logging" => update_logging(&mut merged.logging, &value)?,
            "expression" => merged.expression = Some(string_of(&value)?),
            "mode" | "modes" | "scriptfile" | "scriptdir" | "tcp" | "udp" => {
                return Err(LogtricsError::ConfigImmutable(key.clone()));
            }
            _ => return Err(LogtricsError::ConfigUnknownKey(key.clone())),
        }
    }
    Ok(merged)
}

fn update_graphite(conf: &mut GraphiteConfig, value: &Value) -> Result<(), LogtricsError> {
    let Value::Table(table) = value else {
        return Err(LogtricsError::config_invalid(
            "invalid graphite configuration",
        ));
    };
    for pair in table.pairs::<String, Value>() {
        let (key, value) = pair?;
        match key.as_str() {
            "host" => conf.host = string_of(&value)?,
            "port" => conf.port = port_of(&value)?,
            "interval" => conf.interval = u64::try_from(int_of(&value)?).unwrap_or(0).max(1),
            "debug" => conf.debug = bool_of(&value)?,
            _ => {}
        }
    }
    Ok(())
}

fn update_logging(conf: &mut Logging, value: &Value) -> Result<(), LogtricsError> {
    let Value::Table(table) = value else {
        return Err(LogtricsError::config_invalid(
            "invalid logging configuration",
        ));
    };
    for pair in table.pairs::<String, Value>() {
        let (key, value) = pair?;
        match key.as_str() {
            "type" => {
                conf.sink = string_of(&value)?
                    .parse()
                    .map_err(LogtricsError::ConfigInvalid)?;
            }
            "level" => {
                conf.level = string_of(&value)?
                    .parse()
                    .map_err(LogtricsError::ConfigInvalid)?;
            }
            _ => return Err(LogtricsError::config_invalid("invalid logging config")),
        }
    }
    Ok(())
}

fn string_of(value: &Value) -> Result<String, LogtricsError> {
    match value {
        Value::String(s) => Ok(s.to_string_lossy()),
        other => Err(LogtricsError::config_invalid(format!(
            "expected string, got {}",
            other.type_name()
        ))),
    }
}

fn int_of(value: &Value) -> Result<i64, LogtricsError> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Number(n) => Ok(*n as i64),
        other => Err(LogtricsError::config_invalid(format!(
            "expected integer, got {}",
            other.type_name()
        ))),
    }
}

fn port_of(value: &Value) -> Result<u16, LogtricsError> {
    let port = int_of(value)?;
    u16::try_from(port)
        .map_err(|_| LogtricsError::config_invalid(format!("port {port} out of range")))
}

fn bool_of(value: &Value) -> Result<bool, LogtricsError> {
    match value {
        Value::Boolean(b) => Ok(*b),
        other => Err(LogtricsError::config_invalid(format!(
            "expected boolean, got {}",
            other.type_name()
        ))),
    }
}
