//! Host bindings installed on a logtric's interpreter state.
//!
//! Globals are rebound before every handler invocation so sibling
//! logtrics sharing one state each see their own identity, effective
//! config and metrics registry.

use std::sync::Arc;

use mlua::{Function, Lua, MultiValue, Value};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::LogtricsError,
    graphite::{Graphite, metrics::MetricsRegistry},
    reader::event::LogEvent,
    script::logtric::Logtric,
};

/// Installs the logging, emit and graphite globals for a logtric.
pub(crate) fn install(lua: &Lua, logtric: &Logtric) -> mlua::Result<()> {
    let globals = lua.globals();
    let unit = logtric.unit();

    globals.set("fatal", log_fn(lua, unit.clone(), LogKind::Fatal)?)?;
    globals.set("error", log_fn(lua, unit.clone(), LogKind::Error)?)?;
    globals.set("warn", log_fn(lua, unit.clone(), LogKind::Warn)?)?;
    globals.set("info", log_fn(lua, unit.clone(), LogKind::Info)?)?;
    globals.set("debug", log_fn(lua, unit.clone(), LogKind::Debug)?)?;
    globals.set("trace", log_fn(lua, unit, LogKind::Trace)?)?;

    globals.set("emit", emit_fn(lua, logtric)?)?;
    globals.set("graphite", graphite_fn(lua, logtric)?)?;
    Ok(())
}

#[derive(Clone, Copy)]
enum LogKind {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn log_fn(lua: &Lua, unit: String, kind: LogKind) -> mlua::Result<Function> {
    lua.create_function(move |_, args: MultiValue| {
        let message = format_log_args(&args)?;
        match kind {
            LogKind::Fatal => error!(unit = %unit, fatal = true, "{message}"),
            LogKind::Error => error!(unit = %unit, "{message}"),
            LogKind::Warn => warn!(unit = %unit, "{message}"),
            LogKind::Info => info!(unit = %unit, "{message}"),
            LogKind::Debug => debug!(unit = %unit, "{message}"),
            LogKind::Trace => trace!(unit = %unit, "{message}"),
        }
        Ok(())
    })
}

/// `emit(line)` re-enters the dispatcher with a synthetic event tagged
/// with the logtric's name.
fn emit_fn(lua: &Lua, logtric: &Logtric) -> mlua::Result<Function> {
    let name = logtric.name().to_string();
    let tx = logtric.emit_sender();
    lua.create_function(move |_, line: String| {
        let _ = tx.send(LogEvent::new(name.clone(), line));
        Ok(())
    })
}

/// `graphite()` lazily constructs the logtric's registry and returns the
/// metric factory table.
fn graphite_fn(lua: &Lua, logtric: &Logtric) -> mlua::Result<Function> {
    let conf = logtric.config().graphite.clone();
    let cell = logtric.graphite_cell();
    let cancel = logtric.cancel_token();
    lua.create_function(move |lua, _: MultiValue| {
        let graphite = cell.get_or_try_init(|| Graphite::new(&conf, cancel.child_token()))?;
        let registry = Arc::clone(graphite.registry());

        let table = lua.create_table()?;
        table.set("counter", counter_factory(lua, Arc::clone(&registry))?)?;
        table.set("timer", timer_factory(lua, Arc::clone(&registry))?)?;
        table.set("gauge", gauge_factory(lua, Arc::clone(&registry))?)?;
        table.set("meter", meter_factory(lua, registry)?)?;
        Ok(table)
    })
}

fn counter_factory(lua: &Lua, registry: Arc<MetricsRegistry>) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        let name = metric_name(&args)?;
        let counter = registry.counter(&name)?;
        let ops = lua.create_table()?;
        let cell = Arc::clone(&counter);
        ops.set(
            "inc",
            lua.create_function(move |_, args: MultiValue| {
                cell.inc(delta_arg(&args));
                Ok(())
            })?,
        )?;
        ops.set(
            "dec",
            lua.create_function(move |_, args: MultiValue| {
                counter.dec(delta_arg(&args));
                Ok(())
            })?,
        )?;
        Ok(ops)
    })
}

fn gauge_factory(lua: &Lua, registry: Arc<MetricsRegistry>) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        let name = metric_name(&args)?;
        let gauge = registry.gauge(&name)?;
        let ops = lua.create_table()?;
        ops.set(
            "update",
            lua.create_function(move |_, args: MultiValue| {
                gauge.update(delta_arg(&args));
                Ok(())
            })?,
        )?;
        Ok(ops)
    })
}

fn timer_factory(lua: &Lua, registry: Arc<MetricsRegistry>) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        let name = metric_name(&args)?;
        let timer = registry.timer(&name)?;
        let ops = lua.create_table()?;
        ops.set(
            "update",
            lua.create_function(move |_, args: MultiValue| {
                timer.update(delta_arg(&args));
                Ok(())
            })?,
        )?;
        Ok(ops)
    })
}

fn meter_factory(lua: &Lua, registry: Arc<MetricsRegistry>) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        let name = metric_name(&args)?;
        let meter = registry.meter(&name)?;
        let ops = lua.create_table()?;
        ops.set(
            "mark",
            lua.create_function(move |_, args: MultiValue| {
                meter.mark(delta_arg(&args));
                Ok(())
            })?,
        )?;
        Ok(ops)
    })
}

/// Positional arguments with the implicit self table of `:` calls skipped.
fn positional(args: &MultiValue) -> Vec<&Value> {
    let mut values: Vec<&Value> = args.iter().collect();
    if matches!(values.first(), Some(Value::Table(_))) {
        values.remove(0);
    }
    values
}

fn metric_name(args: &MultiValue) -> mlua::Result<String> {
    match positional(args).first() {
        Some(Value::String(s)) => {
            let name = s.to_string_lossy();
            if name.is_empty() {
                Err(LogtricsError::MetricNameInvalid.into())
            } else {
                Ok(name)
            }
        }
        _ => Err(LogtricsError::MetricNameInvalid.into()),
    }
}

fn delta_arg(args: &MultiValue) -> i64 {
    for value in positional(args) {
        match value {
            Value::Integer(i) => return *i,
            Value::Number(n) => return *n as i64,
            _ => {}
        }
    }
    0
}

fn format_log_args(args: &MultiValue) -> mlua::Result<String> {
    let mut iter = args.iter();
    let Some(first) = iter.next() else {
        return Err(mlua::Error::RuntimeError("parameter required".to_string()));
    };
    let format = render_value(first);
    let rest: Vec<String> = iter.map(render_value).collect();
    Ok(format_message(&format, &rest))
}

/// Renders one argument the way it appears in a log message.
/// Tables render as `[ k = v,  ... ]`.
fn render_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy(),
        Value::Table(table) => {
            let mut out = String::from("[");
            for (key, value) in table.pairs::<Value, Value>().flatten() {
                out.push_str(&format!(
                    " {} = {}, ",
                    render_value(&key),
                    render_value(&value)
                ));
            }
            out.push(']');
            out
        }
        other => format!("{other:?}"),
    }
}

/// Substitutes printf-style `%` placeholders left to right.
fn format_message(format: &str, args: &[String]) -> String {
    let mut out = String::new();
    let mut remaining = args.iter();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                out.push('%');
                chars.next();
            }
            Some(_) => {
                chars.next();
                if let Some(arg) = remaining.next() {
                    out.push_str(arg);
                }
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_message_substitutes_in_order() {
        let args = vec!["world".to_string(), "42".to_string()];
        assert_eq!(
            format_message("greet %s code %d", &args),
            "greet world code 42"
        );
    }

    #[test]
    fn test_format_message_literal_percent() {
        assert_eq!(format_message("100%% done", &[]), "100% done");
    }

    #[test]
    fn test_format_message_missing_args() {
        assert_eq!(format_message("a=%s b=%s", &["1".to_string()]), "a=1 b=");
    }

    #[test]
    fn test_render_table_value() {
        let lua = Lua::new();
        let table: Value = lua.load(r#"return { answer = 42 }"#).eval().unwrap();
        assert_eq!(render_value(&table), "[ answer = 42, ]");
    }

    #[test]
    fn test_metric_name_skips_self_table() {
        let lua = Lua::new();
        let table: Value = lua.load("return {}").eval().unwrap();
        let args = MultiValue::from_iter([table, Value::String(lua.create_string("hits").unwrap())]);
        assert_eq!(metric_name(&args).unwrap(), "hits");
    }

    #[test]
    fn test_empty_metric_name_rejected() {
        let lua = Lua::new();
        let args = MultiValue::from_iter([Value::String(lua.create_string("").unwrap())]);
        assert!(metric_name(&args).is_err());
    }

    #[test]
    fn test_delta_arg_defaults_to_zero() {
        assert_eq!(delta_arg(&MultiValue::new()), 0);
        let args = MultiValue::from_iter([Value::Integer(7)]);
        assert_eq!(delta_arg(&args), 7);
    }
}
