//! Periodic scheduler declared on a logtric.

use std::time::Duration;

use mlua::{Function, Table};

use crate::error::LogtricsError;

/// Interval and handler of a `scheduler { ... }` declaration.
///
/// The tick task itself is spawned by the application so that handler
/// invocations travel the owning script's serialization domain.
#[derive(Debug)]
pub struct SchedulerSpec {
    interval: Duration,
    handler: Function,
}

impl SchedulerSpec {
    pub(crate) fn from_table(table: &Table) -> Result<Self, LogtricsError> {
        let secs = table
            .get::<Option<u64>>("interval")?
            .ok_or_else(|| LogtricsError::config_invalid("scheduler interval not found"))?;
        if secs == 0 {
            return Err(LogtricsError::config_invalid(
                "scheduler interval must be positive",
            ));
        }
        let handler = table
            .get::<Option<Function>>("handler")?
            .ok_or_else(|| LogtricsError::config_invalid("scheduler handler not found"))?;
        Ok(Self {
            interval: Duration::from_secs(secs),
            handler,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn handler(&self) -> &Function {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    fn spec_from(lua: &Lua, chunk: &str) -> Result<SchedulerSpec, LogtricsError> {
        let table: Table = lua.load(chunk).eval().unwrap();
        SchedulerSpec::from_table(&table)
    }

    #[test]
    fn test_valid_declaration() {
        let lua = Lua::new();
        let spec = spec_from(&lua, "return { interval = 2, handler = function() end }").unwrap();
        assert_eq!(spec.interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_interval_rejected() {
        let lua = Lua::new();
        let err = spec_from(&lua, "return { handler = function() end }").unwrap_err();
        assert!(matches!(err, LogtricsError::ConfigInvalid(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let lua = Lua::new();
        let err = spec_from(&lua, "return { interval = 0, handler = function() end }").unwrap_err();
        assert!(matches!(err, LogtricsError::ConfigInvalid(_)));
    }

    #[test]
    fn test_missing_handler_rejected() {
        let lua = Lua::new();
        let err = spec_from(&lua, "return { interval = 5 }").unwrap_err();
        assert!(matches!(err, LogtricsError::ConfigInvalid(_)));
    }
}
