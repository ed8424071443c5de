//! Unified error type for the logtrics pipeline.

use std::{io, path::PathBuf};
use thiserror::Error;

/// Unified error type for configuration, script loading and runtime dispatch.
#[derive(Debug, Error)]
pub enum LogtricsError {
    /// Standard IO error, auto-converted from `io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration value rejected at startup or script load.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Declaration table carries a key the runtime does not recognize.
    #[error("invalid key [{0}]")]
    ConfigUnknownKey(String),

    /// Declaration table tries to override process-wide identity.
    #[error("modification is not supported for [{0}]")]
    ConfigImmutable(String),

    /// TOML config parsing error.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Config file I/O error with path.
    #[error("failed to read config file {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Rule file rejected during initial evaluation.
    #[error("failed to load script {path:?}: {source}")]
    ScriptLoad {
        path: PathBuf,
        #[source]
        source: mlua::Error,
    },

    /// Parser declaration names a kind other than `re2`.
    #[error("unknown parser kind [{kind}]")]
    ParserKindUnknown { kind: String },

    /// Parser expression failed to compile.
    #[error("invalid parser expression {expression:?}: {source}")]
    ParserCompile {
        expression: String,
        #[source]
        source: regex::Error,
    },

    /// Reader cannot start because host/port is missing.
    #[error("reader misconfigured: {0}")]
    ReaderMisconfigured(String),

    /// Script handler raised an error during a protected call.
    #[error("handler failed in {script}:[{logtric}]: {source}")]
    HandlerFailed {
        script: String,
        logtric: String,
        #[source]
        source: mlua::Error,
    },

    /// A metric name is already registered under a different kind.
    #[error("metric kind conflict on '{name}': registered as {registered}, requested {requested}")]
    MetricKindConflict {
        name: String,
        registered: &'static str,
        requested: &'static str,
    },

    /// Missing or empty metric name passed to a graphite factory.
    #[error("graphite: invalid metric name")]
    MetricNameInvalid,

    /// Graphite endpoint could not be resolved at registry construction.
    #[error("graphite connection failed for [{address}]: {reason}")]
    GraphiteResolve { address: String, reason: String },

    /// One flush tick failed; the next tick retries from scratch.
    #[error("graphite flush failed: {0}")]
    FlushFailed(#[source] io::Error),

    /// Any other interpreter error.
    #[error("script error: {0}")]
    Lua(#[from] mlua::Error),
}

impl LogtricsError {
    /// Create a configuration rejection error.
    pub fn config_invalid<S: Into<String>>(reason: S) -> Self {
        LogtricsError::ConfigInvalid(reason.into())
    }

    /// Create a script load failure for a rule file.
    pub fn script_load<P: Into<PathBuf>>(path: P, source: mlua::Error) -> Self {
        LogtricsError::ScriptLoad {
            path: path.into(),
            source,
        }
    }

    /// Create an unknown parser kind error.
    pub fn parser_kind_unknown<S: Into<String>>(kind: S) -> Self {
        LogtricsError::ParserKindUnknown { kind: kind.into() }
    }

    /// Create a reader misconfiguration error.
    pub fn reader_misconfigured<S: Into<String>>(reason: S) -> Self {
        LogtricsError::ReaderMisconfigured(reason.into())
    }

    /// Create a handler failure carrying the script and logtric names.
    pub fn handler_failed<S1, S2>(script: S1, logtric: S2, source: mlua::Error) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        LogtricsError::HandlerFailed {
            script: script.into(),
            logtric: logtric.into(),
            source,
        }
    }

    /// Create a metric kind conflict error.
    pub fn metric_kind_conflict<S: Into<String>>(
        name: S,
        registered: &'static str,
        requested: &'static str,
    ) -> Self {
        LogtricsError::MetricKindConflict {
            name: name.into(),
            registered,
            requested,
        }
    }
}

impl From<LogtricsError> for mlua::Error {
    fn from(e: LogtricsError) -> Self {
        match e {
            LogtricsError::Lua(inner) => inner,
            other => mlua::Error::external(other),
        }
    }
}
