//! Log events and the reader contract.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::error::LogtricsError;

/// A single log line read from a source.
///
/// When `err` is set, `line` is empty and the dispatcher drops the event
/// before handler dispatch.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub source: String,
    pub line: String,
    pub err: Option<String>,
}

impl LogEvent {
    pub fn new<S: Into<String>, L: Into<String>>(source: S, line: L) -> Self {
        Self {
            source: source.into(),
            line: line.into(),
            err: None,
        }
    }

    /// An event carrying a read error instead of a line.
    pub fn error<S: Into<String>, E: std::fmt::Display>(source: S, err: E) -> Self {
        Self {
            source: source.into(),
            line: String::new(),
            err: Some(err.to_string()),
        }
    }
}

/// A source of [`LogEvent`]s.
///
/// `start` performs fallible setup synchronously, spawns the read loop
/// and returns. The loop stops on cancellation.
#[async_trait]
pub trait LogReader: Send {
    async fn start(
        &mut self,
        cancel: CancellationToken,
        tx: UnboundedSender<LogEvent>,
    ) -> Result<(), LogtricsError>;
}

/// Maximum bytes read per datagram or connection; one read is one line.
pub(crate) const MAX_LINE_BYTES: usize = 1024;

/// Decodes a datagram or stream chunk into a trimmed log line.
pub(crate) fn trim_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_line_strips_whitespace_and_crlf() {
        assert_eq!(trim_line(b"  hello world\r\n"), "hello world");
        assert_eq!(trim_line(b"plain"), "plain");
        assert_eq!(trim_line(b"\n"), "");
    }
}
