//! TCP stream reader.

use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    net::TcpListener,
    sync::mpsc::UnboundedSender,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    config::{Configuration, TcpConfig},
    error::LogtricsError,
    reader::event::{self, LogEvent, LogReader, MAX_LINE_BYTES},
};

/// Reads log lines from TCP connections, one event per connection.
pub struct Tcp {
    conf: TcpConfig,
}

impl Tcp {
    pub fn new(conf: &Configuration) -> Self {
        Self {
            conf: conf.tcp.clone(),
        }
    }
}

#[async_trait]
impl LogReader for Tcp {
    async fn start(
        &mut self,
        cancel: CancellationToken,
        tx: UnboundedSender<LogEvent>,
    ) -> Result<(), LogtricsError> {
        if self.conf.host.is_empty() || self.conf.port == 0 {
            return Err(LogtricsError::reader_misconfigured(
                "tcp host and port are required",
            ));
        }
        let listener = TcpListener::bind((self.conf.host.as_str(), self.conf.port)).await?;
        debug!(host = %self.conf.host, port = self.conf.port, "TCP server started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("terminating tcp server");
                        break;
                    }
                    accepted = listener.accept() => {
                        let (mut conn, remote) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!(error = %e, "failed to accept tcp connection");
                                continue;
                            }
                        };
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let mut buf = [0u8; MAX_LINE_BYTES];
                            match conn.read(&mut buf).await {
                                Ok(len) => {
                                    let line = event::trim_line(&buf[..len]);
                                    let _ = tx.send(LogEvent::new(format!("TCP:{remote}"), line));
                                }
                                Err(e) => {
                                    let _ = tx.send(LogEvent::error(format!("TCP:{remote}"), e));
                                }
                            }
                        });
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_misconfigured_port_rejected() {
        let mut conf = Configuration::default();
        conf.tcp.port = 0;
        let mut reader = Tcp::new(&conf);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let err = reader.start(CancellationToken::new(), tx).await.unwrap_err();
        assert!(matches!(err, LogtricsError::ReaderMisconfigured(_)));
    }

    #[tokio::test]
    async fn test_connection_becomes_event() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut conf = Configuration::default();
        conf.tcp.port = port;
        let mut reader = Tcp::new(&conf);

        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        reader.start(cancel.clone(), tx).await.unwrap();

        let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        conn.write_all(b"  status=up\r\n").await.unwrap();
        conn.shutdown().await.unwrap();

        let event = rx.recv().await.unwrap();
        assert!(event.source.starts_with("TCP:127.0.0.1:"));
        assert_eq!(event.line, "status=up");
        cancel.cancel();
    }
}
