//! UDP datagram reader.

use async_trait::async_trait;
use tokio::{net::UdpSocket, sync::mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::{Configuration, UdpConfig},
    error::LogtricsError,
    reader::event::{self, LogEvent, LogReader, MAX_LINE_BYTES},
};

/// Reads log lines from a UDP socket, one event per datagram.
pub struct Udp {
    conf: UdpConfig,
}

impl Udp {
    pub fn new(conf: &Configuration) -> Self {
        Self {
            conf: conf.udp.clone(),
        }
    }
}

#[async_trait]
impl LogReader for Udp {
    async fn start(
        &mut self,
        cancel: CancellationToken,
        tx: UnboundedSender<LogEvent>,
    ) -> Result<(), LogtricsError> {
        if self.conf.host.is_empty() || self.conf.port == 0 {
            return Err(LogtricsError::reader_misconfigured(
                "udp host and port are required",
            ));
        }
        let socket = UdpSocket::bind((self.conf.host.as_str(), self.conf.port)).await?;
        debug!(host = %self.conf.host, port = self.conf.port, "UDP server started");

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_LINE_BYTES];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("UDP server terminated");
                        break;
                    }
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, remote)) => {
                            let line = event::trim_line(&buf[..len]);
                            let _ = tx.send(LogEvent::new(format!("UDP:{remote}"), line));
                        }
                        Err(e) => {
                            let _ = tx.send(LogEvent::error("UDP", e));
                        }
                    }
                }
            }
        });
        Ok(())
    }
}
