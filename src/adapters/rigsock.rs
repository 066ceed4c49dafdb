use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ProtocolError;
use crate::store::types::Vfo;

use super::StationAdapter;

/// Adapter for the local rig-control daemon (default 127.0.0.1:12345).
///
/// Commands are short text frames: `F <hz>` sets frequency, `M <mode> 0`
/// sets mode, `V <vfo>` selects a VFO, lowercase `f` reads the frequency
/// back. Every set command is acknowledged with `RPRT <code>`; code 0 is
/// success, any other code or a malformed acknowledgement is a permanent
/// protocol failure.
pub struct RigSocketAdapter {
    addr: String,
    timeout: Duration,
    conn: Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
}

impl RigSocketAdapter {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            timeout,
            conn: None,
        }
    }

    async fn ensure_conn(&mut self) -> Result<(), ProtocolError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                ProtocolError::Transient(format!("connect to {} timed out", self.addr))
            })?
            .map_err(|e| ProtocolError::from_io("connect", &e))?;
        debug!("Rig control link up to {}", self.addr);
        let (read_half, write_half) = stream.into_split();
        self.conn = Some((BufReader::new(read_half), write_half));
        Ok(())
    }

    /// Send one frame and read one reply line. Transport errors drop the
    /// connection so the next attempt reconnects.
    async fn exchange(&mut self, frame: &str) -> Result<String, ProtocolError> {
        self.ensure_conn().await?;
        let result = self.exchange_inner(frame).await;
        if result.is_err() {
            self.conn = None;
        }
        result
    }

    async fn exchange_inner(&mut self, frame: &str) -> Result<String, ProtocolError> {
        let (reader, writer) = self
            .conn
            .as_mut()
            .ok_or_else(|| ProtocolError::Transient("rig link unavailable".to_string()))?;

        writer
            .write_all(format!("{}\n", frame).as_bytes())
            .await
            .map_err(|e| ProtocolError::from_io("write", &e))?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::from_io("flush", &e))?;

        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| {
                ProtocolError::Transient(format!("no reply to '{}' within {:?}", frame, self.timeout))
            })?
            .map_err(|e| ProtocolError::from_io("read", &e))?;
        if read == 0 {
            return Err(ProtocolError::Transient(
                "rig daemon closed the connection".to_string(),
            ));
        }
        Ok(line.trim().to_string())
    }

    /// Issue a set command and check its `RPRT` acknowledgement.
    async fn command(&mut self, frame: &str) -> Result<(), ProtocolError> {
        let reply = self.exchange(frame).await?;
        check_ack(frame, &reply)
    }
}

/// `RPRT 0` is success; `RPRT <n>` is a daemon-reported error; anything
/// else is a malformed acknowledgement. Both of the latter are permanent.
pub fn check_ack(frame: &str, reply: &str) -> Result<(), ProtocolError> {
    let Some(code_text) = reply.strip_prefix("RPRT ") else {
        return Err(ProtocolError::Permanent(format!(
            "malformed acknowledgement to '{}': '{}'",
            frame, reply
        )));
    };
    match code_text.trim().parse::<i32>() {
        Ok(0) => Ok(()),
        Ok(code) => Err(ProtocolError::Permanent(format!(
            "rig daemon rejected '{}' with RPRT {}",
            frame, code
        ))),
        Err(_) => Err(ProtocolError::Permanent(format!(
            "malformed acknowledgement to '{}': '{}'",
            frame, reply
        ))),
    }
}

#[async_trait]
impl StationAdapter for RigSocketAdapter {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.ensure_conn().await
    }

    async fn set_frequency(&mut self, hz: u64, vfo: Option<Vfo>) -> Result<(), ProtocolError> {
        if let Some(vfo) = vfo {
            self.command(&format!("V {}", vfo.as_str())).await?;
        }
        self.command(&format!("F {}", hz)).await
    }

    async fn set_mode(&mut self, mode: &str) -> Result<(), ProtocolError> {
        self.command(&format!("M {} 0", mode)).await
    }

    async fn send_text(&mut self, _text: &str) -> Result<(), ProtocolError> {
        Err(ProtocolError::Permanent(
            "rig control daemon has no text channel".to_string(),
        ))
    }

    async fn health_check(&mut self) -> Result<(), ProtocolError> {
        // Read-only frequency query; the reply is a bare number.
        let reply = self.exchange("f").await?;
        if reply.parse::<u64>().is_ok() {
            Ok(())
        } else {
            Err(ProtocolError::Permanent(format!(
                "unexpected frequency reply '{}'",
                reply
            )))
        }
    }

    async fn close(&mut self) {
        if let Some((_, mut writer)) = self.conn.take() {
            let _ = writer.shutdown().await;
        }
    }
}
