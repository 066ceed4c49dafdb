use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::store::types::Vfo;

use super::StationAdapter;

/// Line/JSON adapter for JS8Call-style TCP APIs (default port 2442).
///
/// Keeps one persistent connection; commands are newline-delimited JSON
/// objects and responses are correlated back by the request `id` field. A
/// missing correlated response within the per-call timeout is a transient
/// failure and tears the link down so the next call reconnects.
pub struct LineJsonAdapter {
    addr: String,
    timeout: Duration,
    next_id: u64,
    link: Option<Link>,
}

struct Link {
    tx_req: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn teardown(self) {
        // Dropping tx_req ends the writer; the reader is aborted outright.
        self.reader.abort();
        self.writer.abort();
    }
}

impl LineJsonAdapter {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            timeout,
            next_id: 1,
            link: None,
        }
    }

    async fn ensure_link(&mut self) -> Result<(), ProtocolError> {
        if self.link.is_some() {
            return Ok(());
        }

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                ProtocolError::Transient(format!("connect to {} timed out", self.addr))
            })?
            .map_err(|e| ProtocolError::from_io("connect", &e))?;
        debug!("Line/JSON link up to {}", self.addr);

        let (read_half, mut write_half) = stream.into_split();
        let (tx_req, mut rx_req) = mpsc::channel::<String>(32);
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx_req.recv().await {
                if write_half
                    .write_all(format!("{}\n", msg).as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
                let _ = write_half.flush().await;
            }
        });

        let pending_reader = pending.clone();
        let addr = self.addr.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                    warn!("Unparsed line/JSON RX from {}: {}", addr, line);
                    continue;
                };
                if let Some(id) = msg.get("id").and_then(Value::as_u64) {
                    let mut p = pending_reader.lock().await;
                    if let Some(tx) = p.remove(&id) {
                        let _ = tx.send(msg);
                    }
                }
            }
            // Stream closed: fail every in-flight call.
            pending_reader.lock().await.clear();
        });

        self.link = Some(Link {
            tx_req,
            pending,
            reader,
            writer,
        });
        Ok(())
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.teardown();
        }
    }

    async fn call(
        &mut self,
        msg_type: &str,
        value: &str,
        params: Value,
    ) -> Result<Value, ProtocolError> {
        self.ensure_link().await?;
        let id = self.next_id;
        self.next_id += 1;

        let frame = json!({
            "id": id,
            "type": msg_type,
            "value": value,
            "params": params,
        })
        .to_string();

        let (tx, rx) = oneshot::channel();
        let link = self.link.as_ref().ok_or_else(|| {
            ProtocolError::Transient("line/JSON link unavailable".to_string())
        })?;
        link.pending.lock().await.insert(id, tx);

        if link.tx_req.send(frame).await.is_err() {
            self.drop_link();
            return Err(ProtocolError::Transient(
                "line/JSON writer is gone".to_string(),
            ));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => {
                if let Some(err) = resp.get("error") {
                    return Err(ProtocolError::Permanent(format!(
                        "station rejected {}: {}",
                        msg_type, err
                    )));
                }
                Ok(resp)
            }
            Ok(Err(_)) => {
                // Sender dropped: the reader saw the stream close.
                self.drop_link();
                Err(ProtocolError::Transient(
                    "connection closed before a response arrived".to_string(),
                ))
            }
            Err(_) => {
                if let Some(link) = &self.link {
                    link.pending.lock().await.remove(&id);
                }
                // A silent peer leaves the link in an unknown state; rebuild
                // it on the next call.
                self.drop_link();
                Err(ProtocolError::Transient(format!(
                    "no correlated response to {} within {:?}",
                    msg_type, self.timeout
                )))
            }
        }
    }
}

#[async_trait]
impl StationAdapter for LineJsonAdapter {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.ensure_link().await
    }

    async fn set_frequency(&mut self, hz: u64, _vfo: Option<Vfo>) -> Result<(), ProtocolError> {
        // JS8Call has no VFO selection; the dial is the dial.
        self.call("RIG.SET_FREQ", "", json!({ "DIAL": hz }))
            .await?;
        Ok(())
    }

    async fn set_mode(&mut self, mode: &str) -> Result<(), ProtocolError> {
        self.call("RIG.SET_MODE", "", json!({ "MODE": mode }))
            .await?;
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        self.call("TX.SEND_MESSAGE", text, json!({})).await?;
        Ok(())
    }

    async fn health_check(&mut self) -> Result<(), ProtocolError> {
        self.call("RIG.GET_FREQ", "", json!({})).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.drop_link();
    }
}
