use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::error::ProtocolError;
use crate::store::types::Vfo;

use super::StationAdapter;

/// XML-RPC adapter for fldigi-family programs (fldigi waterfall control,
/// flrig-style rig methods on the same envelope format).
///
/// One HTTP POST of a single `methodCall` envelope per command, to `/RPC2`
/// on the configured host/port (default 7362). A non-2xx status, an
/// unparsable response, or a `<fault>` element is a protocol failure.
pub struct XmlRpcAdapter {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl XmlRpcAdapter {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            endpoint: format!("http://{}:{}/RPC2", host, port),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn call(&self, method: &str, param: Option<&str>) -> Result<String, ProtocolError> {
        let body = envelope(method, param);
        debug!("XML-RPC TX {} -> {}", method, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "text/xml")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let msg = format!("XML-RPC endpoint returned HTTP {}", status);
            // 5xx usually means a proxy or a restarting program; worth
            // another attempt. 4xx never is.
            return Err(if status.is_server_error() {
                ProtocolError::Transient(msg)
            } else {
                ProtocolError::Permanent(msg)
            });
        }

        let text = response.text().await.map_err(classify_reqwest)?;
        parse_response(&text)
    }
}

fn classify_reqwest(err: reqwest::Error) -> ProtocolError {
    if err.is_timeout() || err.is_connect() {
        ProtocolError::Transient(format!("XML-RPC transport: {}", err))
    } else {
        ProtocolError::Permanent(format!("XML-RPC transport: {}", err))
    }
}

/// Build a single-parameter `methodCall` envelope. `None` sends an empty
/// parameter list (status probes).
pub fn envelope(method: &str, param: Option<&str>) -> String {
    let params = match param {
        Some(value) => format!(
            "<params><param><value><string>{}</string></value></param></params>",
            quick_xml::escape::escape(value)
        ),
        None => "<params/>".to_string(),
    };
    format!(
        "<?xml version=\"1.0\"?><methodCall><methodName>{}</methodName>{}</methodCall>",
        quick_xml::escape::escape(method),
        params
    )
}

/// Parse a `methodResponse`, returning the first value's text. A `<fault>`
/// element or malformed XML is a permanent failure.
pub fn parse_response(xml: &str) -> Result<String, ProtocolError> {
    let mut reader = Reader::from_str(xml);
    let mut saw_method_response = false;
    let mut in_fault = false;
    let mut fault_text = String::new();
    let mut value_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"methodResponse" => saw_method_response = true,
                b"fault" => in_fault = true,
                _ => {}
            },
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"fault" {
                    in_fault = false;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| {
                        ProtocolError::Permanent(format!("unescapable XML-RPC response: {}", e))
                    })?
                    .to_string();
                if in_fault {
                    fault_text.push_str(&text);
                } else if value_text.is_empty() {
                    value_text = text.trim().to_string();
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ProtocolError::Permanent(format!(
                    "unparsable XML-RPC response: {}",
                    e
                )));
            }
        }
    }

    if !saw_method_response {
        return Err(ProtocolError::Permanent(
            "response carries no methodResponse element".to_string(),
        ));
    }
    if !fault_text.is_empty() {
        return Err(ProtocolError::Permanent(format!(
            "XML-RPC fault: {}",
            fault_text.trim()
        )));
    }
    Ok(value_text)
}

#[async_trait]
impl StationAdapter for XmlRpcAdapter {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        // HTTP is connection-per-call; nothing to set up.
        Ok(())
    }

    async fn set_frequency(&mut self, hz: u64, vfo: Option<Vfo>) -> Result<(), ProtocolError> {
        if let Some(vfo) = vfo {
            let ab = match vfo {
                Vfo::A => "A",
                Vfo::B => "B",
            };
            self.call("rig.set_AB", Some(ab)).await?;
        }
        self.call("rig.set_verify_frequency", Some(&hz.to_string()))
            .await?;
        Ok(())
    }

    async fn set_mode(&mut self, mode: &str) -> Result<(), ProtocolError> {
        self.call("rig.set_mode", Some(mode)).await?;
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        self.call("text.add_tx", Some(text)).await?;
        Ok(())
    }

    async fn set_waterfall(&mut self, offset_hz: i64) -> Result<(), ProtocolError> {
        // Documented shell-command syntax: FLDIGI.WFHZ:<offset>.
        let cmd = format!("FLDIGI.WFHZ:{}", offset_hz);
        self.call("main.shell", Some(&cmd)).await?;
        Ok(())
    }

    async fn health_check(&mut self) -> Result<(), ProtocolError> {
        self.call("main.get_version", None).await?;
        Ok(())
    }

    async fn close(&mut self) {
        // reqwest pools connections internally; dropping the client on
        // adapter teardown releases them.
    }
}
