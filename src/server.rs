//! Line-delimited JSON-RPC 2.0 request surface.
//!
//! The hosting process drives the session through requests on one stream and
//! receives responses plus unsolicited notifications on another, one JSON
//! object per line. Requests are handled sequentially in arrival order;
//! long-running work (reconnection) happens on session tasks, never inside
//! the dispatch loop.
//!
//! Device failures cross the wire as classified errors: the JSON-RPC error
//! `data` carries the full [`Classification`] so the host can show the fixed
//! user-facing message without understanding device internals.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::classify::{classify, Classification, ErrorCategory};
use crate::device::{DeviceError, ServiceProtocol};
use crate::events::{CommandErrorEvent, EventSink, Notification};
use crate::session::Session;

// JSON-RPC 2.0 standard codes.
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

// Application codes, grouped by failure category.
const CONNECTION_FAILED: i64 = -32002;
const COMMAND_FAILED: i64 = -32004;
const PAIRING_FAILED: i64 = -32005;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
    /// Present when this error wraps a device failure; drives the
    /// `command-error` notification alongside the response.
    classification: Option<Classification>,
}

impl RpcError {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: None,
            classification: None,
        }
    }
}

impl From<DeviceError> for RpcError {
    fn from(error: DeviceError) -> Self {
        let classification = classify(&error);
        let code = match classification.category {
            ErrorCategory::Retryable => CONNECTION_FAILED,
            ErrorCategory::NonRetryable => COMMAND_FAILED,
            ErrorCategory::Pairing => PAIRING_FAILED,
            ErrorCategory::Unknown => INTERNAL_ERROR,
        };
        Self {
            code,
            message: classification.message.to_string(),
            data: serde_json::to_value(&classification).ok(),
            classification: Some(classification),
        }
    }
}

/// Request dispatcher bound to one session.
pub struct ControlServer {
    session: Session,
    sink: EventSink,
    scan_timeout: Duration,
    started: std::time::Instant,
}

impl ControlServer {
    #[must_use]
    pub fn new(session: Session, sink: EventSink, scan_timeout: Duration) -> Self {
        Self {
            session,
            sink,
            scan_timeout,
            started: std::time::Instant::now(),
        }
    }

    /// Serves requests until the input stream closes.
    ///
    /// Notifications from the session are interleaved with responses on the
    /// same output stream.
    pub async fn run<R, W>(
        &self,
        reader: R,
        writer: W,
        mut notifications: UnboundedReceiver<Notification>,
    ) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut writer = writer;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("request stream closed");
                        return Ok(());
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let response = self.handle_line(line).await;
                    write_json(&mut writer, &response).await?;
                }
                notification = notifications.recv() => {
                    let Some(notification) = notification else {
                        // Session dropped its sink; nothing more will come.
                        return Ok(());
                    };
                    write_json(&mut writer, &envelope(&notification)).await?;
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) -> Value {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("unparseable request: {e}");
                return error_response(
                    Value::Null,
                    &RpcError {
                        code: PARSE_ERROR,
                        message: format!("parse error: {e}"),
                        data: None,
                        classification: None,
                    },
                );
            }
        };

        let id = request.id.clone().unwrap_or(Value::Null);
        if request.jsonrpc != "2.0" {
            return error_response(
                id,
                &RpcError {
                    code: INVALID_REQUEST,
                    message: "expected jsonrpc 2.0".to_string(),
                    data: None,
                    classification: None,
                },
            );
        }

        debug!("request: {}", request.method);
        match self.dispatch(&request.method, &request.params).await {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(mut error) => {
                // Every device-level failure fires a command-error
                // notification in addition to the response, whichever method
                // it came through.
                if let Some(classification) = error.classification.take() {
                    self.emit_command_error(&request.method, classification);
                }
                error_response(id, &error)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        match method {
            "health" => Ok(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": self.started.elapsed().as_secs(),
                "connected": self.session.is_connected().await,
            })),
            "scan" => {
                let timeout = scan_timeout_param(params, self.scan_timeout)?;
                let devices = self.session.scan(timeout).await?;
                Ok(json!({ "devices": devices }))
            }
            "connect" => {
                let identifier = required_str(params, "identifier")?;
                let device = self.session.connect(identifier).await?;
                Ok(json!({ "success": true, "device": device }))
            }
            "disconnect" => {
                self.session.disconnect().await;
                Ok(json!({ "success": true }))
            }
            "remote_command" => {
                let command = required_str(params, "command")?;
                let action = optional_str(params, "action").unwrap_or("single_tap");
                let sent = self.session.send_command(command, action).await?;
                Ok(json!({ "success": sent }))
            }
            "start_pairing" => {
                let identifier = required_str(params, "identifier")?;
                let protocol = required_str(params, "protocol")?;
                let protocol = ServiceProtocol::parse(protocol).ok_or_else(|| {
                    RpcError::invalid_params(format!("unknown protocol: {protocol}"))
                })?;
                let started = self.session.start_pairing(identifier, protocol).await?;
                Ok(json!({
                    "success": true,
                    "requires_pin": started.requires_pin,
                    "protocol": started.protocol,
                }))
            }
            "finish_pairing" => {
                let pin = optional_str(params, "pin").unwrap_or("");
                let paired = self.session.finish_pairing(pin).await?;
                Ok(json!({ "success": paired }))
            }
            "get_status" => {
                serde_json::to_value(self.session.status().await).map_err(|e| RpcError {
                    code: INTERNAL_ERROR,
                    message: e.to_string(),
                    data: None,
                    classification: None,
                })
            }
            "list_saved_devices" => {
                Ok(json!({ "devices": self.session.saved_devices().await }))
            }
            "forget_device" => {
                let identifier = required_str(params, "identifier")?;
                let removed = self.session.forget_device(identifier).await?;
                Ok(json!({ "success": removed }))
            }
            "set_text" => {
                let text = required_str(params, "text")?;
                self.session.set_text(text).await?;
                Ok(json!({ "success": true }))
            }
            "clear_text" => {
                self.session.clear_text().await?;
                Ok(json!({ "success": true }))
            }
            "get_text" => {
                let text = self.session.get_text().await?;
                Ok(json!({ "text": text }))
            }
            "cancel_reconnect" => {
                let was_reconnecting = self.session.cancel_reconnect().await;
                Ok(json!({ "was_reconnecting": was_reconnecting }))
            }
            "system_wake" => {
                if let Some(gap) = params.get("gap_seconds").and_then(Value::as_f64) {
                    info!("host reported wake after a {gap:.0}s gap");
                }
                let outcome = self.session.trigger_wake_reconnect().await;
                Ok(json!({ "success": outcome.success, "message": outcome.message }))
            }
            other => Err(RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("unknown method: {other}"),
                data: None,
                classification: None,
            }),
        }
    }

    fn emit_command_error(&self, command: &str, classification: Classification) {
        let _ = self.sink.send(Notification::CommandError(CommandErrorEvent {
            command: command.to_string(),
            classification,
        }));
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("missing string param: {key}")))
}

fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn scan_timeout_param(params: &Value, default: Duration) -> Result<Duration, RpcError> {
    let Some(seconds) = params.get("timeout") else {
        return Ok(default);
    };
    let seconds = seconds
        .as_f64()
        .filter(|s| s.is_finite() && *s > 0.0 && *s <= 300.0)
        .ok_or_else(|| RpcError::invalid_params("timeout must be a positive number of seconds"))?;
    Ok(Duration::from_secs_f64(seconds))
}

fn error_response(id: Value, error: &RpcError) -> Value {
    let mut body = json!({ "code": error.code, "message": error.message });
    if let Some(data) = &error.data {
        body["data"] = data.clone();
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": body })
}

/// Wraps a notification in the JSON-RPC envelope the host expects.
fn envelope(notification: &Notification) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "event",
        "params": {
            "event": notification.name(),
            "data": notification.payload(),
        }
    })
}

async fn write_json<W>(writer: &mut W, value: &Value) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = value.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
