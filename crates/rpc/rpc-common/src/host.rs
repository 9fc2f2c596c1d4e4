// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Frames exchanged with the control host.
//!
//! Outbound requests are `{"method", "params", "id"}`, outbound notifications omit `id`.
//! Inbound frames are either responses (`result` or `error`, correlated by integer `id`) or
//! unsolicited notifications (`method` + `params`, no usable `id`).

use crate::{ErrorObject, RpcError};
use serde_json::{Map, Value, json};

/// An unsolicited message from the control host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostNotification {
    pub method: String,
    pub params: Value,
}

impl HostNotification {
    /// The host places the interesting payload in the first element of a params array.
    pub fn first_param(&self) -> Option<&Value> {
        match &self.params {
            Value::Array(items) => items.first(),
            Value::Null => None,
            other => Some(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostFrame {
    /// A reply to something we sent, matched by correlation token.
    Response {
        id: u64,
        result: Result<Value, ErrorObject>,
    },
    /// An error the host could not attach to any request (`"id": null`).
    UncorrelatedError(ErrorObject),
    Notification(HostNotification),
}

fn outbound_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

/// Serialize a request frame. The returned string carries no delimiter; framing is the codec's job.
pub fn encode_request(id: u64, method: &str, params: Value) -> Result<String, RpcError> {
    let frame = json!({
        "method": method,
        "params": outbound_params(params),
        "id": id,
    });
    serde_json::to_string(&frame).map_err(|e| RpcError::Internal(e.to_string()))
}

/// Serialize a fire-and-forget notification frame.
pub fn encode_notification(method: &str, params: Value) -> Result<String, RpcError> {
    let frame = json!({
        "method": method,
        "params": outbound_params(params),
    });
    serde_json::to_string(&frame).map_err(|e| RpcError::Internal(e.to_string()))
}

fn parse_error_object(value: Value) -> Result<ErrorObject, RpcError> {
    match value {
        Value::Object(_) => serde_json::from_value(value)
            .map_err(|e| RpcError::MalformedFrame(format!("bad error object: {e}"))),
        // Some hosts answer with a bare string.
        Value::String(message) => Ok(ErrorObject {
            code: crate::error_codes::INTERNAL_ERROR,
            message,
        }),
        other => Err(RpcError::MalformedFrame(format!(
            "bad error object: {other}"
        ))),
    }
}

/// Parse one deframed chunk of bytes from the control host.
pub fn parse_host_frame(bytes: &[u8]) -> Result<HostFrame, RpcError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| RpcError::MalformedFrame(e.to_string()))?;
    let Value::Object(mut frame) = value else {
        return Err(RpcError::MalformedFrame(
            "frame is not a JSON object".to_string(),
        ));
    };

    let id = frame.remove("id").unwrap_or(Value::Null);

    if let Some(method) = frame.remove("method") {
        let Value::String(method) = method else {
            return Err(RpcError::MalformedFrame(
                "method is not a string".to_string(),
            ));
        };
        let params = frame.remove("params").unwrap_or(Value::Null);
        return Ok(HostFrame::Notification(HostNotification { method, params }));
    }

    if let Some(error) = frame.remove("error") {
        let error = parse_error_object(error)?;
        return match id {
            Value::Null => Ok(HostFrame::UncorrelatedError(error)),
            id => Ok(HostFrame::Response {
                id: correlation_id(&id)?,
                result: Err(error),
            }),
        };
    }

    if let Some(result) = frame.remove("result") {
        return Ok(HostFrame::Response {
            id: correlation_id(&id)?,
            result: Ok(result),
        });
    }

    Err(RpcError::MalformedFrame(
        "frame has neither method, result nor error".to_string(),
    ))
}

fn correlation_id(id: &Value) -> Result<u64, RpcError> {
    id.as_u64()
        .ok_or_else(|| RpcError::MalformedFrame(format!("unusable response id: {id}")))
}
