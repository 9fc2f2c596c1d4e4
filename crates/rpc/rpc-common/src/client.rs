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

//! JSON-RPC 2.0 envelopes exchanged with clients over HTTP and WebSocket.

use crate::{ErrorObject, RpcError};
use serde_json::{Value, json};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// A client-chosen request id. Any JSON scalar; it is echoed back exactly as received.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestId(Value);

impl RequestId {
    pub fn new(value: Value) -> Option<Self> {
        match value {
            Value::String(_) | Value::Number(_) => Some(Self(value)),
            _ => None,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Canonical text form; `1` and `"1"` are distinct ids.
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl Eq for RequestId {}

impl Hash for RequestId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(Value::from(value))
    }
}

/// An inbound client call. `id` is absent for JSON-RPC notifications, which get no response.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Value,
}

impl ClientRequest {
    pub fn new(id: impl Into<RequestId>, method: &str, params: Value) -> Self {
        Self {
            id: Some(id.into()),
            method: method.to_string(),
            params,
        }
    }
}

/// The response to one client call, correlated by the client's own id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    pub id: Option<RequestId>,
    pub outcome: Result<Value, ErrorObject>,
}

impl ClientResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: Option<RequestId>, error: &RpcError) -> Self {
        Self {
            id,
            outcome: Err(error.to_error_object()),
        }
    }

    pub fn to_json(&self) -> Value {
        let id = self.id.as_ref().map_or(Value::Null, |id| id.as_value().clone());
        match &self.outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "result": result, "id": id}),
            Err(error) => json!({
                "jsonrpc": "2.0",
                "error": {"code": error.code, "message": error.message},
                "id": id,
            }),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }
}

/// A server-to-client notification (`notify_status_update`, relayed host events, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientNotification {
    pub method: String,
    pub params: Value,
}

impl ClientNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn to_json(&self) -> Value {
        match &self.params {
            Value::Null => json!({"jsonrpc": "2.0", "method": self.method}),
            Value::Array(_) => {
                json!({"jsonrpc": "2.0", "method": self.method, "params": self.params})
            }
            single => json!({"jsonrpc": "2.0", "method": self.method, "params": [single]}),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }
}

/// Parse one client frame. A frame that cannot be parsed at all yields an error response with a
/// null id; one that parses but is not a valid request echoes whatever id it carried.
pub fn parse_client_request(bytes: &[u8]) -> Result<ClientRequest, ClientResponse> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| {
        ClientResponse::failure(None, &RpcError::MalformedFrame(e.to_string()))
    })?;
    let Value::Object(mut frame) = value else {
        return Err(ClientResponse::failure(
            None,
            &RpcError::InvalidRequest("request must be a JSON object".to_string()),
        ));
    };

    let id = match frame.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => match RequestId::new(raw) {
            Some(id) => Some(id),
            None => {
                return Err(ClientResponse::failure(
                    None,
                    &RpcError::InvalidRequest("id must be a string or number".to_string()),
                ));
            }
        },
    };

    if let Some(version) = frame.remove("jsonrpc")
        && version != Value::from("2.0")
    {
        return Err(ClientResponse::failure(
            id,
            &RpcError::InvalidRequest(format!("unsupported jsonrpc version {version}")),
        ));
    }

    let method = match frame.remove("method") {
        Some(Value::String(method)) => method,
        _ => {
            return Err(ClientResponse::failure(
                id,
                &RpcError::InvalidRequest("method must be a string".to_string()),
            ));
        }
    };

    let params = match frame.remove("params") {
        None | Some(Value::Null) => Value::Null,
        Some(params @ (Value::Object(_) | Value::Array(_))) => params,
        Some(_) => {
            return Err(ClientResponse::failure(
                id,
                &RpcError::InvalidParams("params must be an object or array".to_string()),
            ));
        }
    };

    Ok(ClientRequest { id, method, params })
}
