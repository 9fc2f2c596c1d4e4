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

//! The client-facing method table. Each method is either answered here or forwarded to a
//! control host method.

use crate::hub::Hub;
use crate::session::{ClientIdentity, Session};
use rpc_common::{HOST_QUERY_METHOD, ObjectsRequest, RpcError};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How long a forwarded call may wait for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTimeout {
    /// The link's configured default.
    LinkDefault,
    /// Wait until the host answers or the link resets.
    Unbounded,
    After(Duration),
}

impl CallTimeout {
    fn resolve(self, link_default: Option<Duration>) -> Option<Duration> {
        match self {
            CallTimeout::LinkDefault => link_default,
            CallTimeout::Unbounded => None,
            CallTimeout::After(timeout) => Some(timeout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalMethod {
    ServerInfo,
    ConnectionIdentify,
    WebsocketId,
    ObjectsQuery,
    ObjectsSubscribe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodHandler {
    Local(LocalMethod),
    Forward {
        host_method: String,
        timeout: CallTimeout,
    },
}

impl MethodHandler {
    fn forward(host_method: &str, timeout: CallTimeout) -> Self {
        MethodHandler::Forward {
            host_method: host_method.to_string(),
            timeout,
        }
    }
}

pub struct MethodRegistry {
    handlers: HashMap<String, MethodHandler>,
}

impl MethodRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The methods every server exposes.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("server.info", MethodHandler::Local(LocalMethod::ServerInfo));
        registry.register(
            "server.connection.identify",
            MethodHandler::Local(LocalMethod::ConnectionIdentify),
        );
        registry.register(
            "server.websocket.id",
            MethodHandler::Local(LocalMethod::WebsocketId),
        );
        registry.register(
            "printer.objects.subscribe",
            MethodHandler::Local(LocalMethod::ObjectsSubscribe),
        );
        registry.register(
            "printer.objects.query",
            MethodHandler::Local(LocalMethod::ObjectsQuery),
        );
        registry.register(
            "printer.objects.list",
            MethodHandler::forward("objects/list", CallTimeout::LinkDefault),
        );
        registry.register(
            "printer.info",
            MethodHandler::forward("info", CallTimeout::LinkDefault),
        );
        // Scripts can legitimately run for as long as a print move takes.
        registry.register(
            "printer.gcode.script",
            MethodHandler::forward("gcode/script", CallTimeout::Unbounded),
        );
        registry.register(
            "printer.emergency_stop",
            MethodHandler::forward("emergency_stop", CallTimeout::LinkDefault),
        );
        registry.register(
            "printer.restart",
            MethodHandler::forward("gcode/restart", CallTimeout::LinkDefault),
        );
        registry.register(
            "printer.firmware_restart",
            MethodHandler::forward("gcode/firmware_restart", CallTimeout::LinkDefault),
        );
        registry
    }

    pub fn register(&mut self, method: &str, handler: MethodHandler) {
        self.handlers.insert(method.to_string(), handler);
    }

    pub fn resolve(&self, method: &str) -> Result<&MethodHandler, RpcError> {
        self.handlers
            .get(method)
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        methods.sort();
        methods
    }
}

/// Named params, or the first element of positional params.
fn named_params(params: Value) -> Value {
    match params {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        params => params,
    }
}

/// Cut a host query reply down to the fields each object was asked for.
fn prune_query_reply(request: &ObjectsRequest, reply: &Value) -> Value {
    let status = reply.get("status").and_then(Value::as_object);
    let mut pruned = Map::new();
    for (name, fields) in &request.objects {
        if let Some(Value::Object(values)) = status.and_then(|status| status.get(name)) {
            pruned.insert(name.clone(), Value::Object(fields.filter(values)));
        }
    }
    json!({
        "eventtime": reply.get("eventtime").cloned().unwrap_or(Value::Null),
        "status": pruned,
    })
}

impl Hub {
    /// Run `method` on behalf of `session`. `timeout` overrides the method's own deadline.
    pub(crate) async fn invoke(
        &self,
        session: &Arc<Session>,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let link_default = self.link().config().call_timeout;
        match self.methods().resolve(method)? {
            MethodHandler::Local(local) => {
                let timeout = timeout.or(link_default);
                self.invoke_local(*local, session, params, timeout).await
            }
            MethodHandler::Forward {
                host_method,
                timeout: default,
            } => {
                let timeout = timeout.or(default.resolve(link_default));
                self.link()
                    .call_with_timeout(host_method, params, timeout)
                    .await
            }
        }
    }

    async fn invoke_local(
        &self,
        method: LocalMethod,
        session: &Arc<Session>,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        match method {
            LocalMethod::ServerInfo => Ok(self.server_info()),
            LocalMethod::WebsocketId => Ok(json!({ "websocket_id": session.id() })),
            LocalMethod::ConnectionIdentify => {
                let identity: ClientIdentity = serde_json::from_value(named_params(params))
                    .map_err(|e| RpcError::InvalidParams(format!("identify: {e}")))?;
                info!(
                    session_id = session.id(),
                    client_name = %identity.client_name,
                    version = %identity.version,
                    client_type = %identity.client_type,
                    "Client identified"
                );
                session.set_identity(identity);
                Ok(json!({ "connection_id": session.id() }))
            }
            LocalMethod::ObjectsSubscribe => {
                let request = ObjectsRequest::parse(&params)?;
                let outcome = self.subscriptions().apply(session.id(), &request).await?;
                Ok(outcome.to_json())
            }
            LocalMethod::ObjectsQuery => {
                let request = ObjectsRequest::parse(&params)?;
                let reply = self
                    .link()
                    .call_with_timeout(HOST_QUERY_METHOD, request.to_wire(), timeout)
                    .await?;
                Ok(prune_query_reply(&request, &reply))
            }
        }
    }
}
