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

use crate::host::web_host::WebHost;
use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rpc_common::{ClientResponse, parse_client_request};
use serde_derive::Deserialize;
use stateplex_hub::{Hub, Session, SessionId, TransportKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct JsonRpcQuery {
    /// Run the request on behalf of this live session instead of a throwaway one.
    pub connection_id: Option<SessionId>,
    /// Override the method's deadline for the control host.
    pub timeout_ms: Option<u64>,
}

/// A session that lives exactly as long as one HTTP exchange, including one cut short by the
/// client going away.
struct OneshotSession {
    hub: Hub,
    session: Arc<Session>,
}

impl Drop for OneshotSession {
    fn drop(&mut self) {
        self.hub.unregister_session(self.session.id());
    }
}

/// POST /server/jsonrpc
pub async fn jsonrpc_handler(
    State(host): State<WebHost>,
    Query(query): Query<JsonRpcQuery>,
    body: Bytes,
) -> Response {
    match handle_jsonrpc(&host.hub, &query, &body).await {
        Some(response) => Json(response.to_json()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub(crate) async fn handle_jsonrpc(
    hub: &Hub,
    query: &JsonRpcQuery,
    body: &[u8],
) -> Option<ClientResponse> {
    let request = match parse_client_request(body) {
        Ok(request) => request,
        Err(response) => return Some(response),
    };
    let timeout = query.timeout_ms.map(Duration::from_millis);

    match query.connection_id {
        Some(connection_id) => {
            let session = match hub.registry().get(connection_id) {
                Ok(session) => session,
                Err(e) => {
                    debug!(connection_id, "HTTP request names an unknown connection");
                    return request.id.map(|id| ClientResponse::failure(Some(id), &e));
                }
            };
            hub.dispatch_with_timeout(&session, request, timeout).await
        }
        None => {
            let oneshot = OneshotSession {
                hub: hub.clone(),
                session: hub.register_session(TransportKind::HttpOneshot),
            };
            hub.dispatch_with_timeout(&oneshot.session, request, timeout)
                .await
        }
    }
}
