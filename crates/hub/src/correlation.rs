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

use crate::hub::Hub;
use crate::session::Session;
use rpc_common::{ClientRequest, ClientResponse, RpcError, parse_client_request};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

impl Hub {
    /// Parse and run one client frame. `None` for notifications, which get no response.
    pub async fn dispatch_frame(&self, session: &Arc<Session>, frame: &[u8]) -> Option<ClientResponse> {
        match parse_client_request(frame) {
            Ok(request) => self.dispatch(session, request).await,
            Err(response) => {
                debug!(session_id = session.id(), "Rejected malformed client frame");
                Some(response)
            }
        }
    }

    pub async fn dispatch(
        &self,
        session: &Arc<Session>,
        request: ClientRequest,
    ) -> Option<ClientResponse> {
        self.dispatch_with_timeout(session, request, None).await
    }

    /// Run one client request and build its response, tagged with the request's own id.
    ///
    /// A request id may only be outstanding once per session. If the session closes before the
    /// answer arrives, the call resolves with `SessionClosed`; a late host answer is discarded
    /// by the link.
    pub async fn dispatch_with_timeout(
        &self,
        session: &Arc<Session>,
        request: ClientRequest,
        timeout: Option<Duration>,
    ) -> Option<ClientResponse> {
        let ClientRequest { id, method, params } = request;
        let Some(id) = id else {
            if let Err(e) = self.invoke(session, &method, params, timeout).await {
                debug!(session_id = session.id(), method, error = %e, "Client notification failed");
            }
            return None;
        };

        let _pending = match session.begin_call(&id, &method) {
            Ok(pending) => pending,
            Err(e) => return Some(ClientResponse::failure(Some(id), &e)),
        };
        trace!(session_id = session.id(), %id, method, "Dispatching client request");

        let outcome = tokio::select! {
            biased;
            _ = session.closed() => Err(RpcError::SessionClosed),
            outcome = self.invoke(session, &method, params, timeout) => outcome,
        };
        Some(match outcome {
            Ok(result) => ClientResponse::success(Some(id), result),
            Err(e) => {
                debug!(session_id = session.id(), %id, method, error = %e, "Client request failed");
                ClientResponse::failure(Some(id), &e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::hub::{Hub, HubConfig};
    use crate::session::TransportKind;
    use pretty_assertions::assert_eq;
    use rpc_async_client::{LinkConfig, UpstreamLink};
    use rpc_common::{ClientRequest, ClientResponse, RpcError, error_codes};
    use serde_json::json;

    fn hub() -> Hub {
        Hub::new(
            HubConfig::default(),
            UpstreamLink::new(LinkConfig::new("/nonexistent/stateplex.sock")),
        )
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let hub = hub();
        let session = hub.register_session(TransportKind::Websocket);
        let response = hub
            .dispatch(&session, ClientRequest::new(5i64, "printer.nope", json!({})))
            .await
            .unwrap();
        assert_eq!(
            response,
            ClientResponse::failure(
                Some(5i64.into()),
                &RpcError::UnknownMethod("printer.nope".to_string())
            )
        );
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_forward_while_link_down() {
        let hub = hub();
        let session = hub.register_session(TransportKind::Websocket);
        let response = hub
            .dispatch(
                &session,
                ClientRequest::new("abc", "printer.gcode.script", json!({"script": "G28"})),
            )
            .await
            .unwrap();
        assert_eq!(response.id, Some("abc".into()));
        assert_eq!(
            response.outcome.err().map(|e| e.code),
            Some(error_codes::SERVICE_UNAVAILABLE)
        );
    }

    #[tokio::test]
    async fn test_local_methods() {
        let hub = hub();
        let session = hub.register_session(TransportKind::Websocket);
        let response = hub
            .dispatch(&session, ClientRequest::new(1i64, "server.websocket.id", json!({})))
            .await
            .unwrap();
        assert_eq!(response.outcome, Ok(json!({"websocket_id": session.id()})));

        let response = hub
            .dispatch(
                &session,
                ClientRequest::new(
                    2i64,
                    "server.connection.identify",
                    json!({"client_name": "mainsail", "version": "2.9", "type": "web", "url": "http://x"}),
                ),
            )
            .await
            .unwrap();
        assert_eq!(response.outcome, Ok(json!({"connection_id": session.id()})));
        assert_eq!(
            session.identity().map(|i| i.client_name),
            Some("mainsail".to_string())
        );
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let hub = hub();
        let session = hub.register_session(TransportKind::Websocket);
        let frame = br#"{"jsonrpc": "2.0", "method": "server.info"}"#;
        assert_eq!(hub.dispatch_frame(&session, frame).await, None);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_parse_error() {
        let hub = hub();
        let session = hub.register_session(TransportKind::Websocket);
        let response = hub.dispatch_frame(&session, b"{not json").await.unwrap();
        assert_eq!(response.id, None);
        assert_eq!(
            response.outcome.err().map(|e| e.code),
            Some(error_codes::PARSE_ERROR)
        );
    }

    #[tokio::test]
    async fn test_closed_session_rejects_requests() {
        let hub = hub();
        let session = hub.register_session(TransportKind::Websocket);
        hub.unregister_session(session.id());
        let response = hub
            .dispatch(&session, ClientRequest::new(9i64, "server.info", json!({})))
            .await
            .unwrap();
        assert_eq!(
            response,
            ClientResponse::failure(Some(9i64.into()), &RpcError::SessionClosed)
        );
    }
}
