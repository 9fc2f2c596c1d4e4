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

use crate::host::ws_connection::WebSocketConnection;
use axum::{
    Json,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
};
use stateplex_hub::{Hub, TransportKind};
use std::net::SocketAddr;
use tracing::info;

/// Shared state behind every route.
#[derive(Clone)]
pub struct WebHost {
    pub(crate) hub: Hub,
}

impl WebHost {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}

/// GET /websocket: upgrade and run a long-lived session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(host): State<WebHost>,
) -> impl IntoResponse + use<> {
    info!("WebSocket connection from {}", addr);
    ws.on_upgrade(move |socket| async move {
        let session = host.hub.register_session(TransportKind::Websocket);
        WebSocketConnection::new(host.hub.clone(), session, addr)
            .handle(socket)
            .await
    })
}

/// GET /server/info
pub async fn server_info_handler(State(host): State<WebHost>) -> impl IntoResponse {
    Json(host.hub.server_info())
}
