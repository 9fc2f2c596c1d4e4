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

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use stateplex_hub::{Hub, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::select;
use tracing::{debug, info, trace};

/// One WebSocket client. Requests are dispatched concurrently; responses and pushed events
/// share the socket through a single writer.
pub struct WebSocketConnection {
    hub: Hub,
    session: Arc<Session>,
    peer_addr: SocketAddr,
}

impl WebSocketConnection {
    pub fn new(hub: Hub, session: Arc<Session>, peer_addr: SocketAddr) -> Self {
        Self {
            hub,
            session,
            peer_addr,
        }
    }

    pub async fn handle(self, stream: WebSocket) {
        let session_id = self.session.id();
        info!(session_id, peer = %self.peer_addr, "WebSocket session started");
        let (ws_sender, mut ws_receiver) = stream.split();
        let (responses, outbound) = flume::unbounded::<String>();
        let writer = tokio::spawn(write_loop(ws_sender, outbound, self.session.clone()));

        while let Some(message) = ws_receiver.next().await {
            let frame = match message {
                Ok(message) => match inbound(message) {
                    Inbound::Frame(frame) => frame,
                    Inbound::Skip => continue,
                    Inbound::Close => break,
                },
                Err(e) => {
                    debug!(session_id, error = %e, "WebSocket read failed");
                    break;
                }
            };
            let hub = self.hub.clone();
            let session = self.session.clone();
            let responses = responses.clone();
            tokio::spawn(async move {
                if let Some(response) = hub.dispatch_frame(&session, &frame).await {
                    // The writer is gone if the client already left.
                    let _ = responses.send(response.to_text());
                }
            });
        }

        // Closing the session closes its mailbox, which ends the writer.
        self.hub.unregister_session(session_id);
        drop(responses);
        let _ = writer.await;
        info!(session_id, peer = %self.peer_addr, "WebSocket session ended");
    }
}

enum Inbound {
    Frame(Bytes),
    Skip,
    Close,
}

fn inbound(message: Message) -> Inbound {
    match message {
        Message::Text(text) => Inbound::Frame(Bytes::from(text)),
        Message::Binary(bytes) => Inbound::Frame(bytes),
        Message::Ping(_) | Message::Pong(_) => Inbound::Skip,
        Message::Close(_) => Inbound::Close,
    }
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    responses: flume::Receiver<String>,
    session: Arc<Session>,
) {
    loop {
        let text = select! {
            biased;
            response = responses.recv_async() => match response {
                Ok(text) => text,
                Err(_) => break,
            },
            event = session.mailbox().recv() => match event {
                Some(event) => event.to_text(),
                None => break,
            },
        };
        trace!(session_id = session.id(), "Sending frame");
        if sender.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sender.close().await;
}
