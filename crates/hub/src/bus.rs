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

use crate::mailbox::Delivery;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId};
use rpc_common::{ClientNotification, RpcError};
use serde_json::Value;
use tracing::trace;

/// Pushes server-originated events into session mailboxes. Never waits on a slow client.
#[derive(Clone)]
pub struct EventBus {
    registry: SessionRegistry,
}

impl EventBus {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Deliver to every active session. Returns how many sessions accepted the event.
    pub fn broadcast(&self, method: &str, params: Value) -> usize {
        self.broadcast_where(|_| true, method, params)
    }

    /// Deliver to one session.
    pub fn broadcast_to(
        &self,
        session_id: SessionId,
        method: &str,
        params: Value,
    ) -> Result<(), RpcError> {
        let session = self.registry.get(session_id)?;
        match session
            .mailbox()
            .push(ClientNotification::new(method, params))
        {
            Delivery::Rejected => Err(RpcError::SessionClosed),
            Delivery::Queued | Delivery::DroppedOldest => Ok(()),
        }
    }

    /// Deliver to every active session matching `filter`.
    pub fn broadcast_where<F>(&self, filter: F, method: &str, params: Value) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let event = ClientNotification::new(method, params);
        let mut delivered = 0;
        for session in self.registry.sessions() {
            if !session.is_active() || !filter(&session) {
                continue;
            }
            if session.mailbox().push(event.clone()) != Delivery::Rejected {
                delivered += 1;
            }
        }
        trace!(method, delivered, "Broadcast event");
        delivered
    }
}
