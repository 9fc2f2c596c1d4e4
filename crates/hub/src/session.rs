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

//! Client sessions: one per WebSocket connection or one-shot HTTP exchange.

use crate::mailbox::Mailbox;
use rpc_common::{RequestId, RpcError};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Websocket,
    HttpOneshot,
}

impl TransportKind {
    pub fn id_str(&self) -> &'static str {
        match self {
            TransportKind::Websocket => "websocket",
            TransportKind::HttpOneshot => "http_oneshot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    /// Being torn down: no new mailbox pushes, pending calls are being failed.
    Draining,
    Closed,
}

impl SessionState {
    pub fn id_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id_str())
    }
}

/// What a client says about itself via `server.connection.identify`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientIdentity {
    pub client_name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub client_type: String,
    pub url: String,
}

struct PendingCall {
    method: String,
    started: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session {
    id: SessionId,
    kind: TransportKind,
    created: Instant,
    state: Mutex<SessionState>,
    identity: Mutex<Option<ClientIdentity>>,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    mailbox: Mailbox,
    closed: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: SessionId, kind: TransportKind, mailbox_capacity: usize) -> Self {
        Self {
            id,
            kind,
            created: Instant::now(),
            state: Mutex::new(SessionState::Connecting),
            identity: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            mailbox: Mailbox::new(id, mailbox_capacity),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Events this session lost to mailbox overflow.
    pub fn dropped_events(&self) -> u64 {
        self.mailbox.dropped()
    }

    pub fn identity(&self) -> Option<ClientIdentity> {
        lock(&self.identity).clone()
    }

    pub fn set_identity(&self, identity: ClientIdentity) {
        *lock(&self.identity) = Some(identity);
    }

    /// Resolves once the session starts draining.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn activate(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Connecting {
            *state = SessionState::Active;
        }
    }

    /// Stop accepting events and wake everything waiting on this session. Returns false if the
    /// session was already draining or closed.
    pub(crate) fn begin_draining(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if matches!(*state, SessionState::Draining | SessionState::Closed) {
                return false;
            }
            *state = SessionState::Draining;
        }
        self.mailbox.close();
        self.closed.cancel();
        true
    }

    pub(crate) fn finish_closing(&self) {
        *lock(&self.state) = SessionState::Closed;
    }

    /// Record an in-flight request. Fails if a request with the same id is already outstanding
    /// on this session, or if the session is no longer accepting requests.
    pub fn begin_call(
        self: &Arc<Self>,
        id: &RequestId,
        method: &str,
    ) -> Result<PendingCallGuard, RpcError> {
        if matches!(self.state(), SessionState::Draining | SessionState::Closed) {
            return Err(RpcError::SessionClosed);
        }
        let mut pending = lock(&self.pending);
        if pending.contains_key(id) {
            return Err(RpcError::DuplicateRequestId(id.to_string()));
        }
        pending.insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                started: Instant::now(),
            },
        );
        Ok(PendingCallGuard {
            session: self.clone(),
            id: id.clone(),
        })
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Outstanding calls as `(request id, method, elapsed)`, oldest first.
    pub fn pending_summary(&self) -> Vec<(RequestId, String, Duration)> {
        let pending = lock(&self.pending);
        let mut summary: Vec<_> = pending
            .iter()
            .map(|(id, call)| (id.clone(), call.method.clone(), call.started.elapsed()))
            .collect();
        summary.sort_by(|a, b| b.2.cmp(&a.2));
        summary
    }
}

/// Removes the pending entry when the call completes, whichever way it completes.
pub struct PendingCallGuard {
    session: Arc<Session>,
    id: RequestId,
}

impl Drop for PendingCallGuard {
    fn drop(&mut self) {
        lock(&self.session.pending).remove(&self.id);
    }
}
