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

use crate::session::{Session, SessionId, TransportKind};
use rpc_common::RpcError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

struct RegistryInner {
    sessions: papaya::HashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
    mailbox_capacity: usize,
}

/// Every live client session, keyed by an id that is never reused within a process.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: papaya::HashMap::new(),
                next_id: AtomicU64::new(1),
                mailbox_capacity,
            }),
        }
    }

    /// Allocate a session and make it visible to broadcasts.
    pub fn register(&self, kind: TransportKind) -> Arc<Session> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, kind, self.inner.mailbox_capacity));
        self.inner.sessions.pin().insert(id, session.clone());
        session.activate();
        debug!(session_id = id, kind = kind.id_str(), "Session registered");
        session
    }

    /// Remove a session. The caller is responsible for draining it.
    pub(crate) fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.pin().remove(&id).cloned()
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>, RpcError> {
        self.inner
            .sessions
            .pin()
            .get(&id)
            .cloned()
            .ok_or(RpcError::SessionClosed)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.sessions.pin().contains_key(&id)
    }

    /// A point-in-time copy of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .sessions
            .pin()
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
