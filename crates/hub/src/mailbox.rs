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

use rpc_common::ClientNotification;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

/// Outcome of pushing an event into a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queued, but the oldest undelivered event was discarded to make room.
    DroppedOldest,
    /// The mailbox is closed; the event was discarded.
    Rejected,
}

struct MailboxState {
    queue: VecDeque<ClientNotification>,
    open: bool,
    dropped: u64,
}

/// Bounded per-session outbound queue. Pushing never blocks: when full, the oldest event goes.
pub struct Mailbox {
    session_id: u64,
    capacity: usize,
    state: Mutex<MailboxState>,
    ready: Notify,
}

impl Mailbox {
    pub fn new(session_id: u64, capacity: usize) -> Self {
        Self {
            session_id,
            capacity: capacity.max(1),
            state: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                open: true,
                dropped: 0,
            }),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: ClientNotification) -> Delivery {
        let delivery = {
            let mut state = self.lock();
            if !state.open {
                return Delivery::Rejected;
            }
            let mut delivery = Delivery::Queued;
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state.dropped += 1;
                if state.dropped == 1 || state.dropped % 100 == 0 {
                    warn!(
                        session_id = self.session_id,
                        dropped = state.dropped,
                        capacity = self.capacity,
                        "Session mailbox full; discarding oldest events"
                    );
                }
                delivery = Delivery::DroppedOldest;
            }
            state.queue.push_back(event);
            delivery
        };
        // Single consumer: a stored permit covers a push that lands before the consumer waits.
        self.ready.notify_one();
        delivery
    }

    /// Next queued event, waiting if there is none. `None` once the mailbox is closed.
    pub async fn recv(&self) -> Option<ClientNotification> {
        loop {
            {
                let mut state = self.lock();
                if !state.open {
                    return None;
                }
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
            }
            self.ready.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<ClientNotification> {
        let mut state = self.lock();
        if !state.open {
            return None;
        }
        state.queue.pop_front()
    }

    /// Discard queued events and refuse new ones.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.open = false;
            state.queue.clear();
        }
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        !self.lock().open
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events discarded for lack of room since the mailbox was created.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
