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

//! The session side of the server: client sessions, their status subscriptions, request
//! correlation against the control host link, and event fan-out.

pub use bus::EventBus;
pub use hub::{DEFAULT_STATUS_METHOD, Hub, HubConfig, relay_method_name};
pub use mailbox::{Delivery, Mailbox};
pub use methods::{CallTimeout, LocalMethod, MethodHandler, MethodRegistry};
pub use registry::SessionRegistry;
pub use session::{
    ClientIdentity, PendingCallGuard, Session, SessionId, SessionState, TransportKind,
};
pub use state_cache::HostStateCache;
pub use subscriptions::{SubscribeOutcome, SubscriptionEngine, SyncOutcome};

mod bus;
mod correlation;
mod hub;
mod mailbox;
mod methods;
mod registry;
mod session;
mod state_cache;
mod subscriptions;
