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

//! Entities shared by both sides of the multiplexer: newline (or ETX) delimited JSON-RPC frames
//! exchanged with the control host, and the JSON-RPC 2.0 envelopes exchanged with clients.

pub use client::{
    ClientNotification, ClientRequest, ClientResponse, RequestId, parse_client_request,
};
pub use errors::{ErrorObject, RpcError, error_codes};
pub use framing::Framing;
pub use host::{HostFrame, HostNotification, encode_notification, encode_request, parse_host_frame};
pub use objects::{FieldSet, ObjectsRequest};

mod client;
pub mod client_args;
mod errors;
mod framing;
mod host;
mod objects;

/// The client-facing notification carrying filtered state deltas.
pub const STATUS_UPDATE_METHOD: &str = "notify_status_update";

/// Broadcast when the link to the control host comes up and a resync has completed.
pub const HOST_READY_METHOD: &str = "notify_host_ready";

/// Broadcast when the link to the control host drops.
pub const HOST_DISCONNECTED_METHOD: &str = "notify_host_disconnected";

/// Host method used to (re)declare the full set of tracked objects.
pub const HOST_SUBSCRIBE_METHOD: &str = "objects/subscribe";

/// Host method listing every object the host knows about.
pub const HOST_LIST_METHOD: &str = "objects/list";

/// Host method for one-off queries of object state.
pub const HOST_QUERY_METHOD: &str = "objects/query";
