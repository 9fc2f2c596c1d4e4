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

//! The upstream side of the multiplexer: one persistent socket to the control host, shared by
//! every client session.

pub use backoff::Backoff;
pub use link::{EventHandler, LifecycleHandler, LinkLifecycle, UpstreamLink};

mod backoff;
mod link;

use rpc_common::{Framing, client_args::HostLinkArgs};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

/// Where the link currently stands with respect to the control host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the post-connect resync did not complete.
    Degraded,
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Degraded)
    }

    pub fn id_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
        }
    }
}

impl Display for LinkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id_str())
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub socket_path: PathBuf,
    pub framing: Framing,
    pub max_frame_bytes: usize,
    /// Deadline applied to calls which don't specify their own. `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl LinkConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/stateplex_host.sock"),
            framing: Framing::Newline,
            max_frame_bytes: 4 * 1024 * 1024,
            call_timeout: Some(Duration::from_secs(30)),
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
        }
    }
}

impl From<&HostLinkArgs> for LinkConfig {
    fn from(args: &HostLinkArgs) -> Self {
        Self {
            socket_path: args.host_socket.clone(),
            framing: args.framing,
            max_frame_bytes: args.max_frame_bytes,
            call_timeout: (args.call_timeout_ms > 0)
                .then(|| Duration::from_millis(args.call_timeout_ms)),
            reconnect_min: Duration::from_millis(args.reconnect_min_ms),
            reconnect_max: Duration::from_millis(args.reconnect_max_ms),
        }
    }
}
