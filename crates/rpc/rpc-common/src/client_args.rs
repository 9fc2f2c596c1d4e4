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

use crate::Framing;
use clap_derive::Parser;
use serde_derive::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command line arguments describing how to reach the control host.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct HostLinkArgs {
    #[arg(
        long,
        value_name = "host-socket",
        help = "Unix domain socket the control host listens on",
        default_value = "/tmp/stateplex_host.sock"
    )]
    pub host_socket: PathBuf,

    #[arg(
        long,
        value_enum,
        help = "Frame delimiter used on the control host socket",
        default_value = "newline"
    )]
    pub framing: Framing,

    #[arg(
        long,
        help = "Largest frame accepted from the control host, in bytes",
        default_value = "4194304"
    )]
    pub max_frame_bytes: usize,

    #[arg(
        long,
        help = "Default deadline for forwarded calls in milliseconds, 0 to wait forever",
        default_value = "30000"
    )]
    pub call_timeout_ms: u64,

    #[arg(
        long,
        help = "Initial reconnect delay in milliseconds",
        default_value = "250"
    )]
    pub reconnect_min_ms: u64,

    #[arg(
        long,
        help = "Reconnect delay ceiling in milliseconds",
        default_value = "10000"
    )]
    pub reconnect_max_ms: u64,
}
