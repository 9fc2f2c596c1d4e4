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

use serde_derive::{Deserialize, Serialize};
use tokio_util::codec::AnyDelimiterCodec;

/// How frames are delimited on the control-host socket.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap_derive::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One JSON document per `\n` terminated line.
    #[default]
    Newline,
    /// One JSON document per frame, terminated by an ASCII ETX (0x03) byte.
    Etx,
}

impl Framing {
    pub fn delimiter(&self) -> u8 {
        match self {
            Framing::Newline => b'\n',
            Framing::Etx => 0x03,
        }
    }

    /// Build a codec which splits inbound bytes on this delimiter and terminates every outbound
    /// frame with it. Frames longer than `max_frame_bytes` are rejected by the decoder.
    pub fn codec(&self, max_frame_bytes: usize) -> AnyDelimiterCodec {
        let delimiter = vec![self.delimiter()];
        AnyDelimiterCodec::new_with_max_length(delimiter.clone(), delimiter, max_frame_bytes)
    }
}
