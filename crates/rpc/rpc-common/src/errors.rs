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
use thiserror::Error;

/// Numeric codes carried in client-facing error envelopes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const NOT_FOUND: i64 = 404;
    pub const GONE: i64 = 410;
    pub const SERVICE_UNAVAILABLE: i64 = 503;
    pub const GATEWAY_TIMEOUT: i64 = 504;
}

/// The `{"code": .., "message": ..}` object carried by JSON-RPC error responses, on either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// Everything that can go wrong between a client call and the control host.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    #[error("control host unavailable: {0}")]
    LinkUnavailable(String),
    #[error("control host connection reset")]
    LinkReset,
    #[error("request timed out")]
    Timeout,
    #[error("session closed")]
    SessionClosed,
    #[error("duplicate request id {0}")]
    DuplicateRequestId(String),
    #[error("unknown object: {0}")]
    UnknownObject(String),
    #[error("method not found: {0}")]
    UnknownMethod(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// An error response relayed verbatim from the control host.
    #[error("host error {code}: {message}")]
    HostError { code: i64, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        use error_codes::*;
        match self {
            RpcError::LinkUnavailable(_) | RpcError::LinkReset => SERVICE_UNAVAILABLE,
            RpcError::Timeout => GATEWAY_TIMEOUT,
            RpcError::SessionClosed => GONE,
            RpcError::DuplicateRequestId(_) | RpcError::InvalidRequest(_) => INVALID_REQUEST,
            RpcError::UnknownObject(_) => NOT_FOUND,
            RpcError::UnknownMethod(_) => METHOD_NOT_FOUND,
            RpcError::MalformedFrame(_) => PARSE_ERROR,
            RpcError::InvalidParams(_) => INVALID_PARAMS,
            RpcError::HostError { code, .. } => *code,
            RpcError::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// The error object a client sees for this failure.
    pub fn to_error_object(&self) -> ErrorObject {
        let message = match self {
            // Relay the host's own wording unchanged.
            RpcError::HostError { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorObject {
            code: self.code(),
            message,
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(error: ErrorObject) -> Self {
        RpcError::HostError {
            code: error.code,
            message: error.message,
        }
    }
}
