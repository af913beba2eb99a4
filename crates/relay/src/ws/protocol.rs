// Handshake vocabulary for collaboration sockets: how the bearer token rides
// in `Sec-WebSocket-Protocol`, the states a connection moves through, and
// how each rejection maps to a close code.

use axum::{
    extract::ws::close_code,
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap},
};
use std::fmt;
use thiserror::Error;

use crate::auth::jwt::VerifyError;

/// Prefix of the sub-protocol token that carries the access token.
pub const SUBPROTOCOL_PREFIX: &str = "jwt.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingProtocol,
    AwaitingAuth,
    Authenticating,
    Admitted,
    Relaying,
    Closed,
}

impl HandshakeState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingProtocol => "awaiting_protocol",
            Self::AwaitingAuth => "awaiting_auth",
            Self::Authenticating => "authenticating",
            Self::Admitted => "admitted",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection was refused before admission.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("first offered sub-protocol is missing or not a `jwt.` token")]
    Protocol,
    #[error(transparent)]
    Token(#[from] VerifyError),
    #[error("token subject does not resolve to an account")]
    UnknownUser,
    #[error("project does not exist")]
    UnknownProject,
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl Rejection {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Internal(_) => close_code::ERROR,
            _ => close_code::POLICY,
        }
    }

    /// Close-frame reason. Deliberately coarse; details stay in the logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Protocol => "unsupported protocol",
            Self::Token(_) | Self::UnknownUser => "unauthorized",
            Self::UnknownProject => "unknown project",
            Self::Internal(_) => "internal error",
        }
    }

    /// Label used for the rejection counter.
    pub fn metric_reason(&self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Token(_) => "token",
            Self::UnknownUser => "unknown_user",
            Self::UnknownProject => "unknown_project",
            Self::Internal(_) => "internal",
        }
    }

    /// State the handshake was in when it failed.
    pub fn state(&self) -> HandshakeState {
        match self {
            Self::Protocol => HandshakeState::AwaitingProtocol,
            Self::Token(_) => HandshakeState::AwaitingAuth,
            Self::UnknownUser | Self::UnknownProject | Self::Internal(_) => {
                HandshakeState::Authenticating
            }
        }
    }
}

/// First token the client offered: the leading comma-separated element of
/// the first `Sec-WebSocket-Protocol` header. A blank leading element is
/// returned as an empty token so the handshake rejects it.
pub fn first_offered_protocol(headers: &HeaderMap) -> Option<String> {
    let value = headers.get_all(SEC_WEBSOCKET_PROTOCOL).iter().next()?;
    let first = value.to_str().ok().and_then(|value| value.split(',').next()).unwrap_or_default();
    Some(first.trim().to_owned())
}

/// Extract the bearer token from an offered sub-protocol.
pub fn bearer_from_protocol(protocol: Option<&str>) -> Result<&str, Rejection> {
    protocol
        .and_then(|protocol| protocol.strip_prefix(SUBPROTOCOL_PREFIX))
        .filter(|token| !token.is_empty())
        .ok_or(Rejection::Protocol)
}
