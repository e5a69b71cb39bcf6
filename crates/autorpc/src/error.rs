//! # Error strata
//!
//! Three layers of failure cross this runtime:
//!
//! - [`RpcError`] — protocol-level: the envelope itself was rejected. Its
//!   display form always starts with `autorpc:`, which is how the peer
//!   tells it apart from a user error on the wire.
//! - [`MethodError`] — user-level: a dispatched method reported failure.
//!   Carried verbatim in the envelope's error field, never prefixed.
//! - [`CallError`] — what an outbound call's completion receives.
//!
//! [`SessionError`] is what a dispatch loop hands back to whoever owns the
//! session. Configuration errors live in [`crate::api`], connection-state
//! errors in [`crate::conn`], transport errors in [`crate::transport`].

use crate::transport;

/// A protocol-level failure: an envelope the runtime could not route,
/// decode, or answer.
#[derive(Debug)]
pub struct RpcError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// A protocol error with no message of its own, only an underlying
    /// cause. Displays as `autorpc: internal error <cause>`.
    pub fn from_cause(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            message: String::new(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            match &self.source {
                Some(source) => write!(f, "autorpc: internal error {}", source),
                None => write!(f, "autorpc: internal error"),
            }
        } else {
            write!(f, "autorpc: {}", self.message)
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn std::error::Error + 'static))
    }
}

/// A user-level error returned by a dispatched method. Round-trips over
/// the wire as its verbatim message.
#[derive(Debug, Clone)]
pub struct MethodError(String);

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MethodError {}

/// Why an outbound call's completion was invoked with a failure instead of
/// typed returns.
#[derive(Debug, Clone)]
pub enum CallError {
    /// The remote method reported a user-level error, carried verbatim.
    Remote(String),
    /// The peer rejected the call at the protocol level, or its reply did
    /// not decode into the expected returns.
    Protocol(String),
    /// The request never left: the transport write failed.
    Transport(transport::Error),
    /// An argument could not be serialized; nothing was sent.
    Encode(String),
    /// The function was never declared on the enabled remote record.
    Undeclared(String),
    /// The originating connection was torn down before a response arrived.
    ConnectionClosed,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(message) => f.write_str(message),
            Self::Protocol(message) => write!(f, "autorpc: {}", message),
            Self::Transport(err) => write!(f, "transport failure: {}", err),
            Self::Encode(message) => f.write_str(message),
            Self::Undeclared(name) => {
                write!(f, "autorpc: function {} is not declared on the remote record", name)
            }
            Self::ConnectionClosed => f.write_str("connection closed"),
        }
    }
}

impl std::error::Error for CallError {}

/// What one dispatch iteration (and therefore a whole session) can fail
/// with. EOF is not an error and never appears here.
#[derive(Debug)]
pub enum SessionError {
    /// Protocol-level failure; the peer is likely out of sync.
    Rpc(RpcError),
    /// A local method reported a user-level error. The reply carrying it
    /// was already written to the peer.
    Method(MethodError),
    /// The transport failed mid-session.
    Transport(transport::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc(err) => std::fmt::Display::fmt(err, f),
            Self::Method(err) => std::fmt::Display::fmt(err, f),
            Self::Transport(err) => write!(f, "transport failure: {}", err),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(err) => Some(err),
            Self::Method(err) => Some(err),
            Self::Transport(err) => Some(err),
        }
    }
}
