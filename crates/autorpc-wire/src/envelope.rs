//! # The message envelope
//!
//! One JSON object frames one message. The kind of a message is inferred
//! from which fields are populated rather than carried explicitly:
//!
//! - `f` non-empty: a request.
//! - `f` empty, `e` prefixed `autorpc:`: a protocol-level error, meaning
//!   the peer rejected the envelope itself.
//! - otherwise: a response, where a non-empty `e` is a user-level error
//!   returned by the dispatched function.
//!
//! ## Invariants
//! - Argument and return fragments are carried opaque; the envelope never
//!   re-encodes them.
//! - Call ids are encoded as decimal strings (safe across 53-bit JSON
//!   number boundaries) but accepted in either integer or string form.

use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::value::RawValue;

use crate::error::Error;
use crate::error::Result;

/// Prefix marking an error string as protocol-level rather than user-level.
pub const ERROR_PREFIX: &str = "autorpc:";

/// Identifier correlating a request with its response.
///
/// Non-zero 63-bit values are allocated for outbound calls; zero is the
/// placeholder used when replying to an envelope whose id could not be
/// recovered.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for CallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> de::Visitor<'de> for IdVisitor {
            type Value = CallId;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an unsigned integer or its decimal string form")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<CallId, E> {
                Ok(CallId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<CallId, E> {
                u64::try_from(v)
                    .map(CallId)
                    .map_err(|_| E::custom("negative call id"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<CallId, E> {
                v.parse::<u64>().map(CallId).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// The kind of a decoded envelope, inferred from its populated fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
    ProtocolError,
    /// Both `f` and `e` set. Treated as a protocol error on receipt.
    Malformed,
}

/// One wire message.
///
/// Empty fields are omitted when encoding, matching the `omitempty`
/// convention the peer side of this protocol uses.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "c", default)]
    pub call_id: CallId,

    #[serde(rename = "f", default, skip_serializing_if = "String::is_empty")]
    pub function: String,

    #[serde(rename = "a", default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Box<RawValue>>,

    #[serde(rename = "e", default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(rename = "d", default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<Box<RawValue>>,
}

impl Envelope {
    /// A request envelope invoking `function` with the given argument
    /// fragments.
    pub fn request(call_id: CallId, function: impl Into<String>, args: Vec<Box<RawValue>>) -> Self {
        Self {
            call_id,
            function: function.into(),
            args,
            error: String::new(),
            data: Vec::new(),
        }
    }

    /// A successful response carrying return fragments.
    pub fn response(call_id: CallId, data: Vec<Box<RawValue>>) -> Self {
        Self {
            call_id,
            function: String::new(),
            args: Vec::new(),
            error: String::new(),
            data,
        }
    }

    /// A reply reporting an error, carried verbatim. Whether the peer
    /// sees a user-level or protocol-level failure depends on whether the
    /// string carries the [`ERROR_PREFIX`].
    pub fn failure(call_id: CallId, error: impl Into<String>) -> Self {
        Self {
            call_id,
            function: String::new(),
            args: Vec::new(),
            error: error.into(),
            data: Vec::new(),
        }
    }

    /// A protocol-level error rejecting the envelope itself. The message is
    /// prefixed so the peer can tell it apart from a user error.
    pub fn protocol_error(call_id: CallId, message: &str) -> Self {
        Self {
            call_id,
            function: String::new(),
            args: Vec::new(),
            error: format!("{} {}", ERROR_PREFIX, message),
            data: Vec::new(),
        }
    }

    pub fn kind(&self) -> Kind {
        if !self.function.is_empty() && !self.error.is_empty() {
            Kind::Malformed
        } else if !self.function.is_empty() {
            Kind::Request
        } else if self.error.starts_with(ERROR_PREFIX) {
            Kind::ProtocolError
        } else {
            Kind::Response
        }
    }

    /// The protocol-error message with its `autorpc:` prefix stripped, if
    /// this envelope carries one.
    pub fn protocol_message(&self) -> Option<&str> {
        self.error
            .strip_prefix(ERROR_PREFIX)
            .map(|rest| rest.trim_start())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Parse)
    }
}

/// Best-effort recovery of the call id from bytes that failed to parse as
/// an envelope, so a protocol-error reply can still name the call it
/// rejects. Returns the zero id when nothing can be recovered.
pub fn salvage_call_id(bytes: &[u8]) -> CallId {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return CallId::default();
    };

    match value.get("c") {
        Some(serde_json::Value::Number(n)) => n.as_u64().map(CallId).unwrap_or_default(),
        Some(serde_json::Value::String(s)) => s.parse().map(CallId).unwrap_or_default(),
        _ => CallId::default(),
    }
}
