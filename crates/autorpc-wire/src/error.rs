//! Codec errors.

/// Failures while encoding or decoding envelopes and fragments.
#[derive(Debug)]
pub enum Error {
    /// A value could not be serialized into a JSON fragment.
    Encode(serde_json::Error),
    /// Bytes could not be parsed as an envelope.
    Parse(serde_json::Error),
    /// A fragment at a given position could not be decoded into its
    /// expected type.
    Fragment { index: usize, source: serde_json::Error },
    /// The number of fragments did not match the expected tuple length.
    CountMismatch { expected: usize, got: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "error marshaling value: {}", e),
            Self::Parse(e) => write!(f, "error parsing envelope: {}", e),
            Self::Fragment { index, source } => {
                write!(f, "error unmarshaling input {}: {}", index, source)
            }
            Self::CountMismatch { expected, got } => {
                write!(f, "wrong number of values: expected {}, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Fragment { source, .. } => Some(source),
            Self::CountMismatch { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
