//! Wire format for the autorpc protocol: the tagged JSON envelope and the
//! typed fragment tuples that cross it.
//!
//! This crate knows nothing about transports or dispatch. It frames one
//! message as one JSON object and carries arguments and returns as opaque,
//! already-encoded fragments so that typed decoding can happen at the
//! dispatch site, once the expected types are known.

mod envelope;
mod error;
mod values;


pub use crate::envelope::CallId;
pub use crate::envelope::Envelope;
pub use crate::envelope::Kind;
pub use crate::envelope::ERROR_PREFIX;
pub use crate::envelope::salvage_call_id;

pub use crate::error::Error;
pub use crate::error::Result;

pub use crate::values::WireValues;
pub use crate::values::to_fragment;
pub use crate::values::from_fragment;
