//! # Typed fragment tuples
//!
//! Arguments and returns cross the wire as ordered lists of opaque JSON
//! fragments. `WireValues` is implemented for tuples of serde-encodable
//! values up to eight elements; the tuple shape is what fixes the arity
//! and the element types at the dispatch site.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::to_raw_value;
use serde_json::value::RawValue;

use crate::error::Error;
use crate::error::Result;

/// Encode one value into an opaque fragment.
pub fn to_fragment<T: Serialize>(value: &T) -> Result<Box<RawValue>> {
    to_raw_value(value).map_err(Error::Encode)
}

/// Decode one fragment into a typed value.
pub fn from_fragment<T: DeserializeOwned>(fragment: &RawValue) -> std::result::Result<T, serde_json::Error> {
    serde_json::from_str(fragment.get())
}

/// An ordered tuple of values that crosses the wire as JSON fragments.
///
/// `LEN` is the tuple arity; `from_fragments` rejects a fragment list of
/// any other length with [`Error::CountMismatch`] before decoding.
pub trait WireValues: Sized + Send + 'static {
    const LEN: usize;

    fn to_fragments(&self) -> Result<Vec<Box<RawValue>>>;

    fn from_fragments(fragments: &[Box<RawValue>]) -> Result<Self>;
}

macro_rules! impl_wire_values {
    ($len:expr => $($ty:ident : $idx:tt),*) => {
        impl<$($ty,)*> WireValues for ($($ty,)*)
        where
            $($ty: Serialize + DeserializeOwned + Send + 'static,)*
        {
            const LEN: usize = $len;

            fn to_fragments(&self) -> Result<Vec<Box<RawValue>>> {
                Ok(vec![$(to_fragment(&self.$idx)?,)*])
            }

            fn from_fragments(fragments: &[Box<RawValue>]) -> Result<Self> {
                if fragments.len() != $len {
                    return Err(Error::CountMismatch {
                        expected: $len,
                        got: fragments.len(),
                    });
                }

                Ok(($(
                    from_fragment::<$ty>(&fragments[$idx]).map_err(|source| Error::Fragment {
                        index: $idx,
                        source,
                    })?,
                )*))
            }
        }
    };
}

impl_wire_values!(0 =>);
impl_wire_values!(1 => A: 0);
impl_wire_values!(2 => A: 0, B: 1);
impl_wire_values!(3 => A: 0, B: 1, C: 2);
impl_wire_values!(4 => A: 0, B: 1, C: 2, D: 3);
impl_wire_values!(5 => A: 0, B: 1, C: 2, D: 3, E: 4);
impl_wire_values!(6 => A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_wire_values!(7 => A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_wire_values!(8 => A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
