//! Key and value model

mod key;
mod value;

pub use key::{Key, NAMESPACE_SEPARATOR, RawKey};
pub use value::{Metadata, Payload, Value, ValueType, current_timestamp};
