//! Per-type wire codecs.
//!
//! The routing core moves type-erased values; the only place the concrete
//! element type matters is the boundary with a byte transport. Each typed
//! attachment therefore registers a [`TypeVtable`]: an element-type
//! descriptor used to gate bindings, plus monomorphized encode/decode
//! functions for whichever wire format the connection negotiated.

use crate::channel::MsgValue;
use crate::error::{Error, Result};

use std::any::type_name;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Wire encoding negotiated per connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// Binary object encoding (CBOR).
    #[default]
    Cbor,
    /// JSON encoding.
    Json,
}

/// Bounds every routable message type satisfies.
///
/// `Clone` because one dispatched value may land in several receiver
/// queues; the serde bounds because any endpoint may end up mirrored
/// across a byte transport.
pub trait Msg:
    Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Msg for T where
    T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Element-type descriptor; equality is required for two endpoints to bind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor(String);

impl TypeDescriptor {
    /// The descriptor of a concrete element type.
    pub fn of<T: 'static>() -> Self {
        Self(type_name::<T>().to_string())
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type-erased codec for one element type.
pub(crate) struct TypeVtable {
    pub(crate) descriptor: TypeDescriptor,
    pub(crate) encode: fn(WireFormat, &MsgValue) -> Result<Bytes>,
    pub(crate) decode: fn(WireFormat, &[u8]) -> Result<MsgValue>,
}

impl TypeVtable {
    /// Build the vtable for a concrete element type.
    pub(crate) fn of<T: Msg>() -> Arc<Self> {
        Arc::new(Self {
            descriptor: TypeDescriptor::of::<T>(),
            encode: encode_as::<T>,
            decode: decode_as::<T>,
        })
    }
}

impl Debug for TypeVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeVtable")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

fn encode_as<T: Msg>(format: WireFormat, value: &MsgValue) -> Result<Bytes> {
    let value = value
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Marshal(format!("value is not a {}", type_name::<T>())))?;
    match format {
        WireFormat::Cbor => {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(value, &mut buf)
                .map_err(|e| Error::Marshal(e.to_string()))?;
            Ok(Bytes::from(buf))
        }
        WireFormat::Json => serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| Error::Marshal(e.to_string())),
    }
}

fn decode_as<T: Msg>(format: WireFormat, bytes: &[u8]) -> Result<MsgValue> {
    let value: T = match format {
        WireFormat::Cbor => {
            ciborium::de::from_reader(bytes).map_err(|e| Error::Demarshal(e.to_string()))?
        }
        WireFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| Error::Demarshal(e.to_string()))?
        }
    };
    Ok(Arc::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Ball {
        hit: String,
        count: u32,
    }

    #[test]
    fn test_roundtrip_both_formats() {
        let vt = TypeVtable::of::<Ball>();
        let ball = Ball {
            hit: "hi".into(),
            count: 3,
        };
        for format in [WireFormat::Cbor, WireFormat::Json] {
            let erased: MsgValue = Arc::new(ball.clone());
            let bytes = (vt.encode)(format, &erased).expect("encode");
            let back = (vt.decode)(format, &bytes).expect("decode");
            assert_eq!(back.downcast_ref::<Ball>(), Some(&ball));
        }
    }

    #[test]
    fn test_encode_rejects_foreign_value() {
        let vt = TypeVtable::of::<Ball>();
        let erased: MsgValue = Arc::new(7_u32);
        assert!((vt.encode)(WireFormat::Cbor, &erased).is_err());
    }

    #[test]
    fn test_descriptor_distinguishes_types() {
        assert_ne!(TypeDescriptor::of::<u32>(), TypeDescriptor::of::<u64>());
        assert_eq!(TypeDescriptor::of::<Ball>(), TypeDescriptor::of::<Ball>());
    }
}
