//! Serialization of the opaque payload columns.
//!
//! The storage layer owns the tables but not the record format. Payloads go
//! through a [Codec] supplied by the caller; [JsonCodec] is used when none is.

use std::borrow::Cow;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BoxError, Result, StorageError};

pub trait Codec: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, Self::Error>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(record)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(bytes)
    }
}

pub(crate) fn encode<C: Codec, T: Serialize>(
    codec: &C,
    record: &T,
    what: impl Into<Cow<'static, str>>,
) -> Result<Vec<u8>> {
    codec.encode(record).map_err(|e| StorageError::Encode {
        what: what.into(),
        source: BoxError::from(e),
    })
}

pub(crate) fn decode<C: Codec, T: DeserializeOwned>(
    codec: &C,
    bytes: &[u8],
    what: impl FnOnce() -> String,
) -> Result<T> {
    codec.decode(bytes).map_err(|e| StorageError::Decode {
        what: what().into(),
        source: BoxError::from(e),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;
    use mutations_transport::{Entry, LogId, MapMetadata, SourceSlice, Watermark};

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let metadata = MapMetadata {
            sources: vec![SourceSlice {
                log_id: LogId(2),
                low_watermark: Watermark(10),
                high_watermark: Watermark(20),
            }],
        };
        let bytes = encode(&codec, &metadata, "metadata").unwrap();
        let back: MapMetadata = decode(&codec, &bytes, || "metadata".to_string()).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn test_malformed() {
        let err = decode::<_, Entry>(&JsonCodec, b"\x00garbage", || "dir/1/7".to_string())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().starts_with("could not decode dir/1/7"));
    }
}
