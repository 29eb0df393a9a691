//! Value ⇄ field-map codec.
//!
//! The wire shape is a single `data` field holding the CBOR serialization
//! of the value, wrapped in URL-safe base64 so it survives every text
//! surface the entries pass through. Callers with a different entry layout
//! implement [`Codec`] themselves.

use bytes::Bytes;
use gavel_store::FieldMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;

/// The field the default codec stores its payload under.
pub const DATA_FIELD: &str = "data";

/// Errors that can occur while encoding or decoding stream payloads.
#[derive(Debug, Error)]
pub enum Error {
    /// The value could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(String),

    /// The payload could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// The entry is missing the field the codec expects.
    #[error("entry is missing field `{0}`")]
    MissingField(&'static str),
}

/// A pair of conversions between caller values and stream entry fields.
pub trait Codec<T>
where
    Self: Clone + Send + Sync + 'static,
{
    /// Serializes a value to its raw payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialize`] when the value cannot be serialized.
    fn encode_value(&self, value: &T) -> Result<Bytes, Error>;

    /// Deserializes a value from its raw payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deserialize`] when the payload is malformed.
    fn decode_value(&self, payload: &[u8]) -> Result<T, Error>;

    /// Wraps a value into an entry field map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialize`] when the value cannot be serialized.
    fn encode(&self, value: &T) -> Result<FieldMap, Error> {
        let mut fields = FieldMap::new();
        fields.insert(DATA_FIELD.to_string(), self.encode_value(value)?);
        Ok(fields)
    }

    /// Extracts a value from an entry field map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingField`] when the payload field is absent and
    /// [`Error::Deserialize`] when it is malformed.
    fn decode(&self, fields: &FieldMap) -> Result<T, Error> {
        let payload = fields
            .get(DATA_FIELD)
            .ok_or(Error::MissingField(DATA_FIELD))?;
        self.decode_value(payload)
    }
}

/// The default codec: CBOR, then URL-safe base64, under [`DATA_FIELD`].
#[derive(Debug)]
pub struct BinaryCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BinaryCodec<T> {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BinaryCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BinaryCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for BinaryCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode_value(&self, value: &T) -> Result<Bytes, Error> {
        let mut raw = Vec::new();
        ciborium::ser::into_writer(value, &mut raw)
            .map_err(|err| Error::Serialize(err.to_string()))?;
        Ok(Bytes::from(URL_SAFE.encode(raw)))
    }

    fn decode_value(&self, payload: &[u8]) -> Result<T, Error> {
        let raw = URL_SAFE
            .decode(payload)
            .map_err(|err| Error::Deserialize(err.to_string()))?;
        ciborium::de::from_reader(raw.as_slice())
            .map_err(|err| Error::Deserialize(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{DateTime, Utc};
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        amount: u64,
        at: DateTime<Utc>,
    }

    fn sample() -> Sample {
        Sample {
            name: "first".to_string(),
            amount: 250,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_round_trip() {
        let codec = BinaryCodec::<Sample>::new();
        let value = sample();
        let fields = codec.encode(&value).unwrap();
        assert!(fields.contains_key(DATA_FIELD));
        assert_eq!(codec.decode(&fields).unwrap(), value);
    }

    #[test]
    fn test_payload_is_text_safe() {
        let codec = BinaryCodec::<Sample>::new();
        let payload = codec.encode_value(&sample()).unwrap();
        let text = std::str::from_utf8(&payload).expect("payload must be valid UTF-8");
        assert!(
            text.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '='))
        );
    }

    #[test]
    fn test_missing_field() {
        let codec = BinaryCodec::<Sample>::new();
        let err = codec.decode(&FieldMap::new()).unwrap_err();
        assert!(matches!(err, Error::MissingField(DATA_FIELD)));
    }

    #[test]
    fn test_poisoned_payload() {
        let codec = BinaryCodec::<Sample>::new();
        let mut fields = FieldMap::new();
        fields.insert(DATA_FIELD.to_string(), Bytes::from_static(b"!!not-base64!!"));
        assert!(matches!(
            codec.decode(&fields).unwrap_err(),
            Error::Deserialize(_)
        ));
    }
}
