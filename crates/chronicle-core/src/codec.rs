//! Payload codec.
//!
//! Payloads are persisted as opaque JSON documents. The recorded type name
//! travels with every call so failures can say which payload was broken.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PersistenceError;

/// Serializes typed payloads to an opaque document and back.
pub trait Codec: Send + Sync {
    /// Encodes `value`, recorded under `type_name`.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Codec` if the value cannot be serialized.
    fn encode<T: Serialize + ?Sized>(
        &self,
        type_name: &str,
        value: &T,
    ) -> Result<serde_json::Value, PersistenceError>;

    /// Decodes a document previously recorded under `type_name`.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Codec` if the document does not match `T`.
    fn decode<T: DeserializeOwned>(
        &self,
        type_name: &str,
        document: &serde_json::Value,
    ) -> Result<T, PersistenceError>;
}

/// `serde_json` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(
        &self,
        type_name: &str,
        value: &T,
    ) -> Result<serde_json::Value, PersistenceError> {
        serde_json::to_value(value).map_err(|e| PersistenceError::Codec {
            type_name: type_name.to_owned(),
            message: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(
        &self,
        type_name: &str,
        document: &serde_json::Value,
    ) -> Result<T, PersistenceError> {
        T::deserialize(document).map_err(|e| PersistenceError::Codec {
            type_name: type_name.to_owned(),
            message: e.to_string(),
        })
    }
}
