//! Message codecs.
//!
//! Fixtures move messages across the simulated wire as [`Bytes`], exactly as a
//! transport would. [`RpcMessage`] is the pair of pure functions that get a
//! typed message in and out of that form. Every prost message implements it;
//! serde types opt in through the [`Json`] wrapper.

use crate::error::CodecError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub trait RpcMessage: Sized + Send + 'static {
    fn encode_message(&self) -> Result<Bytes, CodecError>;

    fn decode_message(bytes: Bytes) -> Result<Self, CodecError>;
}

impl<T> RpcMessage for T
where
    T: prost::Message + Default + Send + 'static,
{
    fn encode_message(&self) -> Result<Bytes, CodecError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf).map_err(|e| CodecError::Encode {
            type_name: std::any::type_name::<T>(),
            message: e.to_string(),
        })?;
        Ok(Bytes::from(buf))
    }

    fn decode_message(bytes: Bytes) -> Result<Self, CodecError> {
        T::decode(bytes).map_err(|e| CodecError::Decode {
            type_name: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }
}

/// A serde type carried as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Json<T>(pub T);

impl<T> RpcMessage for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn encode_message(&self) -> Result<Bytes, CodecError> {
        serde_json::to_vec(&self.0)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                type_name: std::any::type_name::<T>(),
                message: e.to_string(),
            })
    }

    fn decode_message(bytes: Bytes) -> Result<Self, CodecError> {
        serde_json::from_slice(&bytes)
            .map(Json)
            .map_err(|e| CodecError::Decode {
                type_name: std::any::type_name::<T>(),
                message: e.to_string(),
            })
    }
}
