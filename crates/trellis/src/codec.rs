use serde::{de::DeserializeOwned, Serialize};

use crate::error::RpcError;

/// Payload serialization scheme, carried in the low nibble of the header's
/// serialize byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializeType {
    RawBytes = 0,
    #[default]
    Json = 1,
    Protobuf = 2,
    MsgPack = 3,
}

impl TryFrom<u8> for SerializeType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Self::RawBytes),
            1 => Ok(Self::Json),
            2 => Ok(Self::Protobuf),
            3 => Ok(Self::MsgPack),
            other => Err(other),
        }
    }
}

/// Encode capability for argument and reply types.
///
/// The statically-typed stand-in for a runtime codec registry: each payload
/// type declares which serialize types it supports. [`wire_serde!`] covers
/// serde types (JSON and MessagePack), [`wire_proto!`] covers prost messages,
/// and `Vec<u8>` is the raw-bytes payload.
///
/// [`wire_serde!`]: crate::wire_serde
/// [`wire_proto!`]: crate::wire_proto
pub trait Pack: Send + Sync {
    fn pack(&self, ty: SerializeType) -> Result<Vec<u8>, RpcError>;
}

/// Decode capability for argument and reply types.
pub trait Unpack: Send {
    fn unpack(&mut self, ty: SerializeType, bytes: &[u8]) -> Result<(), RpcError>;
}

/// Encodes a serde value under `ty`. Raw-bytes and protobuf payloads do not
/// satisfy the serde capability and are rejected as a type mismatch.
pub fn pack_serde<T: Serialize>(ty: SerializeType, value: &T) -> Result<Vec<u8>, RpcError> {
    match ty {
        SerializeType::Json => {
            serde_json::to_vec(value).map_err(|e| RpcError::Codec(e.to_string()))
        }
        SerializeType::MsgPack => {
            rmp_serde::to_vec(value).map_err(|e| RpcError::Codec(e.to_string()))
        }
        SerializeType::RawBytes | SerializeType::Protobuf => Err(RpcError::TypeMismatch(format!(
            "{ty:?} payload does not take the serde encoding path"
        ))),
    }
}

/// Decodes a serde value under `ty`.
pub fn unpack_serde<T: DeserializeOwned>(ty: SerializeType, bytes: &[u8]) -> Result<T, RpcError> {
    match ty {
        SerializeType::Json => {
            serde_json::from_slice(bytes).map_err(|e| RpcError::Codec(e.to_string()))
        }
        SerializeType::MsgPack => {
            rmp_serde::from_slice(bytes).map_err(|e| RpcError::Codec(e.to_string()))
        }
        SerializeType::RawBytes | SerializeType::Protobuf => Err(RpcError::TypeMismatch(format!(
            "{ty:?} payload does not take the serde decoding path"
        ))),
    }
}

/// Implements [`Pack`] and [`Unpack`] for types that serialize through serde
/// (the JSON and MessagePack wire formats).
#[macro_export]
macro_rules! wire_serde {
    ($($t:ty),+ $(,)?) => {$(
        impl $crate::Pack for $t {
            fn pack(&self, ty: $crate::SerializeType) -> Result<Vec<u8>, $crate::RpcError> {
                $crate::codec::pack_serde(ty, self)
            }
        }

        impl $crate::Unpack for $t {
            fn unpack(&mut self, ty: $crate::SerializeType, bytes: &[u8]) -> Result<(), $crate::RpcError> {
                *self = $crate::codec::unpack_serde(ty, bytes)?;
                Ok(())
            }
        }
    )+};
}

/// Implements [`Pack`] and [`Unpack`] for prost messages (the Protobuf wire
/// format). Any other serialize type is a type mismatch for these payloads.
#[macro_export]
macro_rules! wire_proto {
    ($($t:ty),+ $(,)?) => {$(
        impl $crate::Pack for $t {
            fn pack(&self, ty: $crate::SerializeType) -> Result<Vec<u8>, $crate::RpcError> {
                match ty {
                    $crate::SerializeType::Protobuf => Ok(::prost::Message::encode_to_vec(self)),
                    other => Err($crate::RpcError::TypeMismatch(format!(
                        "{other:?} payload requires a non-protobuf type"
                    ))),
                }
            }
        }

        impl $crate::Unpack for $t {
            fn unpack(&mut self, ty: $crate::SerializeType, bytes: &[u8]) -> Result<(), $crate::RpcError> {
                match ty {
                    $crate::SerializeType::Protobuf => {
                        *self = <$t as ::prost::Message>::decode(bytes)
                            .map_err(|e| $crate::RpcError::Codec(e.to_string()))?;
                        Ok(())
                    }
                    other => Err($crate::RpcError::TypeMismatch(format!(
                        "{other:?} payload requires a non-protobuf type"
                    ))),
                }
            }
        }
    )+};
}

// Raw byte buffers pass through untouched under `RawBytes` and fall back to
// serde for the general formats.
impl Pack for Vec<u8> {
    fn pack(&self, ty: SerializeType) -> Result<Vec<u8>, RpcError> {
        match ty {
            SerializeType::RawBytes => Ok(self.clone()),
            other => pack_serde(other, self),
        }
    }
}

impl Unpack for Vec<u8> {
    fn unpack(&mut self, ty: SerializeType, bytes: &[u8]) -> Result<(), RpcError> {
        match ty {
            SerializeType::RawBytes => {
                *self = bytes.to_vec();
                Ok(())
            }
            other => {
                *self = unpack_serde(other, bytes)?;
                Ok(())
            }
        }
    }
}
