use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::error::RpcError;

/// Payload compression scheme, carried in bits 4..2 of the header flags byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressType {
    #[default]
    None = 0,
    Gzip = 1,
}

impl TryFrom<u8> for CompressType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            other => Err(other),
        }
    }
}

/// Gzip-compresses `data`.
pub fn zip(data: &[u8]) -> Result<Vec<u8>, RpcError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| RpcError::Compression(e.to_string()))
}

/// Decompresses gzip `data`.
pub fn unzip(data: &[u8]) -> Result<Vec<u8>, RpcError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| RpcError::Compression(e.to_string()))?;
    Ok(out)
}

/// Applies `ty` to an outgoing payload.
pub fn compress(ty: CompressType, data: &[u8]) -> Result<Vec<u8>, RpcError> {
    match ty {
        CompressType::None => Ok(data.to_vec()),
        CompressType::Gzip => zip(data),
    }
}

/// Reverses `ty` on an incoming payload.
pub fn decompress(ty: CompressType, data: &[u8]) -> Result<Vec<u8>, RpcError> {
    match ty {
        CompressType::None => Ok(data.to_vec()),
        CompressType::Gzip => unzip(data),
    }
}
