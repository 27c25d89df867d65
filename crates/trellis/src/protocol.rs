use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    codec::SerializeType,
    compress::{self, CompressType},
    error::RpcError,
    share::Metadata,
};

/// First header byte of every frame.
pub const MAGIC: u8 = 0x08;

/// Current protocol version.
pub const VERSION: u8 = 0x00;

/// Upper bound on the body length of a single frame.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 12;

/// Direction of a frame, carried in bit 7 of the flags byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Request = 0,
    Response = 1,
}

/// Outcome of a call, carried in bit 1 of the flags byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageStatus {
    #[default]
    Normal = 0,
    Error = 1,
}

/// A single framed wire message.
///
/// Layout: a 12-byte header (magic, version, flags byte, serialize byte,
/// big-endian u64 sequence number), a big-endian u32 total body length, then
/// four length-prefixed sections: service path, service method, metadata and
/// payload. Metadata is a run of `(u32 klen, k, u32 vlen, v)` tuples. All
/// integers are big-endian.
///
/// [`Message::encode`] applies the configured compression to the payload;
/// [`Message::read`] undoes it, so the payload field always holds the
/// uncompressed bytes in memory. Typed decoding of the payload is left to the
/// caller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub heartbeat: bool,
    pub oneway: bool,
    pub compress_type: CompressType,
    pub status: MessageStatus,
    pub serialize_type: SerializeType,
    pub seq: u64,
    pub service_path: String,
    pub service_method: String,
    pub metadata: Metadata,
    pub payload: Vec<u8>,
}

impl Message {
    /// Serializes the message into a single frame, compressing the payload.
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        let payload = compress::compress(self.compress_type, &self.payload)?;
        let metadata = encode_metadata(&self.metadata);

        let body_len = 16
            + self.service_path.len()
            + self.service_method.len()
            + metadata.len()
            + payload.len();
        if body_len > MAX_FRAME_SIZE as usize {
            return Err(RpcError::MalformedFrame(format!(
                "frame body of {body_len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + 4 + body_len);
        buf.push(MAGIC);
        buf.push(VERSION);
        buf.push(self.flags_byte());
        buf.push(self.serialize_type as u8 & 0x0f);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        for section in [
            self.service_path.as_bytes(),
            self.service_method.as_bytes(),
            &metadata,
            &payload,
        ] {
            buf.extend_from_slice(&(section.len() as u32).to_be_bytes());
            buf.extend_from_slice(section);
        }
        Ok(buf)
    }

    /// Reads one frame from `reader`.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, RpcError> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let mut len = [0u8; 4];
        reader.read_exact(&mut len).await?;
        let body_len = u32::from_be_bytes(len);
        if body_len > MAX_FRAME_SIZE {
            return Err(RpcError::MalformedFrame(format!(
                "frame body of {body_len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
            )));
        }

        let mut body = vec![0u8; body_len as usize];
        reader.read_exact(&mut body).await?;
        Message::decode(&header, &body)
    }

    /// Parses a frame from its header and body bytes.
    pub fn decode(header: &[u8; HEADER_LEN], body: &[u8]) -> Result<Message, RpcError> {
        if header[0] != MAGIC {
            return Err(RpcError::MalformedFrame(format!(
                "bad magic byte 0x{:02x}",
                header[0]
            )));
        }
        if header[1] != VERSION {
            return Err(RpcError::MalformedFrame(format!(
                "unsupported protocol version {}",
                header[1]
            )));
        }

        let flags = header[2];
        let message_type = if flags & 0x80 != 0 {
            MessageType::Response
        } else {
            MessageType::Request
        };
        let heartbeat = flags & 0x40 != 0;
        let oneway = flags & 0x20 != 0;
        let compress_type = CompressType::try_from((flags >> 2) & 0x07)
            .map_err(|v| RpcError::MalformedFrame(format!("unknown compress type {v}")))?;
        let status = if flags & 0x02 != 0 {
            MessageStatus::Error
        } else {
            MessageStatus::Normal
        };
        let serialize_type = SerializeType::try_from(header[3] & 0x0f)
            .map_err(|v| RpcError::MalformedFrame(format!("unknown serialize type {v}")))?;

        let seq = u64::from_be_bytes(header[4..12].try_into().expect("8-byte slice"));

        let mut cursor = Cursor { body, pos: 0 };
        let service_path = string_section(&mut cursor, "service path")?;
        let service_method = string_section(&mut cursor, "service method")?;
        let metadata = decode_metadata(cursor.section("metadata")?)?;
        let payload = cursor.section("payload")?.to_vec();
        if cursor.pos != body.len() {
            return Err(RpcError::MalformedFrame(format!(
                "{} trailing bytes after payload",
                body.len() - cursor.pos
            )));
        }

        let payload = compress::decompress(compress_type, &payload)?;

        Ok(Message {
            message_type,
            heartbeat,
            oneway,
            compress_type,
            status,
            serialize_type,
            seq,
            service_path,
            service_method,
            metadata,
            payload,
        })
    }

    fn flags_byte(&self) -> u8 {
        let mut flags = (self.message_type as u8) << 7;
        if self.heartbeat {
            flags |= 0x40;
        }
        if self.oneway {
            flags |= 0x20;
        }
        flags |= (self.compress_type as u8 & 0x07) << 2;
        flags |= (self.status as u8) << 1;
        flags
    }
}

struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn section(&mut self, what: &str) -> Result<&'a [u8], RpcError> {
        let rest = &self.body[self.pos..];
        if rest.len() < 4 {
            return Err(RpcError::MalformedFrame(format!(
                "truncated {what} length prefix"
            )));
        }
        let len = u32::from_be_bytes(rest[..4].try_into().expect("4-byte slice")) as usize;
        if rest.len() - 4 < len {
            return Err(RpcError::MalformedFrame(format!(
                "{what} length {len} exceeds remaining body"
            )));
        }
        self.pos += 4 + len;
        Ok(&rest[4..4 + len])
    }
}

fn string_section(cursor: &mut Cursor<'_>, what: &str) -> Result<String, RpcError> {
    let bytes = cursor.section(what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| RpcError::MalformedFrame(format!("{what} is not valid utf-8")))
}

fn encode_metadata(metadata: &Metadata) -> Vec<u8> {
    let mut buf = Vec::new();
    for (k, v) in metadata {
        buf.extend_from_slice(&(k.len() as u32).to_be_bytes());
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
        buf.extend_from_slice(v.as_bytes());
    }
    buf
}

fn decode_metadata(mut bytes: &[u8]) -> Result<Metadata, RpcError> {
    let mut metadata = Metadata::new();
    while !bytes.is_empty() {
        let (key, rest) = metadata_entry(bytes)?;
        let (value, rest) = metadata_entry(rest)?;
        metadata.insert(key, value);
        bytes = rest;
    }
    Ok(metadata)
}

fn metadata_entry(bytes: &[u8]) -> Result<(String, &[u8]), RpcError> {
    if bytes.len() < 4 {
        return Err(RpcError::MalformedFrame(
            "truncated metadata length prefix".into(),
        ));
    }
    let len = u32::from_be_bytes(bytes[..4].try_into().expect("4-byte slice")) as usize;
    if bytes.len() - 4 < len {
        return Err(RpcError::MalformedFrame(format!(
            "metadata entry length {len} exceeds remaining section"
        )));
    }
    let entry = String::from_utf8(bytes[4..4 + len].to_vec())
        .map_err(|_| RpcError::MalformedFrame("metadata entry is not valid utf-8".into()))?;
    Ok((entry, &bytes[4 + len..]))
}
