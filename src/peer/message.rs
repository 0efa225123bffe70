use super::PeerError;
use super::PeerResult;
use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on an accepted frame. Large enough for a bitfield of any
/// realistic torrent and for one 16 KiB block; anything bigger is a
/// protocol violation or an attack.
const MAX_FRAME_LEN: u32 = 1 << 20;

/// A peer-wire message. The wire form is a 4-byte big-endian length prefix
/// followed by a one-byte id and the payload; a length of zero is a
/// KeepAlive.
#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload_len() + 1);
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::put_header(&mut buf, 0, 0),
            Message::Unchoke => Self::put_header(&mut buf, 1, 0),
            Message::Interested => Self::put_header(&mut buf, 2, 0),
            Message::NotInterested => Self::put_header(&mut buf, 3, 0),
            Message::Have(index) => {
                Self::put_header(&mut buf, 4, 4);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                Self::put_header(&mut buf, 5, bits.len());
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                Self::put_header(&mut buf, 6, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                Self::put_header(&mut buf, 7, 8 + block.len());
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                Self::put_header(&mut buf, 8, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
        }
        buf
    }

    fn put_header(buf: &mut Vec<u8>, id: u8, payload_len: usize) {
        buf.put_u32(payload_len as u32 + 1);
        buf.put_u8(id);
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Have(_) => 4,
            Message::Bitfield(bits) => bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
            _ => 0,
        }
    }

    /// Reads one framed message off the stream.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> PeerResult<Self> {
        let frame_len = reader.read_u32().await?;
        if frame_len == 0 {
            return Ok(Message::KeepAlive);
        }
        if frame_len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(frame_len));
        }
        let id = reader.read_u8().await?;
        let mut payload = vec![0u8; frame_len as usize - 1];
        reader.read_exact(&mut payload).await?;
        Self::parse(id, payload)
    }

    /// Decodes a message from its id and payload (the bytes after the id).
    pub fn parse(id: u8, payload: Vec<u8>) -> PeerResult<Self> {
        let mut buf = payload.as_slice();
        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                if buf.len() != 4 {
                    return Err(PeerError::MalformedMessage("have"));
                }
                Ok(Message::Have(buf.get_u32()))
            }
            5 => Ok(Message::Bitfield(payload)),
            6 => {
                if buf.len() != 12 {
                    return Err(PeerError::MalformedMessage("request"));
                }
                Ok(Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            7 => {
                if buf.len() < 8 {
                    return Err(PeerError::MalformedMessage("piece"));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    block: buf.to_vec(),
                })
            }
            8 => {
                if buf.len() != 12 {
                    return Err(PeerError::MalformedMessage("cancel"));
                }
                Ok(Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

/// Piece indices marked in a bitfield: bit `7 - i` of byte `o` stands for
/// piece `8 * o + i`. Indices at or beyond `num_pieces` (spare trailing
/// bits) are ignored.
pub fn bitfield_indices(bits: &[u8], num_pieces: u32) -> Vec<u32> {
    let mut indices = Vec::new();
    for (byte_offset, byte) in bits.iter().enumerate() {
        for bit in 0..8u32 {
            if byte & (0x80 >> bit) != 0 {
                let index = byte_offset as u32 * 8 + bit;
                if index < num_pieces {
                    indices.push(index);
                }
            }
        }
    }
    indices
}
