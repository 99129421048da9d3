//! Length prefixed frames of the peer wire protocol.
//!
//! All of the messages after the handshake take the form of
//! `<length prefix><message ID><payload>`. The length prefix is a four byte
//! big-endian value covering everything after itself, the message ID is a
//! single byte and the payload is message dependent. A zero length prefix
//! with no ID is a keep-alive.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo};
use crate::{bitfield::Bitfield, error::Error};

/// Default maximum declared length of a frame, anything bigger is treated as
/// a hostile peer.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// Port of the DHT node of the sender.
    Port(u16),
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => Port,
            v => return Err(v),
        })
    }
}

impl Message {
    /// Size of the encoded frame, length prefix included.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        use Message::*;
        match self {
            KeepAlive => 4,
            Choke | Unchoke | Interested | NotInterested => 4 + 1,
            Have(_) => 4 + 1 + 4,
            Bitfield(b) => 4 + 1 + b.len().div_ceil(8),
            Request(_) | Cancel(_) => 4 + 1 + 12,
            Piece(b) => 4 + 1 + 8 + b.block.len(),
            Port(_) => 4 + 1 + 2,
        }
    }

    pub fn id(&self) -> Option<MessageId> {
        use Message::*;
        Some(match self {
            KeepAlive => return None,
            Choke => MessageId::Choke,
            Unchoke => MessageId::Unchoke,
            Interested => MessageId::Interested,
            NotInterested => MessageId::NotInterested,
            Have(_) => MessageId::Have,
            Bitfield(_) => MessageId::Bitfield,
            Request(_) => MessageId::Request,
            Piece(_) => MessageId::Piece,
            Cancel(_) => MessageId::Cancel,
            Port(_) => MessageId::Port,
        })
    }
}

/// Result of trying to decode one frame from the front of a buffer.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    /// A full message, and how many bytes of the buffer it used.
    Message { msg: Message, consumed: usize },
    /// A well formed frame with an ID we don't speak (extensions), it
    /// should be skipped.
    Skipped { id: u8, consumed: usize },
    /// The buffer does not hold a full frame yet.
    Incomplete,
}

/// Decode a single frame from the start of `buf` without mutating it.
///
/// This is a pure function over an accumulating buffer: call it again with
/// more bytes appended after it returns [`Decoded::Incomplete`].
pub fn decode(buf: &[u8], max_frame_len: usize) -> Result<Decoded, Error> {
    if buf.len() < 4 {
        return Ok(Decoded::Incomplete);
    }

    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if size > max_frame_len {
        return Err(Error::violation(format!(
            "frame of {size} bytes exceeds the maximum of {max_frame_len}"
        )));
    }

    if size == 0 {
        return Ok(Decoded::Message { msg: Message::KeepAlive, consumed: 4 });
    }

    if buf.len() < 4 + size {
        return Ok(Decoded::Incomplete);
    }

    let consumed = 4 + size;
    let id = buf[4];
    let mut payload = &buf[5..consumed];

    let Ok(id) = MessageId::try_from(id) else {
        return Ok(Decoded::Skipped { id, consumed });
    };

    let msg = match id {
        // <len=0001><id=0>
        MessageId::Choke => {
            expect_len(id, payload, 0)?;
            Message::Choke
        }
        // <len=0001><id=1>
        MessageId::Unchoke => {
            expect_len(id, payload, 0)?;
            Message::Unchoke
        }
        // <len=0001><id=2>
        MessageId::Interested => {
            expect_len(id, payload, 0)?;
            Message::Interested
        }
        // <len=0001><id=3>
        MessageId::NotInterested => {
            expect_len(id, payload, 0)?;
            Message::NotInterested
        }
        // <len=0005><id=4><piece index>
        MessageId::Have => {
            expect_len(id, payload, 4)?;
            Message::Have(payload.get_u32())
        }
        // <len=0001+X><id=5><bitfield>
        MessageId::Bitfield => {
            Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
        }
        // <len=0013><id=6><index><begin><length>
        MessageId::Request => {
            expect_len(id, payload, 12)?;
            Message::Request(read_block_info(&mut payload))
        }
        // <len=0009+X><id=7><index><begin><block>
        MessageId::Piece => {
            if payload.len() < 8 {
                return Err(Error::violation(format!(
                    "piece with payload of {} bytes",
                    payload.len()
                )));
            }
            let index = payload.get_u32();
            let begin = payload.get_u32();
            Message::Piece(Block { index, begin, block: payload.to_vec() })
        }
        // <len=0013><id=8><index><begin><length>
        MessageId::Cancel => {
            expect_len(id, payload, 12)?;
            Message::Cancel(read_block_info(&mut payload))
        }
        // <len=0003><id=9><listen-port>
        MessageId::Port => {
            expect_len(id, payload, 2)?;
            Message::Port(payload.get_u16())
        }
    };

    Ok(Decoded::Message { msg, consumed })
}

fn expect_len(
    id: MessageId,
    payload: &[u8],
    expected: usize,
) -> Result<(), Error> {
    if payload.len() != expected {
        return Err(Error::violation(format!(
            "{id:?} with payload of {} bytes, expected {expected}",
            payload.len()
        )));
    }
    Ok(())
}

fn read_block_info(payload: &mut &[u8]) -> BlockInfo {
    let index = payload.get_u32();
    let begin = payload.get_u32();
    let len = payload.get_u32();
    BlockInfo { index, begin, len }
}

/// Encode a message into a standalone frame.
pub fn encode(msg: &Message) -> BytesMut {
    let mut buf = BytesMut::with_capacity(msg.len());
    encode_into(msg, &mut buf);
    buf
}

fn encode_into(item: &Message, buf: &mut BytesMut) {
    buf.reserve(item.len());
    buf.put_u32((item.len() - 4) as u32);

    let Some(id) = item.id() else { return };
    buf.put_u8(id as u8);

    match item {
        Message::KeepAlive
        | Message::Choke
        | Message::Unchoke
        | Message::Interested
        | Message::NotInterested => {}
        Message::Have(piece) => buf.put_u32(*piece),
        Message::Bitfield(bitfield) => {
            // spare bits of the last byte must go out as zeroes
            let mut bitfield = bitfield.clone();
            bitfield.set_uninitialized(false);
            buf.extend_from_slice(bitfield.as_raw_slice());
        }
        Message::Request(info) | Message::Cancel(info) => info.encode(buf),
        Message::Piece(block) => block.encode(buf),
        Message::Port(port) => buf.put_u16(*port),
    }
}

/// Tokio codec of [`Message`] frames, rejecting frames whose declared length
/// is bigger than `max_frame_len`.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    pub max_frame_len: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self { max_frame_len: MAX_FRAME_LEN }
    }
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        encode_into(&item, buf);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match decode(buf, self.max_frame_len)? {
                Decoded::Message { msg, consumed } => {
                    buf.advance(consumed);
                    return Ok(Some(msg));
                }
                Decoded::Skipped { id, consumed } => {
                    warn!("unknown message_id {id}, skipping {consumed} bytes");
                    buf.advance(consumed);
                }
                Decoded::Incomplete => {
                    // if the frame is too large to fit the MTU it will be
                    // split into many packets, wait for all of them.
                    if buf.len() >= 4 {
                        let size = u32::from_be_bytes([
                            buf[0], buf[1], buf[2], buf[3],
                        ]) as usize;
                        buf.reserve((size + 4).saturating_sub(buf.len()));
                    }
                    return Ok(None);
                }
            }
        }
    }
}
