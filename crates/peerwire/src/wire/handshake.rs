//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! should be switched to [`super::MessageCodec`], but care should be taken
//! not to discard the underlying receive and send buffers.

use bytes::{Buf, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};

use super::PSTR;
use crate::{bitfield::Reserved, error::Error, peer::PeerId, torrent::InfoHash};

/// Size of a serialized handshake.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(handshake.pstr, PSTR);

        buf.extend_from_slice(&handshake.serialize()?);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at pstrlen without consuming, the rest of the handshake might
        // not be here yet.
        if buf[0] as usize != PSTR.len() {
            return Err(Error::HandshakeInvalid);
        }

        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let handshake = Handshake::deserialize(&buf[..HANDSHAKE_LEN])?;
        buf.advance(HANDSHAKE_LEN);

        if handshake.pstr != PSTR {
            return Err(Error::HandshakeInvalid);
        }

        Ok(Some(handshake))
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
///
/// This is the very first message exchanged. If the peer's protocol string
/// (`BitTorrent protocol`) or the info hash differs from ours, the connection
/// is severed. The reserved field advertises which extensions the peer
/// supports, see [`Reserved`]. The peer id is usually the client name and
/// version.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, reserved: Reserved) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: reserved.into(),
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    pub fn reserved(&self) -> Reserved {
        Reserved::from(self.reserved)
    }
}
