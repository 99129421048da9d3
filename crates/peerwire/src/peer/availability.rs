use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
};

/// The pieces that a remote peer has, as far as it told us.
///
/// A bitfield may only be received once and before any `have`, after that
/// the set only grows.
#[derive(Debug, Clone)]
pub struct PieceAvailability {
    pieces: Bitfield,
    /// Received a bitfield or a have.
    received_any: bool,
}

impl PieceAvailability {
    pub fn new(piece_count: usize) -> Self {
        Self { pieces: Bitfield::from_piece(piece_count), received_any: false }
    }

    /// Replace the known set with the raw bitfield from the wire.
    pub fn on_bitfield(&mut self, bitfield: Bitfield) -> Result<(), Error> {
        if self.received_any {
            return Err(Error::violation("bitfield after have or bitfield"));
        }

        let piece_count = self.pieces.len();
        let expected_bytes = piece_count.div_ceil(8);

        if bitfield.len() != expected_bytes * 8 {
            return Err(Error::violation(format!(
                "bitfield of {} bytes, expected {expected_bytes}",
                bitfield.len().div_ceil(8)
            )));
        }

        if bitfield[piece_count..].any() {
            return Err(Error::violation("bitfield has spare bits set"));
        }

        let mut bitfield = bitfield;
        bitfield.truncate(piece_count);

        self.pieces = bitfield;
        self.received_any = true;
        Ok(())
    }

    /// Set one piece, returning `true` if it was not known before.
    pub fn on_have(&mut self, index: u32) -> Result<bool, Error> {
        let index = index as usize;
        if index >= self.pieces.len() {
            return Err(Error::violation(format!(
                "have {index} out of {} pieces",
                self.pieces.len()
            )));
        }

        self.received_any = true;
        let had = self.pieces.has(index);
        self.pieces.set(index, true);
        Ok(!had)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces.has(index as usize)
    }

    pub fn pieces(&self) -> &Bitfield {
        &self.pieces
    }

    /// If the peer has at least one piece that `local` lacks.
    pub fn is_interesting(&self, local: &Bitfield) -> bool {
        self.pieces.has_any_missing_from(local)
    }
}
