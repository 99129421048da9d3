//! Piece selection.
use crate::bitfield::Bitfield;

/// Decides which piece to download next.
pub trait PiecePicker: Send {
    /// Pick one of `candidates`, pieces that the peer has and that are
    /// neither downloaded nor being downloaded. `availability[i]` is how
    /// many connected peers have piece `i`.
    fn pick(&mut self, candidates: &Bitfield, availability: &[u32]) -> Option<u32>;
}

/// Picks the piece that the fewest peers have, the lowest index on ties.
#[derive(Debug, Default, Clone, Copy)]
pub struct RarestFirst;

impl PiecePicker for RarestFirst {
    fn pick(&mut self, candidates: &Bitfield, availability: &[u32]) -> Option<u32> {
        candidates
            .iter_ones()
            .min_by_key(|i| (availability.get(*i).copied().unwrap_or(0), *i))
            .map(|i| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::{bitvec, prelude::Msb0};

    #[test]
    fn rarest_first() {
        let mut picker = RarestFirst;
        let availability = [3, 1, 2, 1, 5];

        let candidates = bitvec![u8, Msb0; 1, 0, 1, 1, 1];
        assert_eq!(picker.pick(&candidates, &availability), Some(3));

        let candidates = bitvec![u8, Msb0; 1, 1, 1, 1, 1];
        assert_eq!(picker.pick(&candidates, &availability), Some(1));

        let candidates = bitvec![u8, Msb0; 0; 5];
        assert_eq!(picker.pick(&candidates, &availability), None);
    }
}
