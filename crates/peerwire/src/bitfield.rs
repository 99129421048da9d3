//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

/// Capability flags of a peer, taken from the 8 reserved bytes of the
/// handshake.
#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl From<Reserved> for [u8; 8] {
    fn from(value: Reserved) -> Self {
        value.0.into_inner()
    }
}

impl Reserved {
    /// BEP 10, extension protocol.
    pub const EXTENDED: usize = 43;
    /// BEP 6, fast extension.
    pub const FAST: usize = 61;
    /// BEP 5, the peer runs a DHT node and may send `port`.
    pub const DHT: usize = 63;

    /// Reserved bits of protocols that the local client advertises.
    pub fn supported(dht: bool) -> Reserved {
        let mut r = Reserved::default();
        r.0.set(Self::DHT, dht);
        r
    }

    pub fn supports_extended(&self) -> bool {
        self.0[Self::EXTENDED]
    }

    pub fn supports_fast(&self) -> bool {
        self.0[Self::FAST]
    }

    pub fn supports_dht(&self) -> bool {
        self.0[Self::DHT]
    }
}

pub trait BitfieldExt {
    /// An empty bitfield with one bit per piece.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Bitfield from raw wire bytes, cut to `len` bits.
    fn new_and_resize(vec: Vec<u8>, len: usize) -> Bitfield {
        let mut s = Bitfield::from_vec(vec);
        s.resize(len, false);
        s
    }

    /// Out of range indexes read as `false`.
    fn has(&self, index: usize) -> bool;

    /// If `self` has at least one piece that `other` lacks.
    fn has_any_missing_from(&self, other: &Bitfield) -> bool;
}

impl BitfieldExt for Bitfield {
    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn has_any_missing_from(&self, other: &Bitfield) -> bool {
        self.iter_ones().any(|i| !other.has(i))
    }
}
