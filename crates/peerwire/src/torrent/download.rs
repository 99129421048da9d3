//! Which blocks of which pieces are pending, requested or stored.
use std::collections::{BTreeMap, VecDeque};

use hashbrown::{HashMap, HashSet};

use super::{picker::PiecePicker, TorrentMeta};
use crate::{
    bitfield::{Bitfield, BitfieldExt},
    peer::PeerId,
    wire::BlockInfo,
};

#[derive(Debug)]
struct PieceProgress {
    /// Not assigned to any peer.
    pending: VecDeque<BlockInfo>,
    /// `(index, begin) → peer`
    requested: HashMap<(u32, u32), (PeerId, BlockInfo)>,
    stored: HashSet<(u32, u32)>,
    total: usize,
}

/// Progress of the pieces being downloaded and how many peers have each
/// piece. Owned by the torrent, only the torrent task mutates it.
#[derive(Debug)]
pub struct Download {
    meta: TorrentMeta,
    availability: Vec<u32>,
    in_progress: BTreeMap<u32, PieceProgress>,
}

impl Download {
    pub fn new(meta: TorrentMeta) -> Self {
        Self {
            availability: vec![0; meta.piece_count as usize],
            in_progress: BTreeMap::new(),
            meta,
        }
    }

    pub fn availability(&self) -> &[u32] {
        &self.availability
    }

    pub fn is_in_progress(&self, index: u32) -> bool {
        self.in_progress.contains_key(&index)
    }

    pub fn add_availability(&mut self, pieces: &Bitfield) {
        for i in pieces.iter_ones() {
            if let Some(a) = self.availability.get_mut(i) {
                *a += 1;
            }
        }
    }

    pub fn remove_availability(&mut self, pieces: &Bitfield) {
        for i in pieces.iter_ones() {
            if let Some(a) = self.availability.get_mut(i) {
                *a = a.saturating_sub(1);
            }
        }
    }

    pub fn add_have(&mut self, index: u32) {
        if let Some(a) = self.availability.get_mut(index as usize) {
            *a += 1;
        }
    }

    /// Assign up to `qnt` blocks to `peer`. Pieces already in progress are
    /// finished first, then new pieces are chosen by `picker`.
    pub fn assign(
        &mut self,
        peer: &PeerId,
        peer_pieces: &Bitfield,
        local: &Bitfield,
        qnt: usize,
        picker: &mut dyn PiecePicker,
    ) -> Vec<BlockInfo> {
        let mut blocks = Vec::with_capacity(qnt);

        for (index, progress) in self.in_progress.iter_mut() {
            if blocks.len() >= qnt {
                return blocks;
            }
            if !peer_pieces.has(*index as usize) {
                continue;
            }
            Self::take_pending(progress, peer, qnt - blocks.len(), &mut blocks);
        }

        let mut candidates = peer_pieces.clone();
        for (i, mut bit) in candidates.iter_mut().enumerate() {
            if local.has(i) || self.in_progress.contains_key(&(i as u32)) {
                *bit = false;
            }
        }

        while blocks.len() < qnt {
            let Some(index) = picker.pick(&candidates, &self.availability) else {
                break;
            };
            candidates.set(index as usize, false);

            let infos = self.meta.block_infos(index);
            let progress = self.in_progress.entry(index).or_insert(PieceProgress {
                total: infos.len(),
                pending: infos.into(),
                requested: HashMap::new(),
                stored: HashSet::new(),
            });

            Self::take_pending(progress, peer, qnt - blocks.len(), &mut blocks);
        }

        blocks
    }

    fn take_pending(
        progress: &mut PieceProgress,
        peer: &PeerId,
        qnt: usize,
        out: &mut Vec<BlockInfo>,
    ) {
        for _ in 0..qnt {
            let Some(info) = progress.pending.pop_front() else { return };
            progress.requested.insert(info.key(), (peer.clone(), info));
            out.push(info);
        }
    }

    /// Blocks that `peer` will not deliver go back to the pending queue.
    pub fn release(&mut self, peer: &PeerId, blocks: &[BlockInfo]) {
        for info in blocks {
            let Some(progress) = self.in_progress.get_mut(&info.index) else {
                continue;
            };
            let owned = progress
                .requested
                .get(&info.key())
                .is_some_and(|(owner, _)| owner == peer);

            if owned {
                progress.requested.remove(&info.key());
                progress.pending.push_front(*info);
            }
        }
    }

    /// Release every block assigned to `peer`.
    pub fn release_peer(&mut self, peer: &PeerId) {
        for progress in self.in_progress.values_mut() {
            let keys: Vec<_> = progress
                .requested
                .iter()
                .filter(|(_, (owner, _))| owner == peer)
                .map(|(k, _)| *k)
                .collect();

            for key in keys {
                if let Some((_, info)) = progress.requested.remove(&key) {
                    progress.pending.push_front(info);
                }
            }
        }
    }

    /// Mark a block as stored, returning the piece if it was the last one.
    pub fn block_stored(&mut self, info: BlockInfo) -> Option<u32> {
        let progress = self.in_progress.get_mut(&info.index)?;

        progress.requested.remove(&info.key());
        progress.pending.retain(|v| v.key() != info.key());
        progress.stored.insert(info.key());

        if progress.stored.len() < progress.total {
            return None;
        }

        self.in_progress.remove(&info.index);
        Some(info.index)
    }

    /// Forget the progress of a piece that failed verification, it will be
    /// picked again. Returns the blocks of it that are still requested,
    /// with the peer they were requested from.
    pub fn piece_corrupt(&mut self, index: u32) -> Vec<(PeerId, BlockInfo)> {
        self.in_progress
            .remove(&index)
            .map(|p| p.requested.into_values().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        torrent::{picker::RarestFirst, InfoHash},
        wire::BLOCK_LEN,
    };
    use bitvec::{bitvec, prelude::Msb0};

    fn meta() -> TorrentMeta {
        // 4 pieces of 2 blocks, the last piece has 1 block
        TorrentMeta::new(InfoHash::default(), BLOCK_LEN * 2, BLOCK_LEN as u64 * 7).unwrap()
    }

    #[test]
    fn assign_finishes_pieces_in_progress_first() {
        let mut d = Download::new(meta());
        let a = PeerId([1; 20]);
        let b = PeerId([2; 20]);
        let all = bitvec![u8, Msb0; 1; 4];
        let local = bitvec![u8, Msb0; 0; 4];

        d.add_availability(&all);
        d.add_have(3);

        let blocks = d.assign(&a, &all, &local, 1, &mut RarestFirst);
        assert_eq!(blocks, vec![BlockInfo::new(0, 0, BLOCK_LEN)]);

        let blocks = d.assign(&b, &all, &local, 2, &mut RarestFirst);
        assert_eq!(
            blocks,
            vec![BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN), BlockInfo::new(1, 0, BLOCK_LEN)]
        );
        assert!(d.is_in_progress(1));
    }

    #[test]
    fn assign_skips_local_and_missing_pieces() {
        let mut d = Download::new(meta());
        let a = PeerId([1; 20]);
        let peer_pieces = bitvec![u8, Msb0; 1, 1, 0, 1];
        let local = bitvec![u8, Msb0; 1, 0, 0, 0];

        let blocks = d.assign(&a, &peer_pieces, &local, 10, &mut RarestFirst);
        assert_eq!(
            blocks,
            vec![
                BlockInfo::new(1, 0, BLOCK_LEN),
                BlockInfo::new(1, BLOCK_LEN, BLOCK_LEN),
                BlockInfo::new(3, 0, BLOCK_LEN),
            ]
        );
        assert!(d.assign(&a, &peer_pieces, &local, 10, &mut RarestFirst).is_empty());
    }

    #[test]
    fn released_blocks_are_assigned_again() {
        let mut d = Download::new(meta());
        let a = PeerId([1; 20]);
        let b = PeerId([2; 20]);
        let all = bitvec![u8, Msb0; 1; 4];
        let local = bitvec![u8, Msb0; 1, 1, 1, 0];

        let blocks = d.assign(&a, &all, &local, 10, &mut RarestFirst);
        assert_eq!(blocks, vec![BlockInfo::new(3, 0, BLOCK_LEN)]);

        // b can't take back what a owns
        d.release(&b, &blocks);
        assert!(d.assign(&b, &all, &local, 10, &mut RarestFirst).is_empty());

        d.release(&a, &blocks);
        assert_eq!(d.assign(&b, &all, &local, 10, &mut RarestFirst), blocks);

        d.release_peer(&b);
        assert_eq!(d.assign(&a, &all, &local, 10, &mut RarestFirst), blocks);
    }

    #[test]
    fn piece_completes_when_all_blocks_are_stored() {
        let mut d = Download::new(meta());
        let a = PeerId([1; 20]);
        let all = bitvec![u8, Msb0; 1; 4];
        let local = bitvec![u8, Msb0; 0, 1, 1, 1];

        let blocks = d.assign(&a, &all, &local, 10, &mut RarestFirst);
        assert_eq!(blocks.len(), 2);

        assert_eq!(d.block_stored(blocks[1]), None);
        assert_eq!(d.block_stored(blocks[0]), Some(0));
        assert!(!d.is_in_progress(0));
        // late duplicates are ignored
        assert_eq!(d.block_stored(blocks[0]), None);
    }

    #[test]
    fn corrupt_piece_starts_over() {
        let mut d = Download::new(meta());
        let a = PeerId([1; 20]);
        let all = bitvec![u8, Msb0; 1; 4];
        let local = bitvec![u8, Msb0; 0, 1, 1, 1];

        let blocks = d.assign(&a, &all, &local, 10, &mut RarestFirst);
        d.block_stored(blocks[0]);

        let cancelled = d.piece_corrupt(0);
        assert_eq!(cancelled, vec![(a.clone(), blocks[1])]);
        assert!(!d.is_in_progress(0));

        assert_eq!(d.assign(&a, &all, &local, 10, &mut RarestFirst), blocks);
    }

    #[test]
    fn availability_counts() {
        let mut d = Download::new(meta());
        let pieces = bitvec![u8, Msb0; 1, 0, 1, 0];
        d.add_availability(&pieces);
        d.add_availability(&pieces);
        d.add_have(1);
        assert_eq!(d.availability(), &[2, 1, 2, 0]);

        d.remove_availability(&pieces);
        d.remove_availability(&pieces);
        d.remove_availability(&pieces);
        assert_eq!(d.availability(), &[0, 1, 0, 0]);
    }
}
