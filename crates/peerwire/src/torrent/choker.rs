//! Who we upload to.
use hashbrown::HashSet;
use rand::seq::SliceRandom;

use crate::peer::{PeerId, PeerSnapshot};

/// Optimistic unchokes last this many rounds.
const OPTIMISTIC_ROUNDS: u32 = 3;

/// Decides which peers are unchoked, run by the torrent every unchoke
/// interval.
pub trait ChokePolicy: Send {
    /// The peers that must be unchoked until the next round, every other
    /// peer is choked.
    fn unchoke(&mut self, peers: &[PeerSnapshot], seeding: bool) -> HashSet<PeerId>;

    /// How many peers may be unchoked at the same time, not counting the
    /// optimistic one.
    fn slots(&self) -> usize;
}

/// Tit-for-tat: the interested peers that give us the most are unchoked,
/// plus one random interested peer that gets a chance to prove itself.
///
/// While seeding there is nothing to get back, so peers are ranked by how
/// fast we upload to them instead.
#[derive(Debug)]
pub struct UploadSlots {
    slots: usize,
    optimistic: Option<PeerId>,
    round: u32,
}

impl UploadSlots {
    pub fn new(slots: usize) -> Self {
        Self { slots, optimistic: None, round: 0 }
    }

    pub fn optimistic(&self) -> Option<&PeerId> {
        self.optimistic.as_ref()
    }
}

impl ChokePolicy for UploadSlots {
    fn unchoke(&mut self, peers: &[PeerSnapshot], seeding: bool) -> HashSet<PeerId> {
        // a seeder has nothing to download from us, whatever it claims.
        let mut interested: Vec<&PeerSnapshot> = peers
            .iter()
            .filter(|p| p.peer_interested && !p.is_seeder())
            .collect();

        interested.sort_by(|a, b| {
            let rate = |p: &PeerSnapshot| {
                if seeding {
                    p.upload_rate
                } else {
                    p.download_rate
                }
            };
            rate(b).cmp(&rate(a))
        });

        let mut unchoked: HashSet<PeerId> =
            interested.iter().take(self.slots).map(|p| p.id.clone()).collect();

        let rest: Vec<&PeerId> = interested
            .iter()
            .skip(self.slots)
            .map(|p| &p.id)
            .collect();

        // keep the current optimistic peer for a few rounds if it's still
        // around and interested.
        let keep = self.round % OPTIMISTIC_ROUNDS != 0
            && self.optimistic.as_ref().is_some_and(|id| rest.contains(&id));

        if !keep {
            self.optimistic =
                rest.choose(&mut rand::thread_rng()).map(|id| (*id).clone());
        }

        if let Some(id) = &self.optimistic {
            unchoked.insert(id.clone());
        }

        self.round = self.round.wrapping_add(1);
        unchoked
    }

    fn slots(&self) -> usize {
        self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::{Bitfield, BitfieldExt};

    fn snapshot(id: u8, interested: bool, download_rate: u64, upload_rate: u64) -> PeerSnapshot {
        PeerSnapshot {
            id: PeerId([id; 20]),
            addr: format!("127.0.0.1:{}", 6000 + id as u16).parse().unwrap(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: interested,
            pieces: Bitfield::from_piece(4),
            outstanding_requests: 0,
            download_rate,
            upload_rate,
            downloaded: 0,
            uploaded: 0,
            misbehavior: 0,
        }
    }

    #[test]
    fn best_downloaders_are_unchoked() {
        let mut choker = UploadSlots::new(2);
        let peers = vec![
            snapshot(1, true, 100, 0),
            snapshot(2, true, 300, 0),
            snapshot(3, false, 900, 0),
            snapshot(4, true, 200, 0),
        ];

        let unchoked = choker.unchoke(&peers, false);

        assert!(unchoked.contains(&PeerId([2; 20])));
        assert!(unchoked.contains(&PeerId([4; 20])));
        assert!(!unchoked.contains(&PeerId([3; 20])));
        // peer 1 is the only candidate for the optimistic slot
        assert_eq!(choker.optimistic(), Some(&PeerId([1; 20])));
        assert_eq!(unchoked.len(), 3);
    }

    #[test]
    fn seeding_ranks_by_upload() {
        let mut choker = UploadSlots::new(1);
        let peers = vec![snapshot(1, true, 500, 10), snapshot(2, true, 0, 20)];

        let unchoked = choker.unchoke(&peers, true);
        assert!(unchoked.contains(&PeerId([2; 20])));
        assert_eq!(choker.optimistic(), Some(&PeerId([1; 20])));
    }

    #[test]
    fn optimistic_peer_rotates() {
        let mut choker = UploadSlots::new(0);
        let peers: Vec<_> = (1..=8).map(|i| snapshot(i, true, 0, 0)).collect();

        choker.unchoke(&peers, false);
        let first = choker.optimistic().cloned();
        assert!(first.is_some());

        for _ in 1..OPTIMISTIC_ROUNDS {
            let unchoked = choker.unchoke(&peers, false);
            assert_eq!(choker.optimistic().cloned(), first);
            assert_eq!(unchoked.len(), 1);
        }

        // a peer that lost interest loses the slot right away
        let peers: Vec<_> = peers
            .into_iter()
            .filter(|p| Some(&p.id) != first.as_ref())
            .collect();
        choker.unchoke(&peers, false);
        assert_ne!(choker.optimistic().cloned(), first);
    }

    #[test]
    fn seeders_are_never_unchoked() {
        let mut choker = UploadSlots::new(4);
        let mut seeder = snapshot(1, true, 900, 900);
        seeder.pieces = Bitfield::repeat(true, 4);
        let peers = vec![seeder, snapshot(2, true, 0, 0)];

        let unchoked = choker.unchoke(&peers, false);
        assert_eq!(unchoked.len(), 1);
        assert!(unchoked.contains(&PeerId([2; 20])));
        assert_eq!(choker.optimistic(), None);
    }

    #[test]
    fn nobody_interested() {
        let mut choker = UploadSlots::new(4);
        let peers = vec![snapshot(1, false, 100, 100)];
        assert!(choker.unchoke(&peers, false).is_empty());
        assert_eq!(choker.optimistic(), None);
    }
}
