use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
    time::Duration,
};

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::{
    error::Error,
    wire::{Block, BlockInfo},
};

type Key = (u32, u32);

#[derive(Debug, Clone)]
struct Pending {
    info: BlockInfo,
    deadline: Instant,
    retries: u32,
}

/// What to do with a request that timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOut {
    /// Cancel and send the same request again, it is still outstanding.
    Retry(BlockInfo),
    /// Cancel, it was removed from the pipeline and should be requested
    /// from another peer.
    Abandon(BlockInfo),
}

/// Outstanding block requests to one peer.
///
/// Requests are keyed by `(index, begin)`, a key can only be requested once.
#[derive(Debug)]
pub struct RequestPipeline {
    max_depth: usize,
    timeout: Duration,
    max_retries: u32,
    /// Min-heap of deadlines, entries are lazily removed when their request
    /// is gone or was rescheduled.
    timeouts: BinaryHeap<(Reverse<Instant>, Key)>,
    /// `piece → begins`
    requests: BTreeMap<u32, BTreeSet<u32>>,
    index: HashMap<Key, Pending>,
    timed_out_count: u32,
}

impl RequestPipeline {
    pub fn new(max_depth: usize, timeout: Duration, max_retries: u32) -> Self {
        Self {
            max_depth,
            timeout,
            max_retries,
            timeouts: BinaryHeap::new(),
            requests: BTreeMap::new(),
            index: HashMap::new(),
            timed_out_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// How many requests can be added before the pipeline is full.
    pub fn available_slots(&self) -> usize {
        self.max_depth.saturating_sub(self.index.len())
    }

    pub fn contains(&self, key: Key) -> bool {
        self.index.contains_key(&key)
    }

    /// Times a request of this peer expired, counts toward its misbehavior.
    pub fn timed_out_count(&self) -> u32 {
        self.timed_out_count
    }

    /// Add a request, returning `false` if it was already outstanding.
    ///
    /// Fails with [`Error::PipelineFull`] without touching the pipeline if
    /// it already holds `max_depth` requests.
    pub fn request_block(
        &mut self,
        info: BlockInfo,
        now: Instant,
    ) -> Result<bool, Error> {
        if !info.is_valid_len() {
            return Err(Error::InvalidBlock(info));
        }
        if self.index.len() >= self.max_depth {
            return Err(Error::PipelineFull);
        }
        if self.index.contains_key(&info.key()) {
            return Ok(false);
        }

        let deadline = now + self.timeout;
        self.index.insert(info.key(), Pending { info, deadline, retries: 0 });
        self.requests.entry(info.index).or_default().insert(info.begin);
        self.timeouts.push((Reverse(deadline), info.key()));

        Ok(true)
    }

    fn remove(&mut self, key: Key) -> Option<Pending> {
        let pending = self.index.remove(&key)?;

        if let Some(begins) = self.requests.get_mut(&key.0) {
            begins.remove(&key.1);
            if begins.is_empty() {
                self.requests.remove(&key.0);
            }
        }
        if self.index.is_empty() {
            self.timeouts.clear();
        }

        Some(pending)
    }

    /// Remove a request, returning it if it was outstanding and a cancel
    /// should go out.
    pub fn cancel(&mut self, key: Key) -> Option<BlockInfo> {
        self.remove(key).map(|p| p.info)
    }

    /// Match a received block against the outstanding requests. Returns
    /// `None` for blocks that were never requested, or that differ in
    /// length from what was requested.
    pub fn on_block_received(&mut self, block: &Block) -> Option<BlockInfo> {
        let key = (block.index, block.begin);
        let pending = self.index.get(&key)?;

        if pending.info.len as usize != block.block.len() {
            return None;
        }

        self.remove(key).map(|p| p.info)
    }

    /// Collect requests whose deadline passed. Nothing times out while the
    /// peer keeps sending data, only a connection that was idle for a full
    /// timeout since `last_data` is considered stuck.
    pub fn take_timed_out(
        &mut self,
        now: Instant,
        last_data: Instant,
    ) -> Vec<TimedOut> {
        let mut out = Vec::new();

        if now.saturating_duration_since(last_data) < self.timeout {
            return out;
        }

        while let Some((Reverse(deadline), key)) = self.timeouts.peek().copied() {
            if deadline > now {
                break;
            }
            self.timeouts.pop();

            let Some(pending) = self.index.get_mut(&key) else { continue };
            if pending.deadline != deadline {
                continue;
            }

            self.timed_out_count += 1;

            if pending.retries < self.max_retries {
                pending.retries += 1;
                pending.deadline = now + self.timeout;
                let info = pending.info;
                self.timeouts.push((Reverse(now + self.timeout), key));
                out.push(TimedOut::Retry(info));
            } else if let Some(pending) = self.remove(key) {
                out.push(TimedOut::Abandon(pending.info));
            }
        }

        out
    }

    /// Remove every request, ordered by piece and offset.
    pub fn drain(&mut self) -> Vec<BlockInfo> {
        let requests = std::mem::take(&mut self.requests);
        let blocks = requests
            .into_iter()
            .flat_map(|(index, begins)| {
                begins.into_iter().map(move |begin| (index, begin))
            })
            .filter_map(|key| self.index.get(&key).map(|p| p.info))
            .collect();

        self.index.clear();
        self.timeouts.clear();
        blocks
    }
}
