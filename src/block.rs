use std::time::Instant;

/// Sub-unit of a piece; the granularity of transfer requests (spec §3).
pub const BLOCK_SIZE: u64 = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Free,
    /// A request has been sent; `last_seen` records when, so `sweep()` can
    /// demote it back to `Free` after the in-flight timeout.
    Pending,
    Full,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub size: u64,
    pub state: BlockState,
    pub data: Vec<u8>,
    pub last_seen: Option<Instant>,
}

impl Block {
    pub fn new(size: u64) -> Block {
        Block {
            size,
            state: BlockState::Free,
            data: Vec::new(),
            last_seen: None,
        }
    }

    pub fn mark_pending(&mut self, now: Instant) {
        self.state = BlockState::Pending;
        self.last_seen = Some(now);
    }

    pub fn mark_full(&mut self, data: Vec<u8>) {
        self.data = data;
        self.state = BlockState::Full;
    }

    pub fn reset(&mut self) {
        self.state = BlockState::Free;
        self.data.clear();
        self.last_seen = None;
    }

    pub fn is_pending_since_longer_than(&self, now: Instant, timeout: std::time::Duration) -> bool {
        matches!(self.state, BlockState::Pending)
            && self
                .last_seen
                .map(|seen| now.duration_since(seen) > timeout)
                .unwrap_or(false)
    }
}
