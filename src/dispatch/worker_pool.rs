//! Coordinator-side bookkeeping of idle and busy workers.

use crate::error::{EngineError, Result};
use crate::messages::RankId;
use std::collections::VecDeque;

/// Fair FIFO queue of idle worker ranks.
///
/// A worker that just returned goes to the back of the queue, so long-running
/// evaluations do not starve the rest of the pool. At all times the number of
/// idle plus busy workers equals the pool size.
///
/// Blocking check-out lives in the dispatcher, which pumps transport progress
/// while the queue is empty; the pool itself is plain bookkeeping so that
/// completion handling can call [`WorkerPool::check_in`] without re-entering
/// the dispatch loop.
#[derive(Debug)]
pub struct WorkerPool {
    idle: VecDeque<RankId>,
    size: usize,
}

impl WorkerPool {
    /// Build the pool over a fabric of `rank_count` ranks. Rank 0 joins only
    /// when `include_coordinator` is set.
    pub fn new(rank_count: usize, include_coordinator: bool) -> Self {
        let first = if include_coordinator { 0 } else { 1 };
        let idle: VecDeque<RankId> = (first..rank_count).collect();
        let size = idle.len();
        Self { idle, size }
    }

    /// Number of pool members, idle or busy.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of currently idle workers.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Number of currently busy workers.
    pub fn busy_count(&self) -> usize {
        self.size - self.idle.len()
    }

    /// Take the head of the idle queue, if any.
    pub fn try_check_out(&mut self) -> Option<RankId> {
        self.idle.pop_front()
    }

    /// Return a worker to the tail of the idle queue. Checking in a worker
    /// that is already idle is a protocol violation.
    pub fn check_in(&mut self, rank: RankId) -> Result<()> {
        if self.idle.contains(&rank) {
            return Err(EngineError::transport(format!(
                "worker {} checked in twice",
                rank
            )));
        }
        if self.idle.len() == self.size {
            return Err(EngineError::transport(format!(
                "worker {} checked in but the pool is full",
                rank
            )));
        }
        self.idle.push_back(rank);
        Ok(())
    }
}
