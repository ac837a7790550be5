//! Rank-to-rank communication.
//!
//! The engine talks to a fixed set of ranks through the [`Transport`] trait:
//! fire-and-forget point-to-point sends, a collective broadcast for the
//! sample matrix, a non-blocking progress pump and a final barrier. Any
//! transport error is fatal to the run; there are no retries.
//!
//! The in-tree implementation ([`local::LocalFabric`]) realizes ranks as OS
//! threads joined by channels. The trait boundary is deliberately narrow so a
//! process-level fabric can be substituted without touching the dispatch
//! logic.

pub mod local;

use crate::error::Result;
use crate::messages::{Message, RankId};

pub use local::{LocalEndpoint, LocalFabric};

/// Point of presence of one rank in the fabric.
pub trait Transport: Send {
    /// This rank's id. Rank 0 is the coordinator.
    fn rank_id(&self) -> RankId;

    /// Total number of ranks, coordinator included.
    fn rank_count(&self) -> usize;

    /// Fire-and-forget send. Completes locally without a matching receive;
    /// delivery is FIFO per (source, destination) pair.
    fn send(&self, to: RankId, message: Message) -> Result<()>;

    /// Collective broadcast rooted at `root`. The root passes the payload and
    /// gets it back unchanged; every other rank passes an empty slice and
    /// receives the root's payload. All ranks must arrive.
    fn broadcast(&self, root: RankId, payload: &[f64]) -> Result<Vec<f64>>;

    /// Non-blocking progress pump: drain and return every message already
    /// delivered to this rank.
    fn poll(&self) -> Result<Vec<Message>>;

    /// Block until the next message arrives.
    fn wait(&self) -> Result<Message>;

    /// Collective barrier over all ranks.
    fn barrier(&self) -> Result<()>;
}
