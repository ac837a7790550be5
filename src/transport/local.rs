//! In-process fabric: ranks as threads, channels as wires.

use crate::error::{EngineError, Result};
use crate::messages::{Message, RankId};
use crate::transport::Transport;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Barrier};

/// Builder for an in-process fabric of `rank_count` endpoints.
///
/// Endpoint 0 belongs to the coordinator; the rest are handed to worker
/// threads. Every endpoint owns its inbox plus senders to all peers, so a
/// send never blocks on the receiver.
pub struct LocalFabric;

impl LocalFabric {
    /// Create the endpoints of a fabric. The returned vector is indexed by
    /// rank.
    pub fn create(rank_count: usize) -> Vec<LocalEndpoint> {
        assert!(rank_count > 0, "a fabric needs at least one rank");

        let mut inbox_txs = Vec::with_capacity(rank_count);
        let mut inbox_rxs = Vec::with_capacity(rank_count);
        let mut bcast_txs = Vec::with_capacity(rank_count);
        let mut bcast_rxs = Vec::with_capacity(rank_count);
        for _ in 0..rank_count {
            let (tx, rx) = unbounded::<Message>();
            inbox_txs.push(tx);
            inbox_rxs.push(rx);
            let (tx, rx) = unbounded::<Vec<f64>>();
            bcast_txs.push(tx);
            bcast_rxs.push(rx);
        }

        let barrier = Arc::new(Barrier::new(rank_count));

        inbox_rxs
            .into_iter()
            .zip(bcast_rxs)
            .enumerate()
            .map(|(rank, (inbox, bcast_inbox))| LocalEndpoint {
                rank,
                peers: inbox_txs.clone(),
                inbox,
                bcast_peers: bcast_txs.clone(),
                bcast_inbox,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

/// One rank's endpoint in a [`LocalFabric`].
pub struct LocalEndpoint {
    rank: RankId,
    peers: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    bcast_peers: Vec<Sender<Vec<f64>>>,
    bcast_inbox: Receiver<Vec<f64>>,
    barrier: Arc<Barrier>,
}

impl Transport for LocalEndpoint {
    fn rank_id(&self) -> RankId {
        self.rank
    }

    fn rank_count(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: RankId, message: Message) -> Result<()> {
        let peer = self
            .peers
            .get(to)
            .ok_or_else(|| EngineError::transport(format!("no such rank: {}", to)))?;
        peer.send(message)
            .map_err(|_| EngineError::transport(format!("rank {} is gone", to)))
    }

    fn broadcast(&self, root: RankId, payload: &[f64]) -> Result<Vec<f64>> {
        if self.rank == root {
            for (rank, peer) in self.bcast_peers.iter().enumerate() {
                if rank != root {
                    peer.send(payload.to_vec()).map_err(|_| {
                        EngineError::transport(format!("rank {} left the broadcast", rank))
                    })?;
                }
            }
            Ok(payload.to_vec())
        } else {
            self.bcast_inbox
                .recv()
                .map_err(|_| EngineError::transport("broadcast root is gone"))
        }
    }

    fn poll(&self) -> Result<Vec<Message>> {
        Ok(self.inbox.try_iter().collect())
    }

    fn wait(&self) -> Result<Message> {
        self.inbox
            .recv()
            .map_err(|_| EngineError::transport("all peers are gone"))
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }
}
