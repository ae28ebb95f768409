//! In-process process groups.
//!
//! [`LocalWorld`] wires up W ranks inside one process with a dedicated FIFO
//! channel per (sender, receiver) pair. Because every rank of a lockstep
//! SPMD program issues the same sequence of collective calls, per-pair FIFO
//! ordering is enough to match each send with its receive deterministically,
//! with no barriers and no message tagging. Intended for tests and
//! single-machine simulation; a multi-process deployment supplies its own
//! [`ProcessGroup`] over a real transport.

use std::sync::mpsc::{channel, Receiver, Sender};

use candle_core::Tensor;
use tracing::trace;

use crate::comm::ProcessGroup;
use crate::error::{Error, Result};

/// The trivial group for non-distributed runs: one rank, no communication.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn ring_exchange(&self, shard: &Tensor) -> Result<Tensor> {
        Ok(shard.clone())
    }

    fn all_gather(&self, x: &Tensor, dim: usize) -> Result<(Tensor, Vec<usize>)> {
        Ok((x.clone(), vec![x.dim(dim)?]))
    }
}

/// Builder for a set of channel-connected in-process ranks.
pub struct LocalWorld;

impl LocalWorld {
    /// Create `world_size` connected groups, one per rank, in rank order.
    ///
    /// Each group is meant to be moved into its own thread; the groups stay
    /// usable until any peer is dropped, after which collective calls fail
    /// with a transport error.
    pub fn create(world_size: usize) -> Vec<LocalProcessGroup> {
        assert!(world_size > 0, "world_size must be >= 1");

        // senders[src][dst] / receivers[dst][src]
        let mut senders: Vec<Vec<Sender<Tensor>>> = (0..world_size).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Receiver<Tensor>>> =
            (0..world_size).map(|_| Vec::new()).collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                let (tx, rx) = channel();
                senders[src].push(tx);
                receivers[dst].push(rx);
            }
        }

        // receivers were pushed in src order for each dst
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (to_peer, from_peer))| LocalProcessGroup {
                rank,
                world_size,
                to_peer,
                from_peer,
            })
            .collect()
    }
}

/// One rank of an in-process world. See [`LocalWorld::create`].
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
    to_peer: Vec<Sender<Tensor>>,
    from_peer: Vec<Receiver<Tensor>>,
}

impl LocalProcessGroup {
    fn send_to(&self, peer: usize, t: &Tensor) -> Result<()> {
        self.to_peer[peer]
            .send(t.clone())
            .map_err(|_| Error::Transport(format!("rank {peer} disconnected during send")))
    }

    fn recv_from(&self, peer: usize) -> Result<Tensor> {
        self.from_peer[peer]
            .recv()
            .map_err(|_| Error::Transport(format!("rank {peer} disconnected during recv")))
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn ring_exchange(&self, shard: &Tensor) -> Result<Tensor> {
        let next = (self.rank + 1) % self.world_size;
        let prev = (self.rank + self.world_size - 1) % self.world_size;

        trace!(rank = self.rank, next, prev, "ring exchange");

        // Channels are unbounded, so posting the send first cannot deadlock
        // even when next == prev == self (world size 1).
        self.send_to(next, shard)?;
        self.recv_from(prev)
    }

    fn all_gather(&self, x: &Tensor, dim: usize) -> Result<(Tensor, Vec<usize>)> {
        for peer in 0..self.world_size {
            self.send_to(peer, x)?;
        }

        let mut parts = Vec::with_capacity(self.world_size);
        let mut sizes = Vec::with_capacity(self.world_size);
        for peer in 0..self.world_size {
            let t = self.recv_from(peer)?;
            sizes.push(t.dim(dim)?);
            parts.push(t);
        }

        let gathered = Tensor::cat(&parts.iter().collect::<Vec<_>>(), dim)?;
        Ok((gathered, sizes))
    }
}
