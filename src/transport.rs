//! Point-to-point transport under the communication layer.
//!
//! The layer is written against the [`Transport`] trait: reliable
//! delivery, FIFO order per (source, destination) pair, and a collective
//! barrier. Transport failures are fatal by contract — implementations
//! panic rather than surface retryable errors.
//!
//! [`LocalFabric`] is the in-tree implementation: N ranks as threads of
//! one process, wired by channels. A rank-per-process binding (e.g. over
//! MPI) slots in behind the same trait without touching the layer.

use std::sync::{Arc, Barrier};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Application-chosen message stream identifier. Tag 0 is reserved for
/// the layer's control traffic.
pub type Tag = u32;

/// Wire frames. `Data` is the user envelope (tag + opaque payload);
/// `Token` is the zero-payload end-of-epoch control frame, kept disjoint
/// from the user tag space by construction; `Shutdown` is the local
/// poison a rank sends itself to stop its receive worker.
#[derive(Debug)]
pub enum Frame {
    Data {
        tag: Tag,
        src: usize,
        payload: Vec<u8>,
    },
    Token {
        tag: Tag,
        src: usize,
        epoch: u64,
    },
    Shutdown,
}

pub trait Transport: Send + Sync + 'static {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Deliver `frame` to `dst`. Reliable and FIFO per (self, dst) when
    /// called from a single thread, which is how the layer uses it.
    fn send(&self, dst: usize, frame: Frame);

    /// Block until the next incoming frame.
    fn recv(&self) -> Frame;

    /// Collective barrier over all ranks.
    fn barrier(&self);
}

/// In-process rank fabric: each rank owns an inbox and senders to every
/// peer (itself included).
pub struct LocalFabric {
    rank: usize,
    peers: Vec<Sender<Frame>>,
    inbox: Receiver<Frame>,
    barrier: Arc<Barrier>,
}

/// Build a fabric of `ranks` endpoints; hand one to each rank thread.
pub fn local_fabric(ranks: usize) -> Vec<LocalFabric> {
    assert!(ranks >= 1, "need at least one rank");
    let barrier = Arc::new(Barrier::new(ranks));
    let (txs, rxs): (Vec<_>, Vec<_>) = (0..ranks).map(|_| unbounded()).unzip();
    rxs.into_iter()
        .enumerate()
        .map(|(rank, inbox)| LocalFabric {
            rank,
            peers: txs.clone(),
            inbox,
            barrier: Arc::clone(&barrier),
        })
        .collect()
}

impl Transport for LocalFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dst: usize, frame: Frame) {
        self.peers[dst]
            .send(frame)
            .unwrap_or_else(|_| panic!("rank {} inbox closed", dst));
    }

    fn recv(&self) -> Frame {
        self.inbox.recv().expect("fabric closed while receiving")
    }

    fn barrier(&self) {
        self.barrier.wait();
    }
}
