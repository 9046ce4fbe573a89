// Distributed k-mer counting: wires the loader, the codec, and the
// communication layer together.
//
// Each in-process rank partitions the input FASTA, streams DNA k-mers
// from its chunks with a pool of producer threads, and routes every
// window's 64-bit prefix to the owning rank, where a callback tallies
// arrivals in a concurrent map.

use std::hash::BuildHasherDefault;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;
use rustc_hash::FxHasher;
use seq_io::fasta::Reader as FastaReader;

use crate::alphabet::DNA;
use crate::comm::{CommConfig, CommHandle, CommLayer};
use crate::kmer::Kmer;
use crate::loader::{fasta_boundary, FileLoader};
use crate::transport::{local_fabric, LocalFabric, Tag};

const KMER_TAG: Tag = 1;
const CHUNK_BYTES: usize = 1 << 20;

type CountMap = DashMap<u64, u64, BuildHasherDefault<FxHasher>>;

#[derive(Debug)]
pub struct RankSummary {
    pub rank: usize,
    pub kmers_sent: u64,
    pub kmers_received: u64,
    pub distinct: usize,
}

/// Split a k-mer prefix across ranks.
#[inline]
fn owner_of(key: u64, ranks: usize) -> usize {
    (mix64(key) % ranks as u64) as usize
}

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Run the pipeline over `ranks` in-process ranks with `threads`
/// producer threads each.
pub fn run(
    input: &Path,
    k: usize,
    ranks: usize,
    threads: usize,
    config: CommConfig,
) -> Result<Vec<RankSummary>> {
    let endpoints = local_fabric(ranks);
    std::thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .enumerate()
            .map(|(rank, endpoint)| {
                scope.spawn(move || run_rank(input, k, rank, ranks, threads, endpoint, config))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

fn run_rank(
    input: &Path,
    k: usize,
    rank: usize,
    ranks: usize,
    threads: usize,
    endpoint: LocalFabric,
    config: CommConfig,
) -> Result<RankSummary> {
    let mut loader = FileLoader::open(input)?;
    let raw = loader.file_range().block_partition(ranks as u64, rank as u64);
    loader.set_range(raw);
    loader.adjust_range(fasta_boundary);
    log::debug!(
        "rank {}: raw partition {:?}, adjusted {:?}",
        rank,
        raw,
        loader.range()
    );

    let mut layer = CommLayer::new(Arc::new(endpoint), config);
    let counts: Arc<CountMap> = Arc::new(CountMap::default());
    let received = Arc::new(AtomicU64::new(0));
    {
        let counts = Arc::clone(&counts);
        let received = Arc::clone(&received);
        layer.add_receive_callback(KMER_TAG, move |payload, _src| {
            for chunk in payload.chunks_exact(8) {
                let key = u64::from_le_bytes(chunk.try_into().unwrap());
                *counts.entry(key).or_insert(0) += 1;
            }
            received.fetch_add(payload.len() as u64 / 8, Ordering::Relaxed);
        })?;
    }
    layer.init_communication()?;

    let handle = layer.handle();
    let sent = AtomicU64::new(0);
    // Producers record the first failure instead of unwinding; the rank
    // surfaces it once the pool has drained.
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("build producer thread pool")?;
    pool.scope(|scope| {
        let loader = &loader;
        let sent = &sent;
        let first_error = &first_error;
        for _ in 0..threads {
            let handle = handle.clone();
            scope.spawn(move |_| {
                let mut produced = 0u64;
                while let Some((chunk, _)) = loader.next_chunk_atomic(&fasta_boundary, CHUNK_BYTES)
                {
                    match stream_chunk(chunk, k, ranks, &handle) {
                        Ok(n) => produced += n,
                        Err(e) => {
                            let mut slot = first_error.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            return;
                        }
                    }
                }
                sent.fetch_add(produced, Ordering::Relaxed);
            });
        }
    });
    if let Some(e) = first_error.lock().take() {
        return Err(e);
    }

    layer.flush(KMER_TAG)?;
    layer.finish(KMER_TAG)?;
    layer.finish_communication()?;

    Ok(RankSummary {
        rank,
        kmers_sent: sent.load(Ordering::Relaxed),
        kmers_received: received.load(Ordering::Relaxed),
        distinct: counts.len(),
    })
}

/// Parse the FASTA records of one chunk and route every k-mer prefix.
/// Unknown bases keep the historical silent-zero mapping, so windows
/// never reset mid-record.
fn stream_chunk(chunk: &[u8], k: usize, ranks: usize, handle: &CommHandle) -> Result<u64> {
    let mut reader = FastaReader::new(chunk);
    let mut produced = 0u64;
    while let Some(record) = reader.next() {
        let record = record.context("parse FASTA record")?;
        let mut window: Kmer<u64> = Kmer::new(k, DNA.bits_per_symbol);
        let mut have = 0usize;
        for line in record.seq_lines() {
            for &b in line {
                window.push_symbol(DNA.code(b));
                have += 1;
                if have >= k {
                    let key = window.prefix64();
                    handle
                        .send_message(&key.to_le_bytes(), owner_of(key, ranks), KMER_TAG)
                        .context("route k-mer")?;
                    produced += 1;
                }
            }
        }
    }
    Ok(produced)
}
