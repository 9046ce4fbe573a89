//! Core of a distributed k-mer toolkit: a packed k-mer codec generic
//! over storage and stream word widths, a file-range partitioner with
//! atomic chunking, and a tag-scoped message-passing layer with
//! collective flush/finish semantics.

use clap::Parser;

pub mod alphabet;
pub mod buffer;
pub mod comm;
pub mod kmer;
pub mod loader;
pub mod pipeline;
pub mod range;
pub mod transport;
pub mod word;

use comm::CommConfig;

/// Count DNA k-mers from a FASTA file, distributed over in-process
/// ranks through the communication layer.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Input FASTA file
    #[arg(short, long)]
    pub input: std::path::PathBuf,

    /// K-mer length on the DNA alphabet [k=21]
    #[arg(short, long)]
    pub k: Option<usize>,

    /// Number of in-process ranks [r=4]
    #[arg(short, long)]
    pub ranks: Option<usize>,

    /// Producer threads per rank [t=1]
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Accumulation buffer capacity in bytes
    #[arg(long, default_value_t = 8192)]
    pub buffer_capacity: usize,
}

pub fn run_with_args(args: Args) -> anyhow::Result<()> {
    let default_k = 21usize;
    let max_k = 31usize;

    let k = args.k.unwrap_or(default_k);
    anyhow::ensure!(
        (1..=max_k).contains(&k),
        "k={} is invalid: allowed range is 1..={} (default {})",
        k,
        max_k,
        default_k
    );

    let ranks = args.ranks.unwrap_or(4);
    anyhow::ensure!(ranks >= 1, "ranks must be ≥ 1");

    let threads = args.threads.unwrap_or(1);
    anyhow::ensure!(threads >= 1, "threads must be ≥ 1");

    anyhow::ensure!(
        args.buffer_capacity >= 16,
        "buffer_capacity ({}) must be ≥ 16 bytes",
        args.buffer_capacity
    );

    eprintln!("kgrid v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "parameters: k={} ranks={} threads={} buffer_capacity={} input={}",
        k,
        ranks,
        threads,
        args.buffer_capacity,
        args.input.display()
    );

    let config = CommConfig {
        buffer_capacity: args.buffer_capacity,
        pool_buffers: 64.max(4 * ranks),
    };
    let summaries = pipeline::run(&args.input, k, ranks, threads, config)?;

    let mut total_sent = 0u64;
    let mut total_received = 0u64;
    let mut total_distinct = 0usize;
    for s in &summaries {
        eprintln!(
            "[rank {}] sent={} received={} distinct={}",
            s.rank, s.kmers_sent, s.kmers_received, s.distinct
        );
        total_sent += s.kmers_sent;
        total_received += s.kmers_received;
        total_distinct += s.distinct;
    }
    anyhow::ensure!(
        total_sent == total_received,
        "accounting mismatch: {} k-mers sent but {} received",
        total_sent,
        total_received
    );
    eprintln!(
        "total: kmers={} distinct={} ranks={}",
        total_sent, total_distinct, ranks
    );
    Ok(())
}
