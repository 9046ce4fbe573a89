//! Memory-mapped file loader with rank partitions and atomic chunking.
//!
//! A loader maps the whole file read-only and restricts itself to one
//! rank's partition. `adjust_range` snaps both ends of the partition to
//! record boundaries with a caller-supplied predicate, so the adjusted
//! ranges of adjacent ranks meet exactly. `next_chunk_atomic` then hands
//! out disjoint, boundary-aligned slices of the adjusted range to any
//! number of worker threads.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use memmap2::Mmap;

use crate::range::ByteRange;

/// Record-boundary predicate: returns the offset of the first record
/// start at or after `from` (`data.len()` when none remains).
pub trait Boundary: Fn(&[u8], usize) -> usize + Sync {}

impl<F: Fn(&[u8], usize) -> usize + Sync> Boundary for F {}

pub struct FileLoader {
    map: Mmap,
    range: ByteRange,
    next_start: AtomicU64,
}

impl FileLoader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let len = file
            .metadata()
            .with_context(|| format!("read metadata for {:?}", path))?
            .len();
        anyhow::ensure!(len > 0, "input file {:?} is empty", path);
        // Safety: the mapping is read-only and the file is expected to
        // stay unmodified while the loader is alive.
        let map = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {:?}", path))?;
        Ok(FileLoader {
            map,
            range: ByteRange::file_range(len),
            next_start: AtomicU64::new(0),
        })
    }

    /// The full `[0, file_size)` range.
    pub fn file_range(&self) -> ByteRange {
        ByteRange::file_range(self.map.len() as u64)
    }

    /// The rank's current (possibly adjusted) range.
    pub fn range(&self) -> ByteRange {
        self.range
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    /// The bytes of the current range.
    pub fn range_data(&self) -> &[u8] {
        &self.map[self.range.start as usize..self.range.end as usize]
    }

    /// Restrict the loader to `range` (clamped to the file) and reset
    /// the chunk cursor.
    pub fn set_range(&mut self, range: ByteRange) {
        self.range = range.intersect(&self.file_range());
        self.next_start = AtomicU64::new(self.range.start);
    }

    /// Snap the current range to record boundaries. The file start and
    /// end are kept as-is; interior bounds move forward to the next
    /// boundary. Because every rank applies the same predicate to the
    /// same raw partition bounds, rank r's adjusted end equals rank
    /// r+1's adjusted start.
    pub fn adjust_range<B: Boundary>(&mut self, boundary: B) {
        let file = self.file_range();
        let start = if self.range.start == file.start {
            self.range.start
        } else {
            boundary(self.data(), self.range.start as usize) as u64
        };
        let end = if self.range.end >= file.end {
            file.end
        } else {
            boundary(self.data(), self.range.end as usize) as u64
        };
        self.range = ByteRange::new(start.min(end), end.min(file.end));
        self.next_start = AtomicU64::new(self.range.start);
    }

    /// Claim the next chunk of roughly `chunk_bytes` bytes, extended to
    /// the following record boundary. Thread-safe: concurrent callers
    /// receive disjoint slices, in increasing-start order, covering the
    /// whole adjusted range. Returns `None` once the range is consumed.
    pub fn next_chunk_atomic<B: Boundary>(
        &self,
        boundary: &B,
        chunk_bytes: usize,
    ) -> Option<(&[u8], ByteRange)> {
        assert!(chunk_bytes > 0, "chunk size must be positive");
        loop {
            let start = self.next_start.load(Ordering::Acquire);
            if start >= self.range.end {
                return None;
            }
            let tentative = start.saturating_add(chunk_bytes as u64);
            let end = if tentative >= self.range.end {
                self.range.end
            } else {
                (boundary(self.data(), tentative as usize) as u64)
                    .clamp(tentative, self.range.end)
            };
            debug_assert!(end > start);
            if self
                .next_start
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let slice = &self.map[start as usize..end as usize];
                return Some((slice, ByteRange::new(start, end)));
            }
        }
    }
}

/// FASTA record boundary: the next '>' that begins a line.
pub fn fasta_boundary(data: &[u8], from: usize) -> usize {
    if from >= data.len() {
        return data.len();
    }
    if data[from] == b'>' && (from == 0 || data[from - 1] == b'\n') {
        return from;
    }
    let mut pos = from;
    while let Some(nl) = data[pos..].iter().position(|&b| b == b'\n') {
        let candidate = pos + nl + 1;
        if candidate >= data.len() {
            return data.len();
        }
        if data[candidate] == b'>' {
            return candidate;
        }
        pos = candidate;
    }
    data.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fasta_fixture(records: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("create temp file");
        for i in 0..records {
            writeln!(f, ">seq{}", i).unwrap();
            let line = match i % 3 {
                0 => "ACGTACGTACGTACGTGGCC",
                1 => "TTTTGGGGCCCCAAAA",
                _ => "ACACACACGTGTGTGTACGT",
            };
            writeln!(f, "{}", line).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn fasta_boundary_finds_record_starts() {
        let data = b">a\nACGT\n>b\nTTTT\n";
        assert_eq!(fasta_boundary(data, 0), 0);
        assert_eq!(fasta_boundary(data, 1), 8);
        assert_eq!(fasta_boundary(data, 8), 8);
        assert_eq!(fasta_boundary(data, 9), data.len());
    }

    #[test]
    fn adjusted_ranges_meet_exactly() {
        let f = fasta_fixture(100);
        let parts = 7;
        let mut last_end = None;
        let mut covered = 0;
        for rank in 0..parts {
            let mut loader = FileLoader::open(f.path()).unwrap();
            let raw = loader.file_range().block_partition(parts, rank);
            loader.set_range(raw);
            loader.adjust_range(fasta_boundary);
            let r = loader.range();
            if let Some(prev) = last_end {
                assert_eq!(r.start, prev, "rank {} does not meet its predecessor", rank);
            } else {
                assert_eq!(r.start, 0);
            }
            if !r.is_empty() {
                assert_eq!(loader.range_data()[0], b'>');
            }
            covered += r.len();
            last_end = Some(r.end);
        }
        let loader = FileLoader::open(f.path()).unwrap();
        assert_eq!(last_end, Some(loader.file_range().end));
        assert_eq!(covered, loader.file_range().len());
    }

    #[test]
    fn concurrent_chunks_are_disjoint_ordered_and_covering() {
        let f = fasta_fixture(400);
        let mut loader = FileLoader::open(f.path()).unwrap();
        let raw = loader.file_range().block_partition(3, 1);
        loader.set_range(raw);
        loader.adjust_range(fasta_boundary);
        let range = loader.range();

        let mut all: Vec<ByteRange> = std::thread::scope(|scope| {
            let loader = &loader;
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(move || {
                        let mut mine: Vec<ByteRange> = Vec::new();
                        while let Some((slice, r)) = loader.next_chunk_atomic(&fasta_boundary, 256)
                        {
                            assert_eq!(slice.len() as u64, r.len());
                            assert_eq!(slice[0], b'>');
                            if let Some(prev) = mine.last() {
                                assert!(r.start >= prev.end, "per-caller order violated");
                            }
                            mine.push(r);
                        }
                        mine
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().expect("chunk worker panicked"))
                .collect()
        });

        all.sort_by_key(|r| r.start);
        assert_eq!(all.first().map(|r| r.start), Some(range.start));
        assert_eq!(all.last().map(|r| r.end), Some(range.end));
        for pair in all.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "chunks must tile the range");
        }
    }

    #[test]
    fn empty_file_is_rejected() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(FileLoader::open(f.path()).is_err());
    }
}
