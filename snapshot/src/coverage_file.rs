//! The coverage file: a dense array of [`CountedPathEntry`] records, plus
//! the concrete [`CoverageSink`] `grr-dispatch` reports into while fuzzing
//! runs. Mirrors `coverage.cc`'s `CoveredNewPaths`/`PathCoverageHash`: a
//! hash-indexed set of paths already seen, so repeat edges bump a count
//! instead of growing the file, and the caller can ask how many genuinely
//! new paths a run turned up.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use twox_hash::XxHash64;

use grr_core::CountedPathEntry;
use grr_dispatch::CoverageSink;

use crate::error::Result;

type PathCoverageHash = HashMap<(u32, u32, u32), usize, BuildHasherDefault<XxHash64>>;

/// A file-backed [`CoverageSink`]: every recorded edge is deduplicated by
/// its `(last_branch, from, to)` key, with repeats only bumping `count`.
pub struct FileCoverageSink {
    path: Option<PathBuf>,
    entries: Vec<CountedPathEntry>,
    index: PathCoverageHash,
    new_paths_this_run: usize,
}

impl FileCoverageSink {
    pub fn new() -> Self {
        FileCoverageSink {
            path: None,
            entries: Vec::new(),
            index: PathCoverageHash::default(),
            new_paths_this_run: 0,
        }
    }

    /// Loads whatever coverage a prior run accumulated, so repeat fuzzing
    /// sessions keep compounding the same path set instead of starting over.
    pub fn load(path: &Path) -> Result<Self> {
        let mut sink = FileCoverageSink::new();
        sink.path = Some(path.to_path_buf());
        if !path.exists() {
            return Ok(sink);
        }
        let mut bytes = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut bytes)?;
        for chunk in bytes.chunks_exact(CountedPathEntry::ENCODED_LEN) {
            let entry = CountedPathEntry::from_bytes(chunk.try_into().unwrap());
            sink.index.insert(entry.path_key(), sink.entries.len());
            sink.entries.push(entry);
        }
        Ok(sink)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        for entry in &self.entries {
            file.write_all(&entry.to_bytes())?;
        }
        Ok(())
    }

    /// Saves back to wherever this sink was [`load`](Self::load)ed from.
    /// Returns `Ok(false)` (not an error) for a sink built with
    /// [`new`](Self::new) that has no such path.
    pub fn save_to_loaded_path(&self) -> Result<bool> {
        match &self.path {
            Some(path) => {
                self.save(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// How many distinct `(last_branch, from, to)` paths this sink has not
    /// seen before the current run began.
    pub fn new_path_count(&self) -> usize {
        self.new_paths_this_run
    }

    pub fn entries(&self) -> &[CountedPathEntry] {
        &self.entries
    }
}

impl Default for FileCoverageSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageSink for FileCoverageSink {
    fn record(&mut self, entry: CountedPathEntry) {
        let key = entry.path_key();
        match self.index.get(&key) {
            Some(&idx) => self.entries[idx].count = self.entries[idx].count.saturating_add(1),
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(CountedPathEntry { count: 1, ..entry });
                self.new_paths_this_run += 1;
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(from: u32, to: u32) -> CountedPathEntry {
        CountedPathEntry { last_branch: 0, from, to, count: 1 }
    }

    #[test]
    fn repeated_edges_bump_count_instead_of_growing() {
        let mut sink = FileCoverageSink::new();
        sink.record(entry(1, 2));
        sink.record(entry(1, 2));
        sink.record(entry(3, 4));
        assert_eq!(sink.entries().len(), 2);
        assert_eq!(sink.entries()[0].count, 2);
        assert_eq!(sink.new_path_count(), 2);
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cov.bin");

        let mut sink = FileCoverageSink::new();
        sink.record(entry(1, 2));
        sink.record(entry(3, 4));
        sink.save(&path).unwrap();

        let reloaded = FileCoverageSink::load(&path).unwrap();
        assert_eq!(reloaded.entries().len(), 2);
    }

    #[test]
    fn loading_from_a_prior_run_keeps_counting_forward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cov.bin");

        let mut first = FileCoverageSink::new();
        first.record(entry(1, 2));
        first.save(&path).unwrap();

        let mut second = FileCoverageSink::load(&path).unwrap();
        second.record(entry(1, 2));
        second.record(entry(5, 6));
        assert_eq!(second.new_path_count(), 1);
        assert_eq!(second.entries()[0].count, 2);
    }
}
