//! In-memory key sort and the single-node external sorter.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::chunk;
use crate::comm::CommError;
use crate::merger;
use crate::plan;
use crate::record::{RecordError, RecordView};
use crate::scratch::ScratchDir;

/// Subranges at or below this size are sorted sequentially instead of being
/// split into further tasks.
const TASK_CUTOFF: usize = 10_000;

/// Arrays below this size never touch the thread pool.
const PARALLEL_MIN: usize = 1_000;

/// Default per-chunk byte budget for the single-node sorter.
pub const DEFAULT_CHUNK_BYTES: u64 = 1024 * 1024 * 1024;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Scratch directory creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuild(rayon::ThreadPoolBuildError),
    /// A file could not be opened for reading.
    Open(PathBuf, io::Error),
    /// A file could not be created.
    Create(PathBuf, io::Error),
    /// Reading from an open file failed.
    Read(io::Error),
    /// Writing to an open file failed.
    Write(io::Error),
    /// A record failed to decode.
    Record(RecordError),
    /// The messaging substrate reported a failure.
    Transport(CommError),
    /// Keys out of order (verification only).
    KeyOrder { record: u64, prev_key: u64, key: u64 },
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuild(err) => Some(err),
            SortError::Open(_, err) => Some(err),
            SortError::Create(_, err) => Some(err),
            SortError::Read(err) => Some(err),
            SortError::Write(err) => Some(err),
            SortError::Record(err) => Some(err),
            SortError::Transport(err) => Some(err),
            SortError::KeyOrder { .. } => None,
        }
    }
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortError::TempDir(err) => write!(f, "scratch directory not created: {}", err),
            SortError::ThreadPoolBuild(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::Open(path, err) => write!(f, "cannot open {}: {}", path.display(), err),
            SortError::Create(path, err) => write!(f, "cannot create {}: {}", path.display(), err),
            SortError::Read(err) => write!(f, "read failed: {}", err),
            SortError::Write(err) => write!(f, "write failed: {}", err),
            SortError::Record(err) => write!(f, "record decoding failed: {}", err),
            SortError::Transport(err) => write!(f, "transport failed: {}", err),
            SortError::KeyOrder { record, prev_key, key } => write!(
                f,
                "key order violation at record {}: {} after {}",
                record, key, prev_key
            ),
        }
    }
}

impl From<RecordError> for SortError {
    fn from(err: RecordError) -> Self {
        SortError::Record(err)
    }
}

impl From<CommError> for SortError {
    fn from(err: CommError) -> Self {
        SortError::Transport(err)
    }
}

pub(crate) fn init_thread_pool(threads: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(threads) = threads {
        log::info!("initializing thread-pool (threads: {})", threads);
        builder = builder.num_threads(threads);
    } else {
        log::info!("initializing thread-pool (threads: default)");
    }
    builder.build().map_err(SortError::ThreadPoolBuild)
}

/// Sorts descriptors ascending by key. Small arrays are sorted in place on
/// the calling thread; everything else runs a task-parallel quicksort on the
/// given pool. Equal keys end up in arbitrary relative order.
pub fn sort_views(pool: &rayon::ThreadPool, records: &mut [RecordView<'_>]) {
    if records.len() < PARALLEL_MIN {
        records.sort_unstable_by_key(|record| record.key);
        return;
    }
    pool.install(|| quicksort(records));
}

fn quicksort(records: &mut [RecordView<'_>]) {
    if records.len() <= TASK_CUTOFF {
        records.sort_unstable_by_key(|record| record.key);
        return;
    }
    let pivot = partition(records);
    let (low, rest) = records.split_at_mut(pivot);
    let high = &mut rest[1..];
    if low.len() > TASK_CUTOFF && high.len() > TASK_CUTOFF {
        rayon::join(|| quicksort(low), || quicksort(high));
    } else {
        low.sort_unstable_by_key(|record| record.key);
        high.sort_unstable_by_key(|record| record.key);
    }
}

// Lomuto partition on the last element's key.
fn partition(records: &mut [RecordView<'_>]) -> usize {
    let last = records.len() - 1;
    let pivot = records[last].key;
    let mut boundary = 0;
    for probe in 0..last {
        if records[probe].key < pivot {
            records.swap(boundary, probe);
            boundary += 1;
        }
    }
    records.swap(boundary, last);
    boundary
}

/// External sorter builder. Provides methods for [`ExternalSorter`]
/// initialization.
#[derive(Clone, Default)]
pub struct ExternalSorterBuilder {
    /// Number of threads to be used to sort chunks in parallel.
    threads: Option<usize>,
    /// Directory under which the scratch directory is created.
    scratch_root: Option<PathBuf>,
    /// Per-chunk byte budget.
    chunk_bytes: Option<u64>,
    /// Merge fan-in.
    fan_in: Option<usize>,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        ExternalSorter::new(
            self.threads,
            self.scratch_root.as_deref(),
            self.chunk_bytes.unwrap_or(DEFAULT_CHUNK_BYTES),
            self.fan_in.unwrap_or(merger::DEFAULT_FAN_IN),
        )
    }

    /// Sets the number of threads used for chunk sorting and group merging.
    pub fn with_threads(mut self, threads: usize) -> ExternalSorterBuilder {
        self.threads = Some(threads);
        return self;
    }

    /// Sets the directory the scratch directory is created under.
    pub fn with_scratch_root(mut self, path: &Path) -> ExternalSorterBuilder {
        self.scratch_root = Some(path.into());
        return self;
    }

    /// Sets how many input bytes a chunk may cover before it is cut.
    pub fn with_chunk_bytes(mut self, chunk_bytes: u64) -> ExternalSorterBuilder {
        self.chunk_bytes = Some(chunk_bytes);
        return self;
    }

    /// Sets the number of runs merged at once.
    pub fn with_fan_in(mut self, fan_in: usize) -> ExternalSorterBuilder {
        self.fan_in = Some(fan_in);
        return self;
    }
}

/// What a sort pass produced.
#[derive(Debug, Clone, Copy)]
pub struct SortSummary {
    /// Records written to the output.
    pub records: u64,
    /// Sorted runs spilled before merging.
    pub runs: usize,
}

/// Single-node external sorter: partitions the input into record-aligned
/// chunks bounded by a byte budget, sorts each chunk in parallel against the
/// memory-mapped input, spills one run per chunk, then merges the runs with
/// a bounded fan-in.
pub struct ExternalSorter {
    thread_pool: rayon::ThreadPool,
    scratch: ScratchDir,
    chunk_bytes: u64,
    fan_in: usize,
}

impl ExternalSorter {
    pub fn new(
        threads: Option<usize>,
        scratch_root: Option<&Path>,
        chunk_bytes: u64,
        fan_in: usize,
    ) -> Result<Self, SortError> {
        Ok(ExternalSorter {
            thread_pool: init_thread_pool(threads)?,
            scratch: ScratchDir::create(scratch_root, 0)?,
            chunk_bytes,
            fan_in,
        })
    }

    /// Sorts `input` into `output`.
    pub fn sort(&self, input: &Path, output: &Path) -> Result<SortSummary, SortError> {
        let table = plan::scan_offsets(input)?;
        log::info!(
            "scanned {} records ({} bytes) in {}",
            table.record_count(),
            table.end(),
            input.display()
        );

        let mut runs = Vec::new();
        let mut records = 0u64;
        if table.record_count() > 0 {
            let map = chunk::map_input(input)?;
            for range in plan::budget_ranges(&table, self.chunk_bytes) {
                let mut index = chunk::index_chunk(&map, range.start, range.end);
                if let Some(truncation) = &index.truncation {
                    log::warn!(
                        "chunk truncated at offset {}: {}",
                        truncation.offset,
                        truncation.reason
                    );
                }
                records += index.records.len() as u64;
                sort_views(&self.thread_pool, &mut index.records);

                let run = self.scratch.next_run_path();
                chunk::write_run(&run, &index.records)?;
                log::debug!("spilled {} records to {}", index.records.len(), run.display());
                runs.push(run);
            }
        }

        let run_count = runs.len();
        merger::hierarchical_merge(&self.scratch, &self.thread_pool, runs, output, self.fan_in)?;

        Ok(SortSummary {
            records,
            runs: run_count,
        })
    }
}

#[cfg(test)]
mod test {
    use rand::prelude::*;

    use super::{partition, sort_views, ExternalSorterBuilder};
    use crate::record::RecordView;
    use crate::verify;

    fn views_from_keys(keys: &[u64]) -> Vec<RecordView<'static>> {
        keys.iter()
            .map(|&key| RecordView {
                key,
                payload: b"AAAAAAAA",
            })
            .collect()
    }

    fn keys_of(views: &[RecordView<'_>]) -> Vec<u64> {
        views.iter().map(|view| view.key).collect()
    }

    #[test]
    fn test_partition_places_pivot() {
        let mut views = views_from_keys(&[9, 1, 8, 2, 5]);
        let pivot = partition(&mut views);
        assert_eq!(pivot, 2);
        assert_eq!(views[pivot].key, 5);
        assert!(views[..pivot].iter().all(|view| view.key < 5));
        assert!(views[pivot + 1..].iter().all(|view| view.key >= 5));
    }

    #[test]
    fn test_sort_small_array_stays_sequential() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let mut views = views_from_keys(&[3, 1, 2]);
        sort_views(&pool, &mut views);
        assert_eq!(keys_of(&views), vec![1, 2, 3]);
    }

    #[test]
    fn test_sort_matches_reference_on_random_keys() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let keys: Vec<u64> = (0..50_000).map(|_| rng.gen()).collect();

        let mut expected = keys.clone();
        expected.sort_unstable();

        let mut views = views_from_keys(&keys);
        sort_views(&pool, &mut views);
        assert_eq!(keys_of(&views), expected);
    }

    #[test]
    fn test_sort_all_equal_keys() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let mut views = views_from_keys(&vec![42u64; 20_000]);
        sort_views(&pool, &mut views);
        assert!(views.iter().all(|view| view.key == 42));
        assert_eq!(views.len(), 20_000);
    }

    #[test]
    fn test_external_sorter_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let output = dir.path().join("output.bin");
        crate::generate::generate_input(&input, 2_000, Some(32)).unwrap();

        // A small chunk budget forces several runs and a real merge pass.
        let sorter = ExternalSorterBuilder::new()
            .with_threads(2)
            .with_scratch_root(dir.path())
            .with_chunk_bytes(16 * 1024)
            .with_fan_in(4)
            .build()
            .unwrap();

        let summary = sorter.sort(&input, &output).unwrap();
        assert_eq!(summary.records, 2_000);
        assert!(summary.runs > 4, "chunk budget should force many runs");

        assert_eq!(verify::verify(&output).unwrap(), 2_000);
    }

    #[test]
    fn test_external_sorter_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let once = dir.path().join("once.bin");
        let twice = dir.path().join("twice.bin");
        crate::generate::generate_input(&input, 500, None).unwrap();

        let sorter = ExternalSorterBuilder::new()
            .with_threads(2)
            .with_scratch_root(dir.path())
            .with_chunk_bytes(64 * 1024)
            .build()
            .unwrap();

        sorter.sort(&input, &once).unwrap();
        sorter.sort(&once, &twice).unwrap();

        let first = std::fs::read(&once).unwrap();
        let second = std::fs::read(&twice).unwrap();
        assert_eq!(first, second);
    }
}
