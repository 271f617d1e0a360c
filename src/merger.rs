//! Streaming k-way merge of sorted run files.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::chunk::{RunReader, RUN_BUF_SIZE};
use crate::record::{OwnedRecord, RecordError};
use crate::scratch::ScratchDir;
use crate::sort::SortError;

/// Number of runs merged at once by the hierarchical merge.
pub const DEFAULT_FAN_IN: usize = 10;

/// One in-flight record on the merge heap. The cursor owns its record fully;
/// advancing pops the cursor and refills from the same input.
struct MergeCursor {
    record: OwnedRecord,
    source: usize,
}

impl PartialEq for MergeCursor {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key
    }
}

impl Eq for MergeCursor {}

impl PartialOrd for MergeCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCursor {
    // Keys only; equal keys merge in arbitrary order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.record.key.cmp(&other.record.key)
    }
}

fn refill(reader: &mut RunReader, path: &Path) -> Result<Option<OwnedRecord>, SortError> {
    match reader.next_record() {
        Ok(next) => Ok(next),
        Err(RecordError::IO(err)) => Err(SortError::Read(err)),
        // A record that fails to decode mid-file ends that input; the
        // remaining inputs still merge.
        Err(err) => {
            log::warn!("merge input {} terminated early: {}", path.display(), err);
            Ok(None)
        }
    }
}

/// Merges `inputs` (each sorted by key) into a single sorted `output`.
/// Inputs are left in place. An empty input list produces an empty output;
/// a single input is copied through.
pub fn merge_runs(inputs: &[PathBuf], output: &Path) -> Result<(), SortError> {
    if inputs.is_empty() {
        File::create(output).map_err(|err| SortError::Create(output.to_path_buf(), err))?;
        return Ok(());
    }
    if inputs.len() == 1 {
        fs::copy(&inputs[0], output).map_err(SortError::Write)?;
        return Ok(());
    }

    let mut readers = Vec::with_capacity(inputs.len());
    let mut heap = BinaryHeap::with_capacity(inputs.len());
    for (source, path) in inputs.iter().enumerate() {
        let mut reader = RunReader::open(path)?;
        if let Some(record) = refill(&mut reader, path)? {
            heap.push(Reverse(MergeCursor { record, source }));
        }
        readers.push(reader);
    }

    let file = File::create(output).map_err(|err| SortError::Create(output.to_path_buf(), err))?;
    let mut writer = BufWriter::with_capacity(RUN_BUF_SIZE, file);

    while let Some(Reverse(cursor)) = heap.pop() {
        cursor.record.write_to(&mut writer).map_err(SortError::Write)?;
        let source = cursor.source;
        if let Some(record) = refill(&mut readers[source], &inputs[source])? {
            heap.push(Reverse(MergeCursor { record, source }));
        }
    }

    writer.flush().map_err(SortError::Write)?;
    Ok(())
}

fn remove_consumed(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            log::warn!("failed to remove merge input {}: {}", path.display(), err);
        }
    }
}

/// Merges any number of runs into `output` with a bounded fan-in: groups of
/// at most `fan_in` runs are merged in parallel on `pool` into intermediate
/// runs (deleting their inputs), recursively, until one merge produces the
/// output. `fan_in` trades per-merge I/O against recursion depth.
pub fn hierarchical_merge(
    scratch: &ScratchDir,
    pool: &rayon::ThreadPool,
    mut inputs: Vec<PathBuf>,
    output: &Path,
    fan_in: usize,
) -> Result<(), SortError> {
    let fan_in = fan_in.max(2);

    while inputs.len() > fan_in {
        let groups: Vec<Vec<PathBuf>> = inputs.chunks(fan_in).map(<[PathBuf]>::to_vec).collect();
        log::debug!(
            "merging {} runs in {} groups of at most {}",
            inputs.len(),
            groups.len(),
            fan_in
        );
        inputs = pool.install(|| {
            groups
                .into_par_iter()
                .map(|group| {
                    let merged = scratch.next_run_path();
                    merge_runs(&group, &merged)?;
                    remove_consumed(&group);
                    Ok(merged)
                })
                .collect::<Result<Vec<_>, SortError>>()
        })?;
    }

    merge_runs(&inputs, output)?;
    remove_consumed(&inputs);
    Ok(())
}
