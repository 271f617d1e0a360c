//! Distributed coordinator: the per-worker lifecycle of a cluster sort.
//!
//! Every worker runs the same five phases in lockstep: the root scans the
//! record boundaries, the plan is broadcast (or scattered for very large
//! inputs), each worker sorts its own record-aligned slice of the input
//! into a local run, the runs are folded together along a binary tree, and
//! the root renames the surviving run to the output path.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::chunk;
use crate::comm::Communicator;
use crate::merger;
use crate::plan::{self, ByteRange, OffsetTable};
use crate::scratch::ScratchDir;
use crate::sort::{self, SortError};

/// Runs are streamed between workers in pieces of at most this size.
pub const TRANSFER_CHUNK: usize = 128 * 1024 * 1024;

/// Above this record count the offset table is no longer broadcast whole;
/// each worker is scattered just its two boundary offsets.
pub const SCATTER_THRESHOLD: u64 = 100_000_000;

const ROOT: usize = 0;

/// Per-worker driver of the distributed sort. One instance per worker per
/// job; the thread pool and scratch directory live exactly as long as the
/// coordinator.
pub struct DistributedSorter<C: Communicator> {
    comm: C,
    thread_pool: rayon::ThreadPool,
    scratch: ScratchDir,
}

impl<C: Communicator> DistributedSorter<C> {
    pub fn new(comm: C, threads: Option<usize>, scratch_root: Option<&Path>) -> Result<Self, SortError> {
        let thread_pool = sort::init_thread_pool(threads)?;
        let scratch = ScratchDir::create(scratch_root, comm.rank())?;
        Ok(DistributedSorter {
            comm,
            thread_pool,
            scratch,
        })
    }

    /// Sorts `input` into `output` cooperatively with every other worker in
    /// the job. Any unrecoverable error aborts the whole job through the
    /// substrate after a rank-prefixed diagnostic.
    pub fn sort(mut self, input: &Path, output: &Path) {
        let rank = self.comm.rank();
        if let Err(err) = self.run(input, output) {
            log::error!("worker {}: {}", rank, err);
            self.comm.abort(1);
        }
    }

    fn run(&mut self, input: &Path, output: &Path) -> Result<(), SortError> {
        let rank = self.comm.rank();
        let world = self.comm.world_size();

        // Phase 1: boundary scan, root only.
        let table = if rank == ROOT {
            let table = plan::scan_offsets(input)?;
            log::info!(
                "worker 0: scanned {} records ({} bytes)",
                table.record_count(),
                table.end()
            );
            Some(table)
        } else {
            None
        };
        self.comm.barrier();

        // Phase 2: plan broadcast.
        let range = self.exchange_plan(table)?;
        log::debug!(
            "worker {}: assigned byte range [{}, {})",
            rank,
            range.start,
            range.end
        );

        // Phase 3: local sort.
        let local_run = self.scratch.next_run_path();
        self.sort_local_chunk(input, range, &local_run)?;
        self.comm.barrier();

        // Phase 4: tree merge.
        let final_run = self.tree_merge(local_run)?;

        // Phase 5: finalize.
        if rank == ROOT {
            fs::copy(&final_run, output).map_err(SortError::Write)?;
            if let Err(err) = fs::remove_file(&final_run) {
                log::warn!("worker 0: final run {} not removed: {}", final_run.display(), err);
            }
            println!(
                "sorted {} into {} across {} workers",
                input.display(),
                output.display(),
                world
            );
        }
        self.scratch.cleanup();
        self.comm.barrier();
        Ok(())
    }

    /// Phase 2: the root announces the record count, then either broadcasts
    /// the whole offset table (every worker plans its own range) or
    /// scatters each worker's two boundary offsets.
    fn exchange_plan(&self, mut table: Option<OffsetTable>) -> Result<ByteRange, SortError> {
        let rank = self.comm.rank();
        let world = self.comm.world_size();

        let mut header = [0u8; 16];
        if let Some(table) = table.as_ref() {
            LittleEndian::write_u64(&mut header[..8], table.record_count());
            LittleEndian::write_u64(&mut header[8..], table.end());
        }
        self.comm.broadcast(ROOT, &mut header)?;
        let total = LittleEndian::read_u64(&header[..8]);
        let end = LittleEndian::read_u64(&header[8..]);

        if total <= SCATTER_THRESHOLD {
            let mut buf = vec![0u8; total as usize * 8];
            if let Some(table) = table.as_ref() {
                for (slot, offset) in buf.chunks_exact_mut(8).zip(table.offsets()) {
                    LittleEndian::write_u64(slot, *offset);
                }
            }
            self.comm.broadcast(ROOT, &mut buf)?;

            let table = match table.take() {
                Some(table) => table,
                None => {
                    let offsets = buf.chunks_exact(8).map(LittleEndian::read_u64).collect();
                    OffsetTable::from_parts(offsets, end)
                }
            };
            Ok(plan::byte_range(&table, world, rank))
        } else {
            let send = table.as_ref().map(|table| {
                let mut all = vec![0u8; world * 16];
                for dest in 0..world {
                    let range = plan::byte_range(table, world, dest);
                    LittleEndian::write_u64(&mut all[dest * 16..], range.start);
                    LittleEndian::write_u64(&mut all[dest * 16 + 8..], range.end);
                }
                all
            });

            let mut bounds = [0u8; 16];
            self.comm.scatter(ROOT, send.as_deref(), &mut bounds)?;
            Ok(ByteRange {
                start: LittleEndian::read_u64(&bounds[..8]),
                end: LittleEndian::read_u64(&bounds[8..]),
            })
        }
    }

    /// Phase 3: index this worker's byte range against the mapped input,
    /// sort the descriptors, spill one local run. The mapping is released
    /// before the run is consumed by any merge.
    fn sort_local_chunk(&self, input: &Path, range: ByteRange, run: &Path) -> Result<(), SortError> {
        let rank = self.comm.rank();
        if range.is_empty() {
            chunk::write_run(run, &[])?;
            return Ok(());
        }

        let map = chunk::map_input(input)?;
        let mut index = chunk::index_chunk(&map, range.start, range.end);
        if let Some(truncation) = &index.truncation {
            log::warn!(
                "worker {}: chunk truncated at offset {}: {}",
                rank,
                truncation.offset,
                truncation.reason
            );
        }
        log::debug!(
            "worker {}: indexed {} records in [{}, {})",
            rank,
            index.records.len(),
            range.start,
            index.end
        );

        sort::sort_views(&self.thread_pool, &mut index.records);
        chunk::write_run(run, &index.records)
    }

    /// Phase 4: binary-reduction merge. At step s every surviving worker
    /// whose rank is a multiple of 2s receives its partner's run (rank + s)
    /// and merges it with its own; the partner sends and goes inactive.
    /// Every rank, active or not, enters the barrier that closes each step.
    /// After ceil(log2 world) steps rank 0 holds the single merged run.
    fn tree_merge(&self, local_run: PathBuf) -> Result<PathBuf, SortError> {
        let rank = self.comm.rank();
        let world = self.comm.world_size();

        let mut current = local_run;
        let mut active = true;
        let mut step = 1;
        while step < world {
            if active && rank % (2 * step) == 0 {
                let partner = rank + step;
                if partner < world {
                    let received = self.scratch.next_run_path();
                    self.recv_run(partner, &received)?;

                    let merged = self.scratch.next_run_path();
                    let inputs = [current, received];
                    merger::merge_runs(&inputs, &merged)?;
                    for consumed in &inputs {
                        if let Err(err) = fs::remove_file(consumed) {
                            log::warn!("merge input {} not removed: {}", consumed.display(), err);
                        }
                    }
                    current = merged;
                }
            } else if active {
                self.send_run(rank - step, &current)?;
                if let Err(err) = fs::remove_file(&current) {
                    log::warn!("sent run {} not removed: {}", current.display(), err);
                }
                active = false;
            }
            step *= 2;
            self.comm.barrier();
        }

        Ok(current)
    }

    /// Sends a run: an 8-byte length, then the bytes in bounded pieces. A
    /// missing file is announced as length 0.
    fn send_run(&self, dest: usize, path: &Path) -> Result<(), SortError> {
        let mut length = [0u8; 8];
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(_) => {
                self.comm.send(dest, &length)?;
                return Ok(());
            }
        };
        let size = file.metadata().map_err(SortError::Read)?.len();
        LittleEndian::write_u64(&mut length, size);
        self.comm.send(dest, &length)?;

        let mut buf = vec![0u8; TRANSFER_CHUNK.min(size as usize)];
        let mut remaining = size;
        while remaining > 0 {
            let piece = buf.len().min(remaining as usize);
            file.read_exact(&mut buf[..piece]).map_err(SortError::Read)?;
            self.comm.send(dest, &buf[..piece])?;
            remaining -= piece as u64;
        }
        Ok(())
    }

    /// Receives a run announced by `send_run` into `path`, sizing reads by
    /// the announced length. Length 0 yields an empty run file.
    fn recv_run(&self, source: usize, path: &Path) -> Result<(), SortError> {
        let mut length = [0u8; 8];
        self.comm.recv(source, &mut length)?;
        let size = LittleEndian::read_u64(&length);

        let mut file = File::create(path).map_err(|err| SortError::Create(path.to_path_buf(), err))?;
        let mut buf = vec![0u8; TRANSFER_CHUNK.min(size as usize)];
        let mut remaining = size;
        while remaining > 0 {
            let piece = buf.len().min(remaining as usize);
            self.comm.recv(source, &mut buf[..piece])?;
            file.write_all(&buf[..piece]).map_err(SortError::Write)?;
            remaining -= piece as u64;
        }
        file.flush().map_err(SortError::Write)?;
        Ok(())
    }
}
