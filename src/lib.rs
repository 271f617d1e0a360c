//! `recsort` is an out-of-core sorter for files of variable-length binary
//! records, ordered ascending by an 8-byte little-endian key.
//!
//! Inputs are expected to exceed main memory. Sorting therefore runs in two
//! passes: the input is partitioned into record-aligned chunks that are
//! key-sorted in parallel against a memory-mapped view and spilled as
//! sorted runs, then the runs are folded together by a streaming k-way
//! merge with bounded fan-in. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `recsort` supports the following modes:
//!
//! * **Single-node sorting:**
//!   [`ExternalSorter`] sorts a file on one machine with a configurable
//!   thread count, per-chunk byte budget, and merge fan-in.
//! * **Distributed sorting:**
//!   [`DistributedSorter`] spreads the same pipeline across cooperating
//!   workers: the root scans record boundaries and broadcasts a balanced
//!   partition plan, every worker sorts its own slice, and the local runs
//!   are combined along a binary merge tree until rank 0 holds the output.
//!   Workers talk through the [`Communicator`] trait, so any substrate
//!   with point-to-point transfers, broadcast/scatter, and barriers plugs
//!   in; [`LocalCluster`] ships as the in-process implementation.
//!
//! Records never change shape on the way through: the output is a
//! byte-for-byte reordering of the input. Equal keys may land in any
//! relative order.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use recsort::ExternalSorterBuilder;
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Info).init();
//!
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_threads(8)
//!         .with_chunk_bytes(512 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let summary = sorter.sort(Path::new("input.bin"), Path::new("output.bin")).unwrap();
//!     println!("sorted {} records from {} runs", summary.records, summary.runs);
//! }
//! ```

pub mod chunk;
pub mod cluster;
pub mod comm;
pub mod generate;
pub mod merger;
pub mod plan;
pub mod record;
pub mod scratch;
pub mod sort;
pub mod verify;

pub use cluster::DistributedSorter;
pub use comm::{CommError, Communicator, LocalCluster};
pub use merger::{hierarchical_merge, merge_runs, DEFAULT_FAN_IN};
pub use record::{OwnedRecord, RecordError, RecordView, HEADER_SIZE, PAYLOAD_MAX, PAYLOAD_MIN};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortSummary};
