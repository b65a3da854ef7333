//! # arbor
//!
//! A forest-of-trees approximate nearest-neighbor index that:
//! - Builds many randomized binary space-partitioning trees over a set of
//!   fixed-dimensional `f32` vectors, in parallel
//! - Packs items, splits, and small descriptors into one fixed-size node
//!   record, so the whole forest is a single flat file
//! - Memory-maps that file for low-overhead, header-free loads
//! - Answers top-k queries with one best-first search across all trees
//! - Is **generic over the metric**: angular, Euclidean, Manhattan, Hamming
//!   (bit-packed), and dot product (norm-lifted)
//!
//! ## Example
//! ```no_run
//! use arbor::{ArborIndex, Euclidean};
//!
//! let mut index = ArborIndex::<Euclidean>::new(2).unwrap();
//! index.add_item(0, &[2.0, 2.0]).unwrap();
//! index.add_item(1, &[3.0, 2.0]).unwrap();
//! index.add_item(2, &[3.0, 3.0]).unwrap();
//! index.build(10, -1).unwrap();
//!
//! assert_eq!(index.get_nns_by_vector(&[4.0, 4.0], 3, -1).unwrap(), vec![2, 1, 0]);
//!
//! // Persist, then map it back from disk.
//! index.save("points.idx").unwrap();
//! let mut reopened = ArborIndex::<Euclidean>::new(2).unwrap();
//! reopened.load("points.idx", false).unwrap();
//! assert_eq!(reopened.get_nns_by_item(0, 3, -1).unwrap(), vec![0, 1, 2]);
//! ```
//!
//! ## On-disk builds
//! For sets larger than memory, [`ArborIndex::on_disk_build`] points the
//! node store at a file before any items are added; `build` then streams
//! nodes straight to disk and no separate `save` is needed (or allowed).
//!
//! ## File layout
//! `n_nodes` records of exactly `node_size(f, metric)` bytes each,
//! little-endian, no header. The trailing records are copies of the tree
//! roots, which is how `load` finds them again.

mod build;
mod index;
pub mod metric;
mod node;
mod random;
mod search;
mod store;

pub use index::{ArborIndex, Phase};
pub use metric::{Angular, DotProduct, Euclidean, Hamming, Manhattan, Metric, MetricKind};

use thiserror::Error;

/// Errors surfaced by every fallible index operation.
#[derive(Debug, Error)]
pub enum ArborError {
    /// A parameter is outside its domain: bad dimension, wrong vector
    /// length, unknown metric name, or a query for an absent item.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the index's current phase.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// File or mapping failure, including an index file whose size does not
    /// match the node layout.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The node store could not grow.
    #[error("out of memory while growing the node store")]
    OutOfMemory,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ArborError>;

/// An angular-metric index.
pub type AngularIndex = ArborIndex<Angular>;
/// A Euclidean-metric index.
pub type EuclideanIndex = ArborIndex<Euclidean>;
/// A Manhattan-metric index.
pub type ManhattanIndex = ArborIndex<Manhattan>;
/// A Hamming-metric index over 0/1 vectors.
pub type HammingIndex = ArborIndex<Hamming>;
/// A dot-product index (ranked by descending inner product).
pub type DotIndex = ArborIndex<DotProduct>;
