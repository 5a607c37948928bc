//! Crate root: lightweight module orchestration and public re-exports.
//!
//! Modules:
//! - `tree`: indexed read-only view of the constraint tree (ids, LCA,
//!   taxon sets).
//! - `quartets`: quartet canonicalization and the weighted gene-tree
//!   quartet store.
//! - `scorer`: per-chord quartet satisfaction tables in three modes.
//! - `dp`: the bottom-up budgeted dynamic program and its traceback.
//! - `network`: extended-newick emission and re-parsing of networks.
//! - `infer`: the end-to-end pipeline tying the above together.
//! - `support`: per-gene quartet support for inferred reticulations.
//! - `io`: file readers and CSV writers at the boundary.
//! - `bitset`: compact taxon sets.
//! - `errors`: the crate-wide error enum.
//! - `api`: Python bindings via `pyo3` (gated behind "python" feature).

pub mod bitset;
pub mod dp;
pub mod errors;
pub mod infer;
pub mod io;
pub mod network;
pub mod quartets;
pub mod scorer;
pub mod support;
pub mod tree;

#[cfg(feature = "python")]
pub mod api;

// Re-export frequently used types & functions
pub use dp::ReticulationBranch;
pub use errors::{CamusError, Result};
pub use infer::{InferOptions, Inference, NetworkRow, infer};
pub use quartets::{Quartet, QuartetFilter, QuartetOptions, QuartetStore};
pub use scorer::ScoreMode;
pub use tree::TreeData;
