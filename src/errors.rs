//! Error kinds shared by every stage of the pipeline.
//!
//! The core returns these to the caller; only violated internal invariants
//! (which indicate a bug) panic. The CLI maps each variant to a one-line
//! `camus: …` message on stderr and a non-zero exit code.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CamusError>;

#[derive(Debug, Error)]
pub enum CamusError {
    /// Constraint tree whose root does not have exactly two children.
    #[error("constraint tree is not rooted (root must have exactly two children)")]
    Unrooted,

    /// Constraint tree with a multifurcating or unary internal node.
    #[error("constraint tree is not binary (node {node} has {degree} children)")]
    NonBinary { node: usize, degree: usize },

    /// Duplicate tip label within a single tree.
    #[error("duplicate tip label {0:?}")]
    MulTree(String),

    /// Gene-tree taxon that the constraint tree does not carry.
    #[error("gene-tree taxon {0:?} is not in the constraint tree")]
    TipMismatch(String),

    /// Unparseable newick/nexus input.
    #[error("invalid input: {0}")]
    InvalidFormat(String),

    /// Parseable input with the wrong structure (e.g. several trees where
    /// one was expected, or an unpaired reticulation label).
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// `score` was handed a network without any `#H` label.
    #[error("network has no reticulations")]
    NoReticulations,

    /// Two reticulation cycles share a tree node.
    #[error("network is not level-1: reticulations {0} and {1} share a node")]
    NotLevel1(usize, usize),

    /// Rejected CLI flag combination or value.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The shared cancellation flag was raised mid-run.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<phylotree::tree::TreeError> for CamusError {
    fn from(err: phylotree::tree::TreeError) -> Self {
        CamusError::InvalidFormat(err.to_string())
    }
}
