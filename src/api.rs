//! Python binding layer (feature `python`).
//!
//! Exposes the inference pipeline to Python: file paths in, the result
//! table (reticulation count, satisfied percent, extended newick) out.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::infer::{InferOptions, infer};
use crate::io::{GeneTreeFormat, read_constraint_tree, read_gene_trees};
use crate::quartets::{QuartetFilter, QuartetOptions};
use crate::scorer::ScoreMode;

/// Infer level-1 networks from a constraint tree and gene trees.
///
/// Args:
///     tree_file: Path to the rooted binary constraint tree (newick)
///     gene_tree_file: Path to the gene trees (newick lines or nexus)
///     format: "newick" or "nexus" (default "newick")
///     score: "max", "norm" or "sym" (default "max")
///     quartet_filter: 0, 1 or 2 (default 0)
///     threshold: quartet filter threshold in [0,1] (default 0.5)
///     alpha: sym-mode alpha in (0,1] (default 0.1)
///     as_set: count each (gene tree, quartet) once (default False)
///
/// Returns:
///     A list of (n_reticulations, satisfied_percent, extended_newick)
///     rows; row 0 is the chord-free baseline.
///
/// Raises:
///     ValueError: on unreadable input, malformed trees or bad options
#[pyfunction]
#[pyo3(signature = (tree_file, gene_tree_file, format="newick", score="max", quartet_filter=0, threshold=0.5, alpha=0.1, as_set=false))]
#[allow(clippy::too_many_arguments)]
fn infer_networks(
    tree_file: String,
    gene_tree_file: String,
    format: &str,
    score: &str,
    quartet_filter: u8,
    threshold: f64,
    alpha: f64,
    as_set: bool,
) -> PyResult<Vec<(usize, f64, String)>> {
    let format = match format {
        "newick" => GeneTreeFormat::Newick,
        "nexus" => GeneTreeFormat::Nexus,
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown gene-tree format {other:?}"
            )));
        }
    };
    let score_mode = match score {
        "max" => ScoreMode::Max,
        "norm" => ScoreMode::Norm,
        "sym" => ScoreMode::Sym { alpha },
        other => return Err(PyValueError::new_err(format!("unknown score mode {other:?}"))),
    };
    let filter = match quartet_filter {
        0 => QuartetFilter::Off,
        1 => QuartetFilter::DropMin,
        2 => QuartetFilter::KeepMax,
        other => {
            return Err(PyValueError::new_err(format!(
                "quartet_filter must be 0, 1 or 2 (got {other})"
            )));
        }
    };

    let opts = InferOptions {
        score_mode,
        quartets: QuartetOptions {
            filter,
            threshold,
            as_set,
            collapse_below: None,
        },
    };

    let constraint = read_constraint_tree(&tree_file)
        .map_err(|e| PyValueError::new_err(format!("constraint tree: {e}")))?;
    let gene_trees = read_gene_trees(&gene_tree_file, format)
        .map_err(|e| PyValueError::new_err(format!("gene trees: {e}")))?;
    let result = infer(&constraint, &gene_trees, &opts, None)
        .map_err(|e| PyValueError::new_err(e.to_string()))?;

    Ok(result
        .rows
        .into_iter()
        .map(|row| (row.n_reticulations, row.satisfied_percent(), row.newick))
        .collect())
}

/// Python module definition
#[pymodule]
fn camus(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(infer_networks, m)?)?;
    Ok(())
}
