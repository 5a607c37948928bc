//! End-to-end inference: constraint tree + gene trees → one network per
//! optimal reticulation count.
//!
//! The pipeline preprocesses the constraint tree, ingests quartets, builds
//! the chord score table for the requested mode, runs the dynamic program,
//! and emits one extended newick per budget. Reported satisfied fractions
//! are always raw quartet weights, whatever scalar the program optimized.

use std::sync::atomic::AtomicBool;

use phylotree::tree::Tree as PhyloTree;

use crate::dp::{self, ReticulationBranch};
use crate::errors::Result;
use crate::network;
use crate::quartets::{QuartetOptions, QuartetStore};
use crate::scorer::{self, Score, ScoreMode};
use crate::tree::TreeData;

#[derive(Clone, Debug)]
pub struct InferOptions {
    pub score_mode: ScoreMode,
    pub quartets: QuartetOptions,
}

impl Default for InferOptions {
    fn default() -> Self {
        InferOptions {
            score_mode: ScoreMode::Max,
            quartets: QuartetOptions::default(),
        }
    }
}

/// One result row: the best network using exactly `n_reticulations`.
#[derive(Clone, Debug)]
pub struct NetworkRow {
    pub n_reticulations: usize,
    /// Gene-quartet weight the network displays (baseline included).
    pub satisfied_weight: u64,
    /// Post-filter weight of all ingested quartets.
    pub total_weight: u64,
    pub newick: String,
    pub branches: Vec<ReticulationBranch>,
}

impl NetworkRow {
    /// Percentage of quartet weight displayed; NaN with no quartets at all.
    pub fn satisfied_percent(&self) -> f64 {
        if self.total_weight == 0 {
            f64::NAN
        } else {
            100.0 * self.satisfied_weight as f64 / self.total_weight as f64
        }
    }
}

/// Full inference output. Row 0 is always the chord-free baseline.
#[derive(Clone, Debug)]
pub struct Inference {
    pub rows: Vec<NetworkRow>,
    /// Some gene tree omitted constraint taxa (worth one warning).
    pub omitted_taxa: bool,
}

pub fn infer(
    constraint: &PhyloTree,
    gene_trees: &[PhyloTree],
    opts: &InferOptions,
    cancel: Option<&AtomicBool>,
) -> Result<Inference> {
    let mut td = TreeData::from_tree(constraint)?;
    let store = QuartetStore::from_gene_trees(&td, gene_trees, &opts.quartets, cancel)?;
    td.attach_quartets(store.quartets());

    let per_k = match opts.score_mode {
        ScoreMode::Max => {
            let edges = scorer::max_edge_scores(&td, &store, cancel)?;
            solve(&td, &edges, cancel)?
        }
        ScoreMode::Norm => {
            let edges = scorer::norm_edge_scores(&td, &store, cancel)?;
            solve(&td, &edges, cancel)?
        }
        ScoreMode::Sym { alpha } => {
            let edges = scorer::sym_edge_scores(&td, &store, alpha, cancel)?;
            solve(&td, &edges, cancel)?
        }
    };

    let mut rows = Vec::with_capacity(per_k.len() + 1);
    rows.push(NetworkRow {
        n_reticulations: 0,
        satisfied_weight: store.displayed_weight,
        total_weight: store.total_weight,
        newick: network::to_extended_newick(&td, &[]),
        branches: Vec::new(),
    });
    for (i, branches) in per_k.into_iter().enumerate() {
        debug_assert!(network::validate_level1(&td, &branches).is_ok());
        let satisfied: u64 = branches
            .iter()
            .map(|b| scorer::satisfied_weight(&td, &store, b.tail, b.head))
            .sum();
        rows.push(NetworkRow {
            n_reticulations: i + 1,
            satisfied_weight: store.displayed_weight + satisfied,
            total_weight: store.total_weight,
            newick: network::to_extended_newick(&td, &branches),
            branches,
        });
    }

    Ok(Inference {
        rows,
        omitted_taxa: store.omitted_taxa,
    })
}

fn solve<S: Score>(
    td: &TreeData,
    edges: &[Vec<S>],
    cancel: Option<&AtomicBool>,
) -> Result<Vec<Vec<ReticulationBranch>>> {
    let tables = dp::run(td, edges, cancel)?;
    Ok((1..=tables.max_reticulations(td))
        .map(|k| dp::traceback(td, &tables, k))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(constraint: &str, genes: &[&str]) -> Inference {
        run_with(constraint, genes, &InferOptions::default())
    }

    fn run_with(constraint: &str, genes: &[&str], opts: &InferOptions) -> Inference {
        let tree = PhyloTree::from_newick(constraint).unwrap();
        let gene_trees: Vec<PhyloTree> = genes
            .iter()
            .map(|g| PhyloTree::from_newick(g).unwrap())
            .collect();
        infer(&tree, &gene_trees, opts, None).unwrap()
    }

    #[test]
    fn single_chord_discovered() {
        let result = run(
            "(A,(B,(C,(D,(E,(F,(G,(H,(I,J)))))))));",
            &["(A,(B,(C,D)));", "(B,(C,D),E);"],
        );
        assert_eq!(result.rows.len(), 2);
        assert_eq!(
            result.rows[1].newick,
            "(A,(B,((C)#H0,((#H0,D),(E,(F,(G,(H,(I,J)))))))));"
        );
        // one of two surviving quartet weights is explained by the tree
        assert_eq!(result.rows[0].satisfied_percent(), 50.0);
        assert_eq!(result.rows[1].satisfied_percent(), 100.0);
        assert!(result.omitted_taxa);
    }

    #[test]
    fn two_disjoint_chords() {
        let result = run(
            "((A,((((B,C),D),E),F)),(G,H));",
            &["((A,B),(C,D));", "((G,F),(A,H));"],
        );
        assert_eq!(result.rows.len(), 3);
        assert_eq!(
            result.rows[1].newick,
            "((A,((((B,(C)#H0),(#H0,D)),E),F)),(G,H));"
        );
        assert_eq!(
            result.rows[2].newick,
            "(((A)#H0,((((B,(C)#H1),(#H1,D)),E),F)),(G,(#H0,H)));"
        );
        assert_eq!(result.rows[0].satisfied_percent(), 0.0);
        assert_eq!(result.rows[1].satisfied_percent(), 50.0);
        assert_eq!(result.rows[2].satisfied_percent(), 100.0);
    }

    #[test]
    fn one_sided_cycle_wins_on_cycle_length() {
        // every gene pairs A with E; the one-sided chord from the root's
        // child ties the root-anchored cross chord on score and wins on
        // cycle length
        let result = run(
            "((((A,B),C),D),E);",
            &[
                "((A,E),(B,C));",
                "((A,E),(B,C));",
                "((A,E),(B,D));",
                "((A,E),(B,D));",
                "((A,E),(C,D));",
            ],
        );
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[1].newick, "((#H0,((((A)#H0,B),C),D)),E);");
        assert_eq!(result.rows[1].satisfied_percent(), 100.0);
    }

    #[test]
    fn duplicate_quartets_accumulate_weight() {
        let result = run(
            "(((((A,B),C),D),E),F);",
            &[
                "((E,C),(F,B));",
                "((E,C),(F,B));",
                "((E,C),(F,B));",
                "((C,B),(A,D));",
                "((D,C),(A,E));",
            ],
        );
        assert_eq!(result.rows.len(), 2);
        assert_eq!(
            result.rows[1].newick,
            "((#H0,(((((A,B))#H0,C),D),E)),F);"
        );
        // the winning chord explains the triple-weighted quartet plus one
        assert_eq!(result.rows[1].satisfied_weight, 4);
        assert_eq!(result.rows[1].total_weight, 5);
    }

    #[test]
    fn gene_trees_matching_the_constraint_add_nothing() {
        let constraint = "((A,((((B,C),D),E),F)),(G,H));";
        let result = run(constraint, &[constraint, constraint]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].n_reticulations, 0);
        assert_eq!(result.rows[0].satisfied_percent(), 100.0);
        assert!(!result.omitted_taxa);
    }

    #[test]
    fn no_informative_quartets_at_all() {
        let result = run("((A,B),(C,D));", &["(A,(B,C));"]);
        assert_eq!(result.rows.len(), 1);
        assert!(result.rows[0].satisfied_percent().is_nan());
    }

    #[test]
    fn deterministic_reruns() {
        let inputs = (
            "((A,((((B,C),D),E),F)),(G,H));",
            ["((A,B),(C,D));", "((G,F),(A,H));"],
        );
        let first = run(inputs.0, &inputs.1);
        let second = run(inputs.0, &inputs.1);
        let newicks = |r: &Inference| -> Vec<String> {
            r.rows.iter().map(|row| row.newick.clone()).collect()
        };
        assert_eq!(newicks(&first), newicks(&second));
    }

    #[test]
    fn emitted_networks_reparse_to_the_constraint() {
        let result = run(
            "((A,((((B,C),D),E),F)),(G,H));",
            &["((A,B),(C,D));", "((G,F),(A,H));"],
        );
        for row in &result.rows[1..] {
            let parsed = network::parse_extended_newick(&row.newick).unwrap();
            assert_eq!(parsed.constraint_newick, result.rows[0].newick);
            assert_eq!(parsed.branches, row.branches);
        }
    }

    #[test]
    fn norm_and_sym_modes_run_the_same_pipeline() {
        let constraint = "(A,(B,(C,(D,(E,(F,(G,(H,(I,J)))))))));";
        let genes = ["(A,(B,(C,D)));", "(B,(C,D),E);"];
        // norm prefers the chord whose cycle touches the fewest quartets,
        // which is the same local chord max picks here
        for mode in [ScoreMode::Norm, ScoreMode::Sym { alpha: 0.05 }] {
            let result = run_with(
                constraint,
                &genes,
                &InferOptions {
                    score_mode: mode,
                    ..InferOptions::default()
                },
            );
            assert_eq!(result.rows.len(), 2);
            assert_eq!(
                result.rows[1].newick,
                "(A,(B,((C)#H0,((#H0,D),(E,(F,(G,(H,(I,J)))))))));"
            );
            assert_eq!(result.rows[1].satisfied_percent(), 100.0);
        }
    }

    #[test]
    fn sym_mode_suppresses_weak_chords() {
        // the best chord explains weight 1 against a penalty of 12, so a
        // stiff alpha keeps the tree chord-free
        let result = run_with(
            "(A,(B,(C,(D,(E,(F,(G,(H,(I,J)))))))));",
            &["(A,(B,(C,D)));", "(B,(C,D),E);"],
            &InferOptions {
                score_mode: ScoreMode::Sym { alpha: 0.5 },
                ..InferOptions::default()
            },
        );
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].n_reticulations, 0);
    }
}
