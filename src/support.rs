//! Per-gene quartet support for each reticulation of a network.
//!
//! Given an inferred network and the gene-tree set, every (gene tree,
//! reticulation) cell reports how that gene votes on that cycle: the
//! weight of its quartets the chord satisfies over the weight the case
//! analysis resolves at all (satisfied or conflicting). Genes whose
//! quartets never ride the cycle get NaN.

use std::sync::atomic::{AtomicBool, Ordering};

use phylotree::tree::Tree as PhyloTree;

use crate::errors::{CamusError, Result};
use crate::network::ParsedNetwork;
use crate::quartets::{GeneTree, QuartetOptions};
use crate::scorer::{QuartetOutcome, quartet_outcome};

/// Support ratios, one row per gene tree.
#[derive(Clone, Debug)]
pub struct SupportTable {
    /// `#H<i>` column labels, sorted by (length, lex).
    pub labels: Vec<String>,
    /// `rows[gene][column]`; NaN where no quartet was informative.
    pub rows: Vec<Vec<f64>>,
}

pub fn reticulation_support(
    network: &ParsedNetwork,
    gene_trees: &[PhyloTree],
    opts: &QuartetOptions,
    cancel: Option<&AtomicBool>,
) -> Result<SupportTable> {
    let td = &network.tree;

    let mut columns: Vec<(String, usize)> = network
        .branches
        .iter()
        .enumerate()
        .map(|(i, _)| (format!("#H{i}"), i))
        .collect();
    columns.sort_by(|(a, _), (b, _)| (a.len(), a).cmp(&(b.len(), b)));

    let rows: Vec<Vec<f64>> = gene_trees
        .iter()
        .map(|gene| -> Result<Vec<f64>> {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(CamusError::Cancelled);
            }
            let view = GeneTree::from_tree(gene, td, opts.collapse_below)?;
            let quartets = view.quartets(opts.as_set);
            let mut row = Vec::with_capacity(columns.len());
            for &(_, bi) in &columns {
                let branch = &network.branches[bi];
                let w_sub = if branch.tail == branch.anchor {
                    branch.anchor
                } else {
                    td.child_toward(branch.anchor, branch.head)
                };
                let mut satisfied = 0u64;
                let mut informative = 0u64;
                for (q, weight) in &quartets {
                    match quartet_outcome(
                        td,
                        q,
                        branch.tail,
                        branch.head,
                        branch.anchor,
                        w_sub,
                    ) {
                        QuartetOutcome::Satisfied => {
                            satisfied += weight;
                            informative += weight;
                        }
                        QuartetOutcome::Conflicting => informative += weight,
                        QuartetOutcome::Unaffected => {}
                    }
                }
                row.push(if informative == 0 {
                    f64::NAN
                } else {
                    satisfied as f64 / informative as f64
                });
            }
            Ok(row)
        })
        .collect::<Result<_>>()?;

    Ok(SupportTable {
        labels: columns.into_iter().map(|(l, _)| l).collect(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::parse_extended_newick;

    fn support(network: &str, genes: &[&str]) -> SupportTable {
        let parsed = parse_extended_newick(network).unwrap();
        let gene_trees: Vec<PhyloTree> = genes
            .iter()
            .map(|g| PhyloTree::from_newick(g).unwrap())
            .collect();
        reticulation_support(&parsed, &gene_trees, &QuartetOptions::default(), None).unwrap()
    }

    #[test]
    fn votes_for_against_and_abstain() {
        let table = support(
            "(A,(B,((C)#H0,((#H0,D),(E,(F,(G,(H,(I,J)))))))));",
            &[
                "(B,(C,D),E);",    // CD|BE rides the cycle and agrees
                "(C,(B,(D,E)));",  // DE|BC rides the cycle and disagrees
                "(A,(B,(C,D)));",  // CD|AB never attaches at four points
            ],
        );
        assert_eq!(table.labels, vec!["#H0"]);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0], vec![1.0]);
        assert_eq!(table.rows[1], vec![0.0]);
        assert!(table.rows[2][0].is_nan());
    }

    #[test]
    fn one_column_per_reticulation() {
        let table = support(
            "(((A)#H0,((((B,(C)#H1),(#H1,D)),E),F)),(G,(#H0,H)));",
            &["((A,B),(C,D));", "((G,F),(A,H));"],
        );
        assert_eq!(table.labels, vec!["#H0", "#H1"]);
        // the first gene only speaks to the inner cycle, the second only
        // to the outer one
        assert!(table.rows[0][0].is_nan());
        assert_eq!(table.rows[0][1], 1.0);
        assert_eq!(table.rows[1][0], 1.0);
        assert!(table.rows[1][1].is_nan());
    }
}
