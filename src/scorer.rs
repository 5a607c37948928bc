//! Chord scoring: how many quartets does one added edge explain?
//!
//! # Overview
//! For every ordered node pair (tail u, head w) that may carry a chord,
//! the scorer sums the weights of stored quartets the resulting cycle
//! would display. Scores come in three flavors — raw counts, counts
//! normalized by how many quartets the cycle could possibly touch, and a
//! penalized difference — all shaped as a dense `scores[u][w]` table so
//! the dynamic program can stay generic over the scalar.
//!
//! Rows are filled in parallel; each worker owns its row and checks the
//! shared cancellation flag between rows.

use std::ops::Add;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::errors::{CamusError, Result};
use crate::quartets::{Quartet, QuartetStore};
use crate::tree::TreeData;

/// Scalar the dynamic program folds over: addition, comparison, a zero.
pub trait Score:
    Copy + Send + Sync + PartialOrd + Add<Output = Self> + std::fmt::Debug + 'static
{
    const ZERO: Self;
}

impl Score for u64 {
    const ZERO: u64 = 0;
}

impl Score for f64 {
    const ZERO: f64 = 0.0;
}

/// How a candidate chord's table is computed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScoreMode {
    /// Raw weighted satisfied count.
    Max,
    /// Satisfied weight over (gene trees × possibly-affected quartets).
    Norm,
    /// Satisfied weight minus `alpha` times the possibly-affected count.
    Sym { alpha: f64 },
}

/// Outcome of testing one quartet against one candidate cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuartetOutcome {
    /// The cycle displays the quartet's topology.
    Satisfied,
    /// The quartet rides the cycle but resolves to a different topology.
    Conflicting,
    /// The quartet does not attach to the cycle at four distinct points.
    Unaffected,
}

/// Whether (u, w) may carry a chord at all: neither endpoint is the root,
/// the head is not an ancestor of the tail, and the resulting cycle spans
/// at least four edges.
pub fn should_calc_edge(td: &TreeData, u: usize, w: usize) -> bool {
    u != td.root()
        && w != td.root()
        && u != w
        && !td.under(w, u)
        && cycle_length(td, u, w) >= 4
}

/// Edge count of the cycle a chord (u, w) closes through lca(u, w).
pub fn cycle_length(td: &TreeData, u: usize, w: usize) -> usize {
    let v = td.lca(u, w);
    let len = (td.depth(u) - td.depth(v)) + (td.depth(w) - td.depth(v)) + 1;
    if v == u { len + 1 } else { len }
}

/// Case analysis of one quartet against the cycle closed by u→w.
///
/// `v` is the anchor (lca of u and w) and `w_sub` the child of `v` on the
/// head's side (`v` itself for a one-sided cycle, u = v). The quartet
/// participates iff exactly one taxon hangs below the head and the four
/// taxa attach to the cycle at four distinct points; it is satisfied iff
/// the taxon the cycle routes next to that bottom taxon is its topology
/// partner.
pub fn quartet_outcome(
    td: &TreeData,
    q: &Quartet,
    u: usize,
    w: usize,
    v: usize,
    w_sub: usize,
) -> QuartetOutcome {
    // the unique taxon below the head
    let mut bottom = None;
    for (pos, &t) in q.taxa.iter().enumerate() {
        if td.leafset_contains(w, t) {
            if bottom.is_some() {
                return QuartetOutcome::Unaffected;
            }
            bottom = Some((pos, t));
        }
    }
    let Some((bottom_pos, bottom_taxon)) = bottom else {
        return QuartetOutcome::Unaffected;
    };
    let bottom_under_tail = td.leafset_contains(u, bottom_taxon);

    // Attachment point of each taxon on the cycle; taxa outside the anchor
    // share the root sentinel (id 0, depth 0).
    let mut attach = [0usize; 4];
    let mut under_wsub = [false; 4];
    for (pos, &t) in q.taxa.iter().enumerate() {
        under_wsub[pos] = td.leafset_contains(w_sub, t);
        attach[pos] = if !td.leafset_contains(v, t) {
            td.root()
        } else if under_wsub[pos] || bottom_under_tail {
            td.lca(w, td.tip_node(t))
        } else {
            td.lca(u, td.tip_node(t))
        };
    }
    for i in 0..4 {
        for j in (i + 1)..4 {
            if attach[i] == attach[j] {
                return QuartetOutcome::Unaffected;
            }
        }
    }

    // Rerouting the bottom taxon over the chord makes it adjacent to the
    // attachment nearest the chord's far end.
    let candidate = if under_wsub.iter().all(|&b| b) {
        (0..4)
            .min_by_key(|&p| td.depth(attach[p]))
            .expect("four positions")
    } else {
        (0..4)
            .filter(|&p| !under_wsub[p])
            .max_by_key(|&p| td.depth(attach[p]))
            .expect("some position is outside w_sub")
    };

    if candidate == q.partner(bottom_pos) {
        QuartetOutcome::Satisfied
    } else {
        QuartetOutcome::Conflicting
    }
}

/// Weighted count of stored quartets the chord u→w satisfies; 0 for
/// ineligible pairs. Only quartets decidable at the anchor are scanned.
pub fn satisfied_weight(td: &TreeData, store: &QuartetStore, u: usize, w: usize) -> u64 {
    if !should_calc_edge(td, u, w) {
        return 0;
    }
    let v = td.lca(u, w);
    let w_sub = if u == v { v } else { td.child_toward(v, w) };
    td.quartets_at(v)
        .iter()
        .map(|&qi| {
            match quartet_outcome(td, &store.quartets()[qi], u, w, v, w_sub) {
                QuartetOutcome::Satisfied => store.weight(qi),
                _ => 0,
            }
        })
        .sum()
}

/// Number of quartets the cycle of u→w could possibly affect: one taxon
/// below the head times one from each of three distinct subtrees dangling
/// off the cycle. The count is the coefficient of x³ in ∏(1 + sᵢx) over
/// the dangling subtree sizes, scaled by the below-head size.
pub fn penalty(td: &TreeData, u: usize, w: usize) -> u64 {
    let v = td.lca(u, w);
    let s0 = td.num_leaves_below(w) as u64;
    let mut sizes: Vec<u64> = Vec::new();

    // Siblings dangling off the head path. The first step's sibling is the
    // other side of the cycle for a cross chord, a dangling subtree for a
    // one-sided cycle.
    let mut x = w;
    while let Some(p) = td.parent(x) {
        if p == v {
            if u == v {
                sizes.push(td.num_leaves_below(td.sibling(x).expect("below anchor")) as u64);
            }
            break;
        }
        sizes.push(td.num_leaves_below(td.sibling(x).expect("below anchor")) as u64);
        x = p;
    }

    if u != v {
        sizes.push(td.num_leaves_below(u) as u64);
        let mut x = u;
        while let Some(p) = td.parent(x) {
            if p == v {
                break;
            }
            sizes.push(td.num_leaves_below(td.sibling(x).expect("below anchor")) as u64);
            x = p;
        }
    }

    let outside = (td.n_taxa() - td.num_leaves_below(v)) as u64;
    if outside > 0 {
        sizes.push(outside);
    }

    let mut coeff = [1u64, 0, 0, 0];
    for s in sizes {
        coeff[3] += coeff[2] * s;
        coeff[2] += coeff[1] * s;
        coeff[1] += coeff[0] * s;
    }
    s0 * coeff[3]
}

fn fill_rows<S, F>(td: &TreeData, cancel: Option<&AtomicBool>, cell: F) -> Result<Vec<Vec<S>>>
where
    S: Score,
    F: Fn(usize, usize) -> S + Sync,
{
    let n = td.n_nodes();
    (0..n)
        .into_par_iter()
        .map(|u| {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(CamusError::Cancelled);
            }
            Ok((0..n).map(|w| cell(u, w)).collect())
        })
        .collect()
}

/// Raw satisfied-weight table (`-s max`).
pub fn max_edge_scores(
    td: &TreeData,
    store: &QuartetStore,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<Vec<u64>>> {
    fill_rows(td, cancel, |u, w| satisfied_weight(td, store, u, w))
}

/// Normalized table (`-s norm`): satisfied / (gene trees × penalty).
pub fn norm_edge_scores(
    td: &TreeData,
    store: &QuartetStore,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<Vec<f64>>> {
    let genes = store.n_gene_trees.max(1) as f64;
    fill_rows(td, cancel, |u, w| {
        if !should_calc_edge(td, u, w) {
            return 0.0;
        }
        let possible = penalty(td, u, w);
        if possible == 0 {
            return 0.0;
        }
        satisfied_weight(td, store, u, w) as f64 / (genes * possible as f64)
    })
}

/// Penalized table (`-s sym`): satisfied − alpha × penalty.
pub fn sym_edge_scores(
    td: &TreeData,
    store: &QuartetStore,
    alpha: f64,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<Vec<f64>>> {
    fill_rows(td, cancel, |u, w| {
        if !should_calc_edge(td, u, w) {
            return 0.0;
        }
        satisfied_weight(td, store, u, w) as f64 - alpha * penalty(td, u, w) as f64
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quartets::QuartetOptions;
    use phylotree::tree::Tree as PhyloTree;

    fn fixture(constraint: &str, genes: &[&str]) -> (TreeData, QuartetStore) {
        let mut td =
            TreeData::from_tree(&PhyloTree::from_newick(constraint).unwrap()).unwrap();
        let trees: Vec<PhyloTree> = genes
            .iter()
            .map(|g| PhyloTree::from_newick(g).unwrap())
            .collect();
        let store =
            QuartetStore::from_gene_trees(&td, &trees, &QuartetOptions::default(), None).unwrap();
        td.attach_quartets(store.quartets());
        (td, store)
    }

    fn tip(td: &TreeData, name: &str) -> usize {
        td.tip_node(td.taxon_id(name).unwrap())
    }

    #[test]
    fn eligibility_and_cycle_length() {
        let td = TreeData::from_tree(
            &PhyloTree::from_newick("(A,(B,(C,(D,E))));").unwrap(),
        )
        .unwrap();
        let (a, c, d) = (tip(&td, "A"), tip(&td, "C"), tip(&td, "D"));
        // root endpoints never qualify
        assert!(!should_calc_edge(&td, td.root(), c));
        assert!(!should_calc_edge(&td, c, td.root()));
        // the head may not be an ancestor of the tail
        let inner = td.parent(d).unwrap();
        assert!(!should_calc_edge(&td, d, inner));
        // sibling chords close three-edge cycles
        assert_eq!(cycle_length(&td, d, tip(&td, "E")), 3);
        assert!(!should_calc_edge(&td, d, tip(&td, "E")));
        // a proper cross chord
        assert_eq!(cycle_length(&td, d, c), 4);
        assert!(should_calc_edge(&td, d, c));
        // one-sided cycle counts its apex twice
        assert_eq!(cycle_length(&td, inner, d), 3);
        let upper = td.parent(inner).unwrap();
        assert_eq!(cycle_length(&td, upper, d), 4);
        assert!(should_calc_edge(&td, upper, d));
        assert!(should_calc_edge(&td, a, c));
    }

    #[test]
    fn single_quartet_chord_scores() {
        // Only CD|BE survives ingestion; the chord D→C explains it.
        let (td, store) = fixture(
            "(A,(B,(C,(D,(E,(F,(G,(H,(I,J)))))))));",
            &["(A,(B,(C,D)));", "(B,(C,D),E);"],
        );
        let (c, d) = (tip(&td, "C"), tip(&td, "D"));
        assert_eq!(satisfied_weight(&td, &store, d, c), 1);
        // the mirrored orientation explains it too
        assert_eq!(satisfied_weight(&td, &store, c, d), 1);
        // anchoring at the cherry's parent one level up does not
        let node3 = td.lca(c, d);
        assert_eq!(satisfied_weight(&td, &store, node3, c), 0);
        // chords outside the quartet's span see nothing
        let (i, j) = (tip(&td, "I"), tip(&td, "J"));
        assert_eq!(satisfied_weight(&td, &store, i, j), 0);
    }

    #[test]
    fn one_sided_cycle_satisfaction() {
        // all quartets pair A with E; the chord from the root's child down
        // to A satisfies every one of them
        let (td, store) = fixture(
            "((((A,B),C),D),E);",
            &["((A,E),(B,C));", "((A,E),(B,D));", "((A,E),(C,D));"],
        );
        let a = tip(&td, "A");
        let y = td.children(td.root()).unwrap()[0];
        assert_eq!(satisfied_weight(&td, &store, y, a), 3);
        // cross chord from E scores the same set
        assert_eq!(satisfied_weight(&td, &store, tip(&td, "E"), a), 3);
        // but is a longer way around
        assert!(cycle_length(&td, tip(&td, "E"), a) > cycle_length(&td, y, a));
    }

    #[test]
    fn penalty_polynomial() {
        let td = TreeData::from_tree(
            &PhyloTree::from_newick("(((A,B),C),D);").unwrap(),
        )
        .unwrap();
        let (a, d) = (tip(&td, "A"), tip(&td, "D"));
        // cycle D→A dangles {B}, {C}, below-D with one leaf below the head
        assert_eq!(penalty(&td, d, a), 1);
        // one-sided cycle from the root's left child to A dangles {B},
        // {C} and the outside leaf {D}
        let x = td.children(td.root()).unwrap()[0];
        assert_eq!(penalty(&td, x, a), 1);
    }

    #[test]
    fn penalty_counts_choices() {
        let td = TreeData::from_tree(
            &PhyloTree::from_newick("((((A,B),(C,E)),F),(D,G));").unwrap(),
        )
        .unwrap();
        // head at A, tail at the (D,G) node: the cycle dangles B [1],
        // (C,E) [2], F [1] and the below-tail pair [2]; no outside taxa.
        let dg = td.lca(tip(&td, "D"), tip(&td, "G"));
        let a = tip(&td, "A");
        // x³ coefficient of (1+x)(1+2x)(1+x)(1+2x) = 12, times one head leaf
        assert_eq!(penalty(&td, dg, a), 12);
    }

    #[test]
    fn norm_and_sym_arithmetic() {
        let (td, store) = fixture(
            "(A,(B,(C,(D,(E,(F,(G,(H,(I,J)))))))));",
            &["(A,(B,(C,D)));", "(B,(C,D),E);"],
        );
        let (c, d) = (tip(&td, "C"), tip(&td, "D"));
        let sat = satisfied_weight(&td, &store, d, c) as f64;
        let pen = penalty(&td, d, c) as f64;
        let norm = norm_edge_scores(&td, &store, None).unwrap();
        assert_eq!(norm[d][c], sat / (2.0 * pen));
        let sym = sym_edge_scores(&td, &store, 0.1, None).unwrap();
        assert_eq!(sym[d][c], sat - 0.1 * pen);
        // ineligible cells stay zero in every mode
        assert_eq!(norm[td.root()][c], 0.0);
        assert_eq!(sym[td.root()][c], 0.0);
        let max = max_edge_scores(&td, &store, None).unwrap();
        assert_eq!(max[d][c], 1);
    }
}
