//! Bottom-up dynamic program over the constraint tree.
//!
//! # Overview
//! Every node v carries a strictly increasing sequence `scores[v]` indexed
//! by reticulation budget k, with a parallel trace per entry. At each
//! internal node the budget either splits across the two children (no
//! chord anchored here) or pays for one chord anchored at v — a cross
//! chord between the two child subtrees or a one-sided chord from v down
//! to a descendant — plus sub-budgets for the subtrees dangling off the
//! cycle. Budgets grow one step at a time and stop at the first step that
//! brings no strict improvement.
//!
//! # Path accumulation
//! For a chord anchored at v with an endpoint x, the subtrees hanging off
//! the tree path v↘x each contribute their own table. Those contributions
//! are folded incrementally: walking down from v, each step merges the
//! sibling's table into the running path table with a two-way best split.
//! Selected candidates resolve their path allocation into explicit
//! (sibling, budget) pairs, so traceback is a plain recursion over node
//! ids and budgets.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{CamusError, Result};
use crate::scorer::{Score, cycle_length, should_calc_edge};
use crate::tree::TreeData;

/// Reconstruction record for one (node, budget) cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Trace {
    /// Tip cell; nothing below.
    Leaf,
    /// No chord anchored here; the budget splits across the children.
    NoCycle { left_k: usize, right_k: usize },
    /// One-sided chord from this node down to `head`.
    CycleDown {
        head: usize,
        /// (sibling subtree, budget) along the head path.
        path: Vec<(usize, usize)>,
        /// Budget spent below the head.
        below: usize,
    },
    /// Chord across this node, tail in one child subtree, head in the other.
    CycleCross {
        tail: usize,
        head: usize,
        tail_path: Vec<(usize, usize)>,
        head_path: Vec<(usize, usize)>,
        tail_below: usize,
        head_below: usize,
    },
}

/// Finished per-node tables.
#[derive(Clone, Debug)]
pub struct DpTables<S> {
    pub scores: Vec<Vec<S>>,
    pub traces: Vec<Vec<Trace>>,
}

impl<S: Score> DpTables<S> {
    /// Number of reticulations in the best network (root table length − 1).
    pub fn max_reticulations(&self, td: &TreeData) -> usize {
        self.scores[td.root()].len() - 1
    }

    /// Best total score with exactly `k` reticulations.
    pub fn root_score(&self, td: &TreeData, k: usize) -> S {
        self.scores[td.root()][k]
    }
}

/// A chord added to the tree, oriented tail → head, with the cycle's apex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReticulationBranch {
    pub tail: usize,
    pub head: usize,
    pub anchor: usize,
}

/// Best (a, b) with a + b = k maximizing `a_tab[a] + b_tab[b]`.
///
/// Returns `None` when the tables cannot reach k; infeasible candidates
/// are simply skipped by the caller. Ties resolve to the smallest left
/// budget.
fn best_split<S: Score>(a_tab: &[S], b_tab: &[S], k: usize) -> Option<(S, usize, usize)> {
    if a_tab.len() + b_tab.len() < k + 2 {
        return None;
    }
    let lo = (k + 1).saturating_sub(b_tab.len());
    let hi = k.min(a_tab.len() - 1);
    let mut best: Option<(S, usize, usize)> = None;
    for a in lo..=hi {
        let val = a_tab[a] + b_tab[k - a];
        if best.map_or(true, |(bv, _, _)| val > bv) {
            best = Some((val, a, k - a));
        }
    }
    best
}

/// A fully merged pair of tables: `score[k]` is the best achievable sum at
/// budget k, `split[k]` how it divides between the two inputs.
#[derive(Clone, Debug)]
struct Merged<S> {
    score: Vec<S>,
    split: Vec<(usize, usize)>,
}

fn merge<S: Score>(a_tab: &[S], b_tab: &[S]) -> Merged<S> {
    let len = a_tab.len() + b_tab.len() - 1;
    let mut score = Vec::with_capacity(len);
    let mut split = Vec::with_capacity(len);
    for k in 0..len {
        let (val, a, b) = best_split(a_tab, b_tab, k).expect("k within merged range");
        score.push(val);
        split.push((a, b));
    }
    Merged { score, split }
}

/// Per-anchor working state: path tables for every strict descendant.
struct AnchorTables<S> {
    /// Sibling accumulation excluding the first step below the anchor
    /// (that sibling is the cycle's other side for cross chords).
    cross_path: Vec<Option<Merged<S>>>,
    /// Sibling accumulation including the first step (one-sided cycles).
    down_path: Vec<Option<Merged<S>>>,
    /// cross_path[x] ⊕ scores[x]: everything a cross endpoint at x owns.
    cross_side: Vec<Option<Merged<S>>>,
    /// down_path[x] ⊕ scores[x]: everything a one-sided head at x owns.
    down_side: Vec<Option<Merged<S>>>,
    /// Strict descendants of the anchor, ascending (= preorder).
    desc: Vec<usize>,
    /// 0 = left child subtree, 1 = right.
    side: Vec<u8>,
}

impl<S: Score> AnchorTables<S> {
    fn build(td: &TreeData, v: usize, scores: &[Vec<S>]) -> AnchorTables<S> {
        let n = td.n_nodes();
        let [left, _] = td.children(v).expect("anchor is internal");
        let desc: Vec<usize> = (0..n).filter(|&x| td.under(v, x)).collect();
        let mut side = vec![0u8; n];
        let mut cross_path: Vec<Option<Merged<S>>> = vec![None; n];
        let mut down_path: Vec<Option<Merged<S>>> = vec![None; n];
        let mut cross_side: Vec<Option<Merged<S>>> = vec![None; n];
        let mut down_side: Vec<Option<Merged<S>>> = vec![None; n];

        // Ascending ids visit parents before children inside the subtree.
        for &x in &desc {
            let p = td.parent(x).expect("below anchor");
            let sib = td.sibling(x).expect("below anchor");
            side[x] = if x == left || td.under(left, x) { 0 } else { 1 };
            if p == v {
                cross_path[x] = Some(Merged {
                    score: vec![S::ZERO],
                    split: vec![(0, 0)],
                });
                down_path[x] = Some(Merged {
                    score: scores[sib].clone(),
                    split: (0..scores[sib].len()).map(|j| (0, j)).collect(),
                });
            } else {
                cross_path[x] = Some(merge(
                    &cross_path[p].as_ref().expect("parent visited").score,
                    &scores[sib],
                ));
                down_path[x] = Some(merge(
                    &down_path[p].as_ref().expect("parent visited").score,
                    &scores[sib],
                ));
            }
            cross_side[x] = Some(merge(&cross_path[x].as_ref().unwrap().score, &scores[x]));
            down_side[x] = Some(merge(&down_path[x].as_ref().unwrap().score, &scores[x]));
        }

        AnchorTables {
            cross_path,
            down_path,
            cross_side,
            down_side,
            desc,
            side,
        }
    }

    /// Unfolds a path allocation into (sibling, budget) pairs from the
    /// endpoint up to the anchor.
    fn resolve_path(
        &self,
        td: &TreeData,
        v: usize,
        endpoint: usize,
        budget: usize,
        one_sided: bool,
    ) -> Vec<(usize, usize)> {
        let paths = if one_sided { &self.down_path } else { &self.cross_path };
        let mut out = Vec::new();
        let mut x = endpoint;
        let mut j = budget;
        loop {
            let p = td.parent(x).expect("below anchor");
            if p == v && !one_sided {
                break; // seed row carries no sibling
            }
            let (up, sib_budget) = paths[x].as_ref().expect("path cell")[j];
            out.push((td.sibling(x).expect("below anchor"), sib_budget));
            if p == v {
                debug_assert_eq!(up, 0);
                break;
            }
            j = up;
            x = p;
        }
        out
    }
}

impl<S> std::ops::Index<usize> for Merged<S> {
    type Output = (usize, usize);
    fn index(&self, k: usize) -> &(usize, usize) {
        &self.split[k]
    }
}

/// One chord candidate at the current (anchor, budget).
#[derive(Clone, Copy)]
struct ChordChoice<S> {
    value: S,
    cycle_len: usize,
    tail: usize,
    head: usize,
    /// Budget into the endpoint side tables: (tail side, head side) for
    /// cross chords, (unused, head side) for one-sided ones.
    side_budgets: (usize, usize),
}

/// Runs the program bottom-up over the whole tree.
///
/// `edges` is the dense chord score table for the chosen mode. The result
/// is deterministic: candidate ties resolve by smaller cycle, then to the
/// later pair in ascending (tail, head) id order, and a no-chord split
/// beats chords that merely tie it.
pub fn run<S: Score>(
    td: &TreeData,
    edges: &[Vec<S>],
    cancel: Option<&AtomicBool>,
) -> Result<DpTables<S>> {
    let n = td.n_nodes();
    let mut scores: Vec<Vec<S>> = vec![Vec::new(); n];
    let mut traces: Vec<Vec<Trace>> = vec![Vec::new(); n];

    for &v in td.postorder() {
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(CamusError::Cancelled);
        }
        let Some([left, right]) = td.children(v) else {
            scores[v] = vec![S::ZERO];
            traces[v] = vec![Trace::Leaf];
            continue;
        };

        let tables = AnchorTables::build(td, v, &scores);
        let mut v_scores = vec![scores[left][0] + scores[right][0]];
        let mut v_traces = vec![Trace::NoCycle {
            left_k: 0,
            right_k: 0,
        }];

        for k in 1.. {
            assert!(
                k <= n,
                "budget {k} exceeded the node count at node {v}; the score \
                 sequence should have stopped growing"
            );
            let no_chord = best_split(&scores[left], &scores[right], k);
            let chord = best_chord(td, v, &tables, edges, k);

            let chord_wins = match (&chord, &no_chord) {
                (Some(c), Some((nv, _, _))) => c.value > *nv,
                (Some(_), None) => true,
                (None, _) => false,
            };

            let (value, trace) = if chord_wins {
                let c = chord.expect("chord_wins");
                (c.value, chord_trace(td, v, &tables, &c))
            } else if let Some((val, a, b)) = no_chord {
                (
                    val,
                    Trace::NoCycle {
                        left_k: a,
                        right_k: b,
                    },
                )
            } else {
                break; // no candidate can spend this budget
            };

            if !(value > v_scores[k - 1]) {
                break; // strict improvement or stop
            }
            v_scores.push(value);
            v_traces.push(trace);
        }

        scores[v] = v_scores;
        traces[v] = v_traces;
    }

    Ok(DpTables { scores, traces })
}

/// Best chord anchored at v for budget k, applying the tie rules.
fn best_chord<S: Score>(
    td: &TreeData,
    v: usize,
    tables: &AnchorTables<S>,
    edges: &[Vec<S>],
    k: usize,
) -> Option<ChordChoice<S>> {
    let sub_budget = k - 1;
    let mut best: Option<ChordChoice<S>> = None;
    let mut consider = |cand: ChordChoice<S>| {
        let replace = match &best {
            None => true,
            Some(b) => {
                cand.value > b.value || (cand.value == b.value && cand.cycle_len <= b.cycle_len)
            }
        };
        if replace {
            best = Some(cand);
        }
    };

    // One-sided chords first: the anchor id precedes every descendant id.
    if v != td.root() {
        for &w in &tables.desc {
            if !should_calc_edge(td, v, w) {
                continue;
            }
            let side = tables.down_side[w].as_ref().expect("descendant table");
            let Some(&sub) = side.score.get(sub_budget) else {
                continue;
            };
            consider(ChordChoice {
                value: edges[v][w] + sub,
                cycle_len: cycle_length(td, v, w),
                tail: v,
                head: w,
                side_budgets: (0, sub_budget),
            });
        }
    }

    for &u in &tables.desc {
        for &w in &tables.desc {
            if tables.side[u] == tables.side[w] || !should_calc_edge(td, u, w) {
                continue;
            }
            let u_side = tables.cross_side[u].as_ref().expect("descendant table");
            let w_side = tables.cross_side[w].as_ref().expect("descendant table");
            let Some((sub, a, b)) = best_split(&u_side.score, &w_side.score, sub_budget) else {
                continue;
            };
            consider(ChordChoice {
                value: edges[u][w] + sub,
                cycle_len: cycle_length(td, u, w),
                tail: u,
                head: w,
                side_budgets: (a, b),
            });
        }
    }
    best
}

/// Materializes the winning chord's trace, resolving path allocations.
fn chord_trace<S: Score>(
    td: &TreeData,
    v: usize,
    tables: &AnchorTables<S>,
    choice: &ChordChoice<S>,
) -> Trace {
    if choice.tail == v {
        let (path_budget, below) =
            tables.down_side[choice.head].as_ref().expect("head table")[choice.side_budgets.1];
        Trace::CycleDown {
            head: choice.head,
            path: tables.resolve_path(td, v, choice.head, path_budget, true),
            below,
        }
    } else {
        let (tail_path_budget, tail_below) =
            tables.cross_side[choice.tail].as_ref().expect("tail table")[choice.side_budgets.0];
        let (head_path_budget, head_below) =
            tables.cross_side[choice.head].as_ref().expect("head table")[choice.side_budgets.1];
        Trace::CycleCross {
            tail: choice.tail,
            head: choice.head,
            tail_path: tables.resolve_path(td, v, choice.tail, tail_path_budget, false),
            head_path: tables.resolve_path(td, v, choice.head, head_path_budget, false),
            tail_below,
            head_below,
        }
    }
}

/// Collects the chord set of the budget-k solution, outermost anchors
/// first (ascending anchor depth, then anchor, tail, head ids).
pub fn traceback<S: Score>(td: &TreeData, tables: &DpTables<S>, k: usize) -> Vec<ReticulationBranch> {
    let mut branches = Vec::new();
    let mut stack = vec![(td.root(), k)];
    while let Some((v, budget)) = stack.pop() {
        match &tables.traces[v][budget] {
            Trace::Leaf => {}
            Trace::NoCycle { left_k, right_k } => {
                let [l, r] = td.children(v).expect("internal trace");
                stack.push((l, *left_k));
                stack.push((r, *right_k));
            }
            Trace::CycleDown { head, path, below } => {
                branches.push(ReticulationBranch {
                    tail: v,
                    head: *head,
                    anchor: v,
                });
                stack.push((*head, *below));
                stack.extend(path.iter().copied());
            }
            Trace::CycleCross {
                tail,
                head,
                tail_path,
                head_path,
                tail_below,
                head_below,
            } => {
                branches.push(ReticulationBranch {
                    tail: *tail,
                    head: *head,
                    anchor: v,
                });
                stack.push((*tail, *tail_below));
                stack.push((*head, *head_below));
                stack.extend(tail_path.iter().copied());
                stack.extend(head_path.iter().copied());
            }
        }
    }
    branches.sort_by_key(|b| (td.depth(b.anchor), b.anchor, b.tail, b.head));
    branches
}
