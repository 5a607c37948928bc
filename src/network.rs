//! Network assembly: chord branches to extended newick, and back.
//!
//! # Overview
//! A reticulation branch (tail u, head w) materializes as two new nodes:
//! one subdividing the tail's parent edge carrying a fresh tip labeled
//! `#H<i>`, and one subdividing the head's parent edge that itself takes
//! the `#H<i>` label. Branches are grafted outermost-first so that, when a
//! head and a deeper tail land on the same original edge, the head ends up
//! above the tail and the two cycles stay node-disjoint.
//!
//! The reverse direction re-pairs `#H` labels, strips them out, and
//! rebuilds the constraint tree plus branch ids — used by the `score`
//! command and by round-trip checks.

use phylotree::tree::Tree as PhyloTree;

use crate::dp::ReticulationBranch;
use crate::errors::{CamusError, Result};
use crate::scorer::should_calc_edge;
use crate::tree::TreeData;

/// Lightweight mutable node for grafting and serialization.
#[derive(Clone, Debug)]
struct NetNode {
    label: Option<String>,
    children: Vec<usize>,
}

/// Serializes the constraint tree with the given branches grafted in.
///
/// Branches must be ordered outermost-first (as [`crate::dp::traceback`]
/// returns them); `#H` indices follow that order. Branch lengths and
/// support values are dropped.
pub fn to_extended_newick(td: &TreeData, branches: &[ReticulationBranch]) -> String {
    // Mirror of the arena; indices below td.n_nodes() match TreeData ids.
    let mut nodes: Vec<NetNode> = (0..td.n_nodes())
        .map(|v| NetNode {
            label: td.taxon_of(v).map(|t| td.taxon_name(t).to_string()),
            children: td.children(v).map_or_else(Vec::new, |c| c.to_vec()),
        })
        .collect();
    let mut parent: Vec<Option<usize>> = (0..td.n_nodes()).map(|v| td.parent(v)).collect();

    for (i, branch) in branches.iter().enumerate() {
        let label = format!("#H{i}");

        // Tail side: a new node on the tail's parent edge, reticulation
        // tip in the first child slot.
        let tip = nodes.len();
        nodes.push(NetNode {
            label: Some(label.clone()),
            children: Vec::new(),
        });
        parent.push(None);
        let mid = nodes.len();
        nodes.push(NetNode {
            label: None,
            children: vec![tip, branch.tail],
        });
        parent.push(None);
        splice_above(&mut nodes, &mut parent, branch.tail, mid);
        parent[tip] = Some(mid);

        // Head side: a new node on the head's parent edge, carrying the
        // reticulation label itself.
        let hd = nodes.len();
        nodes.push(NetNode {
            label: Some(label),
            children: vec![branch.head],
        });
        parent.push(None);
        splice_above(&mut nodes, &mut parent, branch.head, hd);
    }

    let mut out = String::new();
    write_newick(&nodes, 0, &mut out);
    out.push(';');
    out
}

/// Replaces `node` with `fresh` in its parent's child slot and hangs
/// `node` under `fresh` instead.
fn splice_above(
    nodes: &mut [NetNode],
    parent: &mut [Option<usize>],
    node: usize,
    fresh: usize,
) {
    let p = parent[node].expect("chord endpoints hang below the root");
    let slot = nodes[p]
        .children
        .iter()
        .position(|&c| c == node)
        .expect("child slot");
    nodes[p].children[slot] = fresh;
    parent[fresh] = Some(p);
    parent[node] = Some(fresh);
}

fn write_newick(nodes: &[NetNode], v: usize, out: &mut String) {
    if !nodes[v].children.is_empty() {
        out.push('(');
        for (i, &c) in nodes[v].children.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_newick(nodes, c, out);
        }
        out.push(')');
    }
    if let Some(label) = &nodes[v].label {
        out.push_str(label);
    }
}

/// A network taken apart again: the bare constraint tree and the branches
/// in `#H` index order.
#[derive(Debug)]
pub struct ParsedNetwork {
    pub tree: TreeData,
    /// The constraint tree's plain newick (labels only).
    pub constraint_newick: String,
    pub branches: Vec<ReticulationBranch>,
}

/// Parses an extended-newick network produced by [`to_extended_newick`].
///
/// # Errors
/// - [`CamusError::NoReticulations`] when no `#H` label occurs.
/// - [`CamusError::InvalidFile`] on unpaired or malformed `#H` labels.
/// - [`CamusError::NotLevel1`] when two cycles share a tree node.
/// - Shape errors from [`TreeData::from_tree`] on the stripped tree.
pub fn parse_extended_newick(newick: &str) -> Result<ParsedNetwork> {
    let parsed = PhyloTree::from_newick(newick.trim())
        .map_err(|e| CamusError::InvalidFormat(format!("network: {e}")))?;
    let root = parsed.get_root()?;

    let mut nodes: Vec<NetNode> = Vec::new();
    let mut ends: Vec<(usize, Option<usize>, Option<usize>)> = Vec::new(); // (#H idx, tail, head)

    let cleaned_root = strip_reticulations(&parsed, root, &mut nodes, &mut ends)?
        .ok_or_else(|| CamusError::InvalidFile("network reduces to nothing".into()))?;
    if ends.is_empty() {
        return Err(CamusError::NoReticulations);
    }

    let mut constraint_newick = String::new();
    write_newick(&nodes, cleaned_root, &mut constraint_newick);
    constraint_newick.push(';');

    let stripped = PhyloTree::from_newick(&constraint_newick)
        .map_err(|e| CamusError::InvalidFormat(format!("stripped network: {e}")))?;
    let tree = TreeData::from_tree(&stripped)?;

    // Both the cleaned arena and TreeData number nodes in preorder with
    // identical child order, so positions map one-to-one.
    let mut preorder_of = vec![usize::MAX; nodes.len()];
    let mut stack = vec![cleaned_root];
    let mut next = 0usize;
    while let Some(v) = stack.pop() {
        preorder_of[v] = next;
        next += 1;
        for &c in nodes[v].children.iter().rev() {
            stack.push(c);
        }
    }

    ends.sort_by_key(|&(idx, _, _)| idx);
    let mut branches = Vec::with_capacity(ends.len());
    for (idx, tail, head) in ends {
        let (Some(tail), Some(head)) = (tail, head) else {
            return Err(CamusError::InvalidFile(format!(
                "reticulation #H{idx} lacks a tail or head attachment"
            )));
        };
        let (tail, head) = (preorder_of[tail], preorder_of[head]);
        if !should_calc_edge(&tree, tail, head) {
            return Err(CamusError::InvalidFile(format!(
                "reticulation #H{idx} does not describe a valid chord"
            )));
        }
        branches.push(ReticulationBranch {
            tail,
            head,
            anchor: tree.lca(tail, head),
        });
    }

    validate_level1(&tree, &branches)?;
    Ok(ParsedNetwork {
        tree,
        constraint_newick,
        branches,
    })
}

/// Copies the subtree below `pid` into `nodes`, dropping reticulation
/// tips, suppressing the nodes that carried them, and recording the
/// attachment points. Returns the cleaned id, or `None` for a dropped tip.
fn strip_reticulations(
    parsed: &PhyloTree,
    pid: usize,
    nodes: &mut Vec<NetNode>,
    ends: &mut Vec<(usize, Option<usize>, Option<usize>)>,
) -> Result<Option<usize>> {
    let node = parsed.get(&pid)?;
    let label = node.name.clone().filter(|n| !n.is_empty());
    let hybrid = label.as_deref().and_then(hybrid_index);

    if node.children.is_empty() {
        if let Some(idx) = hybrid {
            // Reticulation tips are consumed by their parent; reaching one
            // here means it stood alone at the top of the input.
            return Err(CamusError::InvalidFile(format!(
                "reticulation #H{idx} tip is not attached to an edge"
            )));
        }
        nodes.push(NetNode {
            label,
            children: Vec::new(),
        });
        return Ok(Some(nodes.len() - 1));
    }

    let mut kept = Vec::new();
    let mut dropped_tips = Vec::new();
    for &child in &node.children {
        let child_node = parsed.get(&child)?;
        let child_hybrid = child_node
            .name
            .as_deref()
            .and_then(hybrid_index)
            .filter(|_| child_node.children.is_empty());
        if let Some(idx) = child_hybrid {
            dropped_tips.push(idx);
        } else if let Some(id) = strip_reticulations(parsed, child, nodes, ends)? {
            kept.push(id);
        }
    }

    if let Some(idx) = hybrid {
        // Head marker: a labeled unary node above the head subtree.
        if kept.len() != 1 || !dropped_tips.is_empty() {
            return Err(CamusError::InvalidFile(format!(
                "reticulation #H{idx} head does not wrap a single subtree"
            )));
        }
        let slot = slot_for(ends, idx);
        if slot.2.is_some() {
            return Err(CamusError::InvalidFile(format!(
                "reticulation #H{idx} appears as head more than once"
            )));
        }
        slot.2 = Some(kept[0]);
        return Ok(Some(kept[0]));
    }

    if !dropped_tips.is_empty() {
        // Tail subdivision node: exactly one sibling subtree remains.
        if kept.len() != 1 {
            return Err(CamusError::InvalidFile(
                "reticulation tail is not attached to a single edge".into(),
            ));
        }
        for idx in dropped_tips {
            let slot = slot_for(ends, idx);
            if slot.1.is_some() {
                return Err(CamusError::InvalidFile(format!(
                    "reticulation #H{idx} appears as tail more than once"
                )));
            }
            slot.1 = Some(kept[0]);
        }
        return Ok(Some(kept[0]));
    }

    match kept.len() {
        0 => Err(CamusError::InvalidFile(
            "internal node lost all of its children".into(),
        )),
        1 => Ok(Some(kept[0])), // suppress pass-through nodes
        _ => {
            nodes.push(NetNode {
                label: None,
                children: kept,
            });
            Ok(Some(nodes.len() - 1))
        }
    }
}

fn slot_for(
    ends: &mut Vec<(usize, Option<usize>, Option<usize>)>,
    idx: usize,
) -> &mut (usize, Option<usize>, Option<usize>) {
    if let Some(pos) = ends.iter().position(|&(i, _, _)| i == idx) {
        &mut ends[pos]
    } else {
        ends.push((idx, None, None));
        ends.last_mut().expect("just pushed")
    }
}

/// `#H<i>` labels mark reticulations.
fn hybrid_index(label: &str) -> Option<usize> {
    label.strip_prefix("#H")?.parse().ok()
}

/// Tree nodes on the cycle a branch closes: the paths from both endpoints
/// up to and including the anchor.
fn cycle_nodes(td: &TreeData, branch: &ReticulationBranch) -> Vec<usize> {
    let mut out = vec![branch.anchor];
    for mut x in [branch.tail, branch.head] {
        while x != branch.anchor {
            out.push(x);
            x = td.parent(x).expect("endpoint below anchor");
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Rejects branch sets whose cycles share a tree node.
pub fn validate_level1(td: &TreeData, branches: &[ReticulationBranch]) -> Result<()> {
    let cycles: Vec<Vec<usize>> = branches.iter().map(|b| cycle_nodes(td, b)).collect();
    for i in 0..cycles.len() {
        for j in (i + 1)..cycles.len() {
            if cycles[i].iter().any(|n| cycles[j].binary_search(n).is_ok()) {
                return Err(CamusError::NotLevel1(i, j));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn treedata(newick: &str) -> TreeData {
        TreeData::from_tree(&PhyloTree::from_newick(newick).unwrap()).unwrap()
    }

    fn tip(td: &TreeData, name: &str) -> usize {
        td.tip_node(td.taxon_id(name).unwrap())
    }

    fn branch(td: &TreeData, tail: usize, head: usize) -> ReticulationBranch {
        ReticulationBranch {
            tail,
            head,
            anchor: td.lca(tail, head),
        }
    }

    #[test]
    fn grafts_single_cross_chord() {
        let td = treedata("(A,(B,(C,(D,(E,(F,(G,(H,(I,J)))))))));");
        let br = branch(&td, tip(&td, "D"), tip(&td, "C"));
        assert_eq!(
            to_extended_newick(&td, &[br]),
            "(A,(B,((C)#H0,((#H0,D),(E,(F,(G,(H,(I,J)))))))));"
        );
    }

    #[test]
    fn grafts_one_sided_chord() {
        let td = treedata("((((A,B),C),D),E);");
        let y = td.children(td.root()).unwrap()[0];
        let br = branch(&td, y, tip(&td, "A"));
        assert_eq!(
            to_extended_newick(&td, &[br]),
            "((#H0,((((A)#H0,B),C),D)),E);"
        );
    }

    #[test]
    fn grafts_two_disjoint_chords() {
        let td = treedata("((A,((((B,C),D),E),F)),(G,H));");
        let outer = branch(&td, tip(&td, "H"), tip(&td, "A"));
        let inner = branch(&td, tip(&td, "D"), tip(&td, "C"));
        assert_eq!(
            to_extended_newick(&td, &[outer, inner]),
            "(((A)#H0,((((B,(C)#H1),(#H1,D)),E),F)),(G,(#H0,H)));"
        );
    }

    #[test]
    fn parse_round_trips() {
        let td = treedata("((A,((((B,C),D),E),F)),(G,H));");
        let branches = vec![
            branch(&td, tip(&td, "H"), tip(&td, "A")),
            branch(&td, tip(&td, "D"), tip(&td, "C")),
        ];
        let emitted = to_extended_newick(&td, &branches);
        let parsed = parse_extended_newick(&emitted).unwrap();
        assert_eq!(parsed.tree, td);
        assert_eq!(parsed.constraint_newick, "((A,((((B,C),D),E),F)),(G,H));");
        assert_eq!(parsed.branches, branches);
        // emitting the parsed form reproduces the string
        assert_eq!(to_extended_newick(&parsed.tree, &parsed.branches), emitted);
    }

    #[test]
    fn plain_trees_have_no_reticulations() {
        assert!(matches!(
            parse_extended_newick("((A,B),(C,D));"),
            Err(CamusError::NoReticulations)
        ));
    }

    #[test]
    fn unpaired_labels_are_rejected() {
        // head marker without a matching tail tip
        assert!(matches!(
            parse_extended_newick("(((A)#H0,B),(C,D));"),
            Err(CamusError::InvalidFile(_))
        ));
        // tail tip without a head
        assert!(matches!(
            parse_extended_newick("(((#H0,A),B),(C,D));"),
            Err(CamusError::InvalidFile(_))
        ));
    }

    #[test]
    fn overlapping_cycles_are_rejected() {
        let td = treedata("(A,(B,(C,(D,(E,F)))));");
        let (c, d, e) = (tip(&td, "C"), tip(&td, "D"), tip(&td, "E"));
        // both cycles run through lca(D,E)'s parent region
        let one = branch(&td, d, c);
        let two = branch(&td, e, c);
        assert!(matches!(
            validate_level1(&td, &[one, two]),
            Err(CamusError::NotLevel1(0, 1))
        ));
        let emitted = to_extended_newick(&td, &[one, two]);
        assert!(matches!(
            parse_extended_newick(&emitted),
            Err(CamusError::NotLevel1(0, 1))
        ));
    }

    #[test]
    fn disjoint_cycles_validate() {
        let td = treedata("((A,((((B,C),D),E),F)),(G,H));");
        let branches = vec![
            branch(&td, tip(&td, "H"), tip(&td, "A")),
            branch(&td, tip(&td, "D"), tip(&td, "C")),
        ];
        assert!(validate_level1(&td, &branches).is_ok());
    }
}
