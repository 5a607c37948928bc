//! Quartet ingestion: from gene trees to a weighted canonical multiset.
//!
//! # Overview
//! A quartet is four taxa plus one of the three unrooted topologies on
//! them. Gene trees are enumerated in parallel; every resolved induced
//! quartet is canonicalized and accumulated into a sharded map. A final
//! sequential pass applies the optional per-taxa-set filter and removes
//! every quartet the constraint tree itself displays — only quartets a
//! reticulation could newly explain stay in the store.
//!
//! # Canonical form
//! Taxa ascend; the 4-bit mask marks the side each position sits on,
//! flipped so position 0 is always on the clear side. Exactly three masks
//! survive: `0b1100` (AB|CD), `0b1010` (AC|BD), `0b0110` (AD|BC).

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use itertools::Itertools;
use phylotree::tree::Tree as PhyloTree;

use crate::errors::{CamusError, Result};
use crate::tree::TreeData;

/// Number of accumulator shards (low bits of the canonical quartet hash).
const SHARD_BITS: u32 = 6;

/// An unordered four-set of taxa with a canonical topology mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quartet {
    /// Taxon ids in strictly ascending order.
    pub taxa: [u16; 4],
    /// Canonical side mask; bit i gives the side of `taxa[i]`.
    pub mask: u8,
}

impl Quartet {
    /// Builds the canonical quartet for the split `{a0,a1} | {b0,b1}`.
    pub fn from_split(a: [u16; 2], b: [u16; 2]) -> Quartet {
        let mut members = [(a[0], true), (a[1], true), (b[0], false), (b[1], false)];
        members.sort_unstable_by_key(|&(t, _)| t);
        let taxa = members.map(|(t, _)| t);
        let mut mask = 0u8;
        for (i, &(_, first_side)) in members.iter().enumerate() {
            if first_side {
                mask |= 1 << i;
            }
        }
        Quartet {
            taxa,
            mask: Self::normalize_mask(mask),
        }
    }

    /// Flips a side mask so position 0 lies on the clear side.
    ///
    /// Panics on masks that do not describe a 2|2 split; those cannot
    /// arise from a well-formed quartet and indicate a bug.
    pub fn normalize_mask(mask: u8) -> u8 {
        let mask = if mask & 1 == 1 { mask ^ 0b1111 } else { mask };
        assert!(
            matches!(mask, 0b1100 | 0b1010 | 0b0110),
            "degenerate quartet mask {mask:#06b}"
        );
        mask
    }

    /// Position (0..4) of `taxon`, if it belongs to this quartet.
    pub fn position_of(&self, taxon: u16) -> Option<usize> {
        self.taxa.iter().position(|&t| t == taxon)
    }

    /// The position sharing `pos`'s side of the topology.
    pub fn partner(&self, pos: usize) -> usize {
        let side = self.mask >> pos & 1;
        (0..4)
            .find(|&p| p != pos && (self.mask >> p & 1) == side)
            .expect("canonical masks split 2|2")
    }
}

/// Per-taxa-set filter applied after all gene trees are ingested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuartetFilter {
    /// Keep everything (mode 0).
    Off,
    /// Keep the taxa-set only when dominance clears the threshold, then
    /// drop its minimum topology (mode 1).
    DropMin,
    /// Keep the taxa-set only when dominance clears the threshold, then
    /// keep only its maximum topology (mode 2).
    KeepMax,
}

/// Ingestion options; defaults match the CLI defaults.
#[derive(Clone, Debug)]
pub struct QuartetOptions {
    pub filter: QuartetFilter,
    /// Dominance threshold θ ∈ [0,1] for the filter.
    pub threshold: f64,
    /// Count each (gene tree, taxa set) once instead of per central-path edge.
    pub as_set: bool,
    /// Collapse gene-tree edges whose support label parses below this.
    pub collapse_below: Option<f64>,
}

impl Default for QuartetOptions {
    fn default() -> Self {
        QuartetOptions {
            filter: QuartetFilter::Off,
            threshold: 0.5,
            as_set: false,
            collapse_below: None,
        }
    }
}

/// The finished weighted quartet multiset, in a deterministic order.
#[derive(Clone, Debug)]
pub struct QuartetStore {
    quartets: Vec<Quartet>,
    weights: Vec<u64>,
    /// Gene trees ingested (the `norm` score denominator).
    pub n_gene_trees: usize,
    /// Post-filter weight including constraint-displayed quartets.
    pub total_weight: u64,
    /// Weight of gene quartets the constraint tree already displays.
    pub displayed_weight: u64,
    /// Whether any gene tree omitted constraint taxa.
    pub omitted_taxa: bool,
}

impl QuartetStore {
    /// Ingests all gene trees in parallel and finalizes the store.
    pub fn from_gene_trees(
        td: &TreeData,
        gene_trees: &[PhyloTree],
        opts: &QuartetOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<QuartetStore> {
        let shards: Vec<Mutex<HashMap<Quartet, u64>>> = (0..1usize << SHARD_BITS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        let omitted = AtomicBool::new(false);

        gene_trees.iter().try_for_each(|gene| -> Result<()> {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(CamusError::Cancelled);
            }
            let view = GeneTree::from_tree(gene, td, opts.collapse_below)?;
            if view.omitted_taxa {
                omitted.store(true, Ordering::Relaxed);
            }
            for (quartet, weight) in view.quartets(opts.as_set) {
                let mut shard = shards[shard_of(&quartet)].lock().expect("shard lock");
                *shard.entry(quartet).or_insert(0) += weight;
            }
            Ok(())
        })?;

        // Sequential merge into one sorted list; same taxa sets end up
        // adjacent, which is what the filter groups over.
        let mut entries: Vec<(Quartet, u64)> = shards
            .into_iter()
            .flat_map(|s| s.into_inner().expect("shard lock"))
            .collect();
        entries.sort_unstable();

        let entries = match opts.filter {
            QuartetFilter::Off => entries,
            mode => apply_filter(entries, mode, opts.threshold),
        };

        // Finishing pass: quartets the constraint tree displays are not
        // evidence for any reticulation; their weight becomes the baseline.
        let mut quartets = Vec::new();
        let mut weights = Vec::new();
        let mut displayed_weight = 0u64;
        let mut total_weight = 0u64;
        for (q, w) in entries {
            total_weight += w;
            if td.induced_topology(q.taxa) == q.mask {
                displayed_weight += w;
            } else {
                quartets.push(q);
                weights.push(w);
            }
        }

        Ok(QuartetStore {
            quartets,
            weights,
            n_gene_trees: gene_trees.len(),
            total_weight,
            displayed_weight,
            omitted_taxa: omitted.load(Ordering::Relaxed),
        })
    }

    pub fn len(&self) -> usize {
        self.quartets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quartets.is_empty()
    }

    pub fn quartets(&self) -> &[Quartet] {
        &self.quartets
    }

    pub fn weight(&self, idx: usize) -> u64 {
        self.weights[idx]
    }
}

fn shard_of(q: &Quartet) -> usize {
    let mut hasher = DefaultHasher::new();
    q.hash(&mut hasher);
    (hasher.finish() & ((1 << SHARD_BITS) - 1)) as usize
}

const LEGAL_MASKS: [u8; 3] = [0b1100, 0b1010, 0b0110];

/// Dominance filter over sorted entries: for each taxa set with topology
/// counts c₁ ≤ c₂ ≤ c₃, keep only if `c₃ − c₂ > θ·(c₃ + c₂)` (ties at the
/// cutoff drop everything); kept sets then lose their minimum topology
/// (mode 1, smallest mask on count ties) or everything but the maximum
/// (mode 2).
fn apply_filter(entries: Vec<(Quartet, u64)>, mode: QuartetFilter, theta: f64) -> Vec<(Quartet, u64)> {
    let mut out = Vec::with_capacity(entries.len());
    let mut group_start = 0;
    while group_start < entries.len() {
        let taxa = entries[group_start].0.taxa;
        let mut group_end = group_start + 1;
        while group_end < entries.len() && entries[group_end].0.taxa == taxa {
            group_end += 1;
        }
        let group = &entries[group_start..group_end];

        let count_of = |mask: u8| -> u64 {
            group
                .iter()
                .find(|(q, _)| q.mask == mask)
                .map_or(0, |&(_, w)| w)
        };
        let mut counts: Vec<u64> = LEGAL_MASKS.iter().map(|&m| count_of(m)).collect();
        counts.sort_unstable();
        let (c2, c3) = (counts[1] as f64, counts[2] as f64);
        if c3 - c2 > theta * (c3 + c2) {
            match mode {
                QuartetFilter::DropMin => {
                    let min_count = counts[0];
                    let min_mask = LEGAL_MASKS
                        .iter()
                        .copied()
                        .filter(|&m| count_of(m) == min_count)
                        .min()
                        .expect("three legal masks");
                    out.extend(group.iter().copied().filter(|(q, _)| q.mask != min_mask));
                }
                QuartetFilter::KeepMax => {
                    let max_mask = LEGAL_MASKS
                        .iter()
                        .copied()
                        .max_by_key(|&m| count_of(m))
                        .expect("three legal masks");
                    out.extend(group.iter().copied().filter(|(q, _)| q.mask == max_mask));
                }
                QuartetFilter::Off => unreachable!("filter disabled"),
            }
        }
        group_start = group_end;
    }
    out
}

/// A single gene tree indexed for quartet extraction.
///
/// Gene trees may be non-binary and may omit constraint taxa; node ids are
/// local. Support-collapsed nodes are skipped entirely: their children
/// hang from the nearest retained ancestor.
pub struct GeneTree {
    parent: Vec<Option<usize>>,
    depth: Vec<usize>,
    /// (local node id, constraint taxon id) per leaf.
    leaves: Vec<(usize, u16)>,
    root_degree: usize,
    pub omitted_taxa: bool,
}

impl GeneTree {
    pub fn from_tree(
        tree: &PhyloTree,
        td: &TreeData,
        collapse_below: Option<f64>,
    ) -> Result<GeneTree> {
        let root = tree.get_root()?;
        let mut parent: Vec<Option<usize>> = Vec::new();
        let mut depth: Vec<usize> = Vec::new();
        let mut leaves: Vec<(usize, u16)> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut root_degree = 0usize;

        // (phylotree id, retained parent). Collapsed internals re-parent
        // their children instead of becoming arena nodes.
        let mut stack: Vec<(usize, Option<usize>)> = vec![(root, None)];
        while let Some((pid, par)) = stack.pop() {
            let node = tree.get(&pid)?;
            let is_leaf = node.children.is_empty();
            let collapsed = !is_leaf
                && par.is_some()
                && collapse_below.is_some_and(|thr| {
                    node.name
                        .as_deref()
                        .and_then(|n| n.parse::<f64>().ok())
                        .is_some_and(|support| support < thr)
                });

            let attach = if collapsed {
                par
            } else {
                let id = parent.len();
                parent.push(par);
                depth.push(par.map_or(0, |p| depth[p] + 1));
                if par == Some(0) {
                    root_degree += 1;
                }
                if is_leaf {
                    let name = node
                        .name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| {
                            CamusError::InvalidFormat("gene tree has an unlabeled tip".into())
                        })?;
                    if !seen.insert(name.clone()) {
                        return Err(CamusError::MulTree(name));
                    }
                    let taxon = td
                        .taxon_id(&name)
                        .ok_or(CamusError::TipMismatch(name))?;
                    leaves.push((id, taxon));
                }
                Some(id)
            };

            for &child in node.children.iter().rev() {
                stack.push((child, attach));
            }
        }

        let omitted_taxa = leaves.len() < td.n_taxa();
        Ok(GeneTree {
            parent,
            depth,
            leaves,
            root_degree,
            omitted_taxa,
        })
    }

    fn lca(&self, mut a: usize, mut b: usize) -> usize {
        while self.depth[a] > self.depth[b] {
            a = self.parent[a].expect("depth > 0 has a parent");
        }
        while self.depth[b] > self.depth[a] {
            b = self.parent[b].expect("depth > 0 has a parent");
        }
        while a != b {
            a = self.parent[a].expect("distinct nodes meet below the root");
            b = self.parent[b].expect("distinct nodes meet below the root");
        }
        a
    }

    fn is_under(&self, anc: usize, mut node: usize) -> bool {
        while self.depth[node] > self.depth[anc] {
            node = self.parent[node].expect("depth > 0 has a parent");
        }
        node == anc
    }

    /// Deepest pairwise join of three nodes: where their paths meet.
    fn median(&self, a: usize, b: usize, c: usize) -> usize {
        [self.lca(a, b), self.lca(a, c), self.lca(b, c)]
            .into_iter()
            .max_by_key(|&m| self.depth[m])
            .expect("three candidates")
    }

    /// All resolved induced quartets with their weights.
    ///
    /// A four-set resolves iff the deepest pairwise join covers exactly two
    /// of its leaves (the cherry); multifurcation stars are skipped. The
    /// default weight is the number of unrooted edges on the quartet's
    /// central path (a degree-2 root is suppressed); `as_set` flattens each
    /// occurrence to 1.
    pub fn quartets(&self, as_set: bool) -> Vec<(Quartet, u64)> {
        let mut out = Vec::new();
        for combo in (0..self.leaves.len()).combinations(4) {
            let mut members: Vec<(u16, usize)> =
                combo.iter().map(|&i| (self.leaves[i].1, self.leaves[i].0)).collect();
            members.sort_unstable_by_key(|&(t, _)| t);
            let nodes: Vec<usize> = members.iter().map(|&(_, n)| n).collect();

            let mut deepest = (0usize, 0usize, 0usize); // (i, j, join)
            let mut best_depth = None;
            for i in 0..4 {
                for j in (i + 1)..4 {
                    let m = self.lca(nodes[i], nodes[j]);
                    if best_depth.is_none_or(|d| self.depth[m] > d) {
                        best_depth = Some(self.depth[m]);
                        deepest = (i, j, m);
                    }
                }
            }
            let (ci, cj, join) = deepest;
            let covered = nodes.iter().filter(|&&n| self.is_under(join, n)).count();
            if covered != 2 {
                continue; // unresolved (star) quartet
            }

            let taxa = [members[0].0, members[1].0, members[2].0, members[3].0];
            let mask = Quartet::normalize_mask((1u8 << ci) | (1u8 << cj));
            let quartet = Quartet { taxa, mask };

            let weight = if as_set {
                1
            } else {
                // Central path: from the cherry join to where the other two
                // leaves' paths meet, in unrooted edges.
                let (oi, oj): (usize, usize) = match (ci, cj) {
                    (0, 1) => (2, 3),
                    (0, 2) => (1, 3),
                    (0, 3) => (1, 2),
                    (1, 2) => (0, 3),
                    (1, 3) => (0, 2),
                    _ => (0, 1),
                };
                let other_join = self.median(nodes[oi], nodes[oj], nodes[ci]);
                let meet = self.lca(join, other_join);
                let mut edges =
                    self.depth[join] + self.depth[other_join] - 2 * self.depth[meet];
                if meet == 0 && join != 0 && other_join != 0 && self.root_degree == 2 {
                    edges -= 1;
                }
                edges as u64
            };
            out.push((quartet, weight));
        }
        out
    }
}
