//! Best-first search across the forest.
//!
//! One max-priority queue drives all trees at once. A node's key is the
//! smallest unsigned margin seen on the path from its root, negated on the
//! wrong side of each split, so the queue always expands the frontier node
//! with the best remaining guarantee. Roots enter at `+inf`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::metric::{Hyperplane, Metric};
use crate::store::StoreView;

/// Frontier entry: a node and the best-case margin of the path to it.
#[derive(Clone, Copy)]
struct Frontier {
    margin: f32,
    id: u32,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.margin == other.margin && self.id == other.id
    }
}
impl Eq for Frontier {}
impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.margin
            .partial_cmp(&other.margin)
            .unwrap_or(Ordering::Equal)
    }
}

/// Collect up to `search_k` candidate leaves across all trees, re-rank them
/// by true distance, and return the `n` best as `(id, internal distance)`
/// pairs in increasing distance order. `query` is in the stored
/// representation (bit-packed for Hamming).
pub(crate) fn nearest_neighbors<M: Metric>(
    view: &StoreView<'_>,
    roots: &[u32],
    n_items: u32,
    query: &[f32],
    n: usize,
    search_k: i32,
) -> Vec<(u32, f32)> {
    let k = view.layout().k() as i32;
    let search_k = if search_k < 0 {
        n.saturating_mul(roots.len())
    } else {
        search_k as usize
    };

    let mut queue: BinaryHeap<Frontier> = BinaryHeap::with_capacity(roots.len());
    for &root in roots {
        queue.push(Frontier { margin: f32::INFINITY, id: root });
    }

    let mut nns: Vec<u32> = Vec::with_capacity(search_k.min(1 << 20));
    while nns.len() < search_k {
        let Some(Frontier { margin, id }) = queue.pop() else {
            break;
        };
        let node = view.node(id);
        let nd = node.n_descendants();
        if nd == 1 && id < n_items {
            nns.push(id);
        } else if nd <= k {
            nns.extend_from_slice(node.descendants());
        } else {
            let plane = Hyperplane::from_split::<M>(&node);
            let mu = M::margin(&plane, query);
            queue.push(Frontier { margin: margin.min(mu), id: node.child(1) });
            queue.push(Frontier { margin: margin.min(-mu), id: node.child(0) });
        }
    }

    // Sort by id so duplicates collapse and each distance is computed once.
    nns.sort_unstable();
    let mut ranked: Vec<(f32, u32)> = Vec::with_capacity(nns.len());
    let mut last = None;
    for &j in &nns {
        if Some(j) == last {
            continue;
        }
        last = Some(j);
        let node = view.node(j);
        // Descriptor tails of sparse roots can surface hole ids; skip them.
        if node.n_descendants() != 1 {
            continue;
        }
        ranked.push((M::distance(query, node.vector()), j));
    }

    ranked.sort_unstable_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    ranked.truncate(n);
    ranked.into_iter().map(|(d, id)| (id, d)).collect()
}
