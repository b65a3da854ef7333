//! Forest construction.
//!
//! One tree is built top-down by recursively splitting the working set until
//! it fits in a descriptor node. Node ids are assigned in post-order
//! (children before parent), and the split is staged in a scratch plane and
//! only written once both subtrees exist, so a worker's partially built
//! subtree is never reachable from the shared store.
//!
//! The forest build runs one task per worker on a dedicated thread pool;
//! worker `t` owns a deterministic RNG substream and a fixed share of the
//! requested trees, so the same seed and worker count reproduce the same
//! forest.

use std::marker::PhantomData;

use rayon::prelude::*;

use crate::metric::{Metric, SplitPlane};
use crate::node::NodeRef;
use crate::random::Kiss64;
use crate::store::{NodeStore, StoreView};
use crate::{ArborError, Result};

/// Upper bound on the number of working-set members handed to `create_split`.
const SPLIT_SAMPLE: usize = 1000;
/// Hyperplane attempts before falling back to random side assignment.
const SPLIT_ATTEMPTS: usize = 3;
/// A split sending more than this share of the set to one side is degenerate.
const DEGENERATE_IMBALANCE: f64 = 0.95;

/// Build the requested number of trees (`-1` = until the store holds twice
/// as many nodes as items) and return the root ids in build order.
pub(crate) fn build_forest<M: Metric>(
    store: &NodeStore,
    n_items: u32,
    seed: u64,
    n_trees: i32,
    n_workers: usize,
) -> Result<Vec<u32>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_workers)
        .build()
        .map_err(|e| ArborError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let per_worker: Vec<Result<Vec<u32>>> = pool.install(|| {
        (0..n_workers)
            .into_par_iter()
            .map(|w| build_worker::<M>(store, n_items, seed, n_trees, w, n_workers))
            .collect()
    });

    // Concatenate in worker order so the roots list does not depend on
    // scheduling.
    let mut roots = Vec::new();
    for worker_roots in per_worker {
        roots.extend(worker_roots?);
    }
    Ok(roots)
}

fn build_worker<M: Metric>(
    store: &NodeStore,
    n_items: u32,
    seed: u64,
    n_trees: i32,
    worker: usize,
    n_workers: usize,
) -> Result<Vec<u32>> {
    let mut rng = Kiss64::substream(seed, worker);
    let quota = if n_trees > 0 {
        let q = n_trees as usize;
        q / n_workers + usize::from(worker < q % n_workers)
    } else {
        usize::MAX
    };

    let mut roots = Vec::new();
    while roots.len() < quota {
        if n_trees == -1 && store.n_nodes() >= 2 * n_items as usize {
            break;
        }
        let indices: Vec<u32> = {
            let view = store.view();
            (0..n_items)
                .filter(|&i| view.node(i).n_descendants() >= 1)
                .collect()
        };
        tracing::debug!(worker, pass = roots.len(), "building tree");
        let root = TreeBuilder::<M>::new(store, n_items, &mut rng).make_tree(&indices, true)?;
        roots.push(root);
    }
    Ok(roots)
}

pub(crate) struct TreeBuilder<'a, M: Metric> {
    store: &'a NodeStore,
    n_items: u32,
    rng: &'a mut Kiss64,
    _metric: PhantomData<M>,
}

impl<'a, M: Metric> TreeBuilder<'a, M> {
    pub(crate) fn new(store: &'a NodeStore, n_items: u32, rng: &'a mut Kiss64) -> Self {
        TreeBuilder { store, n_items, rng, _metric: PhantomData }
    }

    pub(crate) fn make_tree(&mut self, indices: &[u32], is_root: bool) -> Result<u32> {
        let layout = self.store.layout();
        let k = layout.k();

        if indices.len() == 1 && !is_root {
            return Ok(indices[0]);
        }

        if indices.len() <= k
            && (!is_root || self.n_items as usize <= k || indices.len() == 1)
        {
            let id = self.store.alloc()?;
            let view = self.store.view();
            // Safety: freshly issued id, exclusive to this worker.
            let mut node = unsafe { view.node_mut(id) };
            node.set_n_descendants(if is_root {
                self.n_items as i32
            } else {
                indices.len() as i32
            });
            node.set_descendants(indices);
            return Ok(id);
        }

        let mut plane = SplitPlane::zeroed(layout.f());
        let mut sides: [Vec<u32>; 2] = [Vec::new(), Vec::new()];
        {
            let view = self.store.view();
            let sample_ids: Vec<u32> = if indices.len() > SPLIT_SAMPLE {
                (0..SPLIT_SAMPLE)
                    .map(|_| indices[self.rng.index(indices.len())])
                    .collect()
            } else {
                indices.to_vec()
            };
            let sample: Vec<NodeRef<'_>> =
                sample_ids.iter().map(|&i| view.node(i)).collect();

            let mut attempt = 0;
            loop {
                plane = M::create_split(&sample, layout.f(), self.rng);
                self.partition(&view, &plane, indices, &mut sides);
                attempt += 1;
                if attempt >= SPLIT_ATTEMPTS
                    || split_imbalance(sides[0].len(), sides[1].len()) <= DEGENERATE_IMBALANCE
                {
                    break;
                }
            }

            // Anything the attempts could not fix falls back to random sides,
            // judged by the same threshold as the attempt loop.
            while split_imbalance(sides[0].len(), sides[1].len()) > DEGENERATE_IMBALANCE {
                if indices.len() > 100_000 {
                    tracing::warn!(
                        items = indices.len(),
                        "no separating hyperplane found, assigning random sides"
                    );
                }
                plane = SplitPlane::zeroed(layout.f());
                sides[0].clear();
                sides[1].clear();
                for &j in indices {
                    sides[usize::from(self.rng.flip())].push(j);
                }
            }
        }

        // Recurse into the larger side first; ids stay post-order either way.
        let flip = usize::from(sides[0].len() > sides[1].len());
        let mut children = [0u32; 2];
        for side in 0..2 {
            let s = side ^ flip;
            children[s] = self.make_tree(&sides[s], false)?;
        }

        let id = self.store.alloc()?;
        let view = self.store.view();
        // Safety: freshly issued id, exclusive to this worker.
        let mut node = unsafe { view.node_mut(id) };
        node.set_n_descendants(if is_root {
            self.n_items as i32
        } else {
            indices.len() as i32
        });
        if M::HEADER_LEN >= 4 {
            node.set_header(0, plane.a);
        }
        node.set_child(0, children[0]);
        node.set_child(1, children[1]);
        node.vector_mut().copy_from_slice(&plane.normal);
        Ok(id)
    }

    fn partition(
        &mut self,
        view: &StoreView<'_>,
        plane: &SplitPlane,
        indices: &[u32],
        sides: &mut [Vec<u32>; 2],
    ) {
        sides[0].clear();
        sides[1].clear();
        let h = plane.as_hyperplane();
        for &j in indices {
            let item = view.node(j);
            let side = M::side(&h, &item, self.rng);
            sides[usize::from(side)].push(j);
        }
    }
}

fn split_imbalance(left: usize, right: usize) -> f64 {
    let ls = left as f64;
    let rs = right as f64;
    let f = ls / (ls + rs + 1e-9);
    f.max(1.0 - f)
}
