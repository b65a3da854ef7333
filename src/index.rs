//! The index: lifecycle state machine and public operations.

use std::marker::PhantomData;
use std::path::Path;

use rayon::prelude::*;

use crate::build::build_forest;
use crate::metric::Metric;
use crate::node::NodeLayout;
use crate::random::DEFAULT_SEED;
use crate::search::nearest_neighbors;
use crate::store::NodeStore;
use crate::{ArborError, Result};

/// Where an index is in its life.
///
/// Items can only be added before a build; a built or loaded index is
/// read-only and safe to query from many threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting items into an in-memory store.
    Building,
    /// Accepting items into a file-backed store (`on_disk_build`).
    OnDiskBuilding,
    /// Forest constructed; queryable.
    Built,
    /// Memory-mapped from a file; queryable, read-only.
    Loaded,
    /// Mapping released; only `load` is useful from here.
    Unloaded,
}

/// A forest of randomized space-partitioning trees over fixed-dimensional
/// `f32` vectors, generic over the [`Metric`].
///
/// The node store doubles as the serialization format: `save` writes it out
/// verbatim and `load` memory-maps it back without parsing.
pub struct ArborIndex<M: Metric> {
    f: usize,
    store: NodeStore,
    n_items: u32,
    roots: Vec<u32>,
    seed: u64,
    phase: Phase,
    _metric: PhantomData<M>,
}

impl<M: Metric> ArborIndex<M> {
    /// Create an empty index over `f`-dimensional vectors.
    pub fn new(f: usize) -> Result<Self> {
        if f == 0 {
            return Err(ArborError::InvalidArgument(
                "vector dimension must be positive".into(),
            ));
        }
        let layout = NodeLayout::new(f, M::HEADER_LEN);
        Ok(ArborIndex {
            f,
            store: NodeStore::in_memory(layout),
            n_items: 0,
            roots: Vec::new(),
            seed: DEFAULT_SEED,
            phase: Phase::Building,
            _metric: PhantomData,
        })
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Seed the build RNG. Only meaningful before `build`.
    pub fn set_seed(&mut self, seed: u32) -> Result<()> {
        match self.phase {
            Phase::Building | Phase::OnDiskBuilding => {
                self.seed = u64::from(seed);
                Ok(())
            }
            _ => Err(ArborError::IllegalState(
                "the seed can only be set before build".into(),
            )),
        }
    }

    /// Redirect the node store to `path` so the subsequent build streams
    /// straight to disk. Must precede the first `add_item`.
    pub fn on_disk_build(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.phase != Phase::Building || self.n_items != 0 || self.store.n_nodes() != 0 {
            return Err(ArborError::IllegalState(
                "on_disk_build requires an empty index with no items added".into(),
            ));
        }
        self.store = NodeStore::on_disk(self.store.layout(), path.as_ref())?;
        self.phase = Phase::OnDiskBuilding;
        Ok(())
    }

    /// Store `vector` under id `item`. Ids may be sparse; skipped ids become
    /// holes that cost nothing to search over.
    pub fn add_item(&mut self, item: u32, vector: &[f32]) -> Result<()> {
        match self.phase {
            Phase::Building | Phase::OnDiskBuilding => {}
            _ => {
                return Err(ArborError::IllegalState(
                    "items cannot be added after build or load".into(),
                ))
            }
        }
        if vector.len() != self.f {
            return Err(ArborError::InvalidArgument(format!(
                "vector has dimension {} but the index expects {}",
                vector.len(),
                self.f
            )));
        }

        self.store.ensure_nodes(item as usize + 1)?;
        let packed = M::pack_vector(vector);
        {
            let view = self.store.view();
            // Safety: `&mut self`, so no other view of this id is live.
            let mut node = unsafe { view.node_mut(item) };
            node.set_n_descendants(1);
            node.set_child(0, 0);
            node.set_child(1, 0);
            node.vector_mut().copy_from_slice(&packed);
            M::init_item(&mut node);
        }
        if item + 1 > self.n_items {
            self.n_items = item + 1;
        }
        Ok(())
    }

    /// Construct `n_trees` trees (`-1` = until the forest holds about one
    /// internal node per item) on up to `n_jobs` threads (`-1` = all cores).
    pub fn build(&mut self, n_trees: i32, n_jobs: i32) -> Result<()> {
        match self.phase {
            Phase::Building | Phase::OnDiskBuilding => {}
            _ => {
                return Err(ArborError::IllegalState(
                    "index is already built or loaded".into(),
                ))
            }
        }
        if n_trees == 0 || n_trees < -1 {
            return Err(ArborError::InvalidArgument(
                "n_trees must be positive or -1".into(),
            ));
        }
        if n_jobs == 0 || n_jobs < -1 {
            return Err(ArborError::InvalidArgument(
                "n_jobs must be positive or -1".into(),
            ));
        }
        let n_workers = if n_jobs == -1 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            n_jobs as usize
        };

        M::prepare_build(&self.store.view(), self.n_items);
        let roots = build_forest::<M>(&self.store, self.n_items, self.seed, n_trees, n_workers)?;

        // Copy the roots to the tail of the store, in build order, so a later
        // `load` can rediscover them from the raw image.
        for &root in &roots {
            let id = self.store.alloc()?;
            let view = self.store.view();
            // Safety: `id` was just issued and differs from `root`.
            unsafe { view.copy_node(root, id) };
        }

        if self.phase == Phase::OnDiskBuilding {
            self.store.finalize_disk()?;
        }
        self.roots = roots;
        self.phase = Phase::Built;
        tracing::info!(
            n_items = self.n_items,
            n_nodes = self.store.n_nodes(),
            n_trees = self.roots.len(),
            "forest built"
        );
        Ok(())
    }

    /// Drop the forest but keep the items, returning to `Building`. Not
    /// available for mapped or on-disk indices.
    pub fn unbuild(&mut self) -> Result<()> {
        if self.phase != Phase::Built || self.store.is_mapped() || self.store.is_disk_backed() {
            return Err(ArborError::IllegalState(
                "only an in-memory built index can be unbuilt".into(),
            ));
        }
        self.roots.clear();
        self.store.truncate(self.n_items as usize);
        self.phase = Phase::Building;
        Ok(())
    }

    /// Persist the built forest to `path` and switch to the new mapping.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ArborError::IllegalState(
                "save requires a non-empty path".into(),
            ));
        }
        if self.phase != Phase::Built {
            return Err(ArborError::IllegalState(
                "save requires a built index".into(),
            ));
        }
        if self.store.is_disk_backed() {
            return Err(ArborError::IllegalState(
                "an on-disk build already lives in its file; save is not available".into(),
            ));
        }
        self.store.write_to(path)?;
        self.load(path, false)
    }

    /// Memory-map an index file. Resets whatever the index held before; a
    /// failed load leaves it `Unloaded`.
    pub fn load(&mut self, path: impl AsRef<Path>, prefault: bool) -> Result<()> {
        let layout = self.store.layout();
        self.roots.clear();
        self.n_items = 0;
        self.store = NodeStore::in_memory(layout);
        self.phase = Phase::Unloaded;

        let store = NodeStore::open_mapped(layout, path.as_ref(), prefault)?;
        let (roots, n_items) = discover_roots(&store);
        tracing::debug!(roots = roots.len(), n_items, "index loaded");
        self.store = store;
        self.roots = roots;
        self.n_items = n_items;
        self.phase = Phase::Loaded;
        Ok(())
    }

    /// Release the mapping.
    pub fn unload(&mut self) -> Result<()> {
        if self.phase != Phase::Loaded {
            return Err(ArborError::IllegalState(
                "unload requires a loaded index".into(),
            ));
        }
        let layout = self.store.layout();
        self.store = NodeStore::in_memory(layout);
        self.roots.clear();
        self.n_items = 0;
        self.phase = Phase::Unloaded;
        Ok(())
    }

    /// The `n` nearest stored items to `vector`, best first. `search_k < 0`
    /// defaults the candidate budget to `n * n_trees`.
    pub fn get_nns_by_vector(
        &self,
        vector: &[f32],
        n: usize,
        search_k: i32,
    ) -> Result<Vec<u32>> {
        let found = self.query_by_vector(vector, n, search_k)?;
        Ok(found.into_iter().map(|(id, _)| id).collect())
    }

    /// Like [`get_nns_by_vector`](Self::get_nns_by_vector), also reporting
    /// the normalized distance of each neighbor.
    pub fn get_nns_by_vector_with_distances(
        &self,
        vector: &[f32],
        n: usize,
        search_k: i32,
    ) -> Result<(Vec<u32>, Vec<f32>)> {
        let found = self.query_by_vector(vector, n, search_k)?;
        Ok(split_ranked::<M>(found))
    }

    /// The `n` nearest items to stored item `item` (which is its own nearest
    /// neighbor).
    pub fn get_nns_by_item(&self, item: u32, n: usize, search_k: i32) -> Result<Vec<u32>> {
        let found = self.query_by_item(item, n, search_k)?;
        Ok(found.into_iter().map(|(id, _)| id).collect())
    }

    pub fn get_nns_by_item_with_distances(
        &self,
        item: u32,
        n: usize,
        search_k: i32,
    ) -> Result<(Vec<u32>, Vec<f32>)> {
        let found = self.query_by_item(item, n, search_k)?;
        Ok(split_ranked::<M>(found))
    }

    /// Run one query per input vector in parallel.
    pub fn get_nns_by_vector_batch(
        &self,
        vectors: &[Vec<f32>],
        n: usize,
        search_k: i32,
    ) -> Result<Vec<Vec<u32>>> {
        vectors
            .par_iter()
            .map(|v| self.get_nns_by_vector(v, n, search_k))
            .collect()
    }

    /// Copy out the vector stored for `item`.
    pub fn get_item_vector(&self, item: u32) -> Result<Vec<f32>> {
        self.ensure_item(item)?;
        let view = self.store.view();
        Ok(M::unpack_vector(view.node(item).vector(), self.f))
    }

    /// Normalized distance between two stored items.
    pub fn get_distance(&self, i: u32, j: u32) -> Result<f32> {
        self.ensure_item(i)?;
        self.ensure_item(j)?;
        let view = self.store.view();
        let d = M::distance(view.node(i).vector(), view.node(j).vector());
        Ok(M::normalized_distance(d))
    }

    /// Upper bound of item ids, holes included.
    pub fn get_n_items(&self) -> u32 {
        self.n_items
    }

    /// Number of trees in the forest.
    pub fn get_n_trees(&self) -> usize {
        self.roots.len()
    }

    fn query_by_vector(
        &self,
        vector: &[f32],
        n: usize,
        search_k: i32,
    ) -> Result<Vec<(u32, f32)>> {
        self.ensure_queryable()?;
        if vector.len() != self.f {
            return Err(ArborError::InvalidArgument(format!(
                "query has dimension {} but the index expects {}",
                vector.len(),
                self.f
            )));
        }
        let query = M::pack_vector(vector);
        let view = self.store.view();
        Ok(nearest_neighbors::<M>(
            &view,
            &self.roots,
            self.n_items,
            &query,
            n,
            search_k,
        ))
    }

    fn query_by_item(&self, item: u32, n: usize, search_k: i32) -> Result<Vec<(u32, f32)>> {
        self.ensure_queryable()?;
        self.ensure_item(item)?;
        let query = {
            let view = self.store.view();
            view.node(item).vector().to_vec()
        };
        let view = self.store.view();
        Ok(nearest_neighbors::<M>(
            &view,
            &self.roots,
            self.n_items,
            &query,
            n,
            search_k,
        ))
    }

    fn ensure_queryable(&self) -> Result<()> {
        match self.phase {
            Phase::Built | Phase::Loaded => Ok(()),
            _ => Err(ArborError::IllegalState(
                "queries require a built or loaded index".into(),
            )),
        }
    }

    fn ensure_item(&self, item: u32) -> Result<()> {
        if item < self.n_items {
            let view = self.store.view();
            if view.node(item).n_descendants() == 1 {
                return Ok(());
            }
        }
        Err(ArborError::InvalidArgument(format!(
            "item {item} is not in the index"
        )))
    }
}

fn split_ranked<M: Metric>(found: Vec<(u32, f32)>) -> (Vec<u32>, Vec<f32>) {
    let mut ids = Vec::with_capacity(found.len());
    let mut dists = Vec::with_capacity(found.len());
    for (id, d) in found {
        ids.push(id);
        dists.push(M::normalized_distance(d));
    }
    (ids, dists)
}

/// Rediscover tree roots from a raw image: they are the run of trailing
/// nodes sharing one `n_descendants` value, which is also the item count.
/// When the run extends one past the tail copies into the original last
/// root, the duplicate is dropped.
fn discover_roots(store: &NodeStore) -> (Vec<u32>, u32) {
    let n_nodes = store.n_nodes() as u32;
    let view = store.view();
    let mut roots = Vec::new();
    let mut m: i32 = -1;
    for i in (0..n_nodes).rev() {
        let nd = view.node(i).n_descendants();
        if m == -1 || nd == m {
            roots.push(i);
            m = nd;
        } else {
            break;
        }
    }
    if roots.len() > 1
        && view.node(roots[0]).child(0) == view.node(*roots.last().unwrap()).child(0)
    {
        roots.pop();
    }
    roots.reverse();
    (roots, m.max(0) as u32)
}
