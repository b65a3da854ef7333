//! Metric kernels.
//!
//! Each metric supplies the five operations the tree machinery is built on:
//! a distance, a reported (normalized) distance, a signed margin against a
//! split hyperplane, a side classifier for build-time partitioning, and a
//! split constructor. Metrics with extra per-node state (the dot-product
//! norm lift) also hook item initialization and a whole-store pass at the
//! start of a build.
//!
//! All internal arithmetic is `f32`; square roots are taken only at the
//! reporting boundary.

mod angular;
mod dot;
mod euclidean;
mod hamming;
mod manhattan;

pub use angular::Angular;
pub use dot::DotProduct;
pub use euclidean::Euclidean;
pub use hamming::Hamming;
pub use manhattan::Manhattan;

use crate::node::{NodeMut, NodeRef};
use crate::random::Kiss64;
use crate::store::StoreView;
use crate::ArborError;

/// Borrowed view of a split hyperplane: the normal (or packed bit words for
/// Hamming) plus the metric header scalar.
pub struct Hyperplane<'a> {
    pub normal: &'a [f32],
    pub a: f32,
}

impl<'a> Hyperplane<'a> {
    pub fn from_split<M: Metric>(node: &NodeRef<'a>) -> Self {
        let a = if M::HEADER_LEN >= 4 { node.header(0) } else { 0.0 };
        Hyperplane { normal: node.vector(), a }
    }
}

/// Owned hyperplane produced by `create_split`, staged before it is written
/// into a freshly allocated split node.
pub struct SplitPlane {
    pub normal: Vec<f32>,
    pub a: f32,
}

impl SplitPlane {
    pub fn zeroed(f: usize) -> Self {
        SplitPlane { normal: vec![0.0; f], a: 0.0 }
    }

    pub fn as_hyperplane(&self) -> Hyperplane<'_> {
        Hyperplane { normal: &self.normal, a: self.a }
    }
}

pub trait Metric: Send + Sync + Sized + 'static {
    const NAME: &'static str;
    /// Bytes of metric-specific header between `n_descendants` and the
    /// children pair.
    const HEADER_LEN: usize;

    /// Internal distance used for candidate ranking. Not necessarily the
    /// reported value; see [`normalized_distance`](Self::normalized_distance).
    fn distance(u: &[f32], v: &[f32]) -> f32;

    /// Map an internal distance to the reported one.
    fn normalized_distance(d: f32) -> f32;

    /// Signed margin of a query point against a split; the sign selects a
    /// child and the magnitude prioritizes traversal.
    fn margin(plane: &Hyperplane<'_>, v: &[f32]) -> f32;

    /// Margin of a stored item against a split during a build. Metrics whose
    /// items carry extra state (dot) override this.
    fn margin_to_item(plane: &Hyperplane<'_>, item: &NodeRef<'_>) -> f32 {
        Self::margin(plane, item.vector())
    }

    /// Which side of `plane` an item falls on; zero margins are broken by a
    /// coin flip so degenerate planes still partition.
    fn side(plane: &Hyperplane<'_>, item: &NodeRef<'_>, rng: &mut Kiss64) -> bool {
        let m = Self::margin_to_item(plane, item);
        if m != 0.0 {
            m > 0.0
        } else {
            rng.flip()
        }
    }

    /// Build a hyperplane separating the working set, from a sample of it.
    fn create_split(sample: &[NodeRef<'_>], f: usize, rng: &mut Kiss64) -> SplitPlane;

    /// Per-item initialization at `add_item` time.
    fn init_item(_node: &mut NodeMut<'_>) {}

    /// Whole-store pass at the start of `build` (the dot norm lift).
    fn prepare_build(_view: &StoreView<'_>, _n_items: u32) {}

    /// Convert an external vector to its stored representation (Hamming
    /// packs bits; everything else stores the floats as-is).
    fn pack_vector(v: &[f32]) -> Vec<f32> {
        v.to_vec()
    }

    /// Inverse of [`pack_vector`](Self::pack_vector).
    fn unpack_vector(stored: &[f32], _f: usize) -> Vec<f32> {
        stored.to_vec()
    }
}

/// Metric selection at the string boundary (bindings, config files).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Angular,
    Euclidean,
    Manhattan,
    Hamming,
    Dot,
}

impl MetricKind {
    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Angular => Angular::NAME,
            MetricKind::Euclidean => Euclidean::NAME,
            MetricKind::Manhattan => Manhattan::NAME,
            MetricKind::Hamming => Hamming::NAME,
            MetricKind::Dot => DotProduct::NAME,
        }
    }
}

impl std::str::FromStr for MetricKind {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "angular" => Ok(MetricKind::Angular),
            "euclidean" => Ok(MetricKind::Euclidean),
            "manhattan" => Ok(MetricKind::Manhattan),
            "hamming" => Ok(MetricKind::Hamming),
            "dot" => Ok(MetricKind::Dot),
            other => Err(ArborError::InvalidArgument(format!(
                "unknown metric {other:?}"
            ))),
        }
    }
}

#[inline]
pub(crate) fn dot(u: &[f32], v: &[f32]) -> f32 {
    u.iter().zip(v).map(|(x, y)| x * y).sum()
}

#[inline]
pub(crate) fn sq_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum()
}

#[inline]
pub(crate) fn norm(v: &[f32]) -> f32 {
    sq_norm(v).sqrt()
}

pub(crate) fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v {
            *x /= n;
        }
    }
}

/// `2 - 2 cos(u, v)`, the internal angular distance. Falls back to the
/// maximum when either norm vanishes.
pub(crate) fn cosine_distance(u: &[f32], v: &[f32]) -> f32 {
    let mut pp = 0.0f32;
    let mut qq = 0.0f32;
    let mut pq = 0.0f32;
    for (x, y) in u.iter().zip(v) {
        pp += x * x;
        qq += y * y;
        pq += x * y;
    }
    let ppqq = pp * qq;
    if ppqq > 0.0 {
        2.0 - 2.0 * pq / ppqq.sqrt()
    } else {
        2.0
    }
}

/// Running two-centroid state used by [`two_means`]. `a` carries the lifted
/// extra coordinate for the dot metric and stays zero elsewhere.
pub(crate) struct Centroid {
    pub v: Vec<f32>,
    pub a: f32,
}

/// Metrics that split via two-means (all but Hamming).
pub(crate) trait TwoMeansMetric: Metric {
    /// Normalize points onto the unit sphere before clustering.
    const COSINE: bool;

    /// Extra lifted coordinate of a stored item.
    fn item_lift(_item: &NodeRef<'_>) -> f32 {
        0.0
    }

    /// Norm used to normalize a point during clustering.
    fn point_norm(item: &NodeRef<'_>) -> f32 {
        norm(item.vector())
    }

    /// Clustering distance between a running centroid and a stored item.
    fn centroid_distance(c: &Centroid, item: &NodeRef<'_>) -> f32;

    fn normalize_centroid(c: &mut Centroid) {
        normalize(&mut c.v);
    }
}

const TWO_MEANS_ITERATIONS: usize = 200;

/// Lightweight iterative refinement: two running centroids, each weighted by
/// its cluster size, absorb one random sample per iteration. The separating
/// hyperplane of the result is the split.
pub(crate) fn two_means<M: TwoMeansMetric>(
    sample: &[NodeRef<'_>],
    rng: &mut Kiss64,
) -> (Centroid, Centroid) {
    let count = sample.len();
    let (i, j) = rng.index2(count);
    let mut p = Centroid { v: sample[i].vector().to_vec(), a: M::item_lift(&sample[i]) };
    let mut q = Centroid { v: sample[j].vector().to_vec(), a: M::item_lift(&sample[j]) };
    if M::COSINE {
        M::normalize_centroid(&mut p);
        M::normalize_centroid(&mut q);
    }

    let mut ic = 1.0f32;
    let mut jc = 1.0f32;
    for _ in 0..TWO_MEANS_ITERATIONS {
        let k = rng.index(count);
        let di = ic * M::centroid_distance(&p, &sample[k]);
        let dj = jc * M::centroid_distance(&q, &sample[k]);
        let point_norm = if M::COSINE { M::point_norm(&sample[k]) } else { 1.0 };
        if !(point_norm > 0.0) || !point_norm.is_finite() {
            continue;
        }
        if di < dj {
            absorb::<M>(&mut p, &mut ic, &sample[k], point_norm);
        } else if dj < di {
            absorb::<M>(&mut q, &mut jc, &sample[k], point_norm);
        }
    }
    (p, q)
}

fn absorb<M: TwoMeansMetric>(c: &mut Centroid, count: &mut f32, item: &NodeRef<'_>, point_norm: f32) {
    let v = item.vector();
    for (cz, xz) in c.v.iter_mut().zip(v) {
        *cz = (*cz * *count + xz / point_norm) / (*count + 1.0);
    }
    c.a = (c.a * *count + M::item_lift(item) / point_norm) / (*count + 1.0);
    *count += 1.0;
}

/// Two-means split with a plane offset through the midpoint of the centroids
/// (Euclidean and Manhattan).
pub(crate) fn split_with_offset<M: TwoMeansMetric>(
    sample: &[NodeRef<'_>],
    f: usize,
    rng: &mut Kiss64,
) -> SplitPlane {
    let (p, q) = two_means::<M>(sample, rng);
    let mut normal: Vec<f32> = (0..f).map(|z| p.v[z] - q.v[z]).collect();
    normalize(&mut normal);
    let a = -(0..f).map(|z| normal[z] * (p.v[z] + q.v[z]) / 2.0).sum::<f32>();
    SplitPlane { normal, a }
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::node::{NodeLayout, NodeMut, NodeRef};

    /// Owned node records for kernel tests, so `NodeRef`s can be handed to
    /// `create_split` without a full store. Backed by `u32` words to keep
    /// the records 4-byte aligned.
    pub struct NodeArena {
        layout: NodeLayout,
        bufs: Vec<Vec<u32>>,
    }

    impl NodeArena {
        pub fn new(layout: NodeLayout) -> Self {
            NodeArena { layout, bufs: Vec::new() }
        }

        pub fn push_item(&mut self, stored: &[f32]) {
            let mut buf = vec![0u32; self.layout.node_size() / 4];
            {
                let mut node = NodeMut::new(bytemuck::cast_slice_mut(&mut buf), self.layout);
                node.set_n_descendants(1);
                node.vector_mut().copy_from_slice(stored);
            }
            self.bufs.push(buf);
        }

        pub fn node(&self, i: usize) -> NodeRef<'_> {
            NodeRef::new(bytemuck::cast_slice(&self.bufs[i]), self.layout)
        }

        pub fn nodes(&self) -> Vec<NodeRef<'_>> {
            (0..self.bufs.len()).map(|i| self.node(i)).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_kind_parses_known_names() {
        for (s, k) in [
            ("angular", MetricKind::Angular),
            ("euclidean", MetricKind::Euclidean),
            ("manhattan", MetricKind::Manhattan),
            ("hamming", MetricKind::Hamming),
            ("dot", MetricKind::Dot),
        ] {
            assert_eq!(s.parse::<MetricKind>().unwrap(), k);
            assert_eq!(k.name(), s);
        }
        assert!(matches!(
            "cosine".parse::<MetricKind>(),
            Err(ArborError::InvalidArgument(_))
        ));
    }

    #[test]
    fn cosine_distance_basics() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert!((cosine_distance(&a, &b) - 2.0).abs() < 1e-6);
        assert!(cosine_distance(&a, &a).abs() < 1e-6);
        // zero vector falls back to the maximum
        assert_eq!(cosine_distance(&a, &[0.0, 0.0]), 2.0);
    }

    #[test]
    fn normalize_ignores_zero_vector() {
        let mut v = [0.0f32, 0.0];
        normalize(&mut v);
        assert_eq!(v, [0.0, 0.0]);
        let mut v = [3.0f32, 4.0];
        normalize(&mut v);
        assert!((norm(&v) - 1.0).abs() < 1e-6);
    }
}
