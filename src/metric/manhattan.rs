//! Manhattan (L1) metric.

use super::{dot, split_with_offset, Centroid, Hyperplane, Metric, SplitPlane, TwoMeansMetric};
use crate::node::NodeRef;
use crate::random::Kiss64;

/// Manhattan distance. The margin stays a linear functional, so splits use
/// the same midpoint-offset construction as Euclidean while clustering
/// assigns points by L1 distance.
#[derive(Clone, Copy, Debug, Default)]
pub struct Manhattan;

impl Metric for Manhattan {
    const NAME: &'static str = "manhattan";
    const HEADER_LEN: usize = 4;

    fn distance(u: &[f32], v: &[f32]) -> f32 {
        u.iter().zip(v).map(|(x, y)| (x - y).abs()).sum()
    }

    fn normalized_distance(d: f32) -> f32 {
        d.max(0.0)
    }

    fn margin(plane: &Hyperplane<'_>, v: &[f32]) -> f32 {
        plane.a + dot(plane.normal, v)
    }

    fn create_split(sample: &[NodeRef<'_>], f: usize, rng: &mut Kiss64) -> SplitPlane {
        split_with_offset::<Self>(sample, f, rng)
    }
}

impl TwoMeansMetric for Manhattan {
    const COSINE: bool = false;

    fn centroid_distance(c: &Centroid, item: &NodeRef<'_>) -> f32 {
        Manhattan::distance(&c.v, item.vector())
    }
}
