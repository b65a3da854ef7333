//! Euclidean (L2) metric.

use super::{dot, split_with_offset, Centroid, Hyperplane, Metric, SplitPlane, TwoMeansMetric};
use crate::node::NodeRef;
use crate::random::Kiss64;

/// Euclidean distance: squared L2 internally, square-rooted at the reporting
/// boundary. Splits carry a plane offset through the midpoint of the two
/// centroids.
#[derive(Clone, Copy, Debug, Default)]
pub struct Euclidean;

impl Metric for Euclidean {
    const NAME: &'static str = "euclidean";
    const HEADER_LEN: usize = 4;

    fn distance(u: &[f32], v: &[f32]) -> f32 {
        u.iter()
            .zip(v)
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum()
    }

    fn normalized_distance(d: f32) -> f32 {
        d.max(0.0).sqrt()
    }

    fn margin(plane: &Hyperplane<'_>, v: &[f32]) -> f32 {
        plane.a + dot(plane.normal, v)
    }

    fn create_split(sample: &[NodeRef<'_>], f: usize, rng: &mut Kiss64) -> SplitPlane {
        split_with_offset::<Self>(sample, f, rng)
    }
}

impl TwoMeansMetric for Euclidean {
    const COSINE: bool = false;

    fn centroid_distance(c: &Centroid, item: &NodeRef<'_>) -> f32 {
        Euclidean::distance(&c.v, item.vector())
    }
}
