//! Angular (cosine) metric.

use super::{
    cosine_distance, dot, normalize, two_means, Centroid, Hyperplane, Metric, SplitPlane,
    TwoMeansMetric,
};
use crate::node::NodeRef;
use crate::random::Kiss64;

/// Angular distance: `2 - 2 cos(u, v)` internally, reported as
/// `sqrt(max(d, 0))`, i.e. the chord length between the normalized points.
#[derive(Clone, Copy, Debug, Default)]
pub struct Angular;

impl Metric for Angular {
    const NAME: &'static str = "angular";
    const HEADER_LEN: usize = 0;

    fn distance(u: &[f32], v: &[f32]) -> f32 {
        cosine_distance(u, v)
    }

    fn normalized_distance(d: f32) -> f32 {
        d.max(0.0).sqrt()
    }

    fn margin(plane: &Hyperplane<'_>, v: &[f32]) -> f32 {
        dot(plane.normal, v)
    }

    fn create_split(sample: &[NodeRef<'_>], f: usize, rng: &mut Kiss64) -> SplitPlane {
        let (p, q) = two_means::<Self>(sample, rng);
        let mut normal: Vec<f32> = (0..f).map(|z| p.v[z] - q.v[z]).collect();
        normalize(&mut normal);
        SplitPlane { normal, a: 0.0 }
    }
}

impl TwoMeansMetric for Angular {
    const COSINE: bool = true;

    fn centroid_distance(c: &Centroid, item: &NodeRef<'_>) -> f32 {
        cosine_distance(&c.v, item.vector())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::test_util::NodeArena;
    use crate::node::NodeLayout;

    #[test]
    fn orthogonal_unit_vectors() {
        let d = Angular::distance(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!((d - 2.0).abs() < 1e-6);
        assert!((Angular::normalized_distance(d) - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn scale_invariance() {
        let d1 = Angular::distance(&[1.0, 2.0], &[2.0, 1.0]);
        let d2 = Angular::distance(&[10.0, 20.0], &[2.0, 1.0]);
        assert!((d1 - d2).abs() < 1e-5);
    }

    #[test]
    fn margin_sign_follows_halfspace() {
        let plane = SplitPlane { normal: vec![1.0, 0.0], a: 0.0 };
        assert!(Angular::margin(&plane.as_hyperplane(), &[0.5, 3.0]) > 0.0);
        assert!(Angular::margin(&plane.as_hyperplane(), &[-0.5, 3.0]) < 0.0);
    }

    #[test]
    fn split_separates_two_directions() {
        let layout = NodeLayout::new(2, Angular::HEADER_LEN);
        let mut arena = NodeArena::new(layout);
        for i in 0..20 {
            let e = 0.01 * i as f32;
            arena.push_item(&[1.0, e]);
            arena.push_item(&[e, 1.0]);
        }
        let nodes = arena.nodes();
        let mut rng = Kiss64::new(1);
        let plane = Angular::create_split(&nodes, 2, &mut rng);
        let m_x = Angular::margin(&plane.as_hyperplane(), &[1.0, 0.0]);
        let m_y = Angular::margin(&plane.as_hyperplane(), &[0.0, 1.0]);
        assert!(
            m_x * m_y < 0.0,
            "the two clusters should land on opposite sides: {m_x} vs {m_y}"
        );
    }
}
