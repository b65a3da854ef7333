//! Dot-product metric.
//!
//! Ranking is by descending inner product (`distance = -dot`). Tree descent
//! needs a proper metric, so items are lifted by one extra coordinate
//! `a = sqrt(max_norm^2 - norm^2)` at the start of a build, which puts every
//! lifted point on a sphere and reduces the split problem to the angular
//! case. The lift lives in the node header next to the cached squared norm;
//! raw queries carry no lift.

use super::{
    dot, sq_norm, two_means, Centroid, Hyperplane, Metric, SplitPlane, TwoMeansMetric,
};
use crate::node::{NodeMut, NodeRef};
use crate::random::Kiss64;
use crate::store::StoreView;

#[derive(Clone, Copy, Debug, Default)]
pub struct DotProduct;

/// Header word 0: lifted coordinate (plane offset on split nodes).
const HDR_LIFT: usize = 0;
/// Header word 1: cached squared norm of an item vector.
const HDR_SQ_NORM: usize = 1;

impl Metric for DotProduct {
    const NAME: &'static str = "dot";
    const HEADER_LEN: usize = 8;

    fn distance(u: &[f32], v: &[f32]) -> f32 {
        -dot(u, v)
    }

    fn normalized_distance(d: f32) -> f32 {
        -d
    }

    fn margin(plane: &Hyperplane<'_>, v: &[f32]) -> f32 {
        dot(plane.normal, v) + plane.a * plane.a
    }

    fn margin_to_item(plane: &Hyperplane<'_>, item: &NodeRef<'_>) -> f32 {
        dot(plane.normal, item.vector()) + plane.a * item.header(HDR_LIFT)
    }

    fn create_split(sample: &[NodeRef<'_>], f: usize, rng: &mut Kiss64) -> SplitPlane {
        let (p, q) = two_means::<Self>(sample, rng);
        let mut normal: Vec<f32> = (0..f).map(|z| p.v[z] - q.v[z]).collect();
        let mut a = p.a - q.a;
        let n = (sq_norm(&normal) + a * a).sqrt();
        if n > 0.0 {
            for x in &mut normal {
                *x /= n;
            }
            a /= n;
        }
        SplitPlane { normal, a }
    }

    fn init_item(node: &mut NodeMut<'_>) {
        let sq = sq_norm(node.vector_mut());
        node.set_header(HDR_SQ_NORM, sq);
        node.set_header(HDR_LIFT, 0.0);
    }

    /// Norm lift over the whole item set. Holes keep a zero lift.
    fn prepare_build(view: &StoreView<'_>, n_items: u32) {
        let mut max_sq = 0.0f32;
        for i in 0..n_items {
            let node = view.node(i);
            if node.n_descendants() != 1 {
                continue;
            }
            let sq = node.header(HDR_SQ_NORM);
            if sq.is_finite() && sq > max_sq {
                max_sq = sq;
            }
        }
        for i in 0..n_items {
            let sq = {
                let node = view.node(i);
                if node.n_descendants() != 1 {
                    continue;
                }
                node.header(HDR_SQ_NORM)
            };
            let mut lift = (max_sq - sq).max(0.0).sqrt();
            if !lift.is_finite() {
                lift = 0.0;
            }
            // Safety: called before build workers start; ids are exclusive.
            unsafe { view.node_mut(i) }.set_header(HDR_LIFT, lift);
        }
    }
}

impl TwoMeansMetric for DotProduct {
    const COSINE: bool = true;

    fn item_lift(item: &NodeRef<'_>) -> f32 {
        item.header(HDR_LIFT)
    }

    fn point_norm(item: &NodeRef<'_>) -> f32 {
        let a = item.header(HDR_LIFT);
        (sq_norm(item.vector()) + a * a).sqrt()
    }

    fn centroid_distance(c: &Centroid, item: &NodeRef<'_>) -> f32 {
        let v = item.vector();
        let ia = item.header(HDR_LIFT);
        let pp = sq_norm(&c.v) + c.a * c.a;
        let qq = sq_norm(v) + ia * ia;
        let pq = dot(&c.v, v) + c.a * ia;
        let ppqq = pp * qq;
        if ppqq > 0.0 {
            2.0 - 2.0 * pq / ppqq.sqrt()
        } else {
            2.0
        }
    }

    fn normalize_centroid(c: &mut Centroid) {
        let n = (sq_norm(&c.v) + c.a * c.a).sqrt();
        if n > 0.0 {
            for x in &mut c.v {
                *x /= n;
            }
            c.a /= n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeLayout;
    use crate::store::NodeStore;

    #[test]
    fn ranking_is_by_descending_inner_product() {
        let d_small = DotProduct::distance(&[1.0, 1.0], &[2.0, 2.0]);
        let d_large = DotProduct::distance(&[1.0, 1.0], &[3.0, 3.0]);
        assert!(d_large < d_small, "bigger dot product ranks first");
        assert!((DotProduct::normalized_distance(d_large) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn query_margin_uses_squared_offset() {
        let plane = SplitPlane { normal: vec![1.0, 0.0], a: 2.0 };
        let m = DotProduct::margin(&plane.as_hyperplane(), &[3.0, 1.0]);
        assert!((m - 7.0).abs() < 1e-6);
    }

    #[test]
    fn prepare_build_lifts_items_onto_a_sphere() {
        let layout = NodeLayout::new(2, DotProduct::HEADER_LEN);
        let store = NodeStore::in_memory(layout);
        store.ensure_nodes(3).unwrap();
        let view = store.view();
        for (i, v) in [[3.0f32, 4.0], [0.0, 0.0], [5.0, 0.0]].iter().enumerate() {
            let mut node = unsafe { view.node_mut(i as u32) };
            node.set_n_descendants(1);
            node.vector_mut().copy_from_slice(v);
            DotProduct::init_item(&mut node);
        }
        DotProduct::prepare_build(&view, 3);

        // max norm is 5; lift = sqrt(25 - |v|^2)
        assert!(view.node(0).header(HDR_LIFT).abs() < 1e-5);
        assert!((view.node(1).header(HDR_LIFT) - 5.0).abs() < 1e-5);
        assert!(view.node(2).header(HDR_LIFT).abs() < 1e-5);
        // lifted norms are all equal
        for i in 0..3u32 {
            let n = DotProduct::point_norm(&view.node(i));
            assert!((n - 5.0).abs() < 1e-4, "lifted norm {n}");
        }
    }

    #[test]
    fn build_margin_uses_item_lift() {
        let layout = NodeLayout::new(2, DotProduct::HEADER_LEN);
        let store = NodeStore::in_memory(layout);
        store.ensure_nodes(1).unwrap();
        let view = store.view();
        {
            let mut node = unsafe { view.node_mut(0) };
            node.set_n_descendants(1);
            node.vector_mut().copy_from_slice(&[1.0, 0.0]);
            DotProduct::init_item(&mut node);
            node.set_header(HDR_LIFT, 3.0);
        }
        let plane = SplitPlane { normal: vec![2.0, 0.0], a: 0.5 };
        let m = DotProduct::margin_to_item(&plane.as_hyperplane(), &view.node(0));
        assert!((m - (2.0 + 0.5 * 3.0)).abs() < 1e-6);
    }
}
