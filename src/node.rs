//! Packed node records.
//!
//! Every node (item leaf, internal split, or small descriptor) occupies the
//! same `node_size` bytes so that node `i` lives at byte offset
//! `i * node_size` and the whole store can be memory-mapped without parsing.
//!
//! Layout (little-endian):
//!
//! ```text
//! [ n_descendants: i32 ][ metric header: 0/4/8 bytes ][ children: 2 x u32 ][ vector: f x f32 ]
//! ```
//!
//! * leaf item (`n_descendants == 1`): the vector region holds the item
//!   vector (bit-packed words for Hamming);
//! * internal split (`n_descendants > K`): header holds the plane offset
//!   where the metric has one, children hold the two child ids, the vector
//!   region holds the split normal;
//! * descriptor (`2 <= n_descendants <= K`): the children and vector regions
//!   together hold up to `K = f + 2` inlined descendant ids;
//! * hole (`n_descendants == 0`): all zero, never referenced by a tree.

/// Byte width of a node id / `n_descendants` field.
pub const ID_BYTES: usize = 4;

/// Fixed per-node geometry derived from the dimension and the metric header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeLayout {
    f: usize,
    header_len: usize,
    node_size: usize,
    k: usize,
}

impl NodeLayout {
    pub fn new(f: usize, header_len: usize) -> Self {
        debug_assert!(f > 0);
        debug_assert!(header_len % 4 == 0 && header_len <= 8);
        let node_size = ID_BYTES + header_len + 2 * ID_BYTES + f * 4;
        // Ids inlined into a descriptor span the children + vector regions.
        let k = (node_size - ID_BYTES - header_len) / ID_BYTES;
        NodeLayout { f, header_len, node_size, k }
    }

    #[inline]
    pub fn f(&self) -> usize {
        self.f
    }

    #[inline]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Maximum number of descendant ids a descriptor node can inline.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    #[inline]
    fn children_offset(&self) -> usize {
        ID_BYTES + self.header_len
    }

    #[inline]
    fn vector_offset(&self) -> usize {
        ID_BYTES + self.header_len + 2 * ID_BYTES
    }
}

/// Read-only view of one node record.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    bytes: &'a [u8],
    layout: NodeLayout,
}

impl<'a> NodeRef<'a> {
    pub fn new(bytes: &'a [u8], layout: NodeLayout) -> Self {
        debug_assert_eq!(bytes.len(), layout.node_size());
        NodeRef { bytes, layout }
    }

    #[inline]
    pub fn n_descendants(&self) -> i32 {
        i32::from_le_bytes(self.bytes[..4].try_into().unwrap())
    }

    /// Metric header word `i` (0-based). Only valid for metrics with one.
    #[inline]
    pub fn header(&self, i: usize) -> f32 {
        debug_assert!((i + 1) * 4 <= self.layout.header_len);
        let off = ID_BYTES + i * 4;
        f32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    #[inline]
    pub fn child(&self, side: usize) -> u32 {
        debug_assert!(side < 2);
        let off = self.layout.children_offset() + side * ID_BYTES;
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    /// Item vector or split normal, `f` floats.
    #[inline]
    pub fn vector(&self) -> &'a [f32] {
        let off = self.layout.vector_offset();
        bytemuck::cast_slice(&self.bytes[off..off + self.layout.f * 4])
    }

    /// Inlined descendant ids of a descriptor node. Returns at most `K` ids;
    /// a hole yields an empty slice.
    pub fn descendants(&self) -> &'a [u32] {
        let n = self.n_descendants().clamp(0, self.layout.k as i32) as usize;
        let off = self.layout.children_offset();
        bytemuck::cast_slice(&self.bytes[off..off + n * ID_BYTES])
    }
}

/// Mutable view of one node record.
pub struct NodeMut<'a> {
    bytes: &'a mut [u8],
    layout: NodeLayout,
}

impl<'a> NodeMut<'a> {
    pub fn new(bytes: &'a mut [u8], layout: NodeLayout) -> Self {
        debug_assert_eq!(bytes.len(), layout.node_size());
        NodeMut { bytes, layout }
    }

    #[inline]
    pub fn set_n_descendants(&mut self, n: i32) {
        self.bytes[..4].copy_from_slice(&n.to_le_bytes());
    }

    #[inline]
    pub fn set_header(&mut self, i: usize, value: f32) {
        debug_assert!((i + 1) * 4 <= self.layout.header_len);
        let off = ID_BYTES + i * 4;
        self.bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn set_child(&mut self, side: usize, id: u32) {
        debug_assert!(side < 2);
        let off = self.layout.children_offset() + side * ID_BYTES;
        self.bytes[off..off + 4].copy_from_slice(&id.to_le_bytes());
    }

    #[inline]
    pub fn vector_mut(&mut self) -> &mut [f32] {
        let off = self.layout.vector_offset();
        bytemuck::cast_slice_mut(&mut self.bytes[off..off + self.layout.f * 4])
    }

    /// Write the inlined ids of a descriptor node.
    pub fn set_descendants(&mut self, ids: &[u32]) {
        debug_assert!(ids.len() <= self.layout.k);
        let off = self.layout.children_offset();
        let dst: &mut [u32] =
            bytemuck::cast_slice_mut(&mut self.bytes[off..off + ids.len() * ID_BYTES]);
        dst.copy_from_slice(ids);
    }
}
