//! Node store: a flat arena of fixed-size node records.
//!
//! Three backings share one access path:
//! * `Heap`: growable in-memory buffer used while an index is being built;
//! * `DiskBuild`: file-backed writable mapping for on-disk builds, grown by
//!   `set_len` + remap;
//! * `Mapped`: read-only memory map of a finished index file.
//!
//! Once an id is issued, the byte offset `id * node_size` never moves for the
//! lifetime of the store. Growth happens under the region write lock while
//! readers hold read locks, so a live view never observes a relocation.
//! During a build, node bytes are written without locking: each allocated id
//! belongs to exactly one worker until the subtree containing it is linked
//! into a parent.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::node::{NodeLayout, NodeMut, NodeRef};
use crate::{ArborError, Result};

enum Backing {
    Heap(Vec<u32>),
    DiskBuild { file: File, map: Option<MmapMut> },
    Mapped(Mmap),
}

struct Region {
    backing: Backing,
    /// Cached base pointer of the current backing. Never dereferenced while
    /// the region is empty.
    base: *mut u8,
    nodes_cap: usize,
    node_size: usize,
}

impl Region {
    fn heap(node_size: usize) -> Self {
        let mut buf = Vec::new();
        let base = buf.as_mut_ptr() as *mut u8;
        Region { backing: Backing::Heap(buf), base, nodes_cap: 0, node_size }
    }

    fn disk(file: File, node_size: usize) -> Self {
        Region {
            backing: Backing::DiskBuild { file, map: None },
            base: std::ptr::null_mut(),
            nodes_cap: 0,
            node_size,
        }
    }

    fn mapped(map: Mmap, node_size: usize) -> Self {
        let nodes_cap = map.len() / node_size;
        let base = map.as_ptr() as *mut u8;
        Region { backing: Backing::Mapped(map), base, nodes_cap, node_size }
    }

    fn grow(&mut self, min_nodes: usize) -> Result<()> {
        if min_nodes <= self.nodes_cap {
            return Ok(());
        }
        let new_cap = min_nodes.max((self.nodes_cap + 1) * 2);
        match &mut self.backing {
            Backing::Heap(buf) => {
                let new_words = new_cap * self.node_size / 4;
                buf.try_reserve_exact(new_words - buf.len())
                    .map_err(|_| ArborError::OutOfMemory)?;
                buf.resize(new_words, 0);
                self.base = buf.as_mut_ptr() as *mut u8;
            }
            Backing::DiskBuild { file, map } => {
                // set_len zero-fills, matching the heap path; remap after.
                file.set_len((new_cap * self.node_size) as u64)?;
                let new_map = unsafe { MmapMut::map_mut(&*file)? };
                self.base = new_map.as_ptr() as *mut u8;
                *map = Some(new_map);
            }
            Backing::Mapped(_) => {
                return Err(ArborError::IllegalState(
                    "cannot grow a read-only mapped store".into(),
                ));
            }
        }
        self.nodes_cap = new_cap;
        Ok(())
    }

    /// Truncate an on-disk build to its exact final length and flush it.
    fn finalize_disk(&mut self, n_nodes: usize) -> Result<()> {
        match &mut self.backing {
            Backing::DiskBuild { file, map } => {
                if let Some(m) = map.as_ref() {
                    m.flush()?;
                }
                file.set_len((n_nodes * self.node_size) as u64)?;
                file.sync_all()?;
                if n_nodes > 0 {
                    let new_map = unsafe { MmapMut::map_mut(&*file)? };
                    self.base = new_map.as_ptr() as *mut u8;
                    *map = Some(new_map);
                    self.nodes_cap = n_nodes;
                }
                Ok(())
            }
            _ => Err(ArborError::IllegalState(
                "finalize is only meaningful for an on-disk build".into(),
            )),
        }
    }
}

#[derive(Clone, Copy)]
struct Counters {
    len: usize,
    cap: usize,
}

pub struct NodeStore {
    layout: NodeLayout,
    region: RwLock<Region>,
    counters: Mutex<Counters>,
}

// The raw base pointer is only written through ids exclusively owned by one
// worker (see module docs); growth and relocation are serialized by the
// region write lock.
unsafe impl Send for NodeStore {}
unsafe impl Sync for NodeStore {}

impl NodeStore {
    pub fn in_memory(layout: NodeLayout) -> Self {
        NodeStore {
            layout,
            region: RwLock::new(Region::heap(layout.node_size())),
            counters: Mutex::new(Counters { len: 0, cap: 0 }),
        }
    }

    pub fn on_disk(layout: NodeLayout, path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(NodeStore {
            layout,
            region: RwLock::new(Region::disk(file, layout.node_size())),
            counters: Mutex::new(Counters { len: 0, cap: 0 }),
        })
    }

    /// Map a finished index file read-only. Fails when the file length is not
    /// a positive multiple of the node size.
    pub fn open_mapped(layout: NodeLayout, path: &Path, prefault: bool) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let s = layout.node_size() as u64;
        if len == 0 || len % s != 0 {
            return Err(ArborError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("index file is {len} bytes, not a positive multiple of the {s}-byte node size"),
            )));
        }
        let map = unsafe { Mmap::map(&file)? };
        if prefault {
            touch_pages(&map);
        }
        let n = (len / s) as usize;
        Ok(NodeStore {
            layout,
            region: RwLock::new(Region::mapped(map, layout.node_size())),
            counters: Mutex::new(Counters { len: n, cap: n }),
        })
    }

    #[inline]
    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    pub fn n_nodes(&self) -> usize {
        self.counters.lock().len
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.region.read().backing, Backing::Mapped(_))
    }

    pub fn is_disk_backed(&self) -> bool {
        matches!(self.region.read().backing, Backing::DiskBuild { .. })
    }

    /// Issue the next dense id, growing the region when it is full.
    pub fn alloc(&self) -> Result<u32> {
        let mut c = self.counters.lock();
        if c.len == c.cap {
            let mut region = self.region.write();
            region.grow(c.len + 1)?;
            c.cap = region.nodes_cap;
        }
        let id = c.len as u32;
        c.len += 1;
        Ok(id)
    }

    /// Make sure ids `[0, n)` exist; freshly covered ids are zero-filled
    /// holes.
    pub fn ensure_nodes(&self, n: usize) -> Result<()> {
        let mut c = self.counters.lock();
        if n > c.cap {
            let mut region = self.region.write();
            region.grow(n)?;
            c.cap = region.nodes_cap;
        }
        if n > c.len {
            c.len = n;
        }
        Ok(())
    }

    /// Forget every node past `n`. Bytes are not cleared; ids are reissued by
    /// later allocations.
    pub fn truncate(&self, n: usize) {
        let mut c = self.counters.lock();
        debug_assert!(n <= c.len);
        c.len = n;
    }

    pub fn view(&self) -> StoreView<'_> {
        StoreView { guard: self.region.read(), layout: self.layout }
    }

    pub fn finalize_disk(&self) -> Result<()> {
        let c = self.counters.lock();
        let mut region = self.region.write();
        region.finalize_disk(c.len)
    }

    /// Write the live image (`n_nodes * node_size` bytes) to `path`,
    /// replacing any existing file via a sibling temp file and rename.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let c = self.counters.lock();
        let region = self.region.read();
        let bytes = c.len * self.layout.node_size();
        // Safety: `len <= cap`, so the range is inside the backing region,
        // and relocation is excluded by the read guard.
        let image = unsafe { std::slice::from_raw_parts(region.base as *const u8, bytes) };

        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        let mut out = File::create(&tmp)?;
        out.write_all(image)?;
        out.sync_all()?;
        drop(out);
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Read view over the store region. Node accessors borrow from the view, so
/// the region cannot be grown or relocated underneath them.
pub struct StoreView<'a> {
    guard: RwLockReadGuard<'a, Region>,
    layout: NodeLayout,
}

impl StoreView<'_> {
    #[inline]
    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    #[inline]
    pub fn node(&self, id: u32) -> NodeRef<'_> {
        let s = self.layout.node_size();
        let off = id as usize * s;
        debug_assert!(off + s <= self.guard.nodes_cap * s);
        let bytes = unsafe { std::slice::from_raw_parts(self.guard.base.add(off), s) };
        NodeRef::new(bytes, self.layout)
    }

    /// Mutable view of node `id`.
    ///
    /// # Safety
    /// The caller must exclusively own `id`: no other `NodeRef`/`NodeMut` for
    /// the same id may be live, and the backing must not be the read-only
    /// mapping.
    #[inline]
    pub unsafe fn node_mut(&self, id: u32) -> NodeMut<'_> {
        debug_assert!(!matches!(self.guard.backing, Backing::Mapped(_)));
        let s = self.layout.node_size();
        let off = id as usize * s;
        debug_assert!(off + s <= self.guard.nodes_cap * s);
        let bytes = std::slice::from_raw_parts_mut(self.guard.base.add(off), s);
        NodeMut::new(bytes, self.layout)
    }

    /// Copy the full record of `src` over `dst`.
    ///
    /// # Safety
    /// Same exclusive-ownership contract as [`node_mut`](Self::node_mut) for
    /// `dst`; `src` and `dst` must differ.
    pub unsafe fn copy_node(&self, src: u32, dst: u32) {
        debug_assert_ne!(src, dst);
        let s = self.layout.node_size();
        let base = self.guard.base;
        std::ptr::copy_nonoverlapping(
            base.add(src as usize * s) as *const u8,
            base.add(dst as usize * s),
            s,
        );
    }
}

fn touch_pages(map: &Mmap) {
    let mut acc = 0u8;
    let mut i = 0;
    while i < map.len() {
        acc ^= map[i];
        i += 4096;
    }
    std::hint::black_box(acc);
}
