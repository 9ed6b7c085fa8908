//! Registered data buffers
//!
//! Command data lives in 4 MiB registered chunks carved up by a buddy
//! allocator in 4 KiB units. Requests larger than a chunk get a region of
//! their own.

use super::verbs::{access, MemoryRegion, ProtectionDomain};
use crate::error::ScsiResult;
use log::{debug, warn};
use std::sync::Arc;

pub const UNIT_SHIFT: u32 = 12;
pub const UNIT_SIZE: usize = 1 << UNIT_SHIFT;
pub const CHUNK_SHIFT: u32 = 22;
pub const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;
pub const CHUNK_UNITS_SHIFT: u32 = CHUNK_SHIFT - UNIT_SHIFT;
pub const CHUNK_UNITS: usize = 1 << CHUNK_UNITS_SHIFT;

const DATA_ACCESS: u32 = access::LOCAL_WRITE | access::REMOTE_READ | access::REMOTE_WRITE;

/// Binary buddy tree over the units of one chunk
///
/// Node `i` holds the largest free order available below it, counted so that
/// order `k` is a block of `2^(k-1)` units and 0 means nothing free.
#[derive(Debug, Clone)]
pub struct BuddyTree {
    tree: Vec<i8>,
}

impl Default for BuddyTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyTree {
    pub fn new() -> Self {
        let mut tree = vec![0i8; CHUNK_UNITS << 1];
        for depth in 0..=CHUNK_UNITS_SHIFT {
            let order = (CHUNK_UNITS_SHIFT - depth + 1) as i8;
            let start = 1usize << depth;
            tree[start..start << 1].fill(order);
        }
        BuddyTree { tree }
    }

    /// Largest order still free in the chunk
    pub fn max_free_order(&self) -> i8 {
        self.tree[1]
    }

    /// Take a block of order `want`, returning its first unit
    pub fn alloc(&mut self, want: i8) -> Option<usize> {
        if self.tree[1] < want {
            return None;
        }

        let mut pos = 1usize;
        let mut level = CHUNK_UNITS_SHIFT as i8 + 1;
        while want < level {
            pos <<= 1;
            if self.tree[pos] < want {
                pos |= 1;
            }
            level -= 1;
        }

        self.tree[pos] = 0;
        let unit = (pos << (level - 1)) - CHUNK_UNITS;
        self.propagate(pos, level);
        Some(unit)
    }

    /// Return the block starting at `unit`
    pub fn free(&mut self, unit: usize) {
        let mut pos = unit + CHUNK_UNITS;
        let mut level = 1i8;
        while pos > 0 && self.tree[pos] != 0 {
            pos >>= 1;
            level += 1;
        }
        if pos == 0 {
            warn!("Freeing unit {} that is not allocated", unit);
            return;
        }
        self.tree[pos] = level;
        self.propagate(pos, level);
    }

    fn propagate(&mut self, mut pos: usize, mut level: i8) {
        pos >>= 1;
        level += 1;
        while pos > 0 {
            let left = self.tree[pos << 1];
            let right = self.tree[(pos << 1) | 1];
            let value = if left == level - 1 && right == level - 1 {
                level
            } else {
                left.max(right)
            };
            if value == self.tree[pos] {
                break;
            }
            self.tree[pos] = value;
            pos >>= 1;
            level += 1;
        }
    }
}

/// Buddy order needed for `size` bytes
pub fn order_for(size: usize) -> i8 {
    let units = (size * 2 - 1) / UNIT_SIZE / 2;
    let fls = usize::BITS - units.leading_zeros();
    fls as i8 + 1
}

#[derive(Debug)]
struct Chunk {
    mr: MemoryRegion,
    tree: BuddyTree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Chunk(usize),
    Dedicated,
}

/// A slice of registered memory handed to one command
#[derive(Debug)]
pub struct DataBuffer {
    mr: MemoryRegion,
    offset: usize,
    len: usize,
    origin: Origin,
}

impl DataBuffer {
    pub fn addr(&self) -> u64 {
        self.mr.addr() + self.offset as u64
    }

    pub fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    pub fn rkey(&self) -> u32 {
        self.mr.rkey()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.mr
    }

    /// Byte offset of this buffer inside its region
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> ScsiResult<()> {
        self.mr.write(self.offset + offset, data)
    }

    pub fn read(&self, offset: usize, len: usize) -> ScsiResult<Vec<u8>> {
        self.mr.read(self.offset + offset, len)
    }
}

/// Pool of registered chunks
pub struct BufferPool {
    pd: Arc<dyn ProtectionDomain>,
    chunks: Vec<Chunk>,
}

impl BufferPool {
    pub fn new(pd: Arc<dyn ProtectionDomain>) -> Self {
        BufferPool {
            pd,
            chunks: Vec::new(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Allocate `size` bytes; `None` for a zero-length request
    pub fn alloc(&mut self, size: usize) -> ScsiResult<Option<DataBuffer>> {
        if size == 0 {
            return Ok(None);
        }

        if size > CHUNK_SIZE {
            let mr = self.pd.reg_mr(size, DATA_ACCESS)?;
            debug!("Registered dedicated {}-byte data buffer", size);
            return Ok(Some(DataBuffer {
                mr,
                offset: 0,
                len: size,
                origin: Origin::Dedicated,
            }));
        }

        let want = order_for(size);
        for (idx, chunk) in self.chunks.iter_mut().enumerate() {
            if let Some(unit) = chunk.tree.alloc(want) {
                return Ok(Some(DataBuffer {
                    mr: chunk.mr.clone(),
                    offset: unit << UNIT_SHIFT,
                    len: size,
                    origin: Origin::Chunk(idx),
                }));
            }
        }

        let mr = self.pd.reg_mr(CHUNK_SIZE, DATA_ACCESS)?;
        debug!("Registered data chunk #{}", self.chunks.len());
        let mut chunk = Chunk {
            mr,
            tree: BuddyTree::new(),
        };
        let unit = chunk.tree.alloc(want).unwrap_or(0);
        let idx = self.chunks.len();
        let buffer = DataBuffer {
            mr: chunk.mr.clone(),
            offset: unit << UNIT_SHIFT,
            len: size,
            origin: Origin::Chunk(idx),
        };
        self.chunks.push(chunk);
        Ok(Some(buffer))
    }

    pub fn free(&mut self, buffer: DataBuffer) {
        match buffer.origin {
            Origin::Chunk(idx) => match self.chunks.get_mut(idx) {
                Some(chunk) if chunk.mr.same_region(&buffer.mr) => {
                    chunk.tree.free(buffer.offset >> UNIT_SHIFT);
                }
                _ => warn!("Data buffer does not belong to this pool"),
            },
            Origin::Dedicated => self.pd.dereg_mr(&buffer.mr),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            self.pd.dereg_mr(&chunk.mr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::iser::soft::SoftRdma;

    #[test]
    fn test_order_for_sizes() {
        assert_eq!(order_for(1), 1);
        assert_eq!(order_for(4096), 1);
        assert_eq!(order_for(4097), 2);
        assert_eq!(order_for(8192), 2);
        assert_eq!(order_for(8193), 3);
        assert_eq!(order_for(CHUNK_SIZE), CHUNK_UNITS_SHIFT as i8 + 1);
    }

    #[test]
    fn test_buddy_split_and_merge() {
        let mut tree = BuddyTree::new();
        assert_eq!(tree.max_free_order(), 11);

        let a = tree.alloc(1).unwrap();
        let b = tree.alloc(1).unwrap();
        let c = tree.alloc(3).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(c, 4);
        assert_eq!(tree.max_free_order(), 10);

        tree.free(b);
        tree.free(a);
        tree.free(c);
        assert_eq!(tree.max_free_order(), 11);

        let whole = tree.alloc(11).unwrap();
        assert_eq!(whole, 0);
        assert!(tree.alloc(1).is_none());
        tree.free(whole);
        assert_eq!(tree.max_free_order(), 11);
    }

    #[test]
    fn test_pool_reuses_chunk() {
        let rdma = SoftRdma::new();
        let pd = rdma.alloc_pd();
        let mut pool = BufferPool::new(pd);

        assert!(pool.alloc(0).unwrap().is_none());

        let first = pool.alloc(4096).unwrap().unwrap();
        let second = pool.alloc(10_000).unwrap().unwrap();
        assert_eq!(pool.chunk_count(), 1);
        assert_ne!(first.offset(), second.offset());
        assert_eq!(second.offset() % (4 * UNIT_SIZE), 0);

        second.write(0, b"payload").unwrap();
        assert_eq!(second.read(0, 7).unwrap(), b"payload");

        let big = pool.alloc(CHUNK_SIZE + 1).unwrap().unwrap();
        assert_eq!(big.offset(), 0);
        assert_eq!(pool.chunk_count(), 1);

        pool.free(first);
        pool.free(second);
        pool.free(big);
        let again = pool.alloc(CHUNK_SIZE).unwrap().unwrap();
        assert_eq!(again.offset(), 0);
        assert_eq!(pool.chunk_count(), 1);
    }
}
