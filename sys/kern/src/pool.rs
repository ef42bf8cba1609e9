// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-size block pools over the kernel heap.
//!
//! A pool hands out aligned blocks of one size with O(1),
//! allocation-free `alloc`/`free`, suitable for interrupt handlers. The
//! blocks come from *slabs* -- heap allocations each carved into
//! `blocks_per_slab` blocks -- and only the slab operations
//! ([`Pool::add_slabs`], [`Pool::free_unallocated_slabs`]) touch the
//! heap, so only those are restricted to thread context.
//!
//! Free blocks and slabs are chained with the kernel's one list
//! primitive, with the links stored in-band: a free block's first bytes
//! hold its link, and each slab's header holds the slab-list link plus
//! a count of its free blocks. A slab whose free count equals
//! `blocks_per_slab` has no live blocks and can be returned to the
//! heap whole.

use linkq::{Link, LinkStore};

use firstfit::Heap;

/// Sentinel indices for the two list heads, which live in the `Pool`
/// struct rather than in heap memory.
const FREE_HEAD: u32 = u32::MAX - 8;
const SLAB_HEAD: u32 = u32::MAX - 9;

/// Slab header layout, at the start of each slab's heap payload:
/// free count (u32), first-block offset (u32), then the slab link.
const SLAB_HDR: usize = 16;
const SLAB_LINK_AT: u32 = 8;

/// A fixed-block pool. The struct itself is plain state; every
/// operation borrows the heap whose region the blocks live in.
#[derive(Debug)]
pub struct Pool {
    /// Distance between blocks: the requested block size rounded up to
    /// the alignment and to link size.
    stride: u32,
    align: u32,
    blocks_per_slab: u32,
    free_head: Link,
    slab_head: Link,
}

/// The pool's lists live partly in the heap region (free blocks, slab
/// headers) and partly in the `Pool` struct (the two heads, behind
/// sentinel indices).
struct PoolLinks<'a, 'r> {
    heap: &'a mut Heap<'r>,
    free_head: &'a mut Link,
    slab_head: &'a mut Link,
}

impl LinkStore for PoolLinks<'_, '_> {
    fn link(&self, ix: u32) -> Link {
        match ix {
            FREE_HEAD => *self.free_head,
            SLAB_HEAD => *self.slab_head,
            _ => {
                let at = ix as usize;
                let mem = self.heap.region();
                Link {
                    prev: read_u32(mem, at),
                    next: read_u32(mem, at + 4),
                }
            }
        }
    }

    fn set_link(&mut self, ix: u32, link: Link) {
        match ix {
            FREE_HEAD => *self.free_head = link,
            SLAB_HEAD => *self.slab_head = link,
            _ => {
                let at = ix as usize;
                let mem = self.heap.region_mut();
                write_u32(mem, at, link.prev);
                write_u32(mem, at + 4, link.next);
            }
        }
    }
}

fn read_u32(mem: &[u8], at: usize) -> u32 {
    let mut b = [0; 4];
    b.copy_from_slice(&mem[at..at + 4]);
    u32::from_ne_bytes(b)
}

fn write_u32(mem: &mut [u8], at: usize, v: u32) {
    mem[at..at + 4].copy_from_slice(&v.to_ne_bytes());
}

fn round_up(n: u32, to: u32) -> u32 {
    (n + to - 1) / to * to
}

impl Pool {
    /// Describes a pool of `blocks_per_slab`-block slabs of
    /// `block_size`-byte blocks aligned to `align` (a power of two).
    /// No memory is acquired until [`Pool::add_slabs`].
    pub const fn new(block_size: u32, align: u32, blocks_per_slab: u32) -> Self {
        assert!(align.is_power_of_two());
        assert!(block_size > 0);
        assert!(blocks_per_slab > 0);
        // Blocks space out by the larger of size and link room, kept
        // aligned.
        let mut stride = block_size;
        if stride < 8 {
            stride = 8;
        }
        let stride = (stride + align - 1) / align * align;
        Pool {
            stride,
            align,
            blocks_per_slab,
            free_head: Link::detached(FREE_HEAD),
            slab_head: Link::detached(SLAB_HEAD),
        }
    }

    /// Grabs up to `n` more slabs from the heap, pushing their blocks
    /// onto the free list. Returns how many slabs were actually added
    /// (the heap may run out first). Thread context only.
    pub fn add_slabs(&mut self, heap: &mut Heap<'_>, n: usize) -> usize {
        let per_slab = self.blocks_per_slab;
        let stride = self.stride;
        let align = self.align;
        let slab_bytes = SLAB_HDR as u32 + align + per_slab * stride;
        let mut added = 0;
        for _ in 0..n {
            let Some(s) = heap.alloc(slab_bytes as usize) else {
                break;
            };
            let first = round_up(s + SLAB_HDR as u32, align);
            write_u32(heap.region_mut(), s as usize, per_slab);
            write_u32(heap.region_mut(), s as usize + 4, first);
            let mut links = self.links(heap);
            linkq::init(&mut links, s + SLAB_LINK_AT);
            linkq::insert_before(&mut links, SLAB_HEAD, s + SLAB_LINK_AT);
            for i in 0..per_slab {
                let b = first + i * stride;
                linkq::init(&mut links, b);
                linkq::insert_after(&mut links, FREE_HEAD, b);
            }
            added += 1;
        }
        added
    }

    /// Takes a block, or `None` if every block is handed out (the
    /// caller may `add_slabs` and retry). Returns the block's region
    /// offset. ISR-safe under the interrupt mask.
    pub fn alloc(&mut self, heap: &mut Heap<'_>) -> Option<u32> {
        let mut links = self.links(heap);
        let b = linkq::pop_first(&mut links, FREE_HEAD)?;
        self.adjust_free_count(heap, b, -1);
        Some(b)
    }

    /// Returns a block to the pool. `at` must have come from
    /// [`Pool::alloc`] on this pool. ISR-safe under the interrupt mask.
    pub fn free(&mut self, heap: &mut Heap<'_>, at: u32) {
        let mut links = self.links(heap);
        linkq::init(&mut links, at);
        linkq::insert_after(&mut links, FREE_HEAD, at);
        self.adjust_free_count(heap, at, 1);
    }

    /// Returns up to `n` completely-free slabs to the heap, unthreading
    /// their blocks from the free list first. Returns how many slabs
    /// went back. Thread context only.
    pub fn free_unallocated_slabs(
        &mut self,
        heap: &mut Heap<'_>,
        n: usize,
    ) -> usize {
        let per_slab = self.blocks_per_slab;
        let stride = self.stride;
        let mut reclaimed = 0;
        let mut at = {
            let links = self.links(heap);
            linkq::next(&links, SLAB_HEAD)
        };
        while at != SLAB_HEAD && reclaimed < n {
            let s = at - SLAB_LINK_AT;
            let next = {
                let links = self.links(heap);
                linkq::next(&links, at)
            };
            let free_count = read_u32(heap.region(), s as usize);
            if free_count == per_slab {
                let first = read_u32(heap.region(), s as usize + 4);
                let mut links = self.links(heap);
                for i in 0..per_slab {
                    linkq::remove(&mut links, first + i * stride);
                }
                linkq::remove(&mut links, at);
                heap.free(s);
                reclaimed += 1;
            }
            at = next;
        }
        reclaimed
    }

    /// Number of blocks currently free across all slabs.
    pub fn free_blocks(&self, heap: &Heap<'_>) -> usize {
        let links = self.links_shared(heap);
        let mut n = 0;
        let mut at = linkq::next(&links, FREE_HEAD);
        while at != FREE_HEAD {
            n += 1;
            at = linkq::next(&links, at);
        }
        n
    }

    /// Block alignment in effect.
    pub fn align(&self) -> u32 {
        self.align
    }

    /// Distance between blocks (usable size is at least the requested
    /// block size).
    pub fn stride(&self) -> u32 {
        self.stride
    }

    fn links<'a, 'r>(&'a mut self, heap: &'a mut Heap<'r>) -> PoolLinks<'a, 'r> {
        PoolLinks {
            heap,
            free_head: &mut self.free_head,
            slab_head: &mut self.slab_head,
        }
    }

    fn links_shared<'a>(&'a self, heap: &'a Heap<'_>) -> ReadLinks<'a> {
        ReadLinks {
            mem: heap.region(),
            free_head: self.free_head,
            slab_head: self.slab_head,
        }
    }

    /// Finds the slab containing block `b` and bumps its free count.
    fn adjust_free_count(&mut self, heap: &mut Heap<'_>, b: u32, delta: i32) {
        let span = self.blocks_per_slab * self.stride;
        let mut at = {
            let links = self.links(heap);
            linkq::next(&links, SLAB_HEAD)
        };
        while at != SLAB_HEAD {
            let s = at - SLAB_LINK_AT;
            let first = read_u32(heap.region(), s as usize + 4);
            if b >= first && b < first + span {
                let count = read_u32(heap.region(), s as usize);
                let count = (count as i32 + delta) as u32;
                write_u32(heap.region_mut(), s as usize, count);
                return;
            }
            let links = self.links(heap);
            at = linkq::next(&links, at);
        }
        panic!("block belongs to no slab");
    }
}

/// Read-only view for walks that don't modify anything.
struct ReadLinks<'a> {
    mem: &'a [u8],
    free_head: Link,
    slab_head: Link,
}

impl LinkStore for ReadLinks<'_> {
    fn link(&self, ix: u32) -> Link {
        match ix {
            FREE_HEAD => self.free_head,
            SLAB_HEAD => self.slab_head,
            _ => Link {
                prev: read_u32(self.mem, ix as usize),
                next: read_u32(self.mem, ix as usize + 4),
            },
        }
    }

    fn set_link(&mut self, _ix: u32, _link: Link) {
        panic!("read-only link view");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_of(len: usize) -> (Vec<u8>, usize) {
        (vec![0u8; len], len)
    }

    #[test]
    fn blocks_are_aligned_and_distinct() {
        let (mut mem, _) = heap_of(8 * 1024);
        let mut heap = Heap::new(&mut mem, 8);
        let mut pool = Pool::new(24, 8, 4);
        assert_eq!(pool.add_slabs(&mut heap, 2), 2);
        assert_eq!(pool.free_blocks(&mut heap), 8);

        let mut got = vec![];
        while let Some(b) = pool.alloc(&mut heap) {
            assert_eq!(b % 8, 0, "misaligned block");
            assert!(!got.contains(&b), "duplicate block");
            got.push(b);
        }
        assert_eq!(got.len(), 8);
        for b in got {
            pool.free(&mut heap, b);
        }
        assert_eq!(pool.free_blocks(&mut heap), 8);
    }

    #[test]
    fn add_slabs_reports_heap_exhaustion() {
        let (mut mem, _) = heap_of(1024);
        let mut heap = Heap::new(&mut mem, 8);
        // Each slab wants ~4KB; none fit more than once.
        let mut pool = Pool::new(64, 8, 64);
        assert_eq!(pool.add_slabs(&mut heap, 3), 0);
        let mut small = Pool::new(16, 8, 8);
        assert!(small.add_slabs(&mut heap, 10) < 10);
    }

    #[test]
    fn reclaim_only_fully_free_slabs() {
        let (mut mem, _) = heap_of(16 * 1024);
        let mut heap = Heap::new(&mut mem, 8);
        let mut pool = Pool::new(32, 8, 4);
        assert_eq!(pool.add_slabs(&mut heap, 3), 3);

        // Pin one block; its slab must survive reclamation.
        let pinned = pool.alloc(&mut heap).unwrap();
        assert_eq!(pool.free_unallocated_slabs(&mut heap, 8), 2);
        assert_eq!(pool.free_blocks(&mut heap), 3);

        // Still usable.
        let b = pool.alloc(&mut heap).unwrap();
        pool.free(&mut heap, b);
        pool.free(&mut heap, pinned);
        assert_eq!(pool.free_unallocated_slabs(&mut heap, 8), 1);
        assert_eq!(pool.free_blocks(&mut heap), 0);
    }

    #[test]
    fn small_blocks_get_link_room() {
        let (mut mem, _) = heap_of(4 * 1024);
        let mut heap = Heap::new(&mut mem, 8);
        let pool = Pool::new(4, 4, 4);
        assert!(pool.stride() >= 8);
        let mut pool = pool;
        assert_eq!(pool.add_slabs(&mut heap, 1), 1);
        let a = pool.alloc(&mut heap).unwrap();
        let b = pool.alloc(&mut heap).unwrap();
        assert!(a.abs_diff(b) >= 8);
    }
}
