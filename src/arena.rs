// src/arena.rs
//! Bump allocator for stack records, backed by anonymous memory maps.
//!
//! Blocks are mapped outside the host runtime's managed heap, so the
//! collector never scans or moves them. There is no per-object free:
//! [`Arena::release`] (or drop) unmaps every block at once.

use crate::utils::errors::fatal;
use memmap2::{MmapMut, MmapOptions};
use std::ptr::NonNull;
use tracing::debug;

const ALIGN: usize = 8;

/// Region allocator handing out fixed-alignment byte ranges.
///
/// A single request larger than the block size is a programmer error and
/// aborts: callers are bounded by the maximum stack depth.
pub struct Arena {
    blocks: Vec<MmapMut>,
    off: usize,
    block_size: usize,
}

impl Arena {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            off: 0,
            block_size,
        }
    }

    /// Bump-allocate `size` bytes, 8-byte aligned.
    ///
    /// The returned pointer stays valid until [`Arena::release`] or drop;
    /// nothing referencing it may outlive the arena.
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        let size = (size + ALIGN - 1) & !(ALIGN - 1);
        if size > self.block_size {
            fatal("arena allocation exceeds block size");
        }
        if self.blocks.is_empty() || self.off + size > self.block_size {
            self.grow();
        }
        let block = match self.blocks.last_mut() {
            Some(b) => b,
            None => fatal("arena has no current block"),
        };
        // SAFETY: grow() guarantees the current block has at least `size`
        // bytes past `off`, and mmap never returns null.
        let ptr = unsafe { NonNull::new_unchecked(block.as_mut_ptr().add(self.off)) };
        self.off += size;
        ptr
    }

    fn grow(&mut self) {
        let block = match MmapOptions::new().len(self.block_size).map_anon() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("failed to map arena block: {e}");
                fatal("out of memory mapping arena block");
            }
        };
        debug!(
            block_size = self.block_size,
            blocks = self.blocks.len() + 1,
            "mapped arena block"
        );
        self.blocks.push(block);
        self.off = 0;
    }

    /// Unmap every block at once and reset the allocator.
    pub fn release(&mut self) {
        self.blocks.clear();
        self.off = 0;
    }

    /// Total bytes currently mapped.
    pub fn mapped_bytes(&self) -> usize {
        self.blocks.len() * self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_aligned() {
        let mut arena = Arena::new(4096);
        let a = arena.alloc(3);
        let b = arena.alloc(24);
        assert_eq!(a.as_ptr() as usize % ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % ALIGN, 0);
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_alloc_is_writable() {
        let mut arena = Arena::new(4096);
        let p = arena.alloc(16);
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xAB, 16);
            assert_eq!(*p.as_ptr(), 0xAB);
        }
    }

    #[test]
    fn test_grows_new_block_when_full() {
        let mut arena = Arena::new(64);
        arena.alloc(48);
        assert_eq!(arena.mapped_bytes(), 64);
        arena.alloc(48);
        assert_eq!(arena.mapped_bytes(), 128);
    }

    #[test]
    fn test_release_drops_all_blocks() {
        let mut arena = Arena::new(64);
        arena.alloc(48);
        arena.alloc(48);
        arena.release();
        assert_eq!(arena.mapped_bytes(), 0);
        // Usable again after release.
        arena.alloc(8);
        assert_eq!(arena.mapped_bytes(), 64);
    }
}
