//! IOVA-mapped shared memory regions
//!
//! A [`SharedRegion`] is memory visible to both the host and the DCE. The
//! host addresses it through the region handle, the DCE through its device
//! address (IOVA). Storage is word addressed and atomic so both sides may
//! touch it concurrently without any unsafe aliasing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::{IpcError, Result};

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Align address up to page boundary
#[inline]
pub const fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Calculate number of pages needed for size
#[inline]
pub const fn pages_needed(size: usize) -> usize {
    align_up(size) / PAGE_SIZE
}

/// Shared memory region with a device-visible address
#[derive(Clone)]
pub struct SharedRegion {
    iova: u64,
    words: Arc<[AtomicU32]>,
}

impl SharedRegion {
    /// Create a zeroed region of `size` bytes (rounded up to a word)
    pub fn new(iova: u64, size: usize) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self { iova, words }
    }

    /// Device-visible address of the first byte
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Two handles to the same backing memory
    pub fn same_memory(&self, other: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0, "unaligned shared-memory access at {:#x}", offset);
        &self.words[offset / 4]
    }

    /// Load a word with acquire ordering (pairs with [`store_u32`](Self::store_u32))
    pub fn load_u32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    /// Store a word with release ordering, publishing earlier writes
    pub fn store_u32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Release);
    }

    /// Little-endian 64-bit load from two consecutive words
    pub fn load_u64(&self, offset: usize) -> u64 {
        let lo = u64::from(self.load_u32(offset));
        let hi = u64::from(self.load_u32(offset + 4));
        lo | (hi << 32)
    }

    pub fn store_u64(&self, offset: usize, value: u64) {
        self.store_u32(offset, value as u32);
        self.store_u32(offset + 4, (value >> 32) as u32);
    }

    /// Copy `out.len()` bytes starting at `offset`
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        for (i, chunk) in out.chunks_mut(4).enumerate() {
            let word = self.word(offset + i * 4).load(Ordering::Relaxed).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    /// Copy `data` in starting at `offset`
    ///
    /// A trailing partial word is zero padded.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.word(offset + i * 4)
                .store(u32::from_le_bytes(word), Ordering::Relaxed);
        }
    }

    /// Zero `len` bytes starting at `offset`
    pub fn fill_zero(&self, offset: usize, len: usize) {
        for i in (0..len).step_by(4) {
            self.word(offset + i).store(0, Ordering::Relaxed);
        }
    }

    /// Byte-granular copy out; `offset` need not be word aligned
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let start = offset & !3;
        let end = (offset + out.len()).next_multiple_of(4);
        let mut span = vec![0u8; end - start];
        self.read_bytes(start, &mut span);
        let skip = offset - start;
        out.copy_from_slice(&span[skip..skip + out.len()]);
    }

    /// Byte-granular copy in, preserving neighbouring bytes of partial words
    ///
    /// Not atomic with respect to a concurrent writer of the same words.
    pub fn copy_in(&self, offset: usize, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let at = offset + i;
            let word = self.word(at & !3);
            let shift = (at & 3) * 8;
            let old = word.load(Ordering::Relaxed);
            let new = (old & !(0xff << shift)) | (u32::from(byte) << shift);
            word.store(new, Ordering::Relaxed);
        }
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("len", &self.len())
            .finish()
    }
}

/// Allocator for device-visible memory
///
/// Supplied by the platform; the control plane only needs page-aligned
/// regions with a known IOVA.
pub trait IovaAllocator: Send + Sync {
    /// Allocate a zeroed region of at least `size` bytes
    fn allocate(&self, size: usize) -> Result<SharedRegion>;

    /// Return a region to the allocator
    fn free(&self, region: &SharedRegion);

    /// Device-side view: the region mapped at `iova`, if any
    fn lookup(&self, iova: u64) -> Option<SharedRegion>;
}

struct PoolState {
    next: u64,
    live: BTreeMap<u64, SharedRegion>,
    /// Freed ranges keyed by size, reused first-fit on exact size
    free: BTreeMap<usize, Vec<u64>>,
}

/// Bump allocator over a fixed IOVA window
///
/// Freed regions are recycled when a later request has the same page count.
pub struct IovaPool {
    base: u64,
    size: u64,
    state: Mutex<PoolState>,
}

impl IovaPool {
    /// Create a pool covering `[base, base + size)`
    ///
    /// # Errors
    /// `base` must be page aligned and the window must stay below 4 GiB,
    /// because boot commands carry page frame numbers in 20 bits.
    pub fn new(base: u64, size: u64) -> Result<Self> {
        if base % PAGE_SIZE as u64 != 0 || base + size > (1u64 << 32) {
            return Err(IpcError::InvalidGeometry("IOVA window must be page aligned and below 4 GiB"));
        }
        Ok(Self {
            base,
            size,
            state: Mutex::new(PoolState {
                next: base,
                live: BTreeMap::new(),
                free: BTreeMap::new(),
            }),
        })
    }

    /// Bytes handed out and not yet freed
    pub fn allocated(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.live.values().map(SharedRegion::len).sum()
    }

    /// Bytes never handed out
    pub fn available(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (self.base + self.size - state.next) as usize
    }
}

impl IovaAllocator for IovaPool {
    fn allocate(&self, size: usize) -> Result<SharedRegion> {
        if size == 0 {
            return Err(IpcError::InvalidGeometry("zero-sized region"));
        }
        let aligned = align_up(size);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let reused = state.free.get_mut(&aligned).and_then(Vec::pop);
        let iova = match reused {
            Some(iova) => iova,
            None => {
                if state.next + aligned as u64 > self.base + self.size {
                    return Err(IpcError::OutOfMemory { requested: aligned });
                }
                let iova = state.next;
                state.next += aligned as u64;
                iova
            }
        };

        let region = SharedRegion::new(iova, aligned);
        state.live.insert(iova, region.clone());
        log::debug!("iova: allocated {} pages at {:#x}", pages_needed(aligned), iova);
        Ok(region)
    }

    fn free(&self, region: &SharedRegion) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.live.remove(&region.iova()) {
            Some(live) => {
                state.free.entry(live.len()).or_default().push(live.iova());
                log::debug!("iova: freed {:#x}", live.iova());
            }
            None => log::warn!("iova: free of unknown region {:#x}", region.iova()),
        }
    }

    fn lookup(&self, iova: u64) -> Option<SharedRegion> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.live.get(&iova).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(pages_needed(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn test_region_word_access() {
        let region = SharedRegion::new(0x8000_0000, 64);
        region.store_u32(8, 0xdead_beef);
        assert_eq!(region.load_u32(8), 0xdead_beef);

        region.store_u64(16, 0x1122_3344_5566_7788);
        assert_eq!(region.load_u64(16), 0x1122_3344_5566_7788);
        assert_eq!(region.load_u32(16), 0x5566_7788);
    }

    #[test]
    fn test_region_byte_copy_with_padding() {
        let region = SharedRegion::new(0, 16);
        region.write_bytes(4, b"hello");

        let mut out = [0u8; 8];
        region.read_bytes(4, &mut out);
        assert_eq!(&out, b"hello\0\0\0");

        region.fill_zero(4, 8);
        region.read_bytes(4, &mut out);
        assert_eq!(out, [0u8; 8]);
    }

    #[test]
    fn test_region_unaligned_copy() {
        let region = SharedRegion::new(0, 16);
        region.store_u32(0, 0xaabb_ccdd);
        region.copy_in(1, b"xyz!");
        assert_eq!(region.load_u32(0) & 0xff, 0xdd);

        let mut out = [0u8; 4];
        region.copy_out(1, &mut out);
        assert_eq!(&out, b"xyz!");

        let mut one = [0u8; 1];
        region.copy_out(0, &mut one);
        assert_eq!(one[0], 0xdd);
    }

    #[test]
    fn test_pool_allocation_is_page_aligned() {
        let pool = IovaPool::new(0x8000_0000, 16 * PAGE_SIZE as u64).unwrap();

        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(PAGE_SIZE + 1).unwrap();
        assert_eq!(a.iova(), 0x8000_0000);
        assert_eq!(b.iova(), 0x8000_0000 + PAGE_SIZE as u64);
        assert_eq!(b.len(), 2 * PAGE_SIZE);
        assert_eq!(pool.allocated(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_pool_lookup_shares_memory() {
        let pool = IovaPool::new(0x8000_0000, 4 * PAGE_SIZE as u64).unwrap();
        let host = pool.allocate(PAGE_SIZE).unwrap();
        let device = pool.lookup(host.iova()).unwrap();

        host.store_u32(0, 7);
        assert!(host.same_memory(&device));
        assert_eq!(device.load_u32(0), 7);
        assert!(pool.lookup(0x9000_0000).is_none());
    }

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let pool = IovaPool::new(0x8000_0000, 2 * PAGE_SIZE as u64).unwrap();
        let a = pool.allocate(PAGE_SIZE).unwrap();
        let _b = pool.allocate(PAGE_SIZE).unwrap();

        let result = pool.allocate(PAGE_SIZE);
        assert!(matches!(result, Err(IpcError::OutOfMemory { .. })));

        pool.free(&a);
        let c = pool.allocate(PAGE_SIZE).unwrap();
        assert_eq!(c.iova(), a.iova());
        // Recycled memory comes back zeroed
        assert_eq!(c.load_u32(0), 0);
    }

    #[test]
    fn test_pool_rejects_bad_window() {
        assert!(IovaPool::new(0x8000_0001, PAGE_SIZE as u64).is_err());
        assert!(IovaPool::new(0xffff_f000, 2 * PAGE_SIZE as u64).is_err());
    }
}
