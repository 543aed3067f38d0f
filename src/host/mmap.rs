//! A page allocator over anonymous `mmap` regions.
//!
//! Each block is its own private anonymous mapping, faulted in by
//! [`PageAllocator::populate`]. Freeing a page drops its backing memory with
//! `madvise(MADV_DONTNEED)`, handing the physical page back to the kernel
//! while its neighbours stay resident; a mapping is unmapped once none of its
//! pages are live. Blocks are contiguous in virtual memory only: the kernel
//! decides which physical pages back them.

use crate::{AllocError, Block, MemoryStats, PageAllocator};
use core::ptr;
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
    vec::Vec,
};

#[derive(Clone, Copy, Debug)]
struct Mapping {
    len: usize,
    live_pages: usize,
}

#[derive(Clone, Copy, Debug)]
struct LivePage {
    mapping: usize,
    order: u32,
}

#[derive(Default)]
struct State {
    mappings: BTreeMap<usize, Mapping>,
    live: BTreeMap<usize, LivePage>,
}

/// Allocates blocks of host memory with `mmap`. Page handles are addresses.
pub struct MmapPageAllocator {
    page_size: usize,
    state: Mutex<State>,
}

impl Default for MmapPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapPageAllocator {
    /// An allocator of host-sized pages.
    pub fn new() -> Self {
        MmapPageAllocator {
            page_size: super::page_size(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mappings currently held.
    pub fn mappings(&self) -> usize {
        self.state().mappings.len()
    }
}

impl State {
    fn release(&mut self, page: usize, order: u32, page_size: usize) {
        let Some(live) = self.live.remove(&page) else {
            return;
        };
        let len = page_size << order;

        let Some(mapping) = self.mappings.get_mut(&live.mapping) else {
            return;
        };
        mapping.live_pages -= 1 << order;
        if mapping.live_pages == 0 {
            let len = mapping.len;
            self.mappings.remove(&live.mapping);
            // Safety: the mapping was created by `mmap` with this length and
            // no page of it is live.
            if unsafe { libc::munmap(live.mapping as *mut libc::c_void, len) } != 0 {
                log::warn!(
                    "munmap of {:#x}: {}",
                    live.mapping,
                    std::io::Error::last_os_error()
                );
            }
        } else {
            // Safety: the range lies within a live mapping and no longer holds
            // a live page.
            if unsafe { libc::madvise(page as *mut libc::c_void, len, libc::MADV_DONTNEED) } != 0 {
                log::warn!(
                    "madvise of {page:#x}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

impl PageAllocator for MmapPageAllocator {
    type Page = usize;

    #[inline]
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self, order: u32) -> Result<Block<usize>, AllocError> {
        let len = self.page_size.checked_shl(order).ok_or(AllocError)?;

        // Safety: an anonymous private mapping at a kernel-chosen address
        // aliases nothing.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::debug!(
                "mmap of {len} bytes: {}",
                std::io::Error::last_os_error()
            );
            return Err(AllocError);
        }

        let page = addr as usize;
        let mut state = self.state();
        state.mappings.insert(
            page,
            Mapping {
                len,
                live_pages: 1 << order,
            },
        );
        state.live.insert(
            page,
            LivePage {
                mapping: page,
                order,
            },
        );
        Ok(Block { page, order })
    }

    fn populate(&self, block: &Block<usize>, fill: &mut dyn FnMut(usize, &mut [u8])) {
        {
            let state = self.state();
            match state.live.get(&block.page) {
                Some(live) if live.order == block.order => {}
                _ => {
                    log::warn!("populate of non-live block {block:?}");
                    return;
                }
            }
        }

        for i in 0..block.pages() {
            let page = block.page + i * self.page_size;
            // Safety: the block is live, so it is mapped read-write and only
            // its owner writes to it.
            let bytes = unsafe { std::slice::from_raw_parts_mut(page as *mut u8, self.page_size) };
            fill(i, bytes);
        }
    }

    fn split(&self, block: Block<usize>) -> Vec<usize> {
        let mut state = self.state();
        let Some(live) = state
            .live
            .get(&block.page)
            .copied()
            .filter(|l| l.order == block.order)
        else {
            log::warn!("split of non-live block {block:?}");
            return Vec::new();
        };

        let pages: Vec<usize> = (0..block.pages())
            .map(|i| block.page + i * self.page_size)
            .collect();
        for &page in &pages {
            state.live.insert(
                page,
                LivePage {
                    mapping: live.mapping,
                    order: 0,
                },
            );
        }
        pages
    }

    fn free(&self, page: usize, order: u32) {
        let mut state = self.state();
        match state.live.get(&page) {
            Some(live) if live.order == order => state.release(page, order, self.page_size),
            _ => log::warn!("invalid free of {page:#x} at order {order}"),
        }
    }

    fn memory_stats(&self) -> MemoryStats {
        super::memory_stats().unwrap_or_else(|e| {
            log::warn!("sysinfo: {e}");
            MemoryStats::default()
        })
    }
}

impl Drop for MmapPageAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (addr, mapping) in core::mem::take(&mut state.mappings) {
            // Safety: every remaining mapping was created by `mmap` with this
            // length, and the allocator is going away.
            unsafe { libc::munmap(addr as *mut libc::c_void, mapping.len) };
        }
        state.live.clear();
    }
}
