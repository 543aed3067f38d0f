//! A simulated buddy allocator.
//!
//! `BuddyArena` carves memory obtained from an inner [`Allocator`] into zones
//! of base pages and manages each zone with classic binary buddy free lists:
//! one set of free block frame numbers per order, blocks split in halves on
//! allocation and merged with their buddy on free. It is both a
//! [`PageAllocator`] and a [`HistogramSource`], so an injector can fragment
//! it and a scorer can watch it fragment, deterministically and without
//! touching the host's memory management.
//!
//! Page handles are page frame numbers: page `n` lives at byte offset
//! `n * page_size` of the arena's memory. Every zone starts at a frame number
//! aligned to the largest block size, so a block's buddy is found by flipping
//! one bit of its frame number.

use crate::{
    AllocError, Allocator, Block, HistogramError, HistogramSource, MemoryStats, OrderHistogram,
    PageAllocator, ZoneHistogram,
};
use alloc::{
    collections::{BTreeMap, BTreeSet},
    string::String,
    vec,
    vec::Vec,
};
use core::{alloc::Layout, ptr::NonNull};

mod mutex;
use mutex::Mutex;
pub use mutex::{Lock, SingleThreadedLock, SpinLock};

/// One zone of a [`BuddyArena`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneSpec {
    /// The node the zone belongs to.
    pub node_id: u32,
    /// The zone's name.
    pub name: String,
    /// Base pages in the zone.
    pub pages: u64,
}

/// The shape of a [`BuddyArena`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Bytes per base page. Must be a power of two.
    pub page_size: usize,
    /// The largest block order, inclusive.
    pub max_order: u32,
    /// The zones, in allocation preference order.
    pub zones: Vec<ZoneSpec>,
}

impl ArenaConfig {
    /// An arena with no zones yet.
    pub fn new(page_size: usize, max_order: u32) -> Self {
        ArenaConfig {
            page_size,
            max_order,
            zones: Vec::new(),
        }
    }

    /// One `Normal` zone on node 0 of 4 KiB pages with blocks up to order 10.
    pub fn single_zone(pages: u64) -> Self {
        Self::new(4096, crate::DEFAULT_MAX_ORDER).with_zone(0, "Normal", pages)
    }

    /// Add a zone.
    pub fn with_zone(mut self, node_id: u32, name: &str, pages: u64) -> Self {
        self.zones.push(ZoneSpec {
            node_id,
            name: String::from(name),
            pages,
        });
        self
    }

    fn max_block_pages(&self) -> Option<u64> {
        1u64.checked_shl(self.max_order).filter(|_| self.max_order < 32)
    }

    /// Base pages spanned by all zones, including alignment padding.
    fn span_pages(&self) -> Option<u64> {
        let max_block = self.max_block_pages()?;
        self.zones.iter().try_fold(0u64, |span, zone| {
            let padded = zone.pages.checked_next_multiple_of(max_block)?;
            span.checked_add(padded)
        })
    }

    fn layout(&self) -> Option<Layout> {
        let bytes = self
            .span_pages()?
            .checked_mul(u64::try_from(self.page_size).ok()?)?;
        let bytes = usize::try_from(bytes).ok().filter(|b| *b > 0)?;
        Layout::from_size_align(bytes, self.page_size).ok()
    }
}

/// Counters kept by a [`BuddyArena`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Successful block allocations.
    pub allocations: u64,
    /// Failed block allocations.
    pub failed_allocations: u64,
    /// Blocks and pages returned to the free lists.
    pub frees: u64,
    /// Frees, splits or reference drops of pages that were not live, or not
    /// of the given order.
    pub invalid_frees: u64,
    /// Live blocks and split pages.
    pub live: u64,
}

#[derive(Clone, Copy, Debug)]
struct LivePage {
    order: u32,
    refs: u32,
    reclaimable: bool,
}

struct ZoneState {
    node_id: u32,
    name: String,
    start: u64,
    pages: u64,
    free_pages: u64,
    free: Vec<BTreeSet<u64>>,
}

impl ZoneState {
    fn contains(&self, pfn: u64) -> bool {
        (self.start..self.start + self.pages).contains(&pfn)
    }

    fn histogram(&self) -> OrderHistogram {
        OrderHistogram::from_counts(self.free.iter().map(|set| set.len() as u64))
    }

    /// Take a free block of at least `order`, splitting it down.
    fn take(&mut self, order: u32) -> Option<u64> {
        let found = (order as usize..self.free.len()).find(|o| !self.free[*o].is_empty())?;
        let pfn = self.free[found].pop_first()?;
        for o in (order as usize..found).rev() {
            self.free[o].insert(pfn + (1 << o));
        }
        self.free_pages -= 1 << order;
        Some(pfn)
    }

    /// Return a block, merging it with free buddies.
    fn give(&mut self, mut pfn: u64, order: u32) {
        self.free_pages += 1 << order;
        let max = self.free.len() - 1;
        let mut o = order as usize;
        while o < max {
            let buddy = pfn ^ (1 << o);
            if !self.free[o].remove(&buddy) {
                break;
            }
            pfn = pfn.min(buddy);
            o += 1;
        }
        self.free[o].insert(pfn);
    }
}

struct ArenaState {
    zones: Vec<ZoneState>,
    live: BTreeMap<u64, LivePage>,
    stats: ArenaStats,
}

impl ArenaState {
    fn zone_of(&mut self, pfn: u64) -> Option<&mut ZoneState> {
        self.zones.iter_mut().find(|z| z.contains(pfn))
    }

    fn release(&mut self, pfn: u64, order: u32) {
        self.stats.frees += 1;
        self.stats.live -= 1;
        if let Some(zone) = self.zone_of(pfn) {
            zone.give(pfn, order);
        }
    }

    fn invalid(&mut self, what: &str, pfn: u64, order: u32) {
        self.stats.invalid_frees += 1;
        log::warn!("invalid {what} of page {pfn:#x} at order {order}");
    }
}

/// A buddy allocator over memory obtained from an inner allocator.
///
/// Use [`SingleThreadedLock`] for `L` when the arena stays on one thread, and
/// [`SpinLock`] when it is shared, for example with a
/// [`ScoreReporter`](crate::ScoreReporter).
///
/// Callbacks passed to [`PageAllocator::populate`] run with the arena locked
/// and must not call back into it.
pub struct BuddyArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    inner: A,
    memory: NonNull<u8>,
    layout: Layout,
    page_size: usize,
    max_order: u32,
    pristine: Vec<OrderHistogram>,
    state: Mutex<ArenaState, L>,
}

// Safety: the arena's memory is only reached through the mutex, so sending
// the arena sends nothing that is shared.
unsafe impl<A, L> Send for BuddyArena<A, L>
where
    A: Allocator + Send,
    L: Lock + Send,
{
}

// Safety: every access to the arena's memory and state holds the lock.
unsafe impl<A, L> Sync for BuddyArena<A, L>
where
    A: Allocator + Sync,
    L: Lock + Sync,
{
}

impl<A, L> BuddyArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Create an arena shaped like `config`, taking its memory from `inner`.
    ///
    /// Fails if `inner` fails, or if `config` describes no memory, a page size
    /// that is not a power of two, or more memory than is addressable.
    pub fn new(config: ArenaConfig, inner: A, lock: L) -> Result<Self, AllocError> {
        let layout = config.layout().ok_or(AllocError)?;
        let max_block = config.max_block_pages().ok_or(AllocError)?;
        let memory = inner.allocate_zeroed(layout)?.cast::<u8>();

        let mut zones = Vec::with_capacity(config.zones.len());
        let mut start = 0u64;
        for spec in &config.zones {
            let mut zone = ZoneState {
                node_id: spec.node_id,
                name: spec.name.clone(),
                start,
                pages: spec.pages,
                free_pages: 0,
                free: vec![BTreeSet::new(); config.max_order as usize + 1],
            };

            let end = start + spec.pages;
            let mut pfn = start;
            while pfn < end {
                let order = (0..=config.max_order)
                    .rev()
                    .find(|o| pfn % (1 << o) == 0 && pfn + (1 << o) <= end)
                    .unwrap_or(0);
                zone.free[order as usize].insert(pfn);
                zone.free_pages += 1 << order;
                pfn += 1 << order;
            }

            start += spec.pages.next_multiple_of(max_block);
            zones.push(zone);
        }

        let pristine = zones.iter().map(ZoneState::histogram).collect();
        log::debug!(
            "buddy arena of {} bytes with {} zones",
            layout.size(),
            zones.len()
        );

        Ok(BuddyArena {
            inner,
            memory,
            layout,
            page_size: config.page_size,
            max_order: config.max_order,
            pristine,
            state: Mutex::new(
                ArenaState {
                    zones,
                    live: BTreeMap::new(),
                    stats: ArenaStats::default(),
                },
                lock,
            ),
        })
    }

    /// The largest block order.
    #[inline]
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// The arena's counters.
    pub fn arena_stats(&self) -> ArenaStats {
        self.state.lock().stats
    }

    /// Is every zone's free-area histogram what it was when the arena was
    /// created?
    ///
    /// True exactly when every page is free and fully coalesced.
    pub fn is_pristine(&self) -> bool {
        let state = self.state.lock();
        state
            .zones
            .iter()
            .zip(&self.pristine)
            .all(|(zone, pristine)| zone.histogram() == *pristine)
    }

    /// Is `page` reclaimable?
    pub fn is_reclaimable(&self, page: u64) -> bool {
        self.state
            .lock()
            .live
            .get(&page)
            .map_or(false, |p| p.reclaimable)
    }

    /// A copy of `page`'s bytes, if it lies within a zone.
    pub fn copy_page(&self, page: u64) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        state.zone_of(page)?;
        // Safety: the page lies within a zone, and so within the arena's
        // memory, and the lock is held.
        let bytes = unsafe { self.page_bytes(page) };
        Some(bytes.to_vec())
    }

    /// The free-area histogram of every zone, by zone declaration order.
    pub fn zone_histograms(&self) -> Vec<ZoneHistogram> {
        let state = self.state.lock();
        let mut zone_ids: BTreeMap<u32, u32> = BTreeMap::new();
        let mut node_present: BTreeMap<u32, u64> = BTreeMap::new();
        for zone in &state.zones {
            *node_present.entry(zone.node_id).or_default() += zone.pages;
        }

        state
            .zones
            .iter()
            .map(|zone| {
                let zone_id = zone_ids.entry(zone.node_id).or_default();
                let histogram = ZoneHistogram {
                    node_id: zone.node_id,
                    zone_id: *zone_id,
                    zone_name: zone.name.clone(),
                    present_pages: zone.pages,
                    node_present_pages: node_present[&zone.node_id],
                    histogram: zone.histogram(),
                };
                *zone_id += 1;
                histogram
            })
            .collect()
    }

    /// # Safety
    ///
    /// `page` must lie within a zone and the caller must hold the lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn page_bytes(&self, page: u64) -> &mut [u8] {
        let offset = page as usize * self.page_size;
        debug_assert!(offset + self.page_size <= self.layout.size());
        core::slice::from_raw_parts_mut(self.memory.as_ptr().add(offset), self.page_size)
    }
}

impl<A, L> PageAllocator for BuddyArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    type Page = u64;

    #[inline]
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self, order: u32) -> Result<Block<u64>, AllocError> {
        let mut state = self.state.lock();
        let state = &mut *state;

        if order > self.max_order {
            state.stats.failed_allocations += 1;
            return Err(AllocError);
        }

        let Some(page) = state.zones.iter_mut().find_map(|zone| zone.take(order)) else {
            state.stats.failed_allocations += 1;
            return Err(AllocError);
        };

        state.live.insert(
            page,
            LivePage {
                order,
                refs: 1,
                reclaimable: false,
            },
        );
        state.stats.allocations += 1;
        state.stats.live += 1;
        Ok(Block { page, order })
    }

    fn populate(&self, block: &Block<u64>, fill: &mut dyn FnMut(usize, &mut [u8])) {
        let state = self.state.lock();
        match state.live.get(&block.page) {
            Some(p) if p.order == block.order => {}
            _ => {
                log::warn!("populate of non-live block {block:?}");
                return;
            }
        }
        for i in 0..block.pages() {
            // Safety: the block is live, so it lies within a zone, and the
            // lock is held.
            let bytes = unsafe { self.page_bytes(block.page + i as u64) };
            fill(i, bytes);
        }
    }

    fn split(&self, block: Block<u64>) -> Vec<u64> {
        let mut state = self.state.lock();
        match state.live.get(&block.page) {
            Some(p) if p.order == block.order => {}
            _ => {
                state.invalid("split", block.page, block.order);
                return Vec::new();
            }
        }

        let pages: Vec<u64> = (0..block.pages() as u64).map(|i| block.page + i).collect();
        state.live.remove(&block.page);
        state.stats.live -= 1;
        for &page in &pages {
            // The head page keeps the block's reference on top of its own.
            let refs = if page == block.page && block.order > 0 { 2 } else { 1 };
            state.live.insert(
                page,
                LivePage {
                    order: 0,
                    refs,
                    reclaimable: false,
                },
            );
            state.stats.live += 1;
        }
        pages
    }

    fn free(&self, page: u64, order: u32) {
        let mut state = self.state.lock();
        let Some(live) = state.live.get_mut(&page).filter(|p| p.order == order) else {
            state.invalid("free", page, order);
            return;
        };

        live.refs -= 1;
        if live.refs == 0 {
            state.live.remove(&page);
            state.release(page, order);
        }
    }

    fn memory_stats(&self) -> MemoryStats {
        let state = self.state.lock();
        state
            .zones
            .iter()
            .fold(MemoryStats::default(), |stats, zone| MemoryStats {
                total_pages: stats.total_pages + zone.pages,
                free_pages: stats.free_pages + zone.free_pages,
            })
    }

    fn ref_count(&self, page: u64) -> u32 {
        self.state.lock().live.get(&page).map_or(0, |p| p.refs)
    }

    fn put_ref(&self, page: u64) {
        let mut state = self.state.lock();
        let Some(live) = state.live.get_mut(&page) else {
            state.invalid("reference drop", page, 0);
            return;
        };

        live.refs -= 1;
        if live.refs == 0 {
            let order = live.order;
            state.live.remove(&page);
            state.release(page, order);
        }
    }

    fn mark_reclaimable(&self, page: u64) {
        if let Some(live) = self.state.lock().live.get_mut(&page) {
            live.reclaimable = true;
        }
    }
}

impl<A, L> HistogramSource for BuddyArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn read_histograms(&self) -> Result<Vec<ZoneHistogram>, HistogramError> {
        Ok(self.zone_histograms())
    }
}

impl<A, L> Drop for BuddyArena<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn drop(&mut self) {
        // Safety: the memory was allocated by `inner` with this layout, and no
        // page borrows outlive the lock guards that produced them.
        unsafe { self.inner.deallocate(self.memory, self.layout) };
    }
}
