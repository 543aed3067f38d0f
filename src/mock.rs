//! In-crate test doubles.

use crate::{
    AllocError, Block, Clock, HistogramError, HistogramSource, MemoryStats, OrderHistogram,
    PageAllocator, ZoneHistogram,
};
use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};
use core::{
    cell::{Cell, RefCell},
    time::Duration,
};

pub const MOCK_PAGE_SIZE: usize = 64;

#[derive(Clone, Copy, Debug)]
struct MockPage {
    order: u32,
    refs: u32,
    reclaimable: bool,
}

/// A page allocator that hands out fresh, never reused, page numbers and
/// records everything that is done to them.
#[derive(Default)]
pub struct MockAllocator {
    next_page: Cell<u64>,
    live: RefCell<BTreeMap<u64, MockPage>>,
    contents: RefCell<BTreeMap<u64, Vec<u8>>>,
    freed: RefCell<Vec<(u64, u32)>>,
    bad_frees: Cell<u32>,
    allocate_calls: Cell<u32>,
    populate_calls: Cell<u32>,
    fail_always: Cell<bool>,
    fail_next: Cell<u32>,
    capacity_pages: Cell<Option<u64>>,
    stats: Cell<Option<MemoryStats>>,
    extra_head_ref: Cell<bool>,
    extra_ref_at: Cell<Option<usize>>,
    kernel_frees: Cell<bool>,
    short_split: Cell<bool>,
    dead_tail: Cell<bool>,
    short_block: Cell<bool>,
    repeat_last: Cell<Option<Block<u64>>>,
    repeat_blocks: Cell<bool>,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory counters are derived from a fixed capacity and allocations
    /// beyond it fail.
    pub fn with_capacity(pages: u64) -> Self {
        let mock = Self::new();
        mock.capacity_pages.set(Some(pages));
        mock
    }

    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.set(fail);
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.set(n);
    }

    pub fn set_stats(&self, stats: MemoryStats) {
        self.stats.set(Some(stats));
    }

    pub fn set_extra_head_ref(&self, extra: bool) {
        self.extra_head_ref.set(extra);
    }

    /// Split hands the page at `index` an extra reference.
    pub fn set_extra_ref_at(&self, index: Option<usize>) {
        self.extra_ref_at.set(index);
    }

    /// `free` drops one reference and only frees at zero, like the kernel's
    /// `__free_pages`.
    pub fn set_kernel_frees(&self, kernel: bool) {
        self.kernel_frees.set(kernel);
    }

    pub fn set_short_split(&self, short: bool) {
        self.short_split.set(short);
    }

    pub fn set_dead_tail(&self, dead: bool) {
        self.dead_tail.set(dead);
    }

    pub fn set_short_block(&self, short: bool) {
        self.short_block.set(short);
    }

    pub fn set_repeat_blocks(&self, repeat: bool) {
        self.repeat_blocks.set(repeat);
    }

    pub fn set_refs(&self, page: u64, refs: u32) {
        if let Some(p) = self.live.borrow_mut().get_mut(&page) {
            p.refs = refs;
        }
    }

    pub fn allocate_calls(&self) -> u32 {
        self.allocate_calls.get()
    }

    pub fn populate_calls(&self) -> u32 {
        self.populate_calls.get()
    }

    pub fn freed(&self) -> Vec<(u64, u32)> {
        self.freed.borrow().clone()
    }

    pub fn bad_frees(&self) -> u32 {
        self.bad_frees.get()
    }

    pub fn live_pages(&self) -> u64 {
        self.live
            .borrow()
            .values()
            .map(|p| 1u64 << p.order)
            .sum()
    }

    pub fn is_reclaimable(&self, page: u64) -> bool {
        self.live
            .borrow()
            .get(&page)
            .map_or(false, |p| p.reclaimable)
    }

    pub fn contents(&self, page: u64) -> Option<Vec<u8>> {
        self.contents.borrow().get(&page).cloned()
    }
}

impl PageAllocator for MockAllocator {
    type Page = u64;

    fn page_size(&self) -> usize {
        MOCK_PAGE_SIZE
    }

    fn allocate(&self, order: u32) -> Result<Block<u64>, AllocError> {
        self.allocate_calls.set(self.allocate_calls.get() + 1);

        if self.fail_always.get() {
            return Err(AllocError);
        }
        if self.fail_next.get() > 0 {
            self.fail_next.set(self.fail_next.get() - 1);
            return Err(AllocError);
        }
        if self.repeat_blocks.get() {
            if let Some(block) = self.repeat_last.get() {
                return Ok(block);
            }
        }
        if let Some(capacity) = self.capacity_pages.get() {
            if self.live_pages() + (1 << order) > capacity {
                return Err(AllocError);
            }
        }

        let order = if self.short_block.get() && order > 0 {
            order - 1
        } else {
            order
        };
        let page = self.next_page.get();
        self.next_page.set(page + (1 << order));
        self.live.borrow_mut().insert(
            page,
            MockPage {
                order,
                refs: 1,
                reclaimable: false,
            },
        );
        let block = Block { page, order };
        self.repeat_last.set(Some(block));
        Ok(block)
    }

    fn populate(&self, block: &Block<u64>, fill: &mut dyn FnMut(usize, &mut [u8])) {
        self.populate_calls.set(self.populate_calls.get() + 1);
        let mut contents = self.contents.borrow_mut();
        for i in 0..block.pages() {
            let mut bytes = vec![0xAA; MOCK_PAGE_SIZE];
            fill(i, &mut bytes);
            contents.insert(block.page + i as u64, bytes);
        }
    }

    fn split(&self, block: Block<u64>) -> Vec<u64> {
        let mut live = self.live.borrow_mut();
        live.remove(&block.page);

        let mut pages: Vec<u64> = (0..block.pages() as u64).map(|i| block.page + i).collect();
        if self.short_split.get() {
            pages.pop();
        }
        for (i, page) in pages.iter().enumerate() {
            let refs = if i == 0 && self.extra_head_ref.get() {
                2
            } else if self.extra_ref_at.get() == Some(i) {
                2
            } else if i + 1 == block.pages() && self.dead_tail.get() {
                0
            } else {
                1
            };
            live.insert(
                *page,
                MockPage {
                    order: 0,
                    refs,
                    reclaimable: false,
                },
            );
        }
        pages
    }

    fn free(&self, page: u64, order: u32) {
        let mut live = self.live.borrow_mut();
        match live.get(&page) {
            Some(p) if p.order == order => {
                if self.kernel_frees.get() && p.refs > 1 {
                    if let Some(p) = live.get_mut(&page) {
                        p.refs -= 1;
                    }
                    return;
                }
                live.remove(&page);
                self.freed.borrow_mut().push((page, order));
            }
            _ => self.bad_frees.set(self.bad_frees.get() + 1),
        }
    }

    fn memory_stats(&self) -> MemoryStats {
        if let Some(stats) = self.stats.get() {
            return stats;
        }
        match self.capacity_pages.get() {
            Some(total) => MemoryStats {
                total_pages: total,
                free_pages: total.saturating_sub(self.live_pages()),
            },
            None => MemoryStats {
                total_pages: 100,
                free_pages: 50,
            },
        }
    }

    fn ref_count(&self, page: u64) -> u32 {
        self.live.borrow().get(&page).map_or(0, |p| p.refs)
    }

    fn put_ref(&self, page: u64) {
        let mut live = self.live.borrow_mut();
        if let Some(p) = live.get_mut(&page) {
            p.refs -= 1;
            if p.refs == 0 {
                live.remove(&page);
            }
        }
    }

    fn mark_reclaimable(&self, page: u64) {
        if let Some(p) = self.live.borrow_mut().get_mut(&page) {
            p.reclaimable = true;
        }
    }
}

/// A clock that only moves when told to, or by a fixed step on every read.
#[derive(Default)]
pub struct ManualClock {
    now: Cell<Duration>,
    tick: Duration,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticking(tick: Duration) -> Self {
        ManualClock {
            now: Cell::new(Duration::ZERO),
            tick,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        let now = self.now.get();
        self.now.set(now + self.tick);
        now
    }
}

/// A histogram source replaying canned reads; the last one repeats forever.
pub struct StaticSource {
    responses: RefCell<Vec<Result<Vec<ZoneHistogram>, HistogramError>>>,
    reads: Cell<u32>,
}

impl StaticSource {
    pub fn new(zones: Vec<ZoneHistogram>) -> Self {
        Self::scripted(vec![Ok(zones)])
    }

    pub fn scripted(responses: Vec<Result<Vec<ZoneHistogram>, HistogramError>>) -> Self {
        assert!(!responses.is_empty());
        StaticSource {
            responses: RefCell::new(responses),
            reads: Cell::new(0),
        }
    }

    pub fn reads(&self) -> u32 {
        self.reads.get()
    }
}

impl HistogramSource for StaticSource {
    fn read_histograms(&self) -> Result<Vec<ZoneHistogram>, HistogramError> {
        self.reads.set(self.reads.get() + 1);
        let mut responses = self.responses.borrow_mut();
        if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses[0].clone()
        }
    }
}

pub fn zone(
    node_id: u32,
    zone_id: u32,
    present_pages: u64,
    node_present_pages: u64,
    counts: &[u64],
) -> ZoneHistogram {
    ZoneHistogram {
        node_id,
        zone_id,
        zone_name: String::from("Normal"),
        present_pages,
        node_present_pages,
        histogram: OrderHistogram::from_counts(counts.iter().copied()),
    }
}
