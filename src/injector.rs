//! The fragmentation injector.
//!
//! The injector repeatedly allocates a `2^order` block, writes to every base
//! page, splits it into base pages, keeps every other run of [`KEEP_RUN`]
//! pages and frees the rest. The freed runs cannot coalesce back into an
//! order-`order` block while their kept neighbours are held, so every
//! iteration leaves the allocator a little more fragmented.
//!
//! Before fragmenting, the injector can fill a *pressure pool* of whole blocks
//! until free memory drops below a floor, so that fragmenting happens in a
//! realistic low-memory regime. When allocation fails while fragmenting, the
//! pressure pool is released and refilled, which lets the allocator hand out
//! different memory the second time around.

use crate::{
    allocator::normalize_refs, Block, Clock, ContractViolation, FragmentRegistry,
    FragmentUnit, FragmentationScorer, HistogramSource, InjectorConfig, PageAllocator,
    ReleaseSummary, StopReason,
};
use alloc::format;
use core::{fmt, time::Duration};

/// Length of the runs of split pages that are alternately kept and freed.
pub const KEEP_RUN: usize = 4;

/// Is the page at `index` within its split block kept?
#[inline]
pub fn is_kept(index: usize) -> bool {
    (index / KEEP_RUN) % 2 == 0
}

/// Write the populate pattern for the base page at `index` into `page`.
///
/// The page receives the text `alloc_pages <index>`, a NUL byte, and `'0'`
/// bytes up to its end. Pages too small for the text get a prefix of it.
pub fn fill_page(index: usize, page: &mut [u8]) {
    struct Cursor<'a> {
        buf: &'a mut [u8],
        pos: usize,
    }

    impl fmt::Write for Cursor<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let room = self.buf.len() - self.pos;
            let n = s.len().min(room);
            self.buf[self.pos..self.pos + n].copy_from_slice(&s.as_bytes()[..n]);
            self.pos += n;
            Ok(())
        }
    }

    let end = {
        let mut cursor = Cursor { buf: page, pos: 0 };
        let _ = fmt::Write::write_fmt(&mut cursor, format_args!("alloc_pages {index}"));
        cursor.pos
    };

    if let Some((nul, rest)) = page[end..].split_first_mut() {
        *nul = 0;
        rest.fill(b'0');
    }
}

/// The injector's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InjectorState {
    /// Not started.
    Idle,
    /// Filling the pressure pool.
    PressureFilling,
    /// Allocating, splitting and partially freeing blocks.
    Fragmenting,
    /// Finished. Terminal.
    Stopped(StopReason),
}

impl InjectorState {
    /// Has the run finished?
    #[inline]
    pub fn is_stopped(&self) -> bool {
        matches!(self, InjectorState::Stopped(_))
    }

    /// Why the run finished, if it has.
    #[inline]
    pub fn stop_reason(&self) -> Option<&StopReason> {
        match self {
            InjectorState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Counters describing a run so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InjectorStats {
    /// Fragmenting iterations, including ones whose allocation failed.
    pub iterations: u64,
    /// Blocks put on the pressure pool.
    pub pressure_allocations: u64,
    /// Base pages in successfully allocated blocks.
    pub pages_allocated: u64,
    /// Split pages kept on the fragment list.
    pub pages_retained: u64,
    /// Base pages returned to the allocator, by splitting or by release.
    pub pages_released: u64,
    /// Failed allocations.
    pub allocation_failures: u64,
    /// Times the pressure pool was released and refilled.
    pub pressure_refills: u64,
    /// Scores sampled to decide whether to stop.
    pub score_samples: u64,
}

/// Drives a [`PageAllocator`] into a fragmented state.
///
/// Dropping the injector releases every page it still owns.
pub struct FragmentInjector<A, S, C>
where
    A: PageAllocator,
{
    config: InjectorConfig,
    allocator: A,
    scorer: FragmentationScorer<S>,
    clock: C,
    registry: FragmentRegistry<A::Page>,
    state: InjectorState,
    consecutive_failures: u32,
    last_sample: Duration,
    stats: InjectorStats,
}

impl<A, S, C> FragmentInjector<A, S, C>
where
    A: PageAllocator,
    S: HistogramSource,
    C: Clock,
{
    /// Create an idle injector.
    pub fn new(
        config: InjectorConfig,
        allocator: A,
        scorer: FragmentationScorer<S>,
        clock: C,
    ) -> Self {
        FragmentInjector {
            config,
            allocator,
            scorer,
            clock,
            registry: FragmentRegistry::new(),
            state: InjectorState::Idle,
            consecutive_failures: 0,
            last_sample: Duration::ZERO,
            stats: InjectorStats::default(),
        }
    }

    /// The configuration.
    #[inline]
    pub fn config(&self) -> &InjectorConfig {
        &self.config
    }

    /// The current state.
    #[inline]
    pub fn state(&self) -> &InjectorState {
        &self.state
    }

    /// Counters for the run so far.
    #[inline]
    pub fn stats(&self) -> &InjectorStats {
        &self.stats
    }

    /// The pages currently owned.
    #[inline]
    pub fn registry(&self) -> &FragmentRegistry<A::Page> {
        &self.registry
    }

    /// The allocator being fragmented.
    #[inline]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The scorer consulted for stop decisions.
    #[inline]
    pub fn scorer(&self) -> &FragmentationScorer<S> {
        &self.scorer
    }

    /// Allocation failures since the last success.
    #[inline]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Run one iteration.
    ///
    /// Starting an idle injector and its first iteration happen in the same
    /// step. Stepping a stopped injector does nothing.
    pub fn step(&mut self) -> &InjectorState {
        if self.state == InjectorState::Idle {
            self.start();
        }

        let result = match self.state {
            InjectorState::PressureFilling => self.fill_pressure_once(),
            InjectorState::Fragmenting => self.fragment_once(),
            InjectorState::Idle | InjectorState::Stopped(_) => Ok(()),
        };

        if let Err(reason) = result {
            self.stop(reason);
        }
        &self.state
    }

    /// Step until stopped, returning why.
    pub fn run(&mut self) -> StopReason {
        loop {
            if let InjectorState::Stopped(reason) = self.step() {
                return reason.clone();
            }
        }
    }

    /// Return every owned page to the allocator.
    ///
    /// This works in any state and may be called any number of times.
    pub fn release_all(&mut self) -> ReleaseSummary {
        let summary = self.registry.release_all(&self.allocator);
        self.stats.pages_released += summary.pages;
        if summary.units() > 0 || summary.dead_units > 0 {
            log::info!(
                "released {} pressure blocks and {} fragment pages ({} pages, {} dead)",
                summary.pressure_units,
                summary.fragment_units,
                summary.pages,
                summary.dead_units
            );
        }
        summary
    }

    fn start(&mut self) {
        log::info!(
            "fragmenting with order {} (stop score {}, pressure {})",
            self.config.order(),
            self.config.stop_score(),
            if self.config.pressure_enabled() {
                "on"
            } else {
                "off"
            }
        );

        match self.scorer.system_snapshot() {
            Ok(snapshot) => {
                for node in snapshot.iter() {
                    log::info!(
                        "initial fragmentation score {} on node {}",
                        node.score,
                        node.node_id
                    );
                }
            }
            Err(e) => log::warn!("cannot read initial fragmentation score: {e}"),
        }

        self.last_sample = self.clock.now();
        self.state = if self.config.pressure_enabled() {
            InjectorState::PressureFilling
        } else {
            InjectorState::Fragmenting
        };
    }

    fn stop(&mut self, reason: StopReason) {
        if reason.is_expected() {
            log::info!("stopping: {reason}");
        } else {
            log::warn!("stopping: {reason}");
        }
        log::info!(
            "holding {} pressure blocks and {} fragment pages",
            self.registry.pressure_len(),
            self.registry.fragment_len()
        );
        self.state = InjectorState::Stopped(reason);
    }

    fn populate(&self, block: &Block<A::Page>) {
        self.allocator
            .populate(block, &mut |index, page: &mut [u8]| fill_page(index, page));
    }

    fn check_block(&self, block: Block<A::Page>) -> Result<(), StopReason> {
        if block.order >= self.config.order() {
            return Ok(());
        }
        self.allocator.free(block.page, block.order);
        Err(StopReason::AllocatorContractViolation(
            ContractViolation::ShortBlock {
                requested: self.config.order(),
                returned: block.order,
            },
        ))
    }

    fn fill_pressure_once(&mut self) -> Result<(), StopReason> {
        let memory = self.allocator.memory_stats();
        if memory.free_percent() < u64::from(self.config.free_ratio_floor()) {
            log::info!(
                "pressure pool holds {} blocks, free memory at {}%",
                self.registry.pressure_len(),
                memory.free_percent()
            );
            self.state = InjectorState::Fragmenting;
            return Ok(());
        }

        let block = self.allocator.allocate(self.config.order()).map_err(|_| {
            self.stats.allocation_failures += 1;
            StopReason::AllocationExhausted {
                during_pressure: true,
                consecutive_failures: 1,
            }
        })?;
        self.check_block(block)?;
        self.populate(&block);
        self.registry
            .track_pressure(block)
            .map_err(StopReason::AllocatorContractViolation)?;

        self.stats.pressure_allocations += 1;
        self.stats.pages_allocated += block.pages() as u64;
        Ok(())
    }

    fn allocation_failed(&mut self) -> Result<(), StopReason> {
        self.stats.allocation_failures += 1;
        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.config.max_consecutive_failures() {
            return Err(StopReason::AllocationExhausted {
                during_pressure: false,
                consecutive_failures: self.consecutive_failures,
            });
        }

        if self.config.pressure_enabled() && self.registry.pressure_len() > 0 {
            let freed = self.registry.release_pressure(&self.allocator);
            self.stats.pages_released += (freed as u64) << self.config.order();
            self.stats.pressure_refills += 1;
            log::info!("allocation failed, released {freed} pressure blocks to refill");
            self.state = InjectorState::PressureFilling;
        } else {
            log::debug!(
                "allocation failed ({} in a row)",
                self.consecutive_failures
            );
        }
        Ok(())
    }

    /// Free split pages after a contract violation, skipping any that are
    /// dead or already owned.
    fn discard(&self, pages: &[A::Page]) {
        for &page in pages {
            if self.registry.owns(page) || normalize_refs(&self.allocator, page).is_err() {
                continue;
            }
            self.allocator.free(page, 0);
        }
    }

    fn fragment_once(&mut self) -> Result<(), StopReason> {
        self.stats.iterations += 1;
        let order = self.config.order();

        let block = match self.allocator.allocate(order) {
            Ok(block) => block,
            Err(_) => return self.allocation_failed(),
        };
        self.consecutive_failures = 0;
        self.check_block(block)?;
        self.stats.pages_allocated += block.pages() as u64;

        self.populate(&block);

        let memory = self.allocator.memory_stats();
        if memory.free_percent() < u64::from(self.config.low_water_percent()) {
            self.registry
                .track_pressure(block)
                .map_err(StopReason::AllocatorContractViolation)?;
            return Err(StopReason::MemoryPressureCritical {
                free_percent: memory.free_percent(),
                low_water: self.config.low_water_percent(),
            });
        }

        let expected = block.pages();
        let pages = self.allocator.split(block);
        self.check_split(expected, &pages)?;

        // Every split page holds exactly one reference before it is kept or
        // freed, or a freed page stays pinned.
        for &page in &pages {
            if let Err(violation) = normalize_refs(&self.allocator, page) {
                self.discard(&pages);
                return Err(StopReason::AllocatorContractViolation(violation));
            }
        }

        let mut kept = 0;
        for (index, page) in pages.into_iter().enumerate() {
            if is_kept(index) {
                self.allocator.mark_reclaimable(page);
                self.registry
                    .track_fragment(FragmentUnit::split_page(page).retain())
                    .map_err(StopReason::AllocatorContractViolation)?;
                kept += 1;
            } else {
                self.allocator.free(page, 0);
            }
        }
        self.stats.pages_retained += kept;
        self.stats.pages_released += expected as u64 - kept;

        log::debug!(
            "iteration {}: kept {kept} of {expected} pages, {} fragments held",
            self.stats.iterations,
            self.registry.fragment_len()
        );

        self.maybe_sample()
    }

    fn check_split(&self, expected: usize, pages: &[A::Page]) -> Result<(), StopReason> {
        let violation = if pages.len() != expected {
            Some(ContractViolation::ShortSplit {
                expected,
                returned: pages.len(),
            })
        } else if let Some(page) = pages.iter().find(|p| self.allocator.ref_count(**p) == 0) {
            Some(ContractViolation::DeadReference {
                page: format!("{page:?}"),
            })
        } else {
            pages
                .iter()
                .find(|p| self.registry.owns(**p))
                .map(|page| ContractViolation::DuplicateOwnership {
                    page: format!("{page:?}"),
                })
        };

        match violation {
            None => Ok(()),
            Some(violation) => {
                self.discard(pages);
                Err(StopReason::AllocatorContractViolation(violation))
            }
        }
    }

    fn maybe_sample(&mut self) -> Result<(), StopReason> {
        let threshold = self.config.stop_score();
        if threshold == 0 {
            return Ok(());
        }

        let now = self.clock.now();
        if now.saturating_sub(self.last_sample) < self.config.score_interval() {
            return Ok(());
        }
        self.last_sample = now;
        self.stats.score_samples += 1;

        let snapshot = self
            .scorer
            .system_snapshot()
            .map_err(StopReason::ScoreUnavailable)?;

        if let Some(node) = snapshot.first_at_or_above(u64::from(threshold)) {
            return Err(StopReason::ScoreThresholdReached {
                node_id: node.node_id,
                score: node.score,
                threshold,
            });
        }

        log::debug!(
            "fragmentation score {} after {} iterations",
            snapshot.max_score().unwrap_or(0),
            self.stats.iterations
        );
        Ok(())
    }
}

impl<A, S, C> Drop for FragmentInjector<A, S, C>
where
    A: PageAllocator,
{
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            let summary = self.registry.release_all(&self.allocator);
            log::info!("released {} units on drop", summary.units());
        }
    }
}
