//! Ownership bookkeeping for pages held by a fragmentation run.

use crate::{allocator::normalize_refs, Block, ContractViolation, PageAllocator};
use alloc::{collections::BTreeSet, format, vec::Vec};

/// Which list a unit lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pool {
    /// Whole, never split blocks that keep free memory down.
    Pressure,
    /// Order-0 pages kept out of split blocks.
    Fragment,
}

/// Where a unit is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// Allocated and populated, not yet split.
    JustAllocated,
    /// Split, with the decision to keep or free still pending.
    SplitPending,
    /// Owned by the registry until release.
    Retained,
    /// Returned to the allocator.
    Released,
}

/// One block or page the run allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentUnit<P> {
    page: P,
    order: u32,
    pool: Pool,
    state: UnitState,
}

impl<P: Copy> FragmentUnit<P> {
    /// A freshly allocated block.
    pub fn allocated(block: Block<P>, pool: Pool) -> Self {
        FragmentUnit {
            page: block.page,
            order: block.order,
            pool,
            state: UnitState::JustAllocated,
        }
    }

    /// A base page produced by splitting a block.
    pub fn split_page(page: P) -> Self {
        FragmentUnit {
            page,
            order: 0,
            pool: Pool::Fragment,
            state: UnitState::SplitPending,
        }
    }

    /// The unit's first page.
    #[inline]
    pub fn page(&self) -> P {
        self.page
    }

    /// The unit's order.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// The unit's pool.
    #[inline]
    pub fn pool(&self) -> Pool {
        self.pool
    }

    /// The unit's state.
    #[inline]
    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Keep the unit until release.
    pub fn retain(mut self) -> Self {
        debug_assert_ne!(self.state, UnitState::Released);
        self.state = UnitState::Retained;
        self
    }

    /// Mark the unit as returned to the allocator.
    pub fn release(mut self) -> Self {
        self.state = UnitState::Released;
        self
    }
}

/// What a release pass returned to the allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    /// Pressure blocks freed.
    pub pressure_units: usize,
    /// Fragment pages freed.
    pub fragment_units: usize,
    /// Base pages freed, across both pools.
    pub pages: u64,
    /// Units dropped without a free because the allocator no longer held a
    /// reference to them.
    pub dead_units: usize,
}

impl ReleaseSummary {
    /// Units freed, across both pools.
    pub fn units(&self) -> usize {
        self.pressure_units + self.fragment_units
    }
}

/// The pressure and fragment lists of one run.
///
/// Every unit is on at most one list, and appears there at most once.
#[derive(Debug)]
pub struct FragmentRegistry<P> {
    pressure: Vec<FragmentUnit<P>>,
    fragments: Vec<FragmentUnit<P>>,
    owned: BTreeSet<P>,
}

impl<P> Default for FragmentRegistry<P> {
    fn default() -> Self {
        FragmentRegistry {
            pressure: Vec::new(),
            fragments: Vec::new(),
            owned: BTreeSet::new(),
        }
    }
}

impl<P> FragmentRegistry<P>
where
    P: Copy + Ord + core::fmt::Debug,
{
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Units on the pressure list.
    #[inline]
    pub fn pressure_len(&self) -> usize {
        self.pressure.len()
    }

    /// Units on the fragment list.
    #[inline]
    pub fn fragment_len(&self) -> usize {
        self.fragments.len()
    }

    /// Are both lists empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pressure.is_empty() && self.fragments.is_empty()
    }

    /// Does the registry own `page`?
    #[inline]
    pub fn owns(&self, page: P) -> bool {
        self.owned.contains(&page)
    }

    /// Iterate over the fragment list.
    pub fn fragments(&self) -> impl Iterator<Item = &FragmentUnit<P>> + '_ {
        self.fragments.iter()
    }

    /// Iterate over the pressure list.
    pub fn pressure(&self) -> impl Iterator<Item = &FragmentUnit<P>> + '_ {
        self.pressure.iter()
    }

    fn claim(&mut self, page: P) -> Result<(), ContractViolation> {
        if self.owned.insert(page) {
            Ok(())
        } else {
            Err(ContractViolation::DuplicateOwnership {
                page: format!("{page:?}"),
            })
        }
    }

    /// Put a whole block on the pressure list.
    pub fn track_pressure(&mut self, block: Block<P>) -> Result<(), ContractViolation> {
        self.claim(block.page)?;
        self.pressure
            .push(FragmentUnit::allocated(block, Pool::Pressure).retain());
        Ok(())
    }

    /// Put a retained page on the fragment list.
    ///
    /// # Panics
    ///
    /// Panics if `unit` is not in the `Retained` state or not a fragment
    /// unit.
    pub fn track_fragment(&mut self, unit: FragmentUnit<P>) -> Result<(), ContractViolation> {
        assert_eq!(unit.state(), UnitState::Retained);
        assert_eq!(unit.pool(), Pool::Fragment);
        self.claim(unit.page())?;
        self.fragments.push(unit);
        Ok(())
    }

    /// Free everything on the pressure list.
    ///
    /// Returns the number of blocks freed.
    pub fn release_pressure<A>(&mut self, allocator: &A) -> usize
    where
        A: PageAllocator<Page = P> + ?Sized,
    {
        let mut summary = ReleaseSummary::default();
        let units = core::mem::take(&mut self.pressure);
        self.release_units(allocator, units, &mut summary);
        summary.pressure_units
    }

    /// Free everything on both lists, pressure first.
    ///
    /// Calling this again frees nothing.
    pub fn release_all<A>(&mut self, allocator: &A) -> ReleaseSummary
    where
        A: PageAllocator<Page = P> + ?Sized,
    {
        let mut summary = ReleaseSummary::default();

        let pressure = core::mem::take(&mut self.pressure);
        self.release_units(allocator, pressure, &mut summary);

        let fragments = core::mem::take(&mut self.fragments);
        self.release_units(allocator, fragments, &mut summary);

        debug_assert!(self.owned.is_empty());
        summary
    }

    fn release_units<A>(
        &mut self,
        allocator: &A,
        units: Vec<FragmentUnit<P>>,
        summary: &mut ReleaseSummary,
    ) where
        A: PageAllocator<Page = P> + ?Sized,
    {
        for unit in units {
            self.owned.remove(&unit.page());

            if let Err(e) = normalize_refs(allocator, unit.page()) {
                log::error!("not freeing {:?} unit: {e}", unit.pool());
                summary.dead_units += 1;
                continue;
            }

            allocator.free(unit.page(), unit.order());
            let unit = unit.release();
            debug_assert_eq!(unit.state(), UnitState::Released);

            summary.pages += 1u64 << unit.order();
            match unit.pool() {
                Pool::Pressure => summary.pressure_units += 1,
                Pool::Fragment => summary.fragment_units += 1,
            }
        }
    }
}
