//! The order-indexed page allocator the injector drives.

use crate::{AllocError, ContractViolation};
use alloc::{format, sync::Arc, vec::Vec};
use core::fmt::Debug;

/// A `2^order` run of base pages handed out by a [`PageAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block<P> {
    /// Handle of the first base page.
    pub page: P,
    /// The block's order.
    pub order: u32,
}

impl<P> Block<P> {
    /// The number of base pages in this block.
    #[inline]
    pub fn pages(&self) -> usize {
        1usize << self.order
    }
}

/// Whole-system memory counters, in base pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// All pages the allocator manages.
    pub total_pages: u64,
    /// Pages currently free.
    pub free_pages: u64,
}

impl MemoryStats {
    /// Free pages as an integer percentage of total pages.
    ///
    /// Zero when there are no pages at all.
    #[inline]
    pub fn free_percent(&self) -> u64 {
        if self.total_pages == 0 {
            return 0;
        }
        (u128::from(self.free_pages) * 100 / u128::from(self.total_pages)) as u64
    }
}

/// An allocator of power-of-two runs of base pages.
///
/// Pages are identified by copyable handles. Blocks can be split into their
/// base pages, which are then freed individually at order 0.
///
/// Allocators that keep per-page reference counts, and that distinguish
/// reclaimable from unreclaimable pages, override the three reference
/// methods. The defaults describe an allocator where every live page has
/// exactly one reference.
pub trait PageAllocator {
    /// The base-page handle.
    type Page: Copy + Ord + Debug;

    /// Size of a base page, in bytes.
    fn page_size(&self) -> usize;

    /// Allocate a block of `2^order` base pages.
    fn allocate(&self, order: u32) -> Result<Block<Self::Page>, AllocError>;

    /// Write into every base page of `block`.
    ///
    /// `fill` is called once per base page with the page's index within the
    /// block and the page's bytes.
    fn populate(&self, block: &Block<Self::Page>, fill: &mut dyn FnMut(usize, &mut [u8]));

    /// Split `block` into its `2^order` base pages, in address order.
    fn split(&self, block: Block<Self::Page>) -> Vec<Self::Page>;

    /// Return a page, or a whole unsplit block, to the allocator.
    fn free(&self, page: Self::Page, order: u32);

    /// Current memory counters.
    fn memory_stats(&self) -> MemoryStats;

    /// The number of references held on `page`.
    fn ref_count(&self, page: Self::Page) -> u32 {
        let _ = page;
        1
    }

    /// Drop one reference on `page`.
    fn put_ref(&self, page: Self::Page) {
        let _ = page;
    }

    /// Tell the allocator `page` may be reclaimed under pressure.
    fn mark_reclaimable(&self, page: Self::Page) {
        let _ = page;
    }
}

macro_rules! forward_page_allocator {
    ($ty:ty) => {
        impl<T> PageAllocator for $ty
        where
            T: PageAllocator + ?Sized,
        {
            type Page = T::Page;

            #[inline]
            fn page_size(&self) -> usize {
                (**self).page_size()
            }

            #[inline]
            fn allocate(&self, order: u32) -> Result<Block<Self::Page>, AllocError> {
                (**self).allocate(order)
            }

            #[inline]
            fn populate(
                &self,
                block: &Block<Self::Page>,
                fill: &mut dyn FnMut(usize, &mut [u8]),
            ) {
                (**self).populate(block, fill)
            }

            #[inline]
            fn split(&self, block: Block<Self::Page>) -> Vec<Self::Page> {
                (**self).split(block)
            }

            #[inline]
            fn free(&self, page: Self::Page, order: u32) {
                (**self).free(page, order)
            }

            #[inline]
            fn memory_stats(&self) -> MemoryStats {
                (**self).memory_stats()
            }

            #[inline]
            fn ref_count(&self, page: Self::Page) -> u32 {
                (**self).ref_count(page)
            }

            #[inline]
            fn put_ref(&self, page: Self::Page) {
                (**self).put_ref(page)
            }

            #[inline]
            fn mark_reclaimable(&self, page: Self::Page) {
                (**self).mark_reclaimable(page)
            }
        }
    };
}

forward_page_allocator!(&T);
forward_page_allocator!(Arc<T>);

/// Drop references on `page` until exactly one remains.
pub(crate) fn normalize_refs<A>(allocator: &A, page: A::Page) -> Result<(), ContractViolation>
where
    A: PageAllocator + ?Sized,
{
    let refs = allocator.ref_count(page);
    if refs == 0 {
        return Err(ContractViolation::DeadReference {
            page: format!("{page:?}"),
        });
    }
    for _ in 1..refs {
        allocator.put_ref(page);
    }
    Ok(())
}
