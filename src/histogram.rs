//! Free-area order histograms and the contiguity accounting done over them.
//!
//! A page allocator that hands out power-of-two runs of base pages keeps, per
//! zone, a count of free blocks at each order. That histogram is all the
//! fragmentation score needs: it tells us how many free pages there are and how
//! many of them sit in blocks large enough to satisfy a request of some target
//! order.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::ops::Range;

use crate::HistogramError;

/// The default largest order of a free-area histogram.
pub const DEFAULT_MAX_ORDER: u32 = 10;

/// The bound on orders a histogram covers.
///
/// Allocators disagree on whether their maximum order is an inclusive or an
/// exclusive bound, so this is configuration rather than a constant. Counts
/// recorded at orders outside the bound are ignored by the accounting, and
/// orders inside the bound that a histogram does not record count as zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderBound {
    /// Orders `0..=max` are counted.
    Inclusive(u32),
    /// Orders `0..max` are counted.
    Exclusive(u32),
}

impl Default for OrderBound {
    fn default() -> Self {
        OrderBound::Inclusive(DEFAULT_MAX_ORDER)
    }
}

impl OrderBound {
    /// How many orders this bound covers.
    #[inline]
    pub fn order_count(self) -> u32 {
        match self {
            OrderBound::Inclusive(max) => max.saturating_add(1),
            OrderBound::Exclusive(max) => max,
        }
    }

    /// Is `order` within this bound?
    #[inline]
    pub fn contains(self, order: u32) -> bool {
        order < self.order_count()
    }

    /// The orders within this bound, ascending.
    #[inline]
    pub fn orders(self) -> Range<u32> {
        0..self.order_count()
    }
}

/// Number of base pages in `blocks` blocks of the given order, saturating.
#[inline]
pub(crate) fn blocks_to_pages(blocks: u64, order: u32) -> u64 {
    match 1u64.checked_shl(order) {
        Some(pages_per_block) => blocks.saturating_mul(pages_per_block),
        None if blocks == 0 => 0,
        None => u64::MAX,
    }
}

/// Free block counts indexed by order for one zone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderHistogram {
    counts: Vec<u64>,
}

impl OrderHistogram {
    /// An empty histogram: no free blocks at any order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a histogram from per-order counts, starting at order 0.
    pub fn from_counts(counts: impl IntoIterator<Item = u64>) -> Self {
        OrderHistogram {
            counts: counts.into_iter().collect(),
        }
    }

    /// Build a histogram from `(order, free_block_count)` pairs.
    ///
    /// Orders must be strictly increasing. Orders that are skipped have no
    /// free blocks.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (u32, u64)>,
    ) -> Result<Self, HistogramError> {
        let mut histogram = OrderHistogram::new();
        let mut previous = None;
        for (order, blocks) in pairs {
            if let Some(previous) = previous {
                if order <= previous {
                    return Err(HistogramError::UnorderedOrders { previous, order });
                }
            }
            previous = Some(order);
            histogram.set(order, blocks);
        }
        Ok(histogram)
    }

    /// The number of free blocks at `order`.
    #[inline]
    pub fn free_blocks(&self, order: u32) -> u64 {
        usize::try_from(order)
            .ok()
            .and_then(|i| self.counts.get(i))
            .copied()
            .unwrap_or(0)
    }

    /// Set the number of free blocks at `order`.
    pub fn set(&mut self, order: u32, blocks: u64) {
        let i = order as usize;
        if i >= self.counts.len() {
            if blocks == 0 {
                return;
            }
            self.counts.resize(i + 1, 0);
        }
        self.counts[i] = blocks;
    }

    /// Add `blocks` free blocks at `order`.
    pub fn add(&mut self, order: u32, blocks: u64) {
        let current = self.free_blocks(order);
        self.set(order, current.saturating_add(blocks));
    }

    /// Split one free block at `order` into two free blocks at `order - 1`.
    ///
    /// Returns `false`, leaving the histogram untouched, if there is no free
    /// block at `order` or `order` is zero.
    pub fn split_block(&mut self, order: u32) -> bool {
        let blocks = self.free_blocks(order);
        if order == 0 || blocks == 0 {
            return false;
        }
        self.set(order, blocks - 1);
        self.add(order - 1, 2);
        true
    }

    /// The number of orders recorded, including trailing orders with zero
    /// blocks that were explicitly given.
    #[inline]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Does this histogram record no orders at all?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterate over recorded `(order, free_block_count)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        (0u32..).zip(self.counts.iter().copied())
    }
}

/// Aggregate free-page accounting for one zone and one target order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContigPageInfo {
    /// Free base pages.
    pub free_pages: u64,
    /// Free blocks of any order.
    pub free_blocks_total: u64,
    /// Free pages re-expressed in units of `2^target_order`, counting only
    /// blocks that could satisfy a request of the target order.
    pub free_blocks_suitable: u64,
}

impl ContigPageInfo {
    /// Reduce `histogram` for requests of order `suitable_order`.
    pub fn fill(histogram: &OrderHistogram, suitable_order: u32, bound: OrderBound) -> Self {
        let mut info = ContigPageInfo::default();

        for order in bound.orders() {
            let blocks = histogram.free_blocks(order);
            info.free_blocks_total = info.free_blocks_total.saturating_add(blocks);
            info.free_pages = info
                .free_pages
                .saturating_add(blocks_to_pages(blocks, order));

            if order >= suitable_order {
                info.free_blocks_suitable = info
                    .free_blocks_suitable
                    .saturating_add(blocks_to_pages(blocks, order - suitable_order));
            }
        }

        info
    }

    /// The external fragmentation percentage for requests of `order`.
    ///
    /// `order` must be the order this info was filled for. A zone with no free
    /// pages is not fragmented.
    pub fn extfrag_for_order(&self, order: u32) -> u32 {
        if self.free_pages == 0 {
            return 0;
        }

        let suitable_pages = blocks_to_pages(self.free_blocks_suitable, order).min(self.free_pages);
        let unsuitable = u128::from(self.free_pages - suitable_pages);
        (unsuitable * 100 / u128::from(self.free_pages)) as u32
    }
}

/// One zone's free-area histogram, as reported by a [`HistogramSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneHistogram {
    /// The node this zone belongs to.
    pub node_id: u32,
    /// The zone's index within its node.
    pub zone_id: u32,
    /// Human-readable zone name, e.g. `Normal`.
    pub zone_name: String,
    /// Pages physically present in the zone.
    pub present_pages: u64,
    /// Pages physically present across the zone's whole node.
    pub node_present_pages: u64,
    /// Free blocks by order.
    pub histogram: OrderHistogram,
}

impl ZoneHistogram {
    /// Does this zone have any memory at all?
    #[inline]
    pub fn is_populated(&self) -> bool {
        self.present_pages != 0
    }
}

/// Something that can report per-zone free-area histograms.
///
/// Reads are snapshots: they may be stale by the time they are used, which is
/// fine for a heuristic score.
pub trait HistogramSource {
    /// Read the free-area histogram of every zone of every node.
    fn read_histograms(&self) -> Result<Vec<ZoneHistogram>, HistogramError>;
}

impl<T> HistogramSource for &T
where
    T: HistogramSource + ?Sized,
{
    #[inline]
    fn read_histograms(&self) -> Result<Vec<ZoneHistogram>, HistogramError> {
        (**self).read_histograms()
    }
}

impl<T> HistogramSource for Arc<T>
where
    T: HistogramSource + ?Sized,
{
    #[inline]
    fn read_histograms(&self) -> Result<Vec<ZoneHistogram>, HistogramError> {
        (**self).read_histograms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn all_order_zero_pages_are_unsuitable() {
        let histogram = OrderHistogram::from_counts([500]);
        let info = ContigPageInfo::fill(&histogram, 2, OrderBound::default());
        assert_eq!(
            info,
            ContigPageInfo {
                free_pages: 500,
                free_blocks_total: 500,
                free_blocks_suitable: 0,
            }
        );
        assert_eq!(info.extfrag_for_order(2), 100);
    }

    #[test]
    fn empty_zone_is_not_fragmented() {
        let info = ContigPageInfo::fill(&OrderHistogram::new(), 9, OrderBound::default());
        assert_eq!(info.free_pages, 0);
        assert_eq!(info.extfrag_for_order(9), 0);
    }

    #[test]
    fn suitable_blocks_are_counted_in_target_units() {
        // 3 order-0, 1 order-2, 2 order-3 blocks.
        let histogram = OrderHistogram::from_counts([3, 0, 1, 2]);
        let info = ContigPageInfo::fill(&histogram, 2, OrderBound::default());
        assert_eq!(info.free_pages, 3 + 4 + 16);
        assert_eq!(info.free_blocks_total, 6);
        assert_eq!(info.free_blocks_suitable, 1 + 4);
        assert!(info.free_blocks_suitable << 2 <= info.free_pages);
        // 3 of 23 free pages are unusable for order 2: 13%.
        assert_eq!(info.extfrag_for_order(2), 13);
    }

    #[test]
    fn target_order_beyond_histogram_makes_everything_unsuitable() {
        let histogram = OrderHistogram::from_counts([1, 1, 1, 1]);
        let info = ContigPageInfo::fill(&histogram, 15, OrderBound::Inclusive(20));
        assert_eq!(info.free_blocks_suitable, 0);
        assert_eq!(info.extfrag_for_order(15), 100);
    }

    #[test]
    fn inclusive_bound_counts_the_max_order() {
        let mut histogram = OrderHistogram::new();
        histogram.set(10, 1);
        histogram.set(0, 24);

        let inclusive = ContigPageInfo::fill(&histogram, 9, OrderBound::Inclusive(10));
        assert_eq!(inclusive.free_pages, 1024 + 24);
        assert_eq!(inclusive.free_blocks_suitable, 2);
        assert_eq!(inclusive.extfrag_for_order(9), 2);

        let exclusive = ContigPageInfo::fill(&histogram, 9, OrderBound::Exclusive(10));
        assert_eq!(exclusive.free_pages, 24);
        assert_eq!(exclusive.free_blocks_suitable, 0);
        assert_eq!(exclusive.extfrag_for_order(9), 100);

        assert_eq!(OrderBound::Inclusive(10).order_count(), 11);
        assert_eq!(OrderBound::Exclusive(11).order_count(), 11);
        assert!(OrderBound::Inclusive(10).contains(10));
        assert!(!OrderBound::Exclusive(10).contains(10));
    }

    #[test]
    fn pairs_must_be_strictly_increasing() {
        let histogram = OrderHistogram::from_pairs([(0, 4), (2, 1), (5, 3)]).unwrap();
        assert_eq!(histogram.free_blocks(1), 0);
        assert_eq!(histogram.free_blocks(2), 1);
        assert_eq!(histogram.free_blocks(5), 3);
        assert_eq!(histogram.len(), 6);

        assert_eq!(
            OrderHistogram::from_pairs([(0, 4), (3, 1), (3, 1)]),
            Err(HistogramError::UnorderedOrders {
                previous: 3,
                order: 3
            })
        );
        assert_eq!(
            OrderHistogram::from_pairs([(4, 1), (2, 1)]),
            Err(HistogramError::UnorderedOrders {
                previous: 4,
                order: 2
            })
        );
    }

    #[test]
    fn splitting_below_the_target_raises_fragmentation() {
        let mut histogram = OrderHistogram::from_counts([2, 0, 3]);
        let before = ContigPageInfo::fill(&histogram, 2, OrderBound::default());

        assert!(histogram.split_block(2));
        let after = ContigPageInfo::fill(&histogram, 2, OrderBound::default());

        assert_eq!(before.free_pages, after.free_pages);
        assert!(after.extfrag_for_order(2) > before.extfrag_for_order(2));
        assert_eq!(
            histogram.iter().collect::<Vec<_>>(),
            vec![(0, 2), (1, 2), (2, 2)]
        );

        assert!(!histogram.split_block(0));
        assert!(!histogram.split_block(7));
    }

    #[test]
    fn huge_counts_saturate_instead_of_overflowing() {
        let histogram = OrderHistogram::from_counts([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, u64::MAX]);
        let info = ContigPageInfo::fill(&histogram, 0, OrderBound::default());
        assert_eq!(info.free_pages, u64::MAX);
        assert!(info.extfrag_for_order(0) <= 100);
        assert_eq!(blocks_to_pages(3, 70), u64::MAX);
        assert_eq!(blocks_to_pages(0, 70), 0);
    }
}
