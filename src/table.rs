//! The free-area table: where the free memory sits, order by order.

use crate::{histogram::blocks_to_pages, OrderBound, ZoneHistogram};
use alloc::vec::Vec;
use core::fmt;

const GIB: f64 = (1u64 << 30) as f64;

/// One order's row of a [`FreeAreaTable`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FreeAreaRow {
    /// The order.
    pub order: u32,
    /// Free blocks of this order, across all zones.
    pub blocks: u64,
    /// Bytes in those blocks.
    pub bytes: u64,
    /// Share of all free bytes held at this order.
    pub free_percent: f64,
    /// Share of all free bytes held at strictly higher orders.
    pub higher_percent: f64,
}

/// Free blocks per order, aggregated across every zone of every node.
#[derive(Clone, Debug, PartialEq)]
pub struct FreeAreaTable {
    rows: Vec<FreeAreaRow>,
    total_bytes: u64,
}

impl FreeAreaTable {
    /// Aggregate `zones` for base pages of `page_size` bytes.
    pub fn from_zones(zones: &[ZoneHistogram], page_size: usize, bound: OrderBound) -> Self {
        let page_size = page_size as u64;
        let blocks: Vec<u64> = bound
            .orders()
            .map(|order| {
                zones
                    .iter()
                    .map(|z| z.histogram.free_blocks(order))
                    .fold(0u64, u64::saturating_add)
            })
            .collect();

        let bytes: Vec<u64> = (0u32..)
            .zip(&blocks)
            .map(|(order, &n)| blocks_to_pages(n, order).saturating_mul(page_size))
            .collect();
        let total_bytes = bytes.iter().copied().fold(0u64, u64::saturating_add);

        let percent = |part: u64| {
            if total_bytes == 0 {
                0.0
            } else {
                part as f64 / total_bytes as f64 * 100.0
            }
        };

        let mut cumulative = 0u64;
        let rows = (0u32..)
            .zip(blocks.iter().zip(&bytes))
            .map(|(order, (&blocks, &bytes))| {
                cumulative = cumulative.saturating_add(bytes);
                FreeAreaRow {
                    order,
                    blocks,
                    bytes,
                    free_percent: percent(bytes),
                    higher_percent: percent(total_bytes.saturating_sub(cumulative)),
                }
            })
            .collect();

        FreeAreaTable { rows, total_bytes }
    }

    /// The rows, by ascending order.
    pub fn rows(&self) -> &[FreeAreaRow] {
        &self.rows
    }

    /// All free bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl fmt::Display for FreeAreaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<4}{:>10}{:>10}{:>10}{:>10}",
            "Order", "Pages", "Total", "%Free", "%Higher"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<4} {:>10} {:>7.2}GB {:>8.1}% {:>8.1}%",
                row.order,
                row.blocks,
                row.bytes as f64 / GIB,
                row.free_percent,
                row.higher_percent
            )?;
        }
        Ok(())
    }
}
