//! The Linux host backend.
//!
//! Scores the running kernel's fragmentation from procfs and fragments host
//! memory with anonymous mappings.

use crate::{MemoryStats, DEFAULT_HUGE_PAGE_ORDER};
use std::{fs, io, mem};

mod mmap;
mod procfs;

pub use mmap::MmapPageAllocator;
pub use procfs::{
    join, parse_buddyinfo, parse_zoneinfo, BuddyInfoLine, ProcHistogramSource, ZonePresence,
    BUDDYINFO, ZONEINFO,
};

const THP_PMD_SIZE: &str = "/sys/kernel/mm/transparent_hugepage/hpage_pmd_size";
const MEMINFO: &str = "/proc/meminfo";

/// The host's base page size, in bytes.
pub fn page_size() -> usize {
    // Safety: `sysconf` has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|s| *s > 0).unwrap_or(4096)
}

/// The host's total and free memory, in base pages.
pub fn memory_stats() -> io::Result<MemoryStats> {
    // Safety: `sysinfo` is plain old data.
    let mut info: libc::sysinfo = unsafe { mem::zeroed() };
    // Safety: `info` is a valid, writable `sysinfo`.
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let unit = u64::from(info.mem_unit.max(1));
    let page = page_size() as u64;
    Ok(MemoryStats {
        total_pages: (info.totalram as u64).saturating_mul(unit) / page,
        free_pages: (info.freeram as u64).saturating_mul(unit) / page,
    })
}

/// The order of the host's huge page.
///
/// Taken from the transparent huge page PMD size, else from `Hugepagesize`
/// in `/proc/meminfo`, else [`DEFAULT_HUGE_PAGE_ORDER`].
pub fn huge_page_order() -> u32 {
    let order = huge_page_order_from(
        fs::read_to_string(THP_PMD_SIZE).ok().as_deref(),
        fs::read_to_string(MEMINFO).ok().as_deref(),
        page_size(),
    );
    log::debug!("huge page order {order}");
    order
}

fn order_of(bytes: u64, page_size: usize) -> Option<u32> {
    let pages = bytes / page_size as u64;
    (pages > 0 && pages.is_power_of_two() && bytes % page_size as u64 == 0)
        .then(|| pages.ilog2())
}

fn huge_page_order_from(pmd_size: Option<&str>, meminfo: Option<&str>, page_size: usize) -> u32 {
    let from_pmd = pmd_size
        .and_then(|s| s.trim().parse::<u64>().ok())
        .and_then(|bytes| order_of(bytes, page_size));

    let from_meminfo = || {
        meminfo?
            .lines()
            .find_map(|line| line.strip_prefix("Hugepagesize:"))
            .and_then(|rest| rest.trim().strip_suffix("kB"))
            .and_then(|kb| kb.trim().parse::<u64>().ok())
            .and_then(|kb| order_of(kb * 1024, page_size))
    };

    from_pmd
        .or_else(from_meminfo)
        .unwrap_or(DEFAULT_HUGE_PAGE_ORDER)
}
