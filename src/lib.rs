#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

use cfg_if::cfg_if;

mod allocator;
mod arena;
mod clock;
mod config;
mod error;
mod histogram;
mod injector;
mod registry;
mod score;
mod table;

#[cfg(test)]
mod mock;

pub use allocator::{Block, MemoryStats, PageAllocator};
pub use arena::{ArenaConfig, ArenaStats, BuddyArena, Lock, SingleThreadedLock, SpinLock, ZoneSpec};
pub use clock::Clock;
pub use config::{
    InjectorConfig, InjectorConfigBuilder, DEFAULT_FREE_RATIO_FLOOR, DEFAULT_LOW_WATER_PERCENT,
    DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_SCORE_INTERVAL, MAX_ORDER, MIN_ORDER,
};
pub use error::{ConfigError, ContractViolation, HistogramError, StopReason};
pub use histogram::{
    ContigPageInfo, HistogramSource, OrderBound, OrderHistogram, ZoneHistogram, DEFAULT_MAX_ORDER,
};
pub use injector::{
    fill_page, is_kept, FragmentInjector, InjectorState, InjectorStats, KEEP_RUN,
};
pub use registry::{FragmentRegistry, FragmentUnit, Pool, ReleaseSummary, UnitState};
pub use score::{FragmentationScorer, NodeScore, SystemScore, ZoneScore, DEFAULT_HUGE_PAGE_ORDER};
pub use table::{FreeAreaRow, FreeAreaTable};

cfg_if! {
    if #[cfg(feature = "std")] {
        mod reporter;
        pub use clock::StdClock;
        pub use reporter::ScoreReporter;
    }
}

cfg_if! {
    if #[cfg(all(feature = "host", target_os = "linux"))] {
        pub mod host;
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
        pub use alloc::alloc::Global;
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator, Global};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
