//! Error and stop-reason types.

use alloc::string::String;
use core::fmt;

/// An invalid injector configuration.
///
/// Configurations are validated when they are built, so an injector never
/// touches its allocator with a configuration that would be rejected here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The allocation order is outside `1..=20`.
    OrderOutOfRange {
        /// The rejected order.
        order: i64,
    },

    /// The stop score is outside `0..=100`.
    StopScoreOutOfRange {
        /// The rejected score.
        stop_score: i64,
    },

    /// The pressure pool's free-memory floor is not a percentage.
    FreeRatioFloorOutOfRange {
        /// The rejected percentage.
        percent: i64,
    },

    /// The low-water mark is not a percentage.
    LowWaterOutOfRange {
        /// The rejected percentage.
        percent: i64,
    },

    /// The consecutive allocation failure budget is zero.
    ZeroFailureBudget,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::OrderOutOfRange { order } => {
                write!(f, "order must be in [1; 20] range, got {order}")
            }
            ConfigError::StopScoreOutOfRange { stop_score } => {
                write!(f, "stop score must be in [0; 100] range, got {stop_score}")
            }
            ConfigError::FreeRatioFloorOutOfRange { percent } => {
                write!(f, "free ratio floor must be in [0; 100] range, got {percent}")
            }
            ConfigError::LowWaterOutOfRange { percent } => {
                write!(f, "low-water mark must be in [0; 100] range, got {percent}")
            }
            ConfigError::ZeroFailureBudget => {
                write!(f, "at least one allocation failure must be tolerated")
            }
        }
    }
}

impl core::error::Error for ConfigError {}

/// A free-area histogram could not be read or made sense of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HistogramError {
    /// Orders were not strictly increasing.
    UnorderedOrders {
        /// The order seen before `order`.
        previous: u32,
        /// The offending order.
        order: u32,
    },

    /// A line of a textual histogram report did not parse.
    Malformed {
        /// One-based line number.
        line: usize,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// The histogram source could not be read at all.
    Unavailable(String),
}

impl fmt::Display for HistogramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistogramError::UnorderedOrders { previous, order } => write!(
                f,
                "histogram orders must be strictly increasing, got {order} after {previous}"
            ),
            HistogramError::Malformed { line, reason } => {
                write!(f, "malformed histogram report at line {line}: {reason}")
            }
            HistogramError::Unavailable(why) => write!(f, "histogram unavailable: {why}"),
        }
    }
}

impl core::error::Error for HistogramError {}

/// The page allocator broke its side of the contract.
///
/// These are never retried: they mean the collaborator is misbehaving.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractViolation {
    /// `allocate` returned a block of a lower order than requested.
    ShortBlock {
        /// The requested order.
        requested: u32,
        /// The order actually returned.
        returned: u32,
    },

    /// `split` returned the wrong number of base pages.
    ShortSplit {
        /// `2^order` pages.
        expected: usize,
        /// Pages actually returned.
        returned: usize,
    },

    /// A page we own reported a reference count of zero.
    DeadReference {
        /// Debug rendering of the page handle.
        page: String,
    },

    /// The allocator handed out a page that is already in the registry.
    DuplicateOwnership {
        /// Debug rendering of the page handle.
        page: String,
    },
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractViolation::ShortBlock {
                requested,
                returned,
            } => write!(
                f,
                "allocator returned an order-{returned} block for an order-{requested} request"
            ),
            ContractViolation::ShortSplit { expected, returned } => write!(
                f,
                "split returned {returned} base pages, expected {expected}"
            ),
            ContractViolation::DeadReference { page } => {
                write!(f, "owned page {page} has no references")
            }
            ContractViolation::DuplicateOwnership { page } => {
                write!(f, "page {page} was handed out while already owned")
            }
        }
    }
}

impl core::error::Error for ContractViolation {}

/// Why a fragmentation run reached its `Stopped` state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// A node's fragmentation score reached the configured threshold.
    ScoreThresholdReached {
        /// The first node at or above the threshold.
        node_id: u32,
        /// That node's score.
        score: u64,
        /// The configured stop score.
        threshold: u32,
    },

    /// The allocator stopped handing out memory.
    AllocationExhausted {
        /// Whether this happened while filling the pressure pool, where a
        /// single failure is fatal.
        during_pressure: bool,
        /// Consecutive failures observed.
        consecutive_failures: u32,
    },

    /// Free memory dropped below the low-water mark.
    MemoryPressureCritical {
        /// Free memory as a percentage of total memory.
        free_percent: u64,
        /// The configured low-water mark.
        low_water: u32,
    },

    /// The allocator misbehaved.
    AllocatorContractViolation(ContractViolation),

    /// The fragmentation score could not be computed.
    ScoreUnavailable(HistogramError),
}

impl StopReason {
    /// Is this the successful way for a run to end?
    pub fn is_expected(&self) -> bool {
        matches!(self, StopReason::ScoreThresholdReached { .. })
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ScoreThresholdReached {
                node_id,
                score,
                threshold,
            } => write!(
                f,
                "fragmentation score {score} on node {node_id} reached {threshold}"
            ),
            StopReason::AllocationExhausted {
                during_pressure: true,
                ..
            } => write!(f, "allocation failed while filling the pressure pool"),
            StopReason::AllocationExhausted {
                during_pressure: false,
                consecutive_failures,
            } => write!(
                f,
                "allocation failed {consecutive_failures} times in a row"
            ),
            StopReason::MemoryPressureCritical {
                free_percent,
                low_water,
            } => write!(
                f,
                "free memory at {free_percent}% is below the {low_water}% low-water mark"
            ),
            StopReason::AllocatorContractViolation(violation) => {
                write!(f, "allocator contract violation: {violation}")
            }
            StopReason::ScoreUnavailable(e) => write!(f, "cannot score fragmentation: {e}"),
        }
    }
}
