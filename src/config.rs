//! Injector configuration.

use crate::ConfigError;
use core::time::Duration;

/// The smallest order the injector will fragment with.
pub const MIN_ORDER: u32 = 1;

/// The largest order the injector will fragment with.
pub const MAX_ORDER: u32 = 20;

/// Default free-memory percentage the pressure pool fills down to.
pub const DEFAULT_FREE_RATIO_FLOOR: u32 = 76;

/// Default free-memory percentage below which fragmenting stops.
pub const DEFAULT_LOW_WATER_PERCENT: u32 = 20;

/// Default number of allocation failures in a row that ends a run.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Default minimum time between two score samples.
pub const DEFAULT_SCORE_INTERVAL: Duration = Duration::from_millis(500);

/// A validated, immutable injector configuration.
///
/// Build one with [`InjectorConfig::builder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectorConfig {
    order: u32,
    stop_score: u32,
    free_ratio_floor: u32,
    low_water_percent: u32,
    pressure_enabled: bool,
    report_enabled: bool,
    max_consecutive_failures: u32,
    score_interval: Duration,
}

impl InjectorConfig {
    /// Start configuring a run that allocates `2^order` page blocks.
    ///
    /// Values are taken as given and checked by
    /// [`InjectorConfigBuilder::build`].
    pub fn builder(order: i64) -> InjectorConfigBuilder {
        InjectorConfigBuilder {
            order,
            stop_score: 0,
            free_ratio_floor: i64::from(DEFAULT_FREE_RATIO_FLOOR),
            low_water_percent: i64::from(DEFAULT_LOW_WATER_PERCENT),
            pressure_enabled: true,
            report_enabled: false,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            score_interval: DEFAULT_SCORE_INTERVAL,
        }
    }

    /// The order of every allocation.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// The score at which to stop, or zero to never stop on score.
    #[inline]
    pub fn stop_score(&self) -> u32 {
        self.stop_score
    }

    /// The free-memory percentage the pressure pool fills down to.
    #[inline]
    pub fn free_ratio_floor(&self) -> u32 {
        self.free_ratio_floor
    }

    /// The free-memory percentage below which fragmenting stops.
    #[inline]
    pub fn low_water_percent(&self) -> u32 {
        self.low_water_percent
    }

    /// Whether the pressure pool is filled before fragmenting.
    #[inline]
    pub fn pressure_enabled(&self) -> bool {
        self.pressure_enabled
    }

    /// Whether a background score reporter was requested.
    #[inline]
    pub fn report_enabled(&self) -> bool {
        self.report_enabled
    }

    /// Allocation failures in a row that end a run.
    #[inline]
    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    /// Minimum time between score samples.
    #[inline]
    pub fn score_interval(&self) -> Duration {
        self.score_interval
    }
}

/// Builder for [`InjectorConfig`].
#[derive(Clone, Debug)]
pub struct InjectorConfigBuilder {
    order: i64,
    stop_score: i64,
    free_ratio_floor: i64,
    low_water_percent: i64,
    pressure_enabled: bool,
    report_enabled: bool,
    max_consecutive_failures: u32,
    score_interval: Duration,
}

impl InjectorConfigBuilder {
    /// Stop once any node's score reaches `score`. Zero disables scoring.
    pub fn stop_score(mut self, score: i64) -> Self {
        self.stop_score = score;
        self
    }

    /// Fill the pressure pool until free memory drops below `percent`.
    pub fn free_ratio_floor(mut self, percent: i64) -> Self {
        self.free_ratio_floor = percent;
        self
    }

    /// Stop fragmenting once free memory drops below `percent`.
    pub fn low_water_percent(mut self, percent: i64) -> Self {
        self.low_water_percent = percent;
        self
    }

    /// Fill a pressure pool before fragmenting.
    pub fn pressure(mut self, enabled: bool) -> Self {
        self.pressure_enabled = enabled;
        self
    }

    /// Request a background score reporter.
    pub fn report(mut self, enabled: bool) -> Self {
        self.report_enabled = enabled;
        self
    }

    /// End a run after `failures` allocation failures in a row.
    pub fn max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    /// Sample the score at most once per `interval`.
    pub fn score_interval(mut self, interval: Duration) -> Self {
        self.score_interval = interval;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<InjectorConfig, ConfigError> {
        let order = u32::try_from(self.order)
            .ok()
            .filter(|o| (MIN_ORDER..=MAX_ORDER).contains(o))
            .ok_or(ConfigError::OrderOutOfRange { order: self.order })?;

        let stop_score = percent(self.stop_score).ok_or(ConfigError::StopScoreOutOfRange {
            stop_score: self.stop_score,
        })?;

        let free_ratio_floor =
            percent(self.free_ratio_floor).ok_or(ConfigError::FreeRatioFloorOutOfRange {
                percent: self.free_ratio_floor,
            })?;

        let low_water_percent =
            percent(self.low_water_percent).ok_or(ConfigError::LowWaterOutOfRange {
                percent: self.low_water_percent,
            })?;

        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::ZeroFailureBudget);
        }

        Ok(InjectorConfig {
            order,
            stop_score,
            free_ratio_floor,
            low_water_percent,
            pressure_enabled: self.pressure_enabled,
            report_enabled: self.report_enabled,
            max_consecutive_failures: self.max_consecutive_failures,
            score_interval: self.score_interval,
        })
    }
}

fn percent(value: i64) -> Option<u32> {
    u32::try_from(value).ok().filter(|p| *p <= 100)
}
