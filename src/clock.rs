//! Monotonic time, for pacing score samples.

use core::time::Duration;

/// A monotonic clock.
pub trait Clock {
    /// Time elapsed since some fixed origin.
    fn now(&self) -> Duration;
}

impl<T> Clock for &T
where
    T: Clock + ?Sized,
{
    #[inline]
    fn now(&self) -> Duration {
        (**self).now()
    }
}

#[cfg(feature = "std")]
mod std_clock {
    use super::Clock;
    use core::time::Duration;
    use std::time::Instant;

    /// A [`Clock`] backed by [`std::time::Instant`], measuring from its
    /// creation.
    #[derive(Clone, Copy, Debug)]
    pub struct StdClock {
        origin: Instant,
    }

    impl StdClock {
        /// Start a clock at zero now.
        pub fn new() -> Self {
            StdClock {
                origin: Instant::now(),
            }
        }
    }

    impl Default for StdClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for StdClock {
        fn now(&self) -> Duration {
            self.origin.elapsed()
        }
    }
}

#[cfg(feature = "std")]
pub use std_clock::StdClock;
