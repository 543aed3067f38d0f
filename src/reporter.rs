//! A background thread that periodically logs the fragmentation score.

use crate::{FragmentationScorer, HistogramSource};
use core::time::Duration;
use std::{
    io,
    string::String,
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
};

/// Periodically logs every node's fragmentation score.
///
/// The reporter only reads histograms through its own scorer. It stops, and
/// its thread is joined, when [`ScoreReporter::stop`] is called or the
/// reporter is dropped; a pending wait is cut short either way.
#[derive(Debug)]
pub struct ScoreReporter {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<u64>>,
}

impl ScoreReporter {
    /// The default time between reports.
    pub const DEFAULT_PERIOD: Duration = Duration::from_millis(500);

    /// Spawn a reporter thread that logs a report immediately and then once
    /// per `period`.
    pub fn spawn<S>(scorer: FragmentationScorer<S>, period: Duration) -> io::Result<Self>
    where
        S: HistogramSource + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(String::from("score-reporter"))
            .spawn(move || {
                log::debug!("score reporter started, period {period:?}");
                let mut reports = 0;
                loop {
                    report(&scorer);
                    reports += 1;
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("score reporter stopped after {reports} reports");
                reports
            })?;

        Ok(ScoreReporter {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop the reporter and wait for its thread, returning how many reports
    /// it logged.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(reports)) => reports,
            Some(Err(_)) => {
                log::error!("score reporter thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for ScoreReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn report<S: HistogramSource>(scorer: &FragmentationScorer<S>) {
    match scorer.system_snapshot() {
        Ok(snapshot) => {
            for node in snapshot.iter() {
                log::info!(
                    "STATUS - fragmentation score: {} node: {}",
                    node.score,
                    node.node_id
                );
            }
        }
        Err(e) => log::warn!("STATUS - fragmentation score unavailable: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HistogramError, OrderHistogram, ZoneHistogram};
    use std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::Instant,
        vec,
        vec::Vec,
    };

    #[derive(Default)]
    struct CountingSource {
        reads: AtomicU64,
    }

    impl HistogramSource for CountingSource {
        fn read_histograms(&self) -> Result<Vec<ZoneHistogram>, HistogramError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ZoneHistogram {
                node_id: 0,
                zone_id: 0,
                zone_name: "Normal".into(),
                present_pages: 64,
                node_present_pages: 64,
                histogram: OrderHistogram::from_counts([64]),
            }])
        }
    }

    #[test]
    fn stop_interrupts_a_long_wait() {
        let _ = env_logger::try_init();
        let source = Arc::new(CountingSource::default());
        let reporter =
            ScoreReporter::spawn(FragmentationScorer::new(Arc::clone(&source), 9), Duration::from_secs(3600))
                .unwrap();

        let start = Instant::now();
        while source.reads.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        assert_eq!(reporter.stop(), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reports_every_period_until_dropped() {
        let _ = env_logger::try_init();
        let source = Arc::new(CountingSource::default());
        let reporter = ScoreReporter::spawn(
            FragmentationScorer::new(Arc::clone(&source), 2),
            Duration::from_millis(1),
        )
        .unwrap();

        while source.reads.load(Ordering::SeqCst) < 3 {
            thread::yield_now();
        }
        drop(reporter);

        let reads = source.reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(source.reads.load(Ordering::SeqCst), reads);
    }
}
