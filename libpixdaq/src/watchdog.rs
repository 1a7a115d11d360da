//! Periodic sampling of hardware error counters during a readout.
//!
//! The watchdog owns its own register view ([`RxCounters`]) so it never
//! contends with the reader thread for the FIFO handle. It only reports
//! counter *increases*; stale totals left over from a previous run are
//! absorbed by the first sample.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::AcquisitionError;
use super::hardware::RxCounters;

/// Granularity of the shutdown check inside one watchdog interval
const STOP_POLL: Duration = Duration::from_millis(25);

pub(crate) type ErrorCallback = Arc<dyn Fn(&AcquisitionError) + Send + Sync>;

/// Sampled counter state from the previous interval
#[derive(Default)]
struct Baseline {
    discards: Vec<u32>,
    soft_errors: Vec<u32>,
    hard_errors: Vec<u32>,
}

/// Watchdog loop: every `interval`, compare the hardware counters against the
/// previous sample and raise an error through `errback` for every channel
/// whose counter grew. Link error checks are opt-in; discard checks always
/// run.
pub(crate) fn run_watchdog(
    counters: Arc<dyn RxCounters>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    errback: ErrorCallback,
    check_link_errors: bool,
) {
    let mut baseline = Baseline {
        discards: counters.discard_counts(),
        soft_errors: counters.soft_error_counts(),
        hard_errors: counters.hard_error_counts(),
    };
    spdlog::debug!("Watchdog started, sampling every {:?}", interval);

    while !stop.load(Ordering::Relaxed) {
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if stop.load(Ordering::Relaxed) {
                spdlog::debug!("Watchdog shut down");
                return;
            }
            std::thread::sleep(STOP_POLL.min(deadline - Instant::now()));
        }

        report_increases(&counters.discard_counts(), &mut baseline.discards, |c, n| {
            errback(&AcquisitionError::FifoDiscard {
                channel: c,
                count: n,
            });
        });
        if check_link_errors {
            report_increases(
                &counters.soft_error_counts(),
                &mut baseline.soft_errors,
                |c, n| errback(&AcquisitionError::Soft { channel: c, count: n }),
            );
            report_increases(
                &counters.hard_error_counts(),
                &mut baseline.hard_errors,
                |c, n| errback(&AcquisitionError::Hard { channel: c, count: n }),
            );
            for (channel, &lost) in counters.rx_sync_lost().iter().enumerate() {
                if lost {
                    errback(&AcquisitionError::RxSync(channel));
                }
            }
        }
    }
    spdlog::debug!("Watchdog shut down");
}

fn report_increases(current: &[u32], baseline: &mut Vec<u32>, mut raise: impl FnMut(usize, u32)) {
    for (channel, &count) in current.iter().enumerate() {
        let before = baseline.get(channel).copied().unwrap_or(0);
        if count > before {
            raise(channel, count - before);
        }
    }
    *baseline = current.to_vec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    struct FakeCounters {
        discards: AtomicU32,
        soft: AtomicU32,
    }

    impl RxCounters for FakeCounters {
        fn discard_counts(&self) -> Vec<u32> {
            vec![0, self.discards.load(Ordering::Relaxed)]
        }
        fn soft_error_counts(&self) -> Vec<u32> {
            vec![self.soft.load(Ordering::Relaxed), 0]
        }
    }

    fn spawn_watchdog(
        counters: Arc<FakeCounters>,
        check_link_errors: bool,
    ) -> (
        Arc<Mutex<Vec<AcquisitionError>>>,
        Arc<AtomicBool>,
        std::thread::JoinHandle<()>,
    ) {
        let raised = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let errback: ErrorCallback = {
            let raised = raised.clone();
            Arc::new(move |error| raised.lock().unwrap().push(error.clone()))
        };
        let handle = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                run_watchdog(
                    counters,
                    Duration::from_millis(20),
                    stop,
                    errback,
                    check_link_errors,
                )
            })
        };
        (raised, stop, handle)
    }

    #[test]
    fn test_discard_increase_raises() {
        let counters = Arc::new(FakeCounters {
            discards: AtomicU32::new(0),
            soft: AtomicU32::new(0),
        });
        let (raised, stop, handle) = spawn_watchdog(counters.clone(), false);
        // Let the watchdog thread take its initial baseline sample before
        // injecting the discard, so the increase is not absorbed into it
        std::thread::sleep(Duration::from_millis(30));
        counters.discards.store(3, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(80));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let raised = raised.lock().unwrap();
        assert_eq!(raised.len(), 1);
        assert!(matches!(
            raised[0],
            AcquisitionError::FifoDiscard { channel: 1, count: 3 }
        ));
    }

    #[test]
    fn test_steady_counter_stays_silent() {
        // A non-zero total at startup is a leftover, not a new error
        let counters = Arc::new(FakeCounters {
            discards: AtomicU32::new(42),
            soft: AtomicU32::new(7),
        });
        let (raised, stop, handle) = spawn_watchdog(counters, true);
        std::thread::sleep(Duration::from_millis(80));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert!(raised.lock().unwrap().is_empty());
    }

    #[test]
    fn test_link_errors_only_when_enabled() {
        let counters = Arc::new(FakeCounters {
            discards: AtomicU32::new(0),
            soft: AtomicU32::new(0),
        });
        let (raised, stop, handle) = spawn_watchdog(counters.clone(), false);
        counters.soft.store(5, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(80));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        assert!(raised.lock().unwrap().is_empty());
    }
}
