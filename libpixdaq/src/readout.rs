//! The threaded FIFO readout.
//!
//! One reader thread polls the hardware FIFO at a fixed cadence and pushes
//! timestamped chunks into a bounded queue; a distributor fans them out to
//! per-channel worker threads; a watchdog samples the hardware error counters
//! alongside. The reader thread takes ownership of the FIFO handle for the
//! duration of a run and hands it back when joined, so no lock ever sits on
//! the data path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use human_bytes::human_bytes;

use super::config::Config;
use super::constants::WORD_SIZE_BYTES;
use super::data::ReadoutChunk;
use super::distributor::{
    run_distributor, run_worker, ChannelLink, ChunkBuffer, ChunkCallback, ChunkItem,
};
use super::error::AcquisitionError;
use super::hardware::{HardwareFifo, RxCounters};
use super::watchdog::run_watchdog;

pub type ErrorCallback = Arc<dyn Fn(&AcquisitionError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadoutState {
    Stopped,
    Running,
    Stopping,
}

/// Registration record for one consumer channel
struct ChannelSpec {
    name: String,
    callback: Option<Arc<Mutex<ChunkCallback>>>,
    buffer: Option<ChunkBuffer>,
    word_count: Arc<AtomicU64>,
}

/// Caller-side view of a registered channel.
///
/// The word counter and buffer are shared with the running pipeline, so they
/// can be inspected while data is flowing.
#[derive(Clone)]
pub struct ChannelHandle {
    pub name: String,
    word_count: Arc<AtomicU64>,
    buffer: Option<ChunkBuffer>,
}

impl ChannelHandle {
    /// Words distributed to this channel since the readout started
    pub fn words_seen(&self) -> u64 {
        self.word_count.load(Ordering::Relaxed)
    }

    /// Take all buffered chunks, oldest first (buffer channels only)
    pub fn drain(&self) -> Vec<Arc<ReadoutChunk>> {
        match &self.buffer {
            Some(buffer) => buffer.lock().map_or_else(|_| Vec::new(), |mut b| b.drain(..).collect()),
            None => Vec::new(),
        }
    }
}

/// The acquisition pipeline: reader, distributor, channel workers, watchdog.
///
/// Channels and the error callback are registered while stopped and take
/// effect at the next [`start`]. The FIFO handle is moved into the reader
/// thread on start and recovered on [`stop`].
///
/// [`start`]: FifoReadout::start
/// [`stop`]: FifoReadout::stop
pub struct FifoReadout<F: HardwareFifo + 'static> {
    fifo: Option<F>,
    config: Config,
    channels: Vec<ChannelSpec>,
    counters: Option<Arc<dyn RxCounters>>,
    errback: Option<ErrorCallback>,
    state: ReadoutState,
    stop_flag: Arc<AtomicBool>,
    force_stop: Arc<AtomicBool>,
    dist_tx: Option<SyncSender<ChunkItem>>,
    reader: Option<JoinHandle<F>>,
    distributor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl<F: HardwareFifo + 'static> FifoReadout<F> {
    pub fn new(fifo: F, config: &Config) -> Self {
        Self {
            fifo: Some(fifo),
            config: config.clone(),
            channels: Vec::new(),
            counters: None,
            errback: None,
            state: ReadoutState::Stopped,
            stop_flag: Arc::new(AtomicBool::new(false)),
            force_stop: Arc::new(AtomicBool::new(false)),
            dist_tx: None,
            reader: None,
            distributor: None,
            workers: Vec::new(),
            watchdog: None,
        }
    }

    pub fn state(&self) -> ReadoutState {
        self.state
    }

    /// Attach the error-counter interface sampled by the watchdog
    pub fn set_counters(&mut self, counters: Arc<dyn RxCounters>) {
        self.counters = Some(counters);
    }

    /// Register the callback invoked for every acquisition error
    pub fn set_error_callback(&mut self, errback: ErrorCallback) {
        self.errback = Some(errback);
    }

    /// Register a channel whose callback runs on its own worker thread.
    /// Takes effect at the next start.
    pub fn register_callback(
        &mut self,
        name: &str,
        callback: impl FnMut(&ReadoutChunk) + Send + 'static,
    ) -> ChannelHandle {
        self.register(name, Some(Box::new(callback)), false)
    }

    /// Register a channel that accumulates chunks for later [`drain`].
    /// Takes effect at the next start.
    ///
    /// [`drain`]: ChannelHandle::drain
    pub fn register_buffer(&mut self, name: &str) -> ChannelHandle {
        self.register(name, None, true)
    }

    fn register(
        &mut self,
        name: &str,
        callback: Option<ChunkCallback>,
        buffered: bool,
    ) -> ChannelHandle {
        if self.state != ReadoutState::Stopped {
            spdlog::warn!(
                "Channel {} registered on a running readout; active at next start",
                name
            );
        }
        let spec = ChannelSpec {
            name: name.to_string(),
            callback: callback.map(|cb| Arc::new(Mutex::new(cb))),
            buffer: buffered.then(Default::default),
            word_count: Arc::new(AtomicU64::new(0)),
        };
        let handle = ChannelHandle {
            name: spec.name.clone(),
            word_count: spec.word_count.clone(),
            buffer: spec.buffer.clone(),
        };
        self.channels.push(spec);
        handle
    }

    /// Start the pipeline. Already-running readouts are left alone with a
    /// warning.
    pub fn start(&mut self, reset_fifo: bool) {
        if self.state != ReadoutState::Stopped {
            spdlog::warn!("Readout start requested while already running");
            return;
        }
        let Some(mut fifo) = self.fifo.take() else {
            spdlog::error!("FIFO handle was lost by a previous run, cannot start");
            return;
        };

        self.stop_flag.store(false, Ordering::Relaxed);
        self.force_stop.store(false, Ordering::Relaxed);
        for spec in &self.channels {
            spec.word_count.store(0, Ordering::Relaxed);
        }

        let errback = self.dispatcher();
        let depth = self.config.queue_depth;
        let (dist_tx, dist_rx) = sync_channel::<ChunkItem>(depth);

        let mut links = Vec::with_capacity(self.channels.len());
        for spec in &self.channels {
            let (tx, rx) = sync_channel::<ChunkItem>(depth);
            links.push(ChannelLink {
                name: spec.name.clone(),
                tx,
                word_count: spec.word_count.clone(),
            });
            let name = spec.name.clone();
            let callback = spec.callback.clone();
            let buffer = spec.buffer.clone();
            let force_stop = self.force_stop.clone();
            self.workers
                .push(std::thread::spawn(move || {
                    run_worker(name, rx, callback, buffer, force_stop)
                }));
        }
        self.distributor = Some(std::thread::spawn(move || run_distributor(dist_rx, links)));

        if let Some(counters) = self.counters.clone() {
            let interval = self.config.watchdog_interval();
            let stop = self.stop_flag.clone();
            let errback = errback.clone();
            let check_link_errors = self.config.check_link_errors;
            self.watchdog = Some(std::thread::spawn(move || {
                run_watchdog(counters, interval, stop, errback, check_link_errors)
            }));
        }

        let stop = self.stop_flag.clone();
        let force_stop = self.force_stop.clone();
        let interval = self.config.poll_interval();
        let no_data_timeout = self.config.no_data_timeout();
        let tx = dist_tx.clone();
        self.dist_tx = Some(dist_tx);
        self.reader = Some(std::thread::spawn(move || {
            if reset_fifo {
                fifo.reset();
            }
            reader_loop(
                &mut fifo,
                tx,
                stop,
                force_stop,
                interval,
                no_data_timeout,
                errback,
            );
            fifo
        }));

        self.state = ReadoutState::Running;
        spdlog::info!("Readout started with {} channels", self.channels.len());
    }

    /// Stop the pipeline, draining all queues.
    ///
    /// Waits up to `timeout` for the reader to finish its final poll; if it
    /// does not, the force-stop flag is raised, undelivered chunks are dropped
    /// and `StopTimeout` is reported through the error callback and returned.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), AcquisitionError> {
        if self.state != ReadoutState::Running {
            spdlog::warn!("Readout stop requested while not running");
            return Ok(());
        }
        self.state = ReadoutState::Stopping;
        self.stop_flag.store(true, Ordering::Relaxed);

        let mut timed_out = false;
        if let Some(reader) = self.reader.take() {
            let deadline = Instant::now() + timeout;
            while !reader.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if !reader.is_finished() {
                timed_out = true;
                self.force_stop.store(true, Ordering::Relaxed);
            }
            match reader.join() {
                Ok(fifo) => self.fifo = Some(fifo),
                Err(_) => spdlog::error!("Reader thread panicked, FIFO handle is lost"),
            }
        }

        if let Some(tx) = self.dist_tx.take() {
            let _ = tx.send(None);
        }
        if let Some(distributor) = self.distributor.take() {
            let _ = distributor.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
        self.state = ReadoutState::Stopped;

        if timed_out {
            let error = AcquisitionError::StopTimeout(timeout);
            if let Some(errback) = &self.errback {
                errback(&error);
            }
            return Err(error);
        }
        spdlog::info!("Readout stopped");
        Ok(())
    }

    /// Get the FIFO handle back after a stop
    pub fn into_fifo(mut self) -> Option<F> {
        self.fifo.take()
    }

    /// Wrap the user callback with the error policy: fifo errors abort the
    /// run when configured, everything is logged
    fn dispatcher(&self) -> ErrorCallback {
        let user = self.errback.clone();
        let stop_flag = self.stop_flag.clone();
        let abort_on_fifo_error = self.config.abort_on_fifo_error;
        Arc::new(move |error: &AcquisitionError| {
            spdlog::error!("Readout error: {}", error);
            if abort_on_fifo_error && error.is_fifo_error() {
                spdlog::warn!("Aborting readout, the hardware lost data");
                stop_flag.store(true, Ordering::Relaxed);
            }
            if let Some(user) = &user {
                user(error);
            }
        })
    }
}

/// The polling loop run by the reader thread.
///
/// Each iteration drains the FIFO once and, when words came back, sends them
/// as one chunk stamped with the poll start/stop times (seconds since loop
/// start). The remainder of the poll interval is slept off, so the cadence
/// holds whether or not data arrived. A quiet FIFO past the no-data timeout
/// raises an error once and re-arms.
fn reader_loop<F: HardwareFifo>(
    fifo: &mut F,
    tx: SyncSender<ChunkItem>,
    stop: Arc<AtomicBool>,
    force_stop: Arc<AtomicBool>,
    interval: Duration,
    no_data_timeout: Option<Duration>,
    errback: ErrorCallback,
) {
    let epoch = Instant::now();
    let mut last_data = Instant::now();
    let mut words_total: u64 = 0;

    loop {
        if force_stop.load(Ordering::Relaxed) {
            spdlog::warn!("Reader force-stopped");
            break;
        }
        let poll_started = Instant::now();
        let t_start = epoch.elapsed().as_secs_f64();
        let words = fifo.read_data();
        let t_stop = epoch.elapsed().as_secs_f64();

        let got_data = !words.is_empty();
        if got_data {
            last_data = Instant::now();
            words_total += words.len() as u64;
            let chunk = Arc::new(ReadoutChunk {
                words,
                t_start,
                t_stop,
                error: 0,
            });
            if tx.send(Some(chunk)).is_err() {
                break;
            }
        }

        if stop.load(Ordering::Relaxed) {
            // Drain what the hardware already buffered, then leave; a source
            // that never dries up is cut off by the force-stop flag
            if got_data || fifo.fifo_size() > 0 {
                continue;
            }
            break;
        }

        if !got_data {
            if let Some(timeout) = no_data_timeout {
                if last_data.elapsed() > timeout {
                    errback(&AcquisitionError::NoDataTimeout(timeout));
                    last_data = Instant::now();
                }
            }
        } else if fifo.fifo_size() > 0 {
            // Backlogged FIFO, poll again without waiting
            continue;
        }

        let elapsed = poll_started.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
    spdlog::info!(
        "Reader finished after {} words ({})",
        words_total,
        human_bytes((words_total * WORD_SIZE_BYTES) as f64)
    );
}

/// RAII wrapper tying a readout run to a scope.
///
/// Construction starts the readout; [`finish`] (or falling out of scope)
/// stops it with the configured timeout, so an early return from a scan never
/// leaves the reader thread behind.
///
/// [`finish`]: ReadoutGuard::finish
pub struct ReadoutGuard<'a, F: HardwareFifo + 'static> {
    readout: &'a mut FifoReadout<F>,
    timeout: Duration,
    done: bool,
}

impl<'a, F: HardwareFifo + 'static> ReadoutGuard<'a, F> {
    pub fn begin(
        readout: &'a mut FifoReadout<F>,
        reset_fifo: bool,
        timeout: Duration,
    ) -> Self {
        readout.start(reset_fifo);
        Self {
            readout,
            timeout,
            done: false,
        }
    }

    pub fn readout(&mut self) -> &mut FifoReadout<F> {
        self.readout
    }

    /// Stop explicitly, surfacing a possible stop timeout
    pub fn finish(mut self) -> Result<(), AcquisitionError> {
        self.done = true;
        self.readout.stop(self.timeout)
    }
}

impl<F: HardwareFifo + 'static> Drop for ReadoutGuard<'_, F> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.readout.stop(self.timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedCounters, SimulatedFifo};

    fn fast_config() -> Config {
        Config {
            poll_interval_ms: 1,
            no_data_timeout_s: None,
            watchdog_interval_ms: 20,
            ..Config::default()
        }
    }

    #[test]
    fn test_buffer_channel_receives_ordered_chunks() {
        let fifo = SimulatedFifo::new(3, 50);
        let mut readout = FifoReadout::new(fifo, &fast_config());
        let handle = readout.register_buffer("raw");
        readout.start(true);
        std::thread::sleep(Duration::from_millis(100));
        readout.stop(Duration::from_secs(1)).unwrap();

        let chunks = handle.drain();
        assert!(!chunks.is_empty());
        let total: u64 = chunks.iter().map(|c| c.words.len() as u64).sum();
        assert_eq!(total, handle.words_seen());
        for pair in chunks.windows(2) {
            assert!(pair[0].t_start <= pair[1].t_start);
        }
        for chunk in &chunks {
            assert!(chunk.t_stop >= chunk.t_start);
        }
    }

    #[test]
    fn test_callback_channel_sees_every_word() {
        let fifo = SimulatedFifo::new(2, 40);
        let mut readout = FifoReadout::new(fifo, &fast_config());
        let counted = Arc::new(AtomicU64::new(0));
        let counted_in_cb = counted.clone();
        let handle = readout.register_callback("count", move |chunk| {
            counted_in_cb.fetch_add(chunk.words.len() as u64, Ordering::Relaxed);
        });
        readout.start(true);
        std::thread::sleep(Duration::from_millis(100));
        readout.stop(Duration::from_secs(1)).unwrap();

        assert!(handle.words_seen() > 0);
        assert_eq!(counted.load(Ordering::Relaxed), handle.words_seen());
    }

    #[test]
    fn test_no_data_timeout_raised_and_rearmed() {
        let fifo = SimulatedFifo::empty();
        let config = Config {
            poll_interval_ms: 1,
            no_data_timeout_s: Some(0.02),
            abort_on_fifo_error: false,
            ..Config::default()
        };
        let mut readout = FifoReadout::new(fifo, &config);
        let raised = Arc::new(Mutex::new(Vec::new()));
        let raised_in_cb = raised.clone();
        readout.set_error_callback(Arc::new(move |error| {
            raised_in_cb.lock().unwrap().push(error.clone());
        }));
        readout.start(false);
        std::thread::sleep(Duration::from_millis(120));
        readout.stop(Duration::from_secs(1)).unwrap();

        let raised = raised.lock().unwrap();
        assert!(raised.len() >= 2, "timeout should re-arm, got {raised:?}");
        assert!(raised
            .iter()
            .all(|e| matches!(e, AcquisitionError::NoDataTimeout(_))));
    }

    #[test]
    fn test_discard_aborts_readout() {
        let fifo = SimulatedFifo::new(1, 10);
        let counters = Arc::new(SimulatedCounters::new(1));
        let config = Config {
            poll_interval_ms: 1,
            no_data_timeout_s: None,
            watchdog_interval_ms: 10,
            ..Config::default()
        };
        let mut readout = FifoReadout::new(fifo, &config);
        readout.set_counters(counters.clone());
        let raised = Arc::new(Mutex::new(Vec::new()));
        let raised_in_cb = raised.clone();
        readout.set_error_callback(Arc::new(move |error| {
            raised_in_cb.lock().unwrap().push(error.clone());
        }));
        readout.start(true);
        // Let the watchdog thread take its initial baseline sample before
        // injecting the discard, so the increase is not absorbed into it
        std::thread::sleep(Duration::from_millis(20));
        counters.inject_discard(0, 5);
        std::thread::sleep(Duration::from_millis(150));
        // The watchdog raised the error and the policy stopped the reader
        readout.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(readout.state(), ReadoutState::Stopped);
        assert!(raised
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, AcquisitionError::FifoDiscard { .. })));
    }

    #[test]
    fn test_guard_stops_on_drop() {
        let fifo = SimulatedFifo::new(1, 10);
        let mut readout = FifoReadout::new(fifo, &fast_config());
        {
            let _guard = ReadoutGuard::begin(&mut readout, true, Duration::from_secs(1));
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(readout.state(), ReadoutState::Stopped);
    }

    #[test]
    fn test_fifo_handle_returned_after_stop() {
        let fifo = SimulatedFifo::new(1, 10);
        let mut readout = FifoReadout::new(fifo, &fast_config());
        readout.start(true);
        std::thread::sleep(Duration::from_millis(20));
        readout.stop(Duration::from_secs(1)).unwrap();
        readout.start(true);
        std::thread::sleep(Duration::from_millis(20));
        readout.stop(Duration::from_secs(1)).unwrap();
        assert!(readout.into_fifo().is_some());
    }
}
