//! Fan-out of readout chunks to consumer channels.
//!
//! The distributor runs isolated from the polling loop so a slow consumer
//! callback can never stall the reader; backpressure is absorbed by the
//! bounded queues. Ordering within one channel is FIFO end-to-end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::data::ReadoutChunk;

/// Queue item; `None` is the shutdown sentinel
pub type ChunkItem = Option<Arc<ReadoutChunk>>;
/// Consumer callback, invoked once per chunk per channel
pub type ChunkCallback = Box<dyn FnMut(&ReadoutChunk) + Send>;
/// Accumulation buffer retrievable by the scan driver
pub type ChunkBuffer = Arc<Mutex<VecDeque<Arc<ReadoutChunk>>>>;

/// How often a parked worker rechecks for shutdown
const WORKER_POLL: Duration = Duration::from_millis(50);

/// Distributor-side endpoint of one consumer channel
pub(crate) struct ChannelLink {
    pub name: String,
    pub tx: SyncSender<ChunkItem>,
    pub word_count: Arc<AtomicU64>,
}

/// Distribution loop: consume the input queue, count words per channel and
/// forward every chunk to every channel. On the sentinel, forward it to all
/// channels to unblock the workers and terminate.
pub(crate) fn run_distributor(input: Receiver<ChunkItem>, links: Vec<ChannelLink>) {
    loop {
        match input.recv() {
            Ok(Some(chunk)) => {
                for link in &links {
                    link.word_count
                        .fetch_add(chunk.words.len() as u64, Ordering::Relaxed);
                    if link.tx.send(Some(chunk.clone())).is_err() {
                        spdlog::warn!("Channel {} hung up, dropping chunk", link.name);
                    }
                }
            }
            Ok(None) | Err(_) => {
                for link in &links {
                    let _ = link.tx.send(None);
                }
                spdlog::debug!("Distributor shut down");
                return;
            }
        }
    }
}

/// Per-channel worker loop: drain the queue with a short timeout to stay
/// responsive to shutdown, run the callback and/or fill the buffer, exit on
/// the sentinel or on force-stop.
pub(crate) fn run_worker(
    name: String,
    input: Receiver<ChunkItem>,
    callback: Option<Arc<Mutex<ChunkCallback>>>,
    buffer: Option<ChunkBuffer>,
    force_stop: Arc<AtomicBool>,
) {
    loop {
        match input.recv_timeout(WORKER_POLL) {
            Ok(Some(chunk)) => {
                if let Some(callback) = &callback {
                    if let Ok(mut callback) = callback.lock() {
                        (callback)(&chunk);
                    }
                }
                if let Some(buffer) = &buffer {
                    if let Ok(mut buffer) = buffer.lock() {
                        buffer.push_back(chunk);
                    }
                }
            }
            Ok(None) => {
                // Sentinel: every chunk queued before it has been handled
                spdlog::debug!("Channel {} worker shut down", name);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if force_stop.load(Ordering::Relaxed) {
                    spdlog::warn!("Channel {} worker force-stopped", name);
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
