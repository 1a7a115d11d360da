//! # pixdaq
//!
//! pixdaq is a data acquisition core for a 512x512 hybrid pixel detector
//! readout, written in Rust. It polls the readout board FIFO, distributes the
//! raw data stream to consumer channels on worker threads, decodes the framed
//! hit protocol, builds trigger-scoped events, and drives shifted mask scans
//! over the pixel matrix.
//!
//! ## Architecture
//!
//! A running readout consists of four kinds of threads:
//!
//! - The *reader* polls the hardware FIFO at a fixed cadence and pushes
//!   timestamped chunks into a bounded queue. It owns the FIFO handle for the
//!   duration of the run.
//! - The *distributor* fans every chunk out to all registered channels and
//!   keeps per-channel word counters.
//! - One *worker* per channel runs the channel's callback and/or fills its
//!   buffer, so a slow consumer never stalls the reader.
//! - The *watchdog* samples the hardware error counters and raises errors
//!   through the registered error callback when they grow.
//!
//! Decoding is decoupled from acquisition: raw words recorded through the
//! [`hardware::RawDataSink`] contract are replayed offline by the
//! [`analysis`] module, which cuts the stored timeline into
//! per-scan-parameter chunks, decodes them and builds events. The same
//! decoder and event builder run in both paths.
//!
//! ## Hardware interfaces
//!
//! Nothing in this crate talks to a device directly. The readout is generic
//! over the [`hardware::HardwareFifo`], [`hardware::RxCounters`] and
//! [`hardware::CommandSink`] traits; the [`sim`] module provides simulated
//! implementations used by the test suite and the CLI dry-run mode.
//!
//! ## Configuration
//!
//! Configurations are YAML files read with serde. The template written by
//! `pixdaq_cli new` looks like this:
//!
//! ```yml
//! poll_interval_ms: 50
//! no_data_timeout_s: 10.0
//! stop_timeout_s: 5.0
//! queue_depth: 64
//! watchdog_interval_ms: 1000
//! abort_on_fifo_error: true
//! check_link_errors: false
//! chunk_size: 1000000
//! event_window:
//!   lower: 100
//!   upper: 450
//! shift_period: 4
//! shift_stagger: 1
//! skip_empty_steps: true
//! cache_shift_commands: false
//! ```
//!
//! ## Logging
//!
//! All components log through spdlog. Binaries are expected to install a
//! default logger before starting a readout; the library never configures
//! sinks on its own.
pub mod analysis;
pub mod chunk_splitter;
pub mod config;
pub mod constants;
pub mod data;
pub mod distributor;
pub mod error;
pub mod event_builder;
pub mod hardware;
pub mod interpreter;
pub mod mask;
pub mod readout;
pub mod shift;
pub mod sim;
pub mod watchdog;
