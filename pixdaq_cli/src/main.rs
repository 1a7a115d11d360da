use clap::{Arg, Command};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libpixdaq::analysis;
use libpixdaq::config::Config;
use libpixdaq::hardware::{NullCommandSink, RawDataSink, TableSink};
use libpixdaq::mask::MaskSet;
use libpixdaq::readout::{FifoReadout, ReadoutGuard};
use libpixdaq::shift::{MaskScanEngine, ShiftPattern};
use libpixdaq::sim::{SimulatedCounters, SimulatedFifo};

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Run a shifted mask scan against the simulated readout board and analyze
/// the recorded data afterwards
fn run_scan(config_path: &Path) {
    let config = match Config::read_config_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");
    spdlog::info!("Poll interval: {} ms", config.poll_interval_ms);
    spdlog::info!(
        "Shift pattern: period {} stagger {}",
        config.shift_period,
        config.shift_stagger
    );

    let fifo = SimulatedFifo::new(2, 20);
    let counters = Arc::new(SimulatedCounters::new(4));
    let mut readout = FifoReadout::new(fifo, &config);
    readout.set_counters(counters);
    let raw_channel = readout.register_buffer("raw");

    let pattern = ShiftPattern {
        period: config.shift_period,
        stagger: config.shift_stagger,
    };
    let mut engine = MaskScanEngine::new(
        MaskSet::new(),
        pattern,
        config.skip_empty_steps,
        config.cache_shift_commands,
    );
    let mut command_sink = NullCommandSink;
    let mut sink = TableSink::new();
    let mut scan_param_id = 0u32;

    let stop_timeout = config.stop_timeout();
    let guard = ReadoutGuard::begin(&mut readout, true, stop_timeout);
    while let Some(step) = engine.next_step(&mut command_sink) {
        spdlog::info!(
            "Front end {} step {}: {} pixels enabled, {} register writes",
            step.front_end,
            step.step,
            step.active.len(),
            step.stats.total_writes()
        );
        std::thread::sleep(Duration::from_millis(25));
        for chunk in raw_channel.drain() {
            sink.append(&chunk, scan_param_id);
        }
        scan_param_id += 1;
    }
    if let Err(e) = guard.finish() {
        spdlog::error!("{e}");
    }
    // Chunks still in flight when the last step ended
    for chunk in raw_channel.drain() {
        sink.append(&chunk, scan_param_id.saturating_sub(1));
    }

    spdlog::info!(
        "Scan finished, {} words recorded; analyzing...",
        sink.words().len()
    );
    let report = analysis::analyze(sink.words(), sink.meta(), &config);
    report.log();
}

fn main() {
    // Create a cli
    let matches = Command::new("pixdaq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(Command::new("scan").about("Run a simulated shift scan"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the file"),
        )
        .get_matches();

    spdlog::default_logger()
        .set_level_filter(spdlog::LevelFilter::MoreSevereEqual(spdlog::Level::Info));

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    match matches.subcommand() {
        Some(("new", _)) => {
            spdlog::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            make_template_config(&config_path);
            spdlog::info!("Done.");
        }
        Some(("scan", _)) => {
            spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
            run_scan(&config_path);
        }
        _ => (),
    }
}
