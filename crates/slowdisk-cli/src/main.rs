//! SlowDisk CLI: load the read/write delay hook and measure what it costs

use clap::{Parser, Subcommand};
use serde::Serialize;
use slowdisk_hook::config::{ModuleParams, DEFAULT_MAX_WAIT, DEFAULT_MIN_WAIT};
use slowdisk_hook::delay::{spin, thread_cpu_time, DelayStatsSnapshot};
use slowdisk_hook::host::{ProcessTable, Registration};
use slowdisk_hook::protect::Mprotect;
use slowdisk_hook::{ActivationReport, SlowDiskError};
use snafu::Snafu;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// CLI errors for the slowdisk binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("Hook error"), context(false))]
    Hook { source: SlowDiskError },
    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },
    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },
    #[snafu(display("{message}"))]
    Other { message: String },
}

#[derive(Parser)]
#[command(name = "slowdisk")]
#[command(about = "Simulate slow storage by delaying read/write dispatch")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a read/write workload with and without the hook loaded
    Run {
        /// Minimum cycle wait per read/write
        #[arg(long, default_value_t = DEFAULT_MIN_WAIT)]
        min_wait: u64,

        /// Maximum cycle wait per read/write
        #[arg(long, default_value_t = DEFAULT_MAX_WAIT)]
        max_wait: u64,

        /// Seed for reproducible delay draws
        #[arg(long)]
        seed: Option<u64>,

        /// Number of writes (and as many reads) per pass
        #[arg(short, long, default_value_t = 2000)]
        ops: usize,

        /// Bytes per operation
        #[arg(short, long, default_value_t = 4096)]
        block_size: usize,

        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Measure the CPU cost of the delay loop per magnitude
    Calibrate {
        /// Magnitudes to time
        #[arg(
            short,
            long,
            value_delimiter = ',',
            default_value = "1000,10000,100000,1000000"
        )]
        magnitudes: Vec<u64>,

        /// Samples per magnitude (the median is reported)
        #[arg(short, long, default_value_t = 5)]
        samples: usize,

        /// Emit the results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            min_wait,
            max_wait,
            seed,
            ops,
            block_size,
            json,
        } => cmd_run(
            ModuleParams {
                min_wait,
                max_wait,
                seed,
            },
            ops,
            block_size,
            json,
        ),
        Commands::Calibrate {
            magnitudes,
            samples,
            json,
        } => cmd_calibrate(&magnitudes, samples, json),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}

// ── run ─────────────────────────────────────────────────────────────

/// Wall and CPU time of one workload pass.
#[derive(Debug, Clone, Copy, Serialize)]
struct PassTiming {
    wall_ns: u64,
    cpu_ns: u64,
}

impl PassTiming {
    fn per_op_ns(&self, ops: usize) -> f64 {
        self.wall_ns as f64 / ops.max(1) as f64
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    activation: ActivationReport,
    ops: usize,
    block_size: usize,
    baseline: PassTiming,
    hooked: PassTiming,
    slowdown: f64,
    delays: DelayStatsSnapshot,
}

fn cmd_run(params: ModuleParams, ops: usize, block_size: usize, json: bool) -> Result<(), CliError> {
    if block_size == 0 {
        return Err(CliError::Other {
            message: "block size must be non-zero".into(),
        });
    }

    let host = ProcessTable::new()?;
    let mut file = tempfile::tempfile()?;
    let mut buf = vec![0xA5u8; block_size];

    let baseline = run_pass(&host, &mut file, &mut buf, ops)?;
    log::info!("baseline pass: {} ns", baseline.wall_ns);

    let mut registration: Registration<_, _> = Registration::new(&host, Mprotect);
    let activation = registration.load_with(&params)?;
    let hooked = run_pass(&host, &mut file, &mut buf, ops);
    let delays = registration
        .module()
        .map(|m| m.stats())
        .unwrap_or_default();
    registration.unload()?;
    let hooked = hooked?;
    log::info!("hooked pass: {} ns", hooked.wall_ns);

    let report = RunReport {
        activation,
        ops,
        block_size,
        baseline,
        hooked,
        slowdown: hooked.wall_ns as f64 / baseline.wall_ns.max(1) as f64,
        delays,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(&report);
    }
    Ok(())
}

/// Write `ops` blocks, rewind, read them back; all through the table.
fn run_pass(
    host: &ProcessTable,
    file: &mut File,
    buf: &mut [u8],
    ops: usize,
) -> Result<PassTiming, CliError> {
    let fd = file.as_raw_fd();
    file.seek(SeekFrom::Start(0))?;

    let wall = Instant::now();
    let cpu = thread_cpu_time();
    for _ in 0..ops {
        host.dispatch_write(fd, buf)?;
    }
    file.seek(SeekFrom::Start(0))?;
    for _ in 0..ops {
        host.dispatch_read(fd, buf)?;
    }
    Ok(PassTiming {
        wall_ns: wall.elapsed().as_nanos() as u64,
        cpu_ns: (thread_cpu_time() - cpu).as_nanos() as u64,
    })
}

fn print_run_report(report: &RunReport) {
    let total_ops = report.ops * 2;
    println!("=== SlowDisk run ===");
    println!("Table:      {:#x}", report.activation.table_base);
    println!("Interval:   {}", report.activation.bounds);
    if let Some(fix) = &report.activation.normalization {
        println!("            ({})", fix);
    }
    println!(
        "Workload:   {} writes + {} reads of {} bytes",
        report.ops, report.ops, report.block_size
    );
    println!();
    println!(
        "Baseline:   {:>12} ns wall  {:>12} ns cpu  {:>10.1} ns/op",
        report.baseline.wall_ns,
        report.baseline.cpu_ns,
        report.baseline.per_op_ns(total_ops)
    );
    println!(
        "Hooked:     {:>12} ns wall  {:>12} ns cpu  {:>10.1} ns/op",
        report.hooked.wall_ns,
        report.hooked.cpu_ns,
        report.hooked.per_op_ns(total_ops)
    );
    println!("Slowdown:   {:.2}x", report.slowdown);
    println!();
    println!(
        "Delays:     {} reads, {} writes, mean {:.1} cycles, max {}",
        report.delays.reads,
        report.delays.writes,
        report.delays.mean_magnitude(),
        report.delays.max_magnitude
    );
}

// ── calibrate ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CalibrationPoint {
    magnitude: u64,
    median_cpu_ns: u64,
    ns_per_cycle: f64,
}

fn cmd_calibrate(magnitudes: &[u64], samples: usize, json: bool) -> Result<(), CliError> {
    if samples == 0 {
        return Err(CliError::Other {
            message: "samples must be non-zero".into(),
        });
    }

    let points: Vec<CalibrationPoint> = magnitudes
        .iter()
        .map(|&magnitude| {
            let median = median_cpu_time(magnitude, samples);
            CalibrationPoint {
                magnitude,
                median_cpu_ns: median.as_nanos() as u64,
                ns_per_cycle: median.as_nanos() as f64 / magnitude.max(1) as f64,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&points)?);
        return Ok(());
    }

    println!("{:>12}  {:>14}  {:>10}", "magnitude", "cpu ns", "ns/cycle");
    for p in &points {
        println!(
            "{:>12}  {:>14}  {:>10.3}",
            p.magnitude, p.median_cpu_ns, p.ns_per_cycle
        );
    }
    Ok(())
}

fn median_cpu_time(magnitude: u64, samples: usize) -> Duration {
    let mut times: Vec<Duration> = (0..samples)
        .map(|_| {
            let start = thread_cpu_time();
            spin(magnitude);
            thread_cpu_time() - start
        })
        .collect();
    times.sort();
    times[times.len() / 2]
}
