//! blobpark CLI: park files through the parking service and report what happened.

use clap::{Args, Parser, Subcommand};
use blobpark_core::config::{ParkingConfig, PolicyKind};
use blobpark_exec::{ParkAttempt, ParkableBlob, ParkingService};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Appends are fed in pieces of this size, the way a streaming producer would.
const APPEND_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "blobpark")]
#[command(about = "Park large immutable blobs on disk and bring them back on demand", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load files as blobs, freeze them, park them and print statistics
    Park {
        /// Files to load
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,

        /// How long to wait for parking to settle (ms)
        #[arg(long, default_value = "5000")]
        wait_ms: u64,

        /// Read every blob back and compare with the source file
        #[arg(long)]
        verify: bool,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration (env + overrides) as JSON
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args, Debug, Default)]
struct Overrides {
    /// JSON config file used instead of the environment
    #[arg(long)]
    config: Option<PathBuf>,

    /// Minimum blob size worth parking (bytes)
    #[arg(long)]
    min_parking_size: Option<usize>,

    /// Parking policy: immediate or delayed
    #[arg(long)]
    policy: Option<String>,

    /// Delay used by the delayed policy (ms)
    #[arg(long)]
    parking_delay_ms: Option<u64>,

    /// Sweep period (ms)
    #[arg(long)]
    sweep_interval_ms: Option<u64>,

    /// Cap on the backing file size (bytes)
    #[arg(long)]
    max_disk_bytes: Option<u64>,

    /// Directory for the backing file (overrides config)
    #[arg(long)]
    spill_dir: Option<String>,

    /// Keep everything in memory
    #[arg(long)]
    no_disk: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Park {
            files,
            overrides,
            wait_ms,
            verify,
            json,
        } => {
            if let Err(e) = park_files(&files, &overrides, wait_ms, verify, json) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Config { overrides } => match effective_config(&overrides) {
            Ok(config) => match serde_json::to_string_pretty(&config) {
                Ok(s) => println!("{s}"),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
        },
    }
}

fn effective_config(overrides: &Overrides) -> Result<ParkingConfig, Box<dyn std::error::Error>> {
    let mut config = match &overrides.config {
        Some(path) => ParkingConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ParkingConfig::from_env(),
    };
    apply_overrides(&mut config, overrides)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(cfg: &mut ParkingConfig, o: &Overrides) -> Result<(), String> {
    if let Some(size) = o.min_parking_size {
        cfg.min_parking_size = size;
    }
    if let Some(policy) = &o.policy {
        cfg.policy =
            PolicyKind::parse(policy).ok_or_else(|| format!("unknown policy '{policy}'"))?;
    }
    if let Some(delay) = o.parking_delay_ms {
        cfg.parking_delay_ms = delay;
    }
    if let Some(interval) = o.sweep_interval_ms {
        cfg.sweep_interval_ms = interval;
    }
    if let Some(max) = o.max_disk_bytes {
        cfg.max_disk_bytes = Some(max);
    }
    if let Some(dir) = &o.spill_dir {
        cfg.spill_dir = Some(dir.clone());
    }
    if o.no_disk {
        cfg.disk_enabled = false;
    }
    Ok(())
}

fn park_files(
    files: &[PathBuf],
    overrides: &Overrides,
    wait_ms: u64,
    verify: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = effective_config(overrides)?;
    let service = ParkingService::start(config)?;

    let mut blobs = Vec::with_capacity(files.len());
    for path in files {
        let blob = load_blob(&service, path)?;
        tracing::info!(path = %path.display(), id = %blob.id(), size = blob.size(), "loaded");
        blobs.push((path, blob));
    }

    // Don't wait out the first sweep interval.
    service.manager().request_sweep_now();
    let deadline = Instant::now() + Duration::from_millis(wait_ms);
    while Instant::now() < deadline && !settled(&blobs) {
        thread::sleep(Duration::from_millis(20));
    }

    let stats = service.manager().statistics();
    if json {
        println!("{}", stats.to_json()?);
    } else {
        println!("Parking Statistics");
        println!("==================");
        println!(
            "  Resident: {} blobs, {} bytes",
            stats.resident_blobs, stats.resident_bytes
        );
        println!(
            "  On disk:  {} blobs, {} bytes",
            stats.on_disk_blobs, stats.on_disk_bytes
        );
        println!(
            "  Backing file: {} bytes allocated (peak {}), tail {}",
            stats.disk_allocated_bytes, stats.disk_peak_bytes, stats.disk_file_tail
        );
        println!(
            "  Parks: {}  Unparks: {}  Write failures: {}  Sweeps: {}",
            stats.parks, stats.unparks, stats.write_failures, stats.sweeps
        );
        if !stats.writes_enabled {
            println!("  Disk writes are disabled");
        }
    }

    if verify {
        for (path, blob) in &blobs {
            let expected = std::fs::read(path)?;
            let actual = blob.data_copy()?;
            if expected != actual {
                return Err(format!("{}: contents differ after unpark", path.display()).into());
            }
        }
        println!("✓ {} blobs verified", blobs.len());
    }

    Ok(())
}

fn load_blob(
    service: &ParkingService,
    path: &PathBuf,
) -> Result<ParkableBlob, Box<dyn std::error::Error>> {
    let mut file = File::open(path)?;
    let blob = service.create_blob();
    let mut chunk = vec![0u8; APPEND_CHUNK];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        blob.append(&chunk[..n])?;
    }
    blob.freeze();
    Ok(blob)
}

/// Every blob is parked, or resident with nothing in flight and a permanent
/// reason to stay (too small, no room within the cap, writes disabled).
fn settled(blobs: &[(&PathBuf, ParkableBlob)]) -> bool {
    blobs.iter().all(|(_, blob)| blob_settled(blob))
}

fn blob_settled(blob: &ParkableBlob) -> bool {
    if !blob.is_resident() {
        return true;
    }
    if blob.is_parking_in_flight() {
        return false;
    }
    match blob.try_park() {
        ParkAttempt::Skipped(reason) => !reason.is_transient(),
        ParkAttempt::Discarded => true,
        ParkAttempt::WriteScheduled => false,
    }
}
