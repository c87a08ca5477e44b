use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use simplelog::LevelFilter;

use cortexflash::format::{self, BinaryParser, Parser as _};
use cortexflash::transport::Baudrate;
use cortexflash::{
    ConnectOptions, DeviceDb, EntryStrategy, ErasePages, Flashing, Progress, SerialTransport,
    WriteOptions, handshake,
};

#[derive(clap::Parser)]
#[command(
    name = "cortexflash",
    version,
    about = "Flash loader for the VEX Cortex over its serial programming link"
)]
struct Cli {
    /// Serial port, the first one found when omitted
    port: Option<String>,

    /// Baud rate of the bootloader link
    #[arg(short, long, default_value_t = Baudrate::default())]
    baud: Baudrate,

    /// Read the whole flash into FILE
    #[arg(short, long, value_name = "FILE", conflicts_with = "write")]
    read: Option<PathBuf>,

    /// Write FILE (Intel HEX or raw binary) to flash
    #[arg(short, long, value_name = "FILE")]
    write: Option<PathBuf>,

    /// Disable flash write protection
    #[arg(short, long, conflicts_with_all = ["read", "write", "go", "go_flash"])]
    unprotect: bool,

    /// Pages to erase before writing, 255 erases everything and 0 nothing
    #[arg(
        short,
        long,
        value_name = "N",
        default_value_t = 255,
        value_parser = clap::value_parser!(u32).range(0..=255)
    )]
    erase_pages: u32,

    /// Read each chunk back after writing it
    #[arg(short, long, requires = "write")]
    verify: bool,

    /// Rewrites of a chunk that failed verification
    #[arg(short = 'n', long, default_value_t = cortexflash::constants::DEFAULT_VERIFY_RETRIES)]
    retries: u32,

    /// Start execution at ADDR, 0 for the start of flash
    #[arg(short, long, value_name = "ADDR", value_parser = parse_address, conflicts_with = "go_flash")]
    go: Option<u32>,

    /// Start execution at the start of flash
    #[arg(short = 'G', long)]
    go_flash: bool,

    /// Treat the input file as raw binary
    #[arg(short, long)]
    force_binary: bool,

    /// The bootloader is already synchronized, skip the mode handshake
    #[arg(short = 'c', long)]
    resume: bool,

    /// How to bring the Cortex into its bootloader
    #[arg(short = 'X', long, value_enum, default_value_t = EntryStrategy::Command)]
    entry: EntryStrategy,

    /// Have the VEX master reset the Cortex when done
    #[arg(long)]
    reset: bool,

    /// Only report warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

fn parse_address(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or(s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", s, e))
}

fn progress_bar(total: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

fn report(bar: &ProgressBar) -> impl FnMut(Progress) + '_ {
    move |p: Progress| {
        bar.set_position(p.done as u64);
        if p.is_complete() {
            bar.finish();
        }
    }
}

fn log_rate(bytes: usize, started: Instant) {
    let secs = started.elapsed().as_secs_f64();
    if secs > 0.0 {
        log::info!(
            "Transferred {} bytes in {:.2}s ({:.1} KiB/s)",
            bytes,
            secs,
            bytes as f64 / 1024.0 / secs
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        cli.log_level.min(LevelFilter::Warn)
    } else {
        cli.log_level
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    // reject bad arguments before touching the device
    let erase = ErasePages::from_count(cli.erase_pages)?;
    let mut image = match &cli.write {
        Some(path) => Some(
            format::open_image(path, cli.force_binary)
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => None,
    };
    let mut dump = match &cli.read {
        Some(path) => Some(
            BinaryParser::create(path).with_context(|| format!("creating {}", path.display()))?,
        ),
        None => None,
    };

    let db = DeviceDb::load()?;
    let options = ConnectOptions {
        baud_rate: cli.baud.into(),
        strategy: cli.entry,
        resume: cli.resume,
    };
    if cli.port.is_none() {
        log::debug!("Serial ports: {:?}", SerialTransport::scan_ports()?);
    }
    let mut flashing = Flashing::new_from_serial(cli.port.as_deref(), &db, &options)
        .context("connecting to the bootloader")?;
    flashing.dump_info();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }
    flashing.set_cancel_flag(cancel);

    if cli.unprotect {
        let mut transport = flashing.unprotect()?;
        if cli.reset {
            handshake::reset_target(&mut transport, options.baud_rate)?;
        }
        return Ok(());
    }

    if let Some(sink) = dump.as_mut() {
        let total = flashing.device().flash.size() as usize;
        let bar = progress_bar(total, cli.quiet);
        let started = Instant::now();
        flashing.read(sink, cortexflash::constants::MAX_CHUNK_SIZE, report(&bar))?;
        sink.close()?;
        log_rate(total, started);
    }

    if let Some(image) = image.as_mut() {
        let total = image.size();
        let bar = progress_bar(total, cli.quiet);
        let started = Instant::now();
        let write_options = WriteOptions {
            erase,
            verify: cli.verify,
            retries: cli.retries,
            ..Default::default()
        };
        flashing.write(&mut **image, &write_options, report(&bar))?;
        log_rate(total, started);
    }

    if cli.go_flash || cli.go.is_some() {
        let address = cli.go.filter(|&a| a != 0);
        flashing.execute(address)?;
    } else if cli.reset {
        flashing.reset_target()?;
    }

    Ok(())
}
