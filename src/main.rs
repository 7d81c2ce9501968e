//! squeeze2diretta - Squeezelite to Diretta bridge
//!
//! Runs a patched Squeezelite as a child process, reads its headered
//! PCM/DSD stream from stdout, and feeds a Diretta-protocol DAC
//! through the sync adapter:
//!
//! ```text
//! LMS -> squeezelite -> stdout pipe -> bridge -> DirettaSync -> DAC
//! ```

mod bridge;
mod child;
mod header;
mod pipe;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use clap::Parser;

use sqd_sync::{DirettaConfig, DirettaSync, LoopbackDriver, LoopbackFinder, SinkCaps, TargetFinder};

use crate::bridge::Bridge;
use crate::child::{ChildConfig, SqueezeliteChild};
use crate::pipe::PipeReader;

/// Graceful-shutdown flag set by SIGINT/SIGTERM.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);
/// Stats-dump flag set by SIGUSR1.
static STATS_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(
    name = "squeeze2diretta",
    version,
    about = "Squeezelite to Diretta bridge"
)]
struct Cli {
    /// LMS server address (default: autodiscovery)
    #[arg(short = 's', value_name = "SERVER[:PORT]")]
    server: Option<String>,

    /// Player name
    #[arg(short = 'n', default_value = "squeeze2diretta")]
    name: String,

    /// MAC address (ab:cd:ef:12:34:56)
    #[arg(short = 'm', value_name = "MAC")]
    mac: Option<String>,

    /// Model name
    #[arg(short = 'M', default_value = "SqueezeLite")]
    model: String,

    /// Restrict codecs (flac,pcm,mp3,ogg,aac,dsd,...)
    #[arg(short = 'c', value_name = "CODECS")]
    codecs: Option<String>,

    /// Supported sample rates
    #[arg(short = 'r', default_value = "44100-768000", value_name = "RATES")]
    rates: String,

    /// Sample format: 16, 24 or 32
    #[arg(short = 'a', default_value_t = 24, value_name = "BITS")]
    format_bits: u32,

    /// Read WAV/AIFF as headerless PCM
    #[arg(short = 'W')]
    read_wave: bool,

    /// DSD passthrough mode (:u32be, :u32le or dop)
    #[arg(short = 'D', value_name = "FMT", num_args = 0..=1, default_missing_value = "")]
    dsd: Option<String>,

    /// Diretta target number (1-based)
    #[arg(short = 't', long = "target", value_name = "N")]
    target: Option<usize>,

    /// List Diretta targets and exit
    #[arg(short = 'l', long = "list-targets")]
    list_targets: bool,

    /// SDK thread-mode bitmask
    #[arg(long, default_value_t = 1, value_name = "N")]
    thread_mode: u32,

    /// Transfer cycle time in microseconds (default: auto)
    #[arg(long, value_name = "USEC")]
    cycle_time: Option<u32>,

    /// MTU override in bytes (default: auto-measured)
    #[arg(long, value_name = "BYTES")]
    mtu: Option<u32>,

    /// Verbose (debug) output
    #[arg(short = 'v')]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Path to the squeezelite binary
    #[arg(long, default_value = "squeezelite", value_name = "PATH")]
    squeezelite: String,
}

fn main() {
    if let Err(e) = run() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else if cli.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if cli.list_targets {
        list_targets();
        return Ok(());
    }

    if !matches!(cli.format_bits, 16 | 24 | 32) {
        bail!("-a must be 16, 24 or 32 (got {})", cli.format_bits);
    }

    install_signal_handlers();

    // The vendor SDK binds the same driver traits through an FFI shim;
    // this build runs against the in-process loopback transport.
    let finder = Box::new(LoopbackFinder::new());
    let driver = Box::new(LoopbackDriver::new(SinkCaps::default()));
    let mut sync = DirettaSync::new(finder, driver);

    if let Some(target) = cli.target {
        if target == 0 {
            bail!("--target is 1-based");
        }
        sync.set_target_index(target - 1);
    }
    if let Some(mtu) = cli.mtu {
        sync.set_mtu(mtu);
    }

    let config = DirettaConfig {
        cycle_time_us: cli.cycle_time.unwrap_or(2620),
        cycle_time_auto: cli.cycle_time.is_none(),
        thread_mode: cli.thread_mode,
        mtu: cli.mtu.unwrap_or(0),
        ..DirettaConfig::default()
    };

    log::info!("initializing Diretta...");
    sync.enable(config)
        .context("failed to enable Diretta (use -l to list targets)")?;

    let child_cfg = ChildConfig {
        server: cli.server,
        name: cli.name,
        mac: cli.mac,
        model: cli.model,
        codecs: cli.codecs,
        rates: cli.rates,
        format_bits: cli.format_bits,
        read_wave: cli.read_wave,
        dsd: cli.dsd,
        binary: cli.squeezelite,
        verbose: cli.verbose,
    };

    let (mut child, stdout) = SqueezeliteChild::spawn(&child_cfg).with_context(|| {
        format!("failed to spawn squeezelite ({})", child_cfg.binary)
    })?;

    log::info!("waiting for audio stream...");
    let reader = PipeReader::new(stdout);
    let result = Bridge::new(&mut sync, reader, &SHUTDOWN, &STATS_REQUESTED).run();

    child.terminate();

    match result {
        Ok(stats) => {
            log::info!(
                "stopped: {} header(s), {} MiB in, {} MiB out, {} silence chunk(s)",
                stats.headers,
                stats.bytes_in >> 20,
                stats.bytes_out >> 20,
                stats.silence_chunks
            );
            Ok(())
        }
        Err(e) => Err(e).context("bridge terminated"),
    }
}

fn list_targets() {
    let mut finder = LoopbackFinder::new();
    let targets = finder.find_outputs();
    if targets.is_empty() {
        println!("No Diretta targets found");
        return;
    }

    println!("\nAvailable Diretta targets ({} found):\n", targets.len());
    for (index, (addr, info)) in targets.iter().enumerate() {
        println!("[{}] {}", index + 1, info.name);
        if !info.output_name.is_empty() {
            println!("    Output: {}", info.output_name);
        }
        println!("    Address: {addr}");
        if let Some(mtu) = finder.measure_mtu(addr) {
            println!("    MTU: {mtu} bytes");
        }
        println!("    Version: {}", info.version);
        println!("    ProductID: {:#010x}", info.product_id);
        if info.multiport {
            println!("    Multiport: enabled");
        }
        println!();
    }
}

fn install_signal_handlers() {
    extern "C" fn on_signal(sig: libc::c_int) {
        match sig {
            libc::SIGINT | libc::SIGTERM => SHUTDOWN.store(true, Ordering::Release),
            libc::SIGUSR1 => STATS_REQUESTED.store(true, Ordering::Release),
            _ => {}
        }
    }

    // No SA_RESTART: a blocked pipe read must return EINTR so the
    // bridge notices the shutdown flag.
    // SAFETY: handler only touches lock-free atomics.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as usize;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGUSR1] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }
}
