//! cellctl - host helpers for a bare-metal Jailhouse cell
//!
//! Commands:
//! - `cellctl init` - clear every shared window before the cell starts
//! - `cellctl serve` - run the libc server
//! - `cellctl input` - feed Linux input events to the cell
//! - `cellctl debug-port` - bridge stdin/stdout to the cell's debug stub
//!   (GDB: `target remote | cellctl debug-port`)
//! - `cellctl frames` - record video/audio frames handed off by the cell
//! - `cellctl layout` - show the shared-memory layout

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use cell_comms::notify::EventNotifier;
use cell_comms::{Param, WithIrq};
use cell_host::debug_port::{set_nonblocking, DebugBridge};
use cell_host::frames::{FrameMonitor, RawDumpSink};
use cell_host::input::InputFeeder;
use cell_host::mapping::init_comms;
use cell_host::{
    CallServer, CommsConfig, CommsRegions, IdleBackoff, JailhouseIrq, LibcHost, MemDevice,
    WindowedMemory,
};
use clap::{Parser, Subcommand};
use colored::Colorize;

#[derive(Parser)]
#[command(name = "cellctl")]
#[command(version)]
#[command(about = "Host services for a bare-metal Jailhouse cell", long_about = None)]
struct Cli {
    /// Configuration file (TOML); built-in layout if omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clear all shared windows
    Init,

    /// Serve libc calls from the cell
    Serve,

    /// Forward input events
    Input {
        /// evdev node to read; stdin if omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Log every event
        #[arg(long)]
        debug: bool,
    },

    /// Bridge stdin/stdout to the debug port
    DebugPort,

    /// Record frames while the cell has recording enabled
    Frames {
        /// Directory for recNNNN files
        #[arg(short, long, default_value = "/sd")]
        dir: PathBuf,
    },

    /// Show the shared-memory layout
    Layout {
        /// Print the effective configuration as TOML
        #[arg(long)]
        toml: bool,
    },
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_signal: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

/// Stop long-running loops on SIGINT/SIGTERM
fn install_stop_handler() {
    let handler = request_stop as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = CommsConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Init => init(&config)?,
        Commands::Serve => serve(&config)?,
        Commands::Input { device, debug } => input(&config, device.as_deref(), debug)?,
        Commands::DebugPort => debug_port(&config)?,
        Commands::Frames { dir } => frames(&config, &dir)?,
        Commands::Layout { toml } => layout(&config, toml)?,
    }

    Ok(())
}

fn open_mem(config: &CommsConfig) -> Result<MemDevice> {
    MemDevice::open(&config.devices.mem)
        .with_context(|| format!("Failed to open {}", config.devices.mem.display()))
}

fn init(config: &CommsConfig) -> Result<()> {
    let mem = open_mem(config)?;
    init_comms(&mem, &config.region_map())?;
    println!("{} Shared windows cleared", "✅".green());
    Ok(())
}

fn serve(config: &CommsConfig) -> Result<()> {
    let mem = open_mem(config)?;
    let regions = CommsRegions::map_all(&mem, &config.region_map())?;
    let guest = WindowedMemory::map(&mem, &config.guest_memory)?;
    log::info!("{} guest memory windows mapped", guest.window_count());

    // The cell addresses the call window at its physical address.
    let guest_base = Param::try_from(config.regions.call.phys)
        .context("Call window address does not fit the argument word")?;

    install_stop_handler();
    let buf = regions.call_buffer()?;
    // SAFETY: this process is the only server for the channel.
    let mut server = unsafe { CallServer::new(buf, LibcHost::new(), guest, EventNotifier, guest_base) };
    server.publish_ready();

    println!("{} Serving libc calls (Ctrl-C to stop)", "🔌".green());
    let served = server.run_until(&STOP, &mut IdleBackoff::from(&config.idle));
    println!("{} Served {} calls", "✅".green(), served);
    Ok(())
}

fn input(config: &CommsConfig, device: Option<&Path>, debug: bool) -> Result<()> {
    let mem = open_mem(config)?;
    let regions = CommsRegions::map_all(&mem, &config.region_map())?;

    let reader: Box<dyn Read> = match device {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };

    let mut feeder = InputFeeder::new(reader, regions.input_events()?, EventNotifier);
    feeder.set_echo(debug);
    let stats = feeder.run()?;
    println!(
        "{} {} events forwarded, {} filtered",
        "✅".green(),
        stats.published,
        stats.filtered
    );
    Ok(())
}

fn debug_port(config: &CommsConfig) -> Result<()> {
    let mem = open_mem(config)?;
    let regions = CommsRegions::map_all(&mem, &config.region_map())?;
    let irq = JailhouseIrq::open(&config.devices.hypervisor, config.debug_port.irq)?;

    let stdin = io::stdin();
    set_nonblocking(&stdin).context("Failed to make stdin non-blocking")?;

    // stdout carries the debugger protocol; status goes to the log only.
    log::info!("debug port bridge up, interrupt {}", irq.irq());
    let port = regions.byte_port()?.host(WithIrq::new(EventNotifier, irq));
    DebugBridge::new(port, stdin.lock(), io::stdout().lock(), &config.debug_port).run()?;
    Ok(())
}

fn frames(config: &CommsConfig, dir: &Path) -> Result<()> {
    let mem = open_mem(config)?;
    let regions = CommsRegions::map_all(&mem, &config.region_map())?;
    let guest = WindowedMemory::map(&mem, &config.guest_memory)?;

    install_stop_handler();
    let mut sink = RawDumpSink::new(&guest, dir);
    let mut monitor = FrameMonitor::new(regions.media_port()?, EventNotifier);

    println!("{} Waiting for recordings into {}", "🎥".green(), dir.display());
    let stats = monitor.run(&mut sink, &STOP)?;
    println!(
        "{} {} sessions, {} video / {} audio frames, {} / {} dropped, {} unreadable",
        "✅".green(),
        stats.sessions,
        stats.video_frames,
        stats.audio_frames,
        stats.video_dropped,
        stats.audio_dropped,
        stats.bad_frames
    );
    Ok(())
}

fn layout(config: &CommsConfig, toml: bool) -> Result<()> {
    if toml {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let map = config.region_map();
    map.validate().context("Invalid region map")?;

    println!("{}", "Shared windows".bold().green());
    for window in map.windows() {
        println!(
            "  {:<14} {:#010x} - {:#010x}  {:>6} KiB",
            window.name.cyan(),
            window.phys_base,
            window.end(),
            window.size / 1024
        );
    }

    println!("\n{}", "Guest memory".bold().green());
    for window in &config.guest_memory {
        println!(
            "  guest {:#010x} <- phys {:#010x}  {:#x} bytes",
            window.guest_base, window.phys, window.size
        );
    }

    println!("\n{}", "Devices".bold().green());
    println!("  memory      {}", config.devices.mem.display());
    println!(
        "  hypervisor  {} (debug irq {})",
        config.devices.hypervisor.display(),
        config.debug_port.irq
    );
    Ok(())
}
