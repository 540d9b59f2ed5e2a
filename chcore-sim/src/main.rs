//! chcore-sim - boot a simulated ChCore kernel and run demo workloads
//!
//! Usage:
//!   chcore-sim [--config FILE] [--log-level LEVEL] ping-pong --rounds 1000
//!   chcore-sim echo --messages 64
//!   chcore-sim show-config

mod workload;

use anyhow::{Context, Result};
use chcore_kernel::platform::TimerDevice;
use chcore_kernel::{KernelConfig, ObjectType, VERSION};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use workload::{Outcome, Sim};

#[derive(Parser, Debug)]
#[command(name = "chcore-sim", version, about = "Simulated ChCore microkernel")]
struct Cli {
    /// Kernel configuration file (defaults apply when it does not exist)
    #[arg(short, long, env = "CHCORE_CONFIG", default_value = "chcore.toml")]
    config: PathBuf,

    /// Log filter, e.g. "info" or "chcore_kernel=trace"; RUST_LOG wins when unset
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bounce a notification pair between two cores
    PingPong {
        /// Number of round trips
        #[arg(short, long, default_value = "1000")]
        rounds: u64,
    },
    /// Run a channel echo server against a client on another core
    Echo {
        /// Number of calls the client makes
        #[arg(short, long, default_value = "64")]
        messages: u64,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = KernelConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let (name, run, count): (_, fn(&Sim, u64) -> Result<Outcome>, _) = match cli.command {
        Commands::PingPong { rounds } => ("ping-pong", workload::ping_pong, rounds),
        Commands::Echo { messages } => ("echo", workload::echo, messages),
        Commands::ShowConfig => {
            let text = toml::to_string_pretty(&config).context("failed to render config")?;
            print!("{text}");
            return Ok(());
        }
    };

    info!("chcore-sim v{} on {} cores", VERSION, config.sched.cpus);
    let sim = Sim::boot(config)?;
    let outcome = run(&sim, count).with_context(|| format!("{name} workload failed"))?;
    print_summary(&sim, name, outcome);
    Ok(())
}

fn print_summary(sim: &Sim, name: &str, outcome: Outcome) {
    println!("Workload: {name}");
    println!("  Rounds: {}", outcome.rounds);
    if outcome.bytes > 0 {
        println!("  Bytes echoed: {}", outcome.bytes);
    }
    let elapsed = sim.plat.current_tick() / sim.plat.ticks_per_us().max(1);
    println!("  Simulated time: {:?}", Duration::from_micros(elapsed));
    println!();

    println!("{:<6} {:>10} {:>10} {:>8} {:>7} {:>7}", "CPU", "SWITCHES", "TICKS", "IPIS", "READY", "TIMERS");
    println!("{}", "=".repeat(53));
    for cpu in 0..sim.kernel.config().sched.cpus {
        let s = sim.kernel.core(cpu).snapshot();
        println!(
            "{:<6} {:>10} {:>10} {:>8} {:>7} {:>7}",
            s.cpu, s.switches, s.ticks, s.ipis_received, s.ready, s.timers
        );
    }
    println!();

    println!("{:<14} {:>8} {:>8}", "OBJECT", "LIVE", "FREED");
    println!("{}", "=".repeat(32));
    let stats = sim.kernel.objects();
    for ty in ObjectType::ALL {
        println!("{:<14} {:>8} {:>8}", format!("{ty:?}"), stats.live(ty), stats.freed(ty));
    }
}
