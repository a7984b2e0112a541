//! dce-sim - drive the DCE control plane against the simulated firmware
//!
//! Commands:
//! - `dce-sim run [--config FILE] [--inject KIND]` - Boot, exercise and shut down a DCE
//! - `dce-sim config` - Print the default configuration
//! - `dce-sim info` - Show protocol and layout info

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use dce::logbuf::HEADER_SIZE;
use dce::protocol::{admin_cmd, PROTOCOL_VERSION};
use dce::sim::{Bench, Fault};
use dce::{DceConfig, DceState};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "dce-sim")]
#[command(version)]
#[command(about = "DCE control plane on a simulated remote unit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the DCE and run a scenario
    Run {
        /// Scenario file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Fault to inject once the scenario has run
        #[arg(short, long, value_enum)]
        inject: Option<Injection>,
    },

    /// Print the default scenario file
    Config,

    /// Show protocol info
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum Injection {
    Abort,
    Crash,
    Overflow,
}

/// Scenario file: driver configuration plus what to exercise
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Scenario {
    dce: DceConfig,
    run: RunConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    /// Admin echo round trips
    requests: usize,
    /// SC7 suspend/resume cycles
    suspend_cycles: usize,
    /// Set up the shared log buffer
    log: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            requests: 16,
            suspend_cycles: 2,
            log: true,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, inject } => {
            let scenario = load_scenario(config.as_deref())?;
            run_scenario(scenario, inject)?;
        }

        Commands::Config => {
            print!("{}", toml::to_string_pretty(&Scenario::default())?);
        }

        Commands::Info => {
            show_info();
        }
    }

    Ok(())
}

fn load_scenario(path: Option<&Path>) -> anyhow::Result<Scenario> {
    let Some(path) = path else {
        return Ok(Scenario::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn run_scenario(scenario: Scenario, inject: Option<Injection>) -> anyhow::Result<()> {
    let run = scenario.run;
    let bench = Bench::new(scenario.dce).context("Failed to set up the simulated DCE")?;

    step("Booting DCE");
    let begin = Instant::now();
    bench.dce.start().context("Start failed")?;
    done(format!("operating after {:?}", begin.elapsed()));

    if run.log {
        step("Setting up log buffer");
        bench.dce.init_log_buffer().context("Log buffer init failed")?;
        done(format!("active: {}", bench.dce.is_log_active()));
    }

    step(format!("Running {} admin round trips", run.requests));
    let begin = Instant::now();
    for i in 0..run.requests {
        let payload = (i as u32).to_le_bytes();
        let reply = bench
            .dce
            .admin_request(admin_cmd::ECHO, &payload)
            .with_context(|| format!("Admin request {} failed", i))?;
        if reply.payload != payload {
            anyhow::bail!("Admin request {} answered with {:?}", i, reply.payload);
        }
    }
    done(format!("{:?}", begin.elapsed()));

    for cycle in 1..=run.suspend_cycles {
        step(format!("SC7 cycle {}", cycle));
        bench.dce.enter_suspend().context("Suspend failed")?;
        bench.remote.power_loss();
        bench.dce.exit_resume().context("Resume failed")?;
        done(format!("{:?}", bench.dce.state()));
    }

    if let Some(injection) = inject {
        step("Injecting fault");
        let fault = match injection {
            Injection::Abort => Fault::Abort(0xdead),
            Injection::Crash => Fault::Crash("fatal: injected crash\n".into()),
            Injection::Overflow => Fault::Overflow,
        };
        bench.remote.inject(fault);
        std::thread::sleep(std::time::Duration::from_millis(50));
        match bench.dce.state() {
            DceState::Abort => println!(
                "  {} ABORT (reason {:#x})",
                "!".red().bold(),
                bench.dce.abort_reason().unwrap_or_default()
            ),
            state => done(format!(
                "{:?}, {} log overflows",
                state,
                bench.dce.log_overflow_count()
            )),
        }
    }

    if run.log && bench.dce.state() != DceState::Abort {
        let read = bench.dce.read_log().context("Log read failed")?;
        println!("\n{}", "DCE log:".bold());
        for line in String::from_utf8_lossy(&read.data).lines() {
            println!("  {}", line.dimmed());
        }
    }

    step("Shutting down");
    let Bench { dce, remote, .. } = bench;
    dce.deinit();
    drop(remote);
    done("released");

    Ok(())
}

fn step(what: impl AsRef<str>) {
    println!("{} {}...", "▶".cyan(), what.as_ref());
}

fn done(what: impl AsRef<str>) {
    println!("  {} {}", "✓".green(), what.as_ref());
}

fn show_info() {
    println!("{}", "DCE control plane simulator".bold().green());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("\nProtocol version: {}", PROTOCOL_VERSION);
    println!("Log buffer header: {} bytes", HEADER_SIZE);
    println!("\nCommands:");
    println!("  dce-sim run [--config FILE] [--inject KIND]  Run a scenario");
    println!("  dce-sim config                               Print the default scenario");
    println!("  dce-sim info                                 Show this info");
}
