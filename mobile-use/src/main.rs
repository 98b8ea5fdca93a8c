//! `mobile-use`: drive a mobile device toward a natural-language goal.
//!
//! `run` executes one session against the selected Android device, `devices`
//! lists what adb can see and `init-config` writes the default configuration.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mobile_use::core::types::Goal;
use mobile_use::exit_codes;
use mobile_use::io::adb::{AdbDriver, list_devices};
use mobile_use::io::cancel::CancelToken;
use mobile_use::io::config::{AgentConfig, DEFAULT_CONFIG_FILE, load_config, write_config};
use mobile_use::io::gateway::Gateway;
use mobile_use::io::providers::build_provider;
use mobile_use::io::transcript::{TraceRecorder, write_json};
use mobile_use::logging;
use mobile_use::session::{SessionOptions, run_session};

#[derive(Parser)]
#[command(
    name = "mobile-use",
    version,
    about = "Drive a mobile device toward a natural-language goal"
)]
struct Cli {
    /// Path to the TOML configuration (defaults apply when missing).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Raise log verbosity on stderr (-v info, -vv debug); `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one session for GOAL and print its result as JSON.
    Run {
        /// The goal for the agent to achieve.
        goal: String,
        /// Serial of the device to drive (first ready device by default).
        #[arg(long)]
        device: Option<String>,
        /// Name for the trace recording. If provided, a trace is saved.
        #[arg(short = 'n', long)]
        test_name: Option<String>,
        /// Directory receiving saved traces.
        #[arg(short = 'p', long, default_value = "traces")]
        traces_path: PathBuf,
        /// Description of the structured output to extract after the session.
        #[arg(short = 'o', long)]
        output_description: Option<String>,
        /// Override the iteration ceiling from the config.
        #[arg(long)]
        max_steps: Option<u32>,
        /// Write the full session transcript to this file.
        #[arg(long)]
        results_path: Option<PathBuf>,
    },
    /// List devices visible to adb.
    Devices,
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            goal,
            device,
            test_name,
            traces_path,
            output_description,
            max_steps,
            results_path,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(serial) = device {
                config.device.serial = Some(serial);
            }
            if let Some(max_steps) = max_steps {
                config.session.max_steps = max_steps;
            }
            config.validate()?;
            cmd_run(
                &config,
                &goal,
                RunArtifacts {
                    test_name,
                    traces_path,
                    output_description,
                    results_path,
                },
            )
        }
        Command::Devices => cmd_devices(&load_config(&cli.config)?),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

struct RunArtifacts {
    test_name: Option<String>,
    traces_path: PathBuf,
    output_description: Option<String>,
    results_path: Option<PathBuf>,
}

fn cmd_run(config: &AgentConfig, goal: &str, artifacts: RunArtifacts) -> Result<i32> {
    let goal = Goal::new(goal)?;
    let driver = AdbDriver::connect(&config.device).context("connect to device")?;
    let provider = build_provider(&config.provider)?;
    let gateway = Gateway::new(provider, config.provider.timeout())?;

    let trace = artifacts
        .test_name
        .as_deref()
        .map(|name| TraceRecorder::create(&artifacts.traces_path, name))
        .transpose()?;
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone())?;
    let options = SessionOptions {
        cancel,
        output_description: artifacts.output_description,
        trace,
        ..SessionOptions::default()
    };

    let report = run_session(goal, &driver, &gateway, config, options, |record| {
        eprintln!(
            "step {}.{}: {} -> {:?}",
            record.step, record.attempt, record.proposal.action, record.transition
        );
    })?;
    let transcript = &report.transcript;
    if let Some(dir) = &report.trace_dir {
        info!(dir = %dir.display(), "trace written");
        eprintln!("trace: {}", dir.display());
    }
    if let Some(path) = &artifacts.results_path {
        write_json(path, transcript)?;
    }
    let value = transcript.result_value()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&value).context("serialize result")?
    );
    Ok(exit_codes::for_outcome(&transcript.outcome))
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// First Ctrl-C: the session winds down and still writes its transcript.
    Cancelled,
    /// Second Ctrl-C while winding down.
    Exit,
}

fn on_interrupt(cancel: &CancelToken) -> Interrupt {
    if cancel.is_cancelled() {
        return Interrupt::Exit;
    }
    cancel.cancel();
    Interrupt::Cancelled
}

/// Turn Ctrl-C into cooperative cancellation of `cancel`.
///
/// The in-flight device call finishes; the loop aborts at its next checkpoint.
fn install_interrupt_handler(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    match on_interrupt(&cancel) {
                        Interrupt::Cancelled => {
                            warn!("interrupt received, cancelling session");
                            eprintln!("cancelling (press Ctrl-C again to exit immediately)");
                        }
                        Interrupt::Exit => std::process::exit(exit_codes::ABORTED),
                    }
                }
            });
        })
        .context("spawn interrupt handler")?;
    Ok(())
}

fn cmd_devices(config: &AgentConfig) -> Result<i32> {
    let devices = list_devices(&config.device.adb_path)?;
    if devices.is_empty() {
        eprintln!("no devices attached");
    }
    for device in devices {
        println!("{}\t{}", device.serial, device.state);
    }
    Ok(exit_codes::OK)
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &AgentConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}
