//! Command-line interface for the spindle streaming engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use spindle_commands::{
    load_alarm_catalog, ProtocolSession, SimulatedController, StreamingJob, StreamingQueue,
};
use spindle_core::alarms::fallback_alarm;
use spindle_core::config::{load_toml_file, log_json, DEFAULT_CONFIG_FILE};
use spindle_core::{EngineConfig, EngineEvent, EventBus, LineOrigin, RealtimeCommand};
use spindle_eta::{estimate_lines, MachineLimits};
use spindle_plugins::{AutoDustBoot, PluginHost};
use spindle_telemetry::{StateBroadcaster, TelemetryService};
use tracing::{info, warn};

/// Error code the simulated controller answers rejected lines with.
const REJECT_ERROR_CODE: u16 = 20;

/// Time given to event printers to drain after a job.
const DRAIN_DELAY: Duration = Duration::from_millis(50);

/// Spindle - G-code streaming for grbl-family controllers.
#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to ./spindle.toml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate the run time of a program.
    Estimate {
        /// G-code file.
        file: PathBuf,
        /// Print the estimate of every line.
        #[arg(long)]
        per_line: bool,
        /// Print the estimate as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Stream a program to a simulated controller.
    Simulate {
        /// G-code file.
        file: PathBuf,
        /// Load the automatic dust boot plugin.
        #[arg(long)]
        dust_boot: bool,
        /// Line the controller rejects with an error (repeatable).
        #[arg(long, value_name = "LINE")]
        reject: Vec<String>,
    },
    /// List alarm codes and their descriptions.
    Alarms {
        /// Read the table from a simulated controller with `$EA`.
        #[arg(long)]
        from_controller: bool,
    },
}

/// The `[machine]` table of the configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MachineSection {
    machine: MachineLimits,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Estimate {
            file,
            per_line,
            json,
        } => run_estimate(args.config.as_deref(), &file, per_line, json),
        Command::Simulate {
            file,
            dust_boot,
            reject,
        } => run_simulate(args.config.as_deref(), &file, dust_boot, reject).await,
        Command::Alarms { from_controller } => run_alarms(args.config.as_deref(), from_controller).await,
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "spindle=debug" } else { "spindle=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    if log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Machine limits from the `[machine]` table, defaults when absent.
fn load_machine_limits(path: Option<&Path>) -> Result<MachineLimits> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => PathBuf::from(DEFAULT_CONFIG_FILE),
        None => return Ok(MachineLimits::default()),
    };
    let limits = load_toml_file::<MachineSection>(&path)?.machine;
    ensure!(
        limits.xy_max_rate > 0.0 && limits.z_max_rate > 0.0,
        "machine rates must be greater than 0"
    );
    ensure!(
        limits.xy_acceleration > 0.0 && limits.z_acceleration > 0.0,
        "machine accelerations must be greater than 0"
    );
    Ok(limits)
}

fn read_program(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

/// Format seconds as `1.50s`, `2m 03.4s` or `1h 02m 03s`.
fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{:.2}s", seconds);
    }
    let whole = seconds.round() as u64;
    if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        return format!("{}m {:04.1}s", minutes as u64, seconds - minutes * 60.0);
    }
    format!("{}h {:02}m {:02}s", whole / 3600, (whole % 3600) / 60, whole % 60)
}

fn run_estimate(config: Option<&Path>, file: &Path, per_line: bool, json: bool) -> Result<()> {
    let limits = load_machine_limits(config)?;
    let program = read_program(file)?;
    let lines: Vec<&str> = program.lines().collect();
    let estimate = estimate_lines(lines.iter().copied(), &limits);

    if json {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
        return Ok(());
    }
    if per_line {
        for (index, (line, seconds)) in lines.iter().zip(&estimate.line_seconds).enumerate() {
            println!("{:>5} {:>9.3}s  {}", index + 1, seconds, line);
        }
    }
    println!(
        "Estimated time: {} ({} lines)",
        format_duration(estimate.total_seconds),
        lines.len()
    );
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::LineSent {
            line_number,
            text,
            origin,
        } => {
            let number = line_number.map(|n| n.to_string()).unwrap_or_default();
            let marker = match origin {
                LineOrigin::Job => '>',
                LineOrigin::Injected => '+',
                LineOrigin::Console => '$',
            };
            println!("{:>5} {} {}", number, marker, text);
        }
        EngineEvent::LineSkipped {
            line_number,
            rendered,
        } => println!("{:>5} - {}", line_number, rendered),
        EngineEvent::AlarmRaised { code, description } => {
            println!("ALARM:{} {}", code, description)
        }
        EngineEvent::PluginMessage {
            plugin_id,
            event,
            payload,
        } => println!("[{}] {} {}", plugin_id, event, payload),
        EngineEvent::ProtocolError { line, reason } => {
            warn!(category = "protocol", line = %line, reason = %reason, "Protocol error")
        }
        _ => {}
    }
}

async fn run_simulate(
    config: Option<&Path>,
    file: &Path,
    dust_boot: bool,
    reject: Vec<String>,
) -> Result<()> {
    let engine = EngineConfig::load(config)?;
    let limits = load_machine_limits(config)?;
    let program = read_program(file)?;
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());

    let estimate = estimate_lines(program.lines(), &limits);
    info!(
        category = "stream",
        file = %filename,
        eta = %format_duration(estimate.total_seconds),
        "Simulating job"
    );

    let (controller, events) = SimulatedController::new();
    for line in reject {
        controller.fail_line(line, REJECT_ERROR_CODE);
    }

    let bus = EventBus::new();
    let mut bus_rx = bus.subscribe();
    let session = ProtocolSession::connect(controller, events, bus.clone(), &engine.session);

    let broadcaster = StateBroadcaster::new();
    let mut telemetry_rx = broadcaster.subscribe();
    let telemetry = TelemetryService::new(broadcaster).spawn(&bus);

    let queue = StreamingQueue::new(session.clone(), &engine.streaming);
    let host = PluginHost::new(queue.sender(), bus.clone());
    let queue = queue.with_middleware(host.pipeline());
    if dust_boot {
        host.load(Arc::new(AutoDustBoot::default())).await?;
    }

    let events_printer = tokio::spawn(async move {
        while let Some((event, _)) = bus_rx.recv().await {
            print_event(&event);
        }
    });
    let telemetry_printer = tokio::spawn(async move {
        while let Some(message) = telemetry_rx.recv().await {
            let payload = serde_json::Value::Object(message.payload);
            println!("~ {} {:?} {}", message.topic, message.kind, payload);
        }
    });

    session.start_status_poll(Duration::from_millis(engine.telemetry.status_poll_interval_ms));
    queue.start(StreamingJob::from_text(filename, &program))?;
    let outcome = queue
        .wait()
        .await
        .ok_or_else(|| anyhow!("job ended without an outcome"))?;
    session.realtime(RealtimeCommand::StatusQuery).await?;
    tokio::time::sleep(DRAIN_DELAY).await;

    host.unload_all().await;
    session.shutdown();
    for task in [events_printer, telemetry_printer, telemetry] {
        task.abort();
    }

    let progress = &outcome.progress;
    println!(
        "Job {}: {} sent, {} skipped, {}/{} acknowledged",
        outcome.reason.as_str(),
        progress.sent,
        progress.skipped,
        progress.acknowledged,
        progress.total
    );
    if let Some(error) = outcome.error {
        bail!("{} failed: {}", outcome.filename, error);
    }
    Ok(())
}

async fn run_alarms(config: Option<&Path>, from_controller: bool) -> Result<()> {
    if !from_controller {
        for code in 1..=u16::MAX {
            let Some(text) = fallback_alarm(code) else {
                break;
            };
            println!("{:>3}  {}", code, text);
        }
        return Ok(());
    }

    let engine = EngineConfig::load(config)?;
    let (controller, events) = SimulatedController::new();
    let session = ProtocolSession::connect(controller, events, EventBus::new(), &engine.session);
    let catalog = load_alarm_catalog(
        &session,
        Duration::from_millis(engine.alarms.request_timeout_ms),
    )
    .await?;
    session.shutdown();

    for (code, text) in catalog.sorted() {
        println!("{:>3}  {}", code, text);
    }
    Ok(())
}
