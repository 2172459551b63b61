//! CLI entry point for sonorover
//!
//! Provides a command-line interface for:
//! - Running a measurement protocol against the rig
//! - Checking a protocol offline (grid sizes, drive values) without hardware
//!
//! # Usage
//!
//! Run a protocol:
//! ```bash
//! sonorover run --protocol demos/protocol.csv --conversion-table demos/conversion_table.csv
//! ```
//!
//! Check a protocol:
//! ```bash
//! sonorover plan --protocol demos/protocol.csv
//! ```
//!
//! The binary drives the simulated rig from [`sonorover::hardware::mock`];
//! vendor drivers implement the same capability traits.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use clap::{Parser, Subcommand};
use sonorover::config::RigConfig;
use sonorover::data::{RunManifest, RunStatus};
use sonorover::experiment::intensity::ConversionTable;
use sonorover::experiment::loader::{load_conversion_table_csv, load_protocol_csv};
use sonorover::experiment::measurement::PointStatus;
use sonorover::experiment::sequencer::{
    prepare_sequences, Confirmation, ConfirmationSource, ProtocolSequencer,
};
use sonorover::experiment::Sequence;
use sonorover::hardware::mock::{MockDigitizer, MockDriver, MockPositioner};
use sonorover::hardware::HardwareCoordinator;
use sonorover::logging::{self, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sonorover")]
#[command(about = "Protocol-driven acoustic field characterization", long_about = None)]
struct Cli {
    /// Rig configuration file
    #[arg(long, global = true, default_value = "config/rig.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a protocol
    Run {
        #[command(flatten)]
        input: ProtocolInput,

        /// Pause for confirmation between sequences
        #[arg(long)]
        interactive: bool,

        /// Override storage.output_dir
        #[arg(long)]
        output: Option<PathBuf>,

        /// Override storage.run_name
        #[arg(long)]
        run_name: Option<String>,
    },

    /// Validate a protocol and print what a run would measure
    Plan {
        #[command(flatten)]
        input: ProtocolInput,

        /// Also print the effective configuration as TOML
        #[arg(long)]
        show_config: bool,
    },
}

#[derive(clap::Args)]
struct ProtocolInput {
    /// Protocol CSV
    #[arg(long)]
    protocol: PathBuf,

    /// Directory for relative coordinate-file paths (default: the protocol's directory)
    #[arg(long)]
    coordinates_dir: Option<PathBuf>,

    /// Isppa → global power conversion table CSV
    #[arg(long)]
    conversion_table: Option<PathBuf>,
}

impl ProtocolInput {
    fn load(&self) -> Result<(Vec<Sequence>, Option<ConversionTable>)> {
        let sequences = load_protocol_csv(&self.protocol, self.coordinates_dir.as_deref())
            .with_context(|| format!("Failed to load protocol {}", self.protocol.display()))?;
        let table = match &self.conversion_table {
            Some(path) => Some(
                load_conversion_table_csv(path)
                    .with_context(|| format!("Failed to load conversion table {}", path.display()))?,
            ),
            None => None,
        };
        Ok((sequences, table))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut rig = RigConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            input,
            interactive,
            output,
            run_name,
        } => {
            if let Some(output) = output {
                rig.storage.output_dir = output;
            }
            if let Some(run_name) = run_name {
                rig.storage.run_name = run_name;
            }
            rig.validate()?;
            run_protocol(rig, input, interactive).await
        }
        Commands::Plan { input, show_config } => {
            rig.validate()?;
            plan_protocol(&rig, &input, show_config)
        }
    }
}

async fn run_protocol(rig: RigConfig, input: ProtocolInput, interactive: bool) -> Result<()> {
    let log_file = rig.storage.output_dir.join(format!(
        "log_{}_{}.txt",
        Local::now().format("%Y%m%d_%H%M%S"),
        rig.storage.run_name
    ));
    let tracing_config = TracingConfig::from_app_config(&rig.application)
        .map_err(anyhow::Error::msg)?
        .with_log_file(&log_file);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    let (sequences, table) = input.load()?;
    info!(
        protocol = %input.protocol.display(),
        sequences = sequences.len(),
        "🚀 {} starting",
        rig.application.name
    );

    let coordinator = simulated_rig(&rig);
    let sequencer = ProtocolSequencer::from_config(coordinator, &rig)
        .with_protocol_source(&input.protocol)
        .with_confirmation(Box::new(StdinConfirmation));

    let cancel = sequencer.cancellation_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping at the next safe point");
            cancel.cancel();
        }
    });

    let manifest = sequencer
        .run(&sequences, rig.zero_point, table.as_ref(), interactive)
        .await
        .context("Run failed")?;
    print_summary(&manifest);
    println!("   Log: {}", log_file.display());

    match manifest.status {
        RunStatus::Aborted => bail!(
            "run aborted: {}",
            manifest.abort_reason.as_deref().unwrap_or("unknown reason")
        ),
        _ => Ok(()),
    }
}

fn plan_protocol(rig: &RigConfig, input: &ProtocolInput, show_config: bool) -> Result<()> {
    if show_config {
        println!("{}", toml::to_string_pretty(rig).context("Failed to render configuration")?);
    }
    let (sequences, table) = input.load()?;
    let prepared = prepare_sequences(&sequences, rig.zero_point, table.as_ref(), &rig.acquisition)?;

    println!("📋 {} sequence(s), zero point {}", prepared.len(), rig.zero_point);
    let mut total = 0;
    for seq in &prepared {
        total += seq.points.len();
        println!(
            "   #{:<3} {:<16} {:>7} points  drive {}  ({} {})  {:.1} MS/s × {} samples  map {}×{}×{}",
            seq.sequence.id,
            seq.sequence.tag,
            seq.points.len(),
            seq.drive.drive,
            seq.drive.requested_value,
            seq.drive.requested_kind,
            seq.plan.sample_rate_hz / 1e6,
            seq.plan.expected_samples,
            seq.layout.slices,
            seq.layout.rows,
            seq.layout.columns,
        );
    }
    println!("   {} points in total", total);
    Ok(())
}

fn simulated_rig(rig: &RigConfig) -> HardwareCoordinator {
    let driver = Arc::new(MockDriver::new());
    let digitizer = Arc::new(
        MockDigitizer::new()
            .with_tone(rig.acquisition.operating_frequency_hz(), 0.1)
            .with_trigger_line(driver.trigger_line()),
    );
    let positioner = Arc::new(MockPositioner::new().with_motion_time(Duration::from_millis(5)));
    HardwareCoordinator::new(positioner, driver, digitizer, rig.coordinator_settings())
}

fn print_summary(manifest: &RunManifest) {
    let icon = match manifest.status {
        RunStatus::Completed => "✅",
        RunStatus::CompletedWithSkips => "⚠️ ",
        _ => "❌",
    };
    println!();
    println!("{} Run {} finished: {}", icon, manifest.run_id, manifest.status);
    for seq in &manifest.sequences {
        println!(
            "   sequence {:<3} {:>6}/{} stored, {} retried, {} skipped",
            seq.sequence_id,
            seq.count(PointStatus::Success) + seq.count(PointStatus::Retried),
            seq.planned_points,
            seq.count(PointStatus::Retried),
            seq.count(PointStatus::Skipped),
        );
    }
    if let Some(reason) = &manifest.abort_reason {
        println!("   Reason: {}", reason);
    }
    println!("   Output: {}", manifest.output_dir.display());
}

/// Reads operator answers from standard input.
struct StdinConfirmation;

#[async_trait]
impl ConfirmationSource for StdinConfirmation {
    async fn confirm(&self, completed: u32, next: u32) -> Confirmation {
        println!(
            "⏸  Sequence {} done. Check the setup, then continue with sequence {}? [Y/n]",
            completed, next
        );
        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(0) | Err(_) => Confirmation::Cancel,
            Ok(_) => match line.trim().to_lowercase().as_str() {
                "" | "y" | "yes" | "c" | "continue" => Confirmation::Continue,
                _ => Confirmation::Cancel,
            },
        }
    }
}
