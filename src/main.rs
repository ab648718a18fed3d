//! CLI entry point for scope_cal
//!
//! # Usage
//!
//! Check a results workbook:
//! ```bash
//! scope_cal check results/666_DSOX3034T.csv
//! ```
//!
//! Run the DCV and timebase tests against the simulated bench:
//! ```bash
//! scope_cal run results/666_DSOX3034T.csv --tests DCV,TIME --simulate --yes
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scope_cal::adapters::list_resources;
use scope_cal::config::Settings;
use scope_cal::operator::{ConsoleOperator, Operator, ScriptedOperator};
use scope_cal::sequencer::{
    check_connections, choose_parallel, select_rows, CalibrationRunner, Instruments, RowStatus,
    RunOptions,
};
use scope_cal::workbook::{CsvSheet, ResultsSheet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scope_cal")]
#[command(about = "Oscilloscope calibration over VISA", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/scope_cal.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the test functions and any unsupported rows in a workbook
    Check {
        /// Results workbook (CSV export)
        workbook: PathBuf,
    },

    /// Check every configured instrument answers
    Connections {
        /// Use the simulated bench
        #[arg(long)]
        simulate: bool,
    },

    /// List VISA resources
    Resources,

    /// Run tests and write the results into the workbook
    Run {
        /// Results workbook (CSV export)
        workbook: PathBuf,

        /// Test functions to run (e.g. DCV,TIME); asks when omitted
        #[arg(long, value_delimiter = ',')]
        tests: Vec<String>,

        /// Use the simulated bench
        #[arg(long)]
        simulate: bool,

        /// Calibrator output wired to all channels at once
        #[arg(long)]
        parallel: bool,

        /// Also run rows that already have a result
        #[arg(long)]
        all_rows: bool,

        /// Do not stop for operator prompts
        #[arg(long)]
        yes: bool,

        /// Write the run summary as JSON
        #[arg(long)]
        summary: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Check { workbook } => check_workbook(&settings, &workbook),
        Commands::Connections { simulate } => {
            show_connections(&settings, simulate || settings.application.simulate).await
        }
        Commands::Resources => show_resources(),
        Commands::Run {
            workbook,
            tests,
            simulate,
            parallel,
            all_rows,
            yes,
            summary,
        } => {
            let request = RunRequest {
                tests,
                simulate: simulate || settings.application.simulate,
                parallel: parallel || settings.run.parallel,
                skip_completed: settings.run.skip && !all_rows,
                unattended: yes,
                summary,
            };
            run(&settings, &workbook, request).await
        }
    }
}

struct RunRequest {
    tests: Vec<String>,
    simulate: bool,
    parallel: bool,
    skip_completed: bool,
    unattended: bool,
    summary: Option<PathBuf>,
}

fn open_workbook(settings: &Settings, path: &Path) -> Result<ResultsSheet<CsvSheet>> {
    let sheet = CsvSheet::open(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?
        .with_names(&settings.workbook.names)?
        .with_backup_dir(&settings.workbook.backups);
    Ok(ResultsSheet::new(sheet, &settings.workbook))
}

fn check_workbook(settings: &Settings, path: &Path) -> Result<()> {
    let results = open_workbook(settings, path)?;
    if !results.check_valid_results() {
        warn!(
            "No '{}' named range; using row {}",
            settings.workbook.startcell,
            results.row()
        );
    }
    println!("First test row: {}", results.row());
    println!("Tests ({}):", results.number_of_tests());
    for function in results.test_types() {
        println!("  {}", function);
    }
    let invalid = results.invalid_tests();
    if !invalid.is_empty() {
        println!("Unsupported rows:");
        for (function, row) in invalid {
            println!("  row {}: {}", row, function);
        }
    }
    Ok(())
}

async fn show_connections(settings: &Settings, simulate: bool) -> Result<()> {
    let report = check_connections(&settings.instruments, simulate).await;
    for status in &report {
        let mark = if status.connected { "ok" } else { "--" };
        println!(
            "[{}] {:<13} {:<40} {}",
            mark, status.instrument, status.resource, status.detail
        );
    }
    Ok(())
}

fn show_resources() -> Result<()> {
    let resources = list_resources().context("Failed to list VISA resources")?;
    if resources.is_empty() {
        println!("No VISA resources found");
    }
    for resource in resources {
        println!("{}", resource);
    }
    Ok(())
}

async fn run(settings: &Settings, path: &Path, request: RunRequest) -> Result<()> {
    let mut results = open_workbook(settings, path)?;
    if !results.check_valid_results() {
        bail!(
            "{} is not a results workbook: no '{}' named range",
            path.display(),
            settings.workbook.startcell
        );
    }
    for (function, row) in results.invalid_tests() {
        warn!("Row {}: unsupported function '{}' will be skipped", row, function);
    }

    let mut operator: Box<dyn Operator> = if request.unattended {
        Box::new(ScriptedOperator::new())
    } else {
        Box::new(ConsoleOperator::new())
    };

    let selected = if request.tests.is_empty() {
        operator.select_tests(&results.test_types()).await?
    } else {
        request.tests
    };
    let (rows, parallel_capable) = select_rows(&results, &selected)?;
    if rows.is_empty() {
        println!("Nothing to run");
        return Ok(());
    }
    let parallel_channels =
        choose_parallel(operator.as_mut(), request.parallel, parallel_capable).await?;
    let options = RunOptions {
        parallel_channels,
        skip_completed: request.skip_completed,
    };

    if let Some(backup) = results.backup().context("Failed to back up workbook")? {
        info!("Backup written to {}", backup.display());
    }

    let instruments = Instruments::connect(&settings.instruments, request.simulate)
        .await
        .context("Failed to connect to the bench")?;
    let mut runner = CalibrationRunner::new(instruments, operator)
        .with_age_cell(settings.workbook.agecell.clone());
    let summary = runner
        .run_tests(&mut results, &rows, options)
        .await
        .context("Calibration run failed")?;

    for outcome in &summary.rows {
        let status = match &outcome.status {
            RowStatus::Tested { result } => result.clone(),
            RowStatus::Skipped { reason } => format!("skipped ({})", reason),
            RowStatus::Failed { error } => format!("FAILED: {}", error),
        };
        println!("  row {:>4} {:<8} {}", outcome.row, outcome.function, status);
    }
    println!(
        "{} tested, {} skipped, {} failed{}",
        summary.tested(),
        summary.skipped(),
        summary.failed(),
        if summary.aborted { " (aborted)" } else { "" }
    );

    if let Some(target) = request.summary {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&target, json)
            .with_context(|| format!("Failed to write summary to {}", target.display()))?;
    }
    Ok(())
}
