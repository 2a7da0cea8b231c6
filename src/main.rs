use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use ctxpatch::{apply_diff, ApplyOptions, HunkApplyStatus, LocalFileSystem, PatchError};
use env_logger::Builder;
use log::{info, warn, Level, LevelFilter};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const MAX_LOOKAHEAD: usize = 100;

// --- Main Application Entry Point ---

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        // {:?} prints the full cause chain from `anyhow`.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    // --- Argument Validation ---
    if !args.target.is_dir() {
        return Err(anyhow!(
            "Target directory '{}' not found or is not a directory.",
            args.target.display()
        ));
    }
    if !(1..=MAX_LOOKAHEAD).contains(&args.lookahead) {
        return Err(anyhow!(
            "Lookahead must be between 1 and {}.",
            MAX_LOOKAHEAD
        ));
    }

    let content = fs::read_to_string(&args.diff)
        .with_context(|| format!("Failed to read diff file '{}'", args.diff.display()))?;

    let options = ApplyOptions::builder()
        .dry_run(args.dry_run)
        .lookahead(args.lookahead)
        .build();

    let results = match apply_diff(&content, &args.target, &LocalFileSystem, options) {
        Ok(results) => results,
        Err(e) => {
            if !matches!(e, PatchError::Parse(_)) && !args.dry_run {
                warn!("Files patched before this failure keep their changes.");
            }
            return Err(e).with_context(|| {
                format!("Failed to apply diff '{}'", args.diff.display())
            });
        }
    };

    if results.is_empty() {
        info!("No file sections found in '{}'.", args.diff.display());
        return Ok(());
    }

    let mut applied_hunks = 0;
    let mut skipped_hunks = 0;
    for result in &results {
        for status in &result.report {
            match status {
                HunkApplyStatus::Applied { .. } => applied_hunks += 1,
                HunkApplyStatus::SkippedNoChanges => skipped_hunks += 1,
            }
        }
        if let Some(diff) = &result.diff {
            println!("----- Proposed Changes for {} -----", result.path.display());
            print!("{}", diff);
            println!("------------------------------------");
        }
    }

    // --- Final Summary ---
    info!("\n--- Summary ---");
    info!("Patched files:  {}", results.len());
    info!("Applied hunks:  {}", applied_hunks);
    info!("Skipped hunks:  {}", skipped_hunks);
    if args.dry_run {
        info!("DRY RUN completed. No files were modified.");
    }

    Ok(())
}

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Apply a unified diff to a directory by matching context lines, ignoring line numbers.",
    long_about = "Each hunk is located by its leading context, compared after whitespace normalization. \
                  Deleted lines may drift a few lines from where the diff expects them. \
                  The first failure stops the run; files already patched keep their changes."
)]
struct Args {
    /// Path to the file containing the unified diff.
    #[arg(short, long)]
    diff: PathBuf,
    /// Directory the diff's file names are relative to.
    #[arg(short, long, default_value = ".")]
    target: PathBuf,
    /// Show what would be done, but don't modify any files.
    #[arg(short = 'n', long)]
    dry_run: bool,
    /// How many lines a deleted line may be searched for past its expected position.
    #[arg(short, long, default_value_t = ctxpatch::DEFAULT_LOOKAHEAD)]
    lookahead: usize,
    /// Increase logging verbosity.
    /// -v for info, -vv for debug, -vvv for trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Sets up the global logger with a level taken from the `-v` count.
fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}
