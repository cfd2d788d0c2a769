//! haul - copy, move and maintain files under a speed limit.
//!
//! Usage:
//!   haul copy SOURCE... DEST     Copy files and directories into DEST
//!   haul move SOURCE... DEST     Move files and directories into DEST
//!   haul delete PATH...          Delete files and directories
//!   haul count PATH...           Sum the size of directory trees
//!   haul attrs PATH...           Change attributes and times
//!   haul convert PATH...         Re-encode line endings of text files
//!   haul --help                  Show help

mod logging;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};

use hauler_core::{
    ChangeAttrsData, ConvertData, EngineConfig, EolMode, FileAttributes, ScriptSettings,
};
use hauler_ops::{
    Job, LocalFs, PlanKind, PlanRequest, ScriptEvent, ScriptOutcome, ScriptReport, plan_script,
    start_script,
};

use crate::ui::{ProgressView, auto_answer, format_size};

#[derive(Parser)]
#[command(
    name = "haul",
    version,
    about = "Copy, move and maintain files under a speed limit",
    long_about = "haul plans a script of file operations and runs it, asking what to do \
                  when something fails. Copies over the network use overlapped block I/O \
                  that resumes after errors without sending data twice."
)]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Options {
    /// Maximum transfer rate (e.g., "500KB", "10MB")
    #[arg(long, global = true)]
    speed_limit: Option<String>,

    /// Never use the overlapped block pipeline
    #[arg(long, global = true)]
    no_async: bool,

    /// Copy permissions and ownership
    #[arg(long, global = true)]
    preserve_security: bool,

    /// Copy readonly, compression and encryption attributes
    #[arg(long, global = true)]
    preserve_attrs: bool,

    /// Copy directory modification times
    #[arg(long, global = true)]
    preserve_dir_time: bool,

    /// Copy alternate data streams (extended attributes)
    #[arg(long, global = true)]
    streams: bool,

    /// Overwrite existing files only when the source is newer
    #[arg(long, global = true)]
    overwrite_older: bool,

    /// Move deleted files to the trash
    #[arg(long, global = true)]
    trash: bool,

    /// Glob of paths to leave out (repeatable)
    #[arg(long, global = true)]
    exclude: Vec<String>,

    /// Answer every question without asking
    #[arg(short, long, global = true)]
    yes: bool,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log debug events
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write JSON logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Engine configuration (defaults to <config dir>/hauler/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Copy files and directories into a directory
    Copy {
        /// Sources followed by the destination directory
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,
    },

    /// Move files and directories into a directory
    Move {
        /// Sources followed by the destination directory
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,
    },

    /// Delete files and directories
    Delete {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Count the size of directory trees
    Count {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Change attributes and times
    Attrs {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Make files readonly (otherwise writable)
        #[arg(long)]
        readonly: bool,

        /// Set compression to the value of --compressed
        #[arg(long)]
        set_compression: bool,

        #[arg(long)]
        compressed: bool,

        /// Set encryption to the value of --encrypted
        #[arg(long)]
        set_encryption: bool,

        #[arg(long)]
        encrypted: bool,

        /// Set the modification time to now
        #[arg(long)]
        touch: bool,
    },

    /// Re-encode line endings of text files in place
    Convert {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Line ending to write
        #[arg(short, long, default_value = "lf")]
        eol: Eol,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Eol {
    Keep,
    Crlf,
    Lf,
    Cr,
}

impl From<Eol> for EolMode {
    fn from(eol: Eol) -> Self {
        match eol {
            Eol::Keep => EolMode::Keep,
            Eol::Crlf => EolMode::Crlf,
            Eol::Lf => EolMode::Lf,
            Eol::Cr => EolMode::Cr,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init_logging(cli.options.verbose, cli.options.log_file.as_deref())?;

    let config = load_config(&cli.options)?;
    let request = build_request(cli.command, &cli.options)?;

    let fs = LocalFs::new();
    let script = plan_script(&fs, &request).wrap_err("Planning failed")?;
    if script.is_empty() {
        eprintln!("Nothing to do.");
        return Ok(());
    }
    eprintln!(
        "{} operations, {} in {} files",
        script.len(),
        format_size(script.totals.total_file_size),
        script.totals.files_count
    );

    let report = run(script, config, &cli.options).await?;
    print_report(&report, cli.options.json)?;

    match report.outcome {
        ScriptOutcome::Finished => Ok(()),
        ScriptOutcome::Cancelled => bail!("Cancelled"),
        ScriptOutcome::Failed(message) => Err(eyre!(message)),
    }
}

/// Load the engine configuration and apply flag overrides.
fn load_config(options: &Options) -> Result<EngineConfig> {
    let path = options.config.clone().or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("hauler").join("config.toml"))
            .filter(|path| path.exists())
    });
    let mut config = match path {
        Some(path) => EngineConfig::load(&path)
            .wrap_err_with(|| format!("Invalid configuration {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if options.no_async {
        config.use_async_copy = false;
    }
    Ok(config)
}

fn settings(options: &Options) -> Result<ScriptSettings> {
    let speed_limit = options.speed_limit.as_deref().map(parse_size).transpose()?;
    if speed_limit == Some(0) {
        bail!("Speed limit must be positive");
    }
    Ok(ScriptSettings {
        speed_limit,
        preserve_attrs: options.preserve_attrs,
        preserve_security: options.preserve_security,
        preserve_dir_time: options.preserve_dir_time,
        copy_streams: options.streams,
        use_trash: options.trash,
        overwrite_older: options.overwrite_older,
        overwrite_all: options.yes && !options.overwrite_older,
        ..Default::default()
    })
}

fn canonical(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths
        .iter()
        .map(|p| {
            p.canonicalize()
                .wrap_err_with(|| format!("Invalid path {}", p.display()))
        })
        .collect()
}

fn build_request(command: Command, options: &Options) -> Result<PlanRequest> {
    let request = match command {
        Command::Copy { paths } => transfer(PlanKind::Copy, &paths)?,
        Command::Move { paths } => transfer(PlanKind::Move, &paths)?,
        Command::Delete { paths } => PlanRequest::new(PlanKind::Delete, canonical(&paths)?),
        Command::Count { paths } => PlanRequest::new(PlanKind::CountSize, canonical(&paths)?),
        Command::Attrs {
            paths,
            readonly,
            set_compression,
            compressed,
            set_encryption,
            encrypted,
            touch,
        } => {
            let mut request = PlanRequest::new(PlanKind::ChangeAttrs, canonical(&paths)?);
            request.attributes = FileAttributes {
                readonly,
                compressed,
                encrypted,
            };
            request.change_attrs = Some(ChangeAttrsData {
                change_compression: set_compression,
                change_encryption: set_encryption,
                modified: touch.then(SystemTime::now),
                ..Default::default()
            });
            request
        }
        Command::Convert { paths, eol } => {
            let mut request = PlanRequest::new(PlanKind::Convert, canonical(&paths)?);
            request.convert = Some(ConvertData::identity(eol.into()));
            request
        }
    };
    Ok(request
        .with_settings(settings(options)?)
        .with_excludes(options.exclude.clone()))
}

fn transfer(kind: PlanKind, paths: &[PathBuf]) -> Result<PlanRequest> {
    let Some((destination, sources)) = paths.split_last() else {
        bail!("Need at least one source and a destination");
    };
    let destination = destination
        .canonicalize()
        .wrap_err_with(|| format!("Invalid destination {}", destination.display()))?;
    Ok(PlanRequest::new(kind, canonical(sources)?).with_destination(destination))
}

async fn run(
    script: hauler_core::Script,
    config: EngineConfig,
    options: &Options,
) -> Result<ScriptReport> {
    let view = ProgressView::new(script.totals.total_size, options.json);
    let mut handle = start_script(Job::new(script, Arc::new(LocalFs::new())).with_config(config));

    let control = handle.control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            control.cancel();
        }
    });

    while let Some(event) = handle.events.recv().await {
        match event {
            ScriptEvent::Operation(started) => view.operation_started(&started),
            ScriptEvent::Progress(progress) => view.update(&progress),
            ScriptEvent::Ask(request) => {
                let decision = if options.yes {
                    auto_answer(&request)
                } else {
                    view.ask(&request)
                };
                request.answer(decision);
            }
        }
    }
    view.finish();

    handle.task.await.wrap_err("Script task failed")
}

fn print_report(report: &ScriptReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", report.summary());
    if report.bytes_transferred > 0 {
        println!(" {} transferred", format_size(report.bytes_transferred));
    }
    for (path, size) in &report.counted_sizes {
        println!(" {:>10}  {}", format_size(*size), path.display());
    }
    if !report.errors.is_empty() {
        println!();
        println!("{} item(s) skipped:", report.errors.len());
        for error in &report.errors {
            println!("   {}: {}", error.path.display(), error.message);
        }
    }
    Ok(())
}

/// Parse a size string (e.g., "1KB", "10MB", "1GB").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
    let multiplier: u64 = match s[digits.len()..].trim() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        unit => bail!("Unknown size unit {unit:?}"),
    };
    let num: f64 = digits
        .parse()
        .wrap_err_with(|| format!("Invalid size {s:?}"))?;
    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("500").unwrap(), 500);
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("1.5m").unwrap(), 1536 * 1024);
        assert_eq!(parse_size(" 2G ").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("10XB").is_err());
        assert!(parse_size("MB").is_err());
    }

    #[test]
    fn test_cli_parses_copy() {
        let cli = Cli::parse_from(["haul", "copy", "a", "b", "dest", "--speed-limit", "1MB"]);
        assert_eq!(cli.options.speed_limit.as_deref(), Some("1MB"));
        match cli.command {
            Command::Copy { paths } => assert_eq!(paths.len(), 3),
            _ => panic!("expected copy"),
        }
    }

    #[test]
    fn test_yes_implies_overwrite_all() {
        let cli = Cli::parse_from(["haul", "-y", "delete", "x"]);
        let settings = settings(&cli.options).unwrap();
        assert!(settings.overwrite_all);
        assert!(!settings.use_trash);
    }

    #[test]
    fn test_zero_speed_limit_rejected() {
        let cli = Cli::parse_from(["haul", "--speed-limit", "0", "count", "x"]);
        assert!(settings(&cli.options).is_err());
    }
}
