//! # trailrun
//!
//! A CLI for inspecting how trailrunlib sees a project.
//!
//! ## Overview
//!
//! trailrun is built on top of trailrunlib. It shows which project root a
//! path belongs to, which `.gitignore` files apply to it, and which files a
//! walk would hand to a tool (and why the others were left out).
//!
//! ## Usage
//!
//! ```bash
//! # Root and ignore files for the current directory
//! trailrun debug .
//!
//! # Files a walk would return, then what it skipped
//! trailrun walk src tests
//!
//! # Extra gitignore-style excludes, every file type, JSON output
//! trailrun walk . -e "build/" -e "*.gen.py" --all --json
//!
//! # Log every pruning decision
//! trailrun -v walk .
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use console::Style;
use serde::Serialize;
use trailrunlib::{Excluded, IncludeFilter, RunnerOptions, Trailrunner, WalkRequest};

/// Ignore file contributing to a directory's rules
#[derive(Debug, Serialize)]
struct IgnoreFileInfo {
    path: PathBuf,
    patterns: Vec<String>,
}

/// Output of `trailrun debug`
#[derive(Debug, Serialize)]
struct DebugInfo {
    path: PathBuf,
    root: PathBuf,
    ignore_files: Vec<IgnoreFileInfo>,
    pattern_count: usize,
}

/// Output of `trailrun walk --json`
#[derive(Debug, Serialize)]
struct WalkOutput<'a> {
    files: Vec<&'a Path>,
    excluded: &'a [Excluded],
}

/// Build the clap Command structure
fn build_command() -> Command {
    Command::new("trailrun")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Arthur Debert")
        .about("Inspect project roots, gitignore layering and file discovery")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log discovery decisions to stderr"),
        )
        .subcommand(
            Command::new("debug")
                .about("Show the project root and ignore files for a path")
                .arg(Arg::new("path").help("Path to inspect").default_value("."))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("walk")
                .about("List the files a walk would return")
                .arg(
                    Arg::new("paths")
                        .help("Start paths (files or directories)")
                        .num_args(1..)
                        .default_value("."),
                )
                .arg(
                    Arg::new("exclude")
                        .short('e')
                        .long("exclude")
                        .action(ArgAction::Append)
                        .help("Exclude paths matching a gitignore-style pattern"),
                )
                .arg(
                    Arg::new("root")
                        .long("root")
                        .help("Project root to use instead of discovering one"),
                )
                .arg(
                    Arg::new("all")
                        .long("all")
                        .action(ArgAction::SetTrue)
                        .help("Return every file, not only Python sources"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("trailrunlib=debug,trailrun=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Handler for `trailrun debug`
fn debug_command(matches: &ArgMatches) -> Result<()> {
    let path = matches
        .get_one::<String>("path")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    if !path.exists() {
        anyhow::bail!("path does not exist: {}", path.display());
    }

    let runner = Trailrunner::new();
    let root = runner
        .project_root(&path)
        .with_context(|| format!("resolving the project root of {}", path.display()))?;
    let dir = if path.is_dir() {
        path.clone()
    } else {
        path.parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    };
    let spec = runner.ignore_spec(&root, &dir)?;

    let info = DebugInfo {
        path,
        root,
        ignore_files: spec
            .layers()
            .iter()
            .map(|layer| IgnoreFileInfo {
                path: layer
                    .source()
                    .unwrap_or_else(|| layer.dir())
                    .to_path_buf(),
                patterns: layer.lines().to_vec(),
            })
            .collect(),
        pattern_count: spec.len(),
    };

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let label = Style::new().bold();
    println!("{} {}", label.apply_to("path:"), info.path.display());
    println!("{} {}", label.apply_to("root:"), info.root.display());
    println!("{}", label.apply_to("ignore files:"));
    if info.ignore_files.is_empty() {
        println!("  (none)");
    }
    for file in &info.ignore_files {
        println!("  {} ({} patterns)", file.path.display(), file.patterns.len());
    }
    println!("{} {}", label.apply_to("patterns:"), info.pattern_count);
    Ok(())
}

/// Handler for `trailrun walk`
fn walk_command(matches: &ArgMatches) -> Result<()> {
    let paths: Vec<PathBuf> = matches
        .get_many::<String>("paths")
        .map(|v| v.map(PathBuf::from).collect())
        .unwrap_or_default();
    let excludes: Vec<String> = matches
        .get_many::<String>("exclude")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();

    let mut request = WalkRequest::new(paths).excludes(excludes);
    if let Some(root) = matches.get_one::<String>("root") {
        request = request.root(root);
    }

    let mut options = RunnerOptions::new();
    if matches.get_flag("all") {
        options = options.include(IncludeFilter::all());
    }

    let report = Trailrunner::with_options(options).walk_report(&request)?;

    if matches.get_flag("json") {
        let output = WalkOutput {
            files: report.files.iter().map(PathBuf::as_path).collect(),
            excluded: &report.excluded,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for file in &report.files {
        println!("{}", file.display());
    }

    if !report.excluded.is_empty() {
        let dim = Style::new().dim();
        println!();
        println!("{}", Style::new().bold().apply_to("excluded:"));
        for excluded in &report.excluded {
            println!(
                "  {} {}",
                excluded.path.display(),
                dim.apply_to(format!("({})", excluded.reason))
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let matches = build_command().get_matches();
    init_logging(matches.get_flag("verbose"));

    let result = match matches.subcommand() {
        Some(("debug", sub)) => debug_command(sub),
        Some(("walk", sub)) => walk_command(sub),
        _ => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
