//! Command-line front end: opens the event log and the optional
//! supplementary sources, runs the aggregation, and writes the report
//! artifacts.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use psychometrics_core::{CourseNames, CourseOutline, LegacyAnswers, LogParser};
use psychometrics_report::write_all_reports;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "edx2csv")]
#[command(about = "Converts a course event log into psychometric report tables")]
pub struct Cli {
    /// Event log file, one JSON event per line.
    #[arg(short = 'l', long)]
    logs: PathBuf,

    /// Course structure file with semicolon-delimited outline rows.
    #[arg(short = 'c', long)]
    course: Option<PathBuf>,

    /// Legacy student answers file.
    #[arg(short = 'a', long)]
    answers: Option<PathBuf>,

    /// Course display names file.
    #[arg(short = 'C', long)]
    courses: Option<PathBuf>,

    /// Output artifact prefix; an existing directory becomes `<dir>/csv`.
    output: PathBuf,
}

/// Runs the full conversion for parsed arguments.
///
/// Missing optional sources behave as empty inputs; an unreadable log or a
/// failing artifact write aborts the run.
///
/// # Errors
/// Returns an error when a source cannot be opened or read, or when an
/// artifact cannot be written.
pub fn run_cli(cli: Cli) -> Result<()> {
    let outline = match &cli.course {
        Some(path) => CourseOutline::parse(open_source(path)?)
            .with_context(|| format!("failed reading course outline {}", path.display()))?,
        None => CourseOutline::default(),
    };
    let answers = match &cli.answers {
        Some(path) => LegacyAnswers::parse(open_source(path)?)
            .with_context(|| format!("failed reading legacy answers {}", path.display()))?,
        None => LegacyAnswers::default(),
    };
    let names = match &cli.courses {
        Some(path) => CourseNames::parse(open_source(path)?)
            .with_context(|| format!("failed reading course names {}", path.display()))?,
        None => CourseNames::default(),
    };

    let parser = LogParser::parse(open_source(&cli.logs)?, &outline, &answers, &names)
        .with_context(|| format!("failed reading event log {}", cli.logs.display()))?;

    let prefix = if cli.output.is_dir() {
        cli.output.join("csv")
    } else {
        cli.output
    };
    write_all_reports(&prefix, &parser)?;
    info!("wrote report artifacts with prefix {}", prefix.display());
    Ok(())
}

fn open_source(path: &Path) -> Result<BufReader<File>> {
    let file =
        File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    Ok(BufReader::new(file))
}
