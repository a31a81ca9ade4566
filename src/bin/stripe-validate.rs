//! Stripe Validate - consistency checks for finished captures
//!
//! Reads the timestamp log of one or more capture directories and checks that it can be trusted:
//! the header is the expected one, image indices run 0, 1, 2, ..., timestamps never go backwards
//! and the trigger flag never clears once it has been set. When the session snapshot is present
//! the frame count is compared with the configured window and, for raw output, every frame file
//! is checked for existence.
//!
//! # Usage
//!
//! ```bash
//! stripe-validate run1
//! stripe-validate run1 run2 run3
//! ```
//!
//! Exits with status 1 if any capture fails a check.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};

use stripe_capture::persist::{LogRow, check_log, expand_output_template, read_log};
use stripe_capture::session::{OutputFormat, SESSION_SNAPSHOT, SessionConfig, TIMESTAMP_LOG};

#[derive(Parser)]
#[command(name = "stripe-validate")]
#[command(about = "Check capture directories created by stripe-capture")]
#[command(version)]
struct Args {
    /// Capture directories to check
    #[arg(default_value = "capture")]
    dirs: Vec<PathBuf>,
}

/// Checks that need the session snapshot.
fn check_against_snapshot(dir: &Path, rows: &[LogRow]) -> Result<Vec<String>> {
    let path = dir.join(SESSION_SNAPSHOT);
    if !path.is_file() {
        return Ok(vec![]);
    }
    let snapshot: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    let Some(session) = snapshot.get("session") else {
        return Ok(vec![]);
    };
    let config: SessionConfig = serde_json::from_value(session.clone())?;
    let mut problems = Vec::new();

    let failed = snapshot.get("outcome").and_then(|o| o.get("failure")).is_some();
    let triggered = rows.iter().any(|r| r.triggered);
    if triggered && !failed && rows.len() != config.target_count() {
        problems.push(format!(
            "triggered capture holds {} frames, window is {}",
            rows.len(),
            config.target_count()
        ));
    }
    if rows.len() > config.target_count() {
        problems.push(format!("{} frames exceed the {} frame window", rows.len(), config.target_count()));
    }

    if config.format == OutputFormat::Raw {
        for row in rows {
            let name = expand_output_template(&config.output_template, row.image_index);
            if !dir.join(&name).is_file() {
                problems.push(format!("frame file {} is missing", name));
            }
        }
    }
    Ok(problems)
}

fn validate(dir: &Path) -> Result<Vec<String>> {
    let rows = read_log(dir.join(TIMESTAMP_LOG))?;
    let mut problems = check_log(&rows);
    problems.extend(check_against_snapshot(dir, &rows)?);
    println!("  {} frames, {} triggered", rows.len(), rows.iter().filter(|r| r.triggered).count());
    Ok(problems)
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("Stripe Capture Validator");
    println!("========================");
    println!();

    let mut failed = 0;
    for dir in &args.dirs {
        println!("{}", dir.display());
        match validate(dir) {
            Ok(problems) if problems.is_empty() => println!("  OK"),
            Ok(problems) => {
                failed += 1;
                for problem in &problems {
                    println!("  FAIL {}", problem);
                }
            }
            Err(e) => {
                failed += 1;
                println!("  FAIL could not read capture: {:#}", e);
            }
        }
        println!();
    }

    if failed > 0 {
        println!("{} of {} capture(s) failed validation", failed, args.dirs.len());
        std::process::exit(1);
    }
    println!("All {} capture(s) valid", args.dirs.len());
    Ok(())
}
