use anyhow::Result;
use std::io::{self, BufRead, Write};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::hardware::simulated::EventCounter;

/// Shared state the command loop acts on.
#[derive(Clone)]
pub struct CommandTargets {
    /// Trigger line of the simulated bank.
    pub trigger: EventCounter,
    /// Stops the capture between ticks.
    pub cancel: Arc<AtomicBool>,
    /// Set once the session has finished.
    pub done: Arc<AtomicBool>,
}

/// Read commands from stdin until QUIT, end of input or the session finishes.
pub fn handle_commands(targets: CommandTargets) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    handle_commands_from(stdin.lock(), stdout.lock(), &targets)
}

pub fn handle_commands_from<R: BufRead, W: Write>(input: R, mut out: W, targets: &CommandTargets) -> Result<()> {
    for line_res in input.lines() {
        let line = line_res?;
        let cmd = line.trim();

        if targets.done.load(Ordering::SeqCst) {
            writeln!(out, "STATUS DONE")?;
            out.flush().ok();
            break;
        }

        if cmd.eq_ignore_ascii_case("TRIGGER") {
            let count = targets.trigger.fire();
            writeln!(out, "STATUS TRIGGERED ({})", count)?;
        } else if cmd.eq_ignore_ascii_case("STATUS") {
            let state = if targets.cancel.load(Ordering::SeqCst) {
                "STOPPING"
            } else {
                "CAPTURING"
            };
            writeln!(out, "STATUS {} (trigger count {})", state, targets.trigger.value())?;
        } else if cmd.eq_ignore_ascii_case("QUIT") {
            targets.cancel.store(true, Ordering::SeqCst);
            writeln!(out, "STATUS QUIT")?;
            out.flush().ok();
            break;
        } else if !cmd.is_empty() {
            writeln!(out, "ERROR unknown command: {}", cmd)?;
        }
        out.flush().ok();
    }
    Ok(())
}
