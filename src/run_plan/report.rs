//! Reports the outcome of each [Step] that runs.
//!
//! As with the rest of the run, the reporting logic lives in private functions that write to
//! any pair of writers, and [Reporter] hands them the real stdout and stderr. Reporter locks both
//! only for the duration of one report.

use crate::core::plan::{Direction, Step};
use async_trait::async_trait;
use std::fmt::Display;
use std::io::{self, Write};
use std::ops::DerefMut;
use std::process::Output;
use tokio::task;

/// Prints feedback about each [Step] to stdout/stderr to keep the operator informed.
#[async_trait]
pub trait Report {
    /// Reports that a step is about to commence.
    async fn starting(&mut self, step: &Step) -> io::Result<()>;

    /// Reports the outcome of a step.
    async fn report(&mut self, step: &Step, output: &Output) -> io::Result<()>;
}

/// The production [Report] implementation. Uses the real stdout/stderr.
#[derive(Clone, Debug)]
pub struct Reporter;

#[async_trait]
impl Report for Reporter {
    async fn starting(&mut self, step: &Step) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || _starting(&mut stdout, step))
    }

    async fn report(&mut self, step: &Step, output: &Output) -> io::Result<()> {
        // Lock stdout and stderr for sane output ordering. Tokio's async IO provides no locking.
        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        task::block_in_place(move || _report(&mut stdout, &mut stderr, step, output))
    }
}

/// The host a step talks to, as shown in brackets in front of each report line.
pub fn target(step: &Step) -> String {
    match step {
        Step::RunLocal(_) => "operator".to_string(),
        Step::RunRemote(session) => session.address.to_string(),
        Step::Transfer(transfer) => transfer.address.to_string(),
    }
}

/// Generates a one-line identifier for a [Step], suitable for use as its title in user output.
pub fn title(step: &Step) -> String {
    match step {
        Step::RunLocal(fragment) => fragment.label.clone(),
        Step::RunRemote(session) => format!("session {} ({})", session.delimiter, session.user),
        Step::Transfer(transfer) => {
            let arrow = match transfer.direction {
                Direction::Upload => "->",
                Direction::Download => "<-",
            };
            format!("copy: {} {arrow} {}", transfer.sources.join(", "), transfer.destination)
        }
    }
}

/// `exit code N`, or `error` if the process was ended by a signal.
pub fn exit_status(output: &Output) -> String {
    match output.status.code() {
        Some(i) => format!("exit code {i}"),
        None => "error".to_string(),
    }
}

/// A testable method containing the logic for reporting the outcome of a [Step].
pub fn _report<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    step: &Step,
    output: &Output,
) -> io::Result<()> {
    fn write_indented(
        mut writer: impl Write,
        header: impl Display,
        content: impl AsRef<str>,
    ) -> io::Result<()> {
        writeln!(writer, "    {header}")?;
        for line in content.as_ref().lines() {
            writeln!(writer, "        {line}")?;
        }
        Ok(())
    }

    let target = target(step);
    if output.status.success() {
        writeln!(&mut stdout, "[{target}] Completed {}", title(step))?;
    } else {
        writeln!(&mut stderr, "[{target}] Step failed. See below for details.")?;
    }

    if !output.stdout.is_empty() {
        write_indented(
            stdout.deref_mut(),
            "Captured stdout:",
            String::from_utf8_lossy(&output.stdout),
        )?;
    }

    if !output.stderr.is_empty() {
        write_indented(
            stderr.deref_mut(),
            "Captured stderr:",
            String::from_utf8_lossy(&output.stderr),
        )?;
    }

    if !output.status.success() {
        writeln!(
            &mut stderr,
            "Step exited with {}: {}",
            exit_status(output),
            title(step),
        )?;
    }
    Ok(())
}

/// A testable method containing the logic for reporting that a [Step] is starting.
pub fn _starting<OT: Write, O: DerefMut<Target = OT>>(mut stdout: O, step: &Step) -> io::Result<()> {
    writeln!(
        &mut stdout,
        // The extra space lines "Starting" up with "Completed".
        "[{}] Starting  {}",
        target(step),
        title(step),
    )
}
