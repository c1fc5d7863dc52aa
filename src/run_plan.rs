//! Runs a [Plan] from the operator's machine.
//!
//! Each top-level step is scripted on its own and handed to an [Execute] implementation. The
//! coordinator's session, and everything nested in it, is one such step. Steps run in order and
//! the first failing step ends the run; nothing already done is undone.

mod report;

pub use report::{exit_status, target, title, Report, Reporter};

use crate::core::plan::{FailurePolicy, Plan, Step};
use crate::core::script::{Script, OPEN_FAILURE, SSH_FAILURE, STDIN_RUNNER};
use crate::error::{Error, Result};
use crate::run_log::RunLog;
use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

/// Runs one top-level step.
#[async_trait]
pub trait Execute {
    async fn execute(
        &mut self,
        step: &Step,
        script: &Script,
        policy: FailurePolicy,
    ) -> Result<Output>;
}

/// Runs each step's script with the local `bash`. Sessions and copies are the `ssh` and `scp`
/// commands written into the script.
///
/// The script goes to `bash` on stdin, so its size is not bounded by the argument limit.
#[derive(Clone, Debug, Default)]
pub struct ShellExecutor;

#[async_trait]
impl Execute for ShellExecutor {
    async fn execute(
        &mut self,
        _step: &Step,
        script: &Script,
        _policy: FailurePolicy,
    ) -> Result<Output> {
        let mut child = Command::new("bash")
            .arg("-c")
            .arg(STDIN_RUNNER)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.render().as_bytes()).await?;
            stdin.flush().await?;
        }
        Ok(child.wait_with_output().await?)
    }
}

/// Opens the coordinator's session with a native OpenSSH connection instead of a scripted `ssh`.
///
/// Only the outermost hop changes; the session body, including every deeper hop, is the same
/// script [ShellExecutor] would send. Steps that are not sessions go to the shell.
#[cfg(feature = "openssh")]
#[derive(Clone, Debug, Default)]
pub struct OpenSshExecutor {
    shell: ShellExecutor,
}

#[cfg(feature = "openssh")]
#[async_trait]
impl Execute for OpenSshExecutor {
    async fn execute(
        &mut self,
        step: &Step,
        script: &Script,
        policy: FailurePolicy,
    ) -> Result<Output> {
        use openssh::{KnownHosts, SessionBuilder};

        let Step::RunRemote(session) = step else {
            return self.shell.execute(step, script, policy).await;
        };
        let body = Script::session_body(session, policy)?;

        let mut builder = SessionBuilder::default();
        builder
            .user(session.user.clone())
            .port(session.address.port)
            .keyfile(crate::config::expand_home(&session.credential.key))
            .known_hosts_check(KnownHosts::Add);
        let ssh = builder
            .connect_mux(&session.address.host)
            .await
            .map_err(|err| {
                tracing::warn!(host = %session.address.host, %err, "could not connect");
                Error::SessionOpenFailure {
                    step: title(step),
                    code: SSH_FAILURE,
                }
            })?;

        let output = send_body(&ssh, &body).await;
        ssh.close().await?;
        output
    }
}

/// Runs `body` on the far side of `ssh`, passing it on stdin.
#[cfg(feature = "openssh")]
async fn send_body(ssh: &openssh::Session, body: &Script) -> Result<Output> {
    use openssh::Stdio;

    let mut child = ssh
        .command("bash")
        .arg("-c")
        .arg(STDIN_RUNNER)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .await?;

    if let Some(mut stdin) = child.stdin().take() {
        stdin.write_all(body.render().as_bytes()).await?;
        stdin.flush().await?;
    }
    Ok(child.wait_with_output().await?)
}

/// Turns a failed step's output into the matching error.
fn check(step: &Step, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let status = exit_status(output);
    let step_title = title(step);
    Err(match (step, output.status.code()) {
        (Step::RunRemote(_), Some(SSH_FAILURE)) => Error::SessionOpenFailure {
            step: unopened_session(&output.stderr).unwrap_or(step_title),
            code: SSH_FAILURE,
        },
        (Step::Transfer(_), _) => Error::TransferFailure {
            step: step_title,
            status,
        },
        _ => Error::SessionBodyFailure {
            step: step_title,
            status,
        },
    })
}

/// The innermost session a script reported it could not open.
///
/// Each failing level writes its own marker on the way out, innermost first.
fn unopened_session(stderr: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .find_map(|line| line.strip_prefix(OPEN_FAILURE))
        .map(|delimiter| format!("session {}", delimiter.trim()))
}

/// Runs every top-level step of `plan`, reporting each one and recording it to `log` if given.
pub async fn run_plan<E, R>(
    operation: &str,
    plan: &Plan,
    executor: &mut E,
    reporter: &mut R,
    mut log: Option<&mut RunLog>,
) -> Result<()>
where
    E: Execute + Send,
    R: Report + Send,
{
    for step in &plan.steps {
        let script = Script::for_step(step, plan.policy)?;
        reporter.starting(step).await?;
        info!(operation, step = %title(step), "running step");

        let output = executor.execute(step, &script, plan.policy).await?;
        if let Some(log) = log.as_deref_mut() {
            log.record(operation, step, &script, &output)?;
        }
        reporter.report(step, &output).await?;
        check(step, &output)?;
    }
    info!(operation, steps = plan.steps.len(), "plan complete");
    Ok(())
}
