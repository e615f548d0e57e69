//! Running host tools, and running them inside a container's network
//! namespace.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;
use tokio::time::sleep;

use crate::context::AgentContext;
use crate::error::{Error, Result};

/// Launch retries for plumbing commands.
pub const PLUMBING_TRIES: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `-1` when the process was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns a process and waits for it.  An `Err` means the process could not
/// be launched at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &[String], env: &HashMap<String, String>) -> io::Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &[String], env: &HashMap<String, String>) -> io::Result<CommandOutput> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let output = Command::new(program)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// What to do when a namespace command fails on both paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Raise,
    Ignore,
}

/// Which path ended up running a namespace command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetnsPath {
    /// `nsenter` from the host.
    Nsenter,
    /// The runtime's exec facility inside the container.
    Exec,
    /// Both paths failed and the caller asked to ignore it.
    Failed,
}

/// Runs `command`, logging its output tagged with the program name.
///
/// Launch errors are retried up to `tries` more times, `delay` apart; the
/// last launch error is returned once they run out.  A non-zero exit is a
/// real answer from the command and is returned as-is.
pub async fn call_retry(
    runner: &dyn CommandRunner,
    command: &[String],
    env: &HashMap<String, String>,
    delay: Duration,
    tries: u32,
) -> Result<i32> {
    let line = command.join(" ");
    let program = command.first().map(String::as_str).unwrap_or_default();
    let mut remaining = tries;

    loop {
        info!("Calling: {}", line);
        match runner.run(command, env).await {
            Ok(output) => {
                for out in output.stdout.lines() {
                    info!("{}: {}", program, out.trim());
                }
                for err in output.stderr.lines() {
                    warn!("{}: {}", program, err.trim());
                }
                return Ok(output.code);
            }
            Err(source) => {
                warn!("Command \"{}\" failed: {}", line, source);
                if remaining == 0 {
                    return Err(Error::Launch {
                        command: line,
                        source,
                    });
                }
                remaining -= 1;
            }
        }
        sleep(delay).await;
    }
}

/// Runs `command` inside the network namespace of `container`.
///
/// `nsenter` against the container's pid is tried first since it only needs
/// tools on the host.  If that does not exit cleanly the command is run once
/// through the runtime's exec as root, which needs `ip` in the image.  A
/// known `pid` skips the inspection, which cleanup relies on when the
/// container may be going away.
pub async fn call_in_netns(
    ctx: &AgentContext,
    container: &str,
    command: &[String],
    on_error: OnError,
    pid: Option<i64>,
) -> Result<NetnsPath> {
    let pid = match pid {
        Some(pid) => pid,
        None => container_pid(ctx, container).await?,
    };

    let mut nsenter = vec![
        "nsenter".to_string(),
        "--target".to_string(),
        pid.to_string(),
        "--net".to_string(),
        "--no-fork".to_string(),
    ];
    nsenter.extend_from_slice(command);

    let env = ctx.command_env();
    let code = call_retry(ctx.runner.as_ref(), &nsenter, &env, ctx.retry_delay(), PLUMBING_TRIES)
        .await
        .unwrap_or(-1);
    if code == 0 {
        return Ok(NetnsPath::Nsenter);
    }

    warn!("nsenter command failed, resorting to docker exec");
    let failure = match ctx.runtime.exec(container, command, "root").await {
        Ok(0) => return Ok(NetnsPath::Exec),
        Ok(code) => format!("exit code {}", code),
        Err(err) => err.to_string(),
    };

    match on_error {
        OnError::Raise => {
            warn!("`{}` failed in {}: {}", command.join(" "), container, failure);
            Err(Error::Netns {
                container: container.to_string(),
                command: command.join(" "),
            })
        }
        OnError::Ignore => {
            debug!("ignoring failure of `{}` in {}: {}", command.join(" "), container, failure);
            Ok(NetnsPath::Failed)
        }
    }
}

/// Pid of the container's init process, needed for namespace operations.
pub async fn container_pid(ctx: &AgentContext, container: &str) -> Result<i64> {
    ctx.runtime
        .inspect_container(container)
        .await?
        .pid
        .ok_or_else(|| Error::NotRunning(container.to_string()))
}

/// Builds an owned argv from string slices.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, RecordingRuntime, ScriptedRunner};

    #[tokio::test]
    async fn call_retry_returns_nonzero_exit_without_retrying() {
        let runner = ScriptedRunner::default();
        runner.push_exit(2);
        let code = call_retry(&runner, &argv(&["ip", "link"]), &HashMap::new(), Duration::ZERO, 3)
            .await
            .unwrap();
        assert_eq!(code, 2);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn call_retry_retries_launch_errors_then_gives_up() {
        let runner = ScriptedRunner::default();
        runner.push_launch_error();
        runner.push_launch_error();
        runner.push_launch_error();
        let result = call_retry(&runner, &argv(&["iw", "dev"]), &HashMap::new(), Duration::ZERO, 2).await;
        assert!(matches!(result, Err(Error::Launch { .. })));
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn call_retry_recovers_after_launch_error() {
        let runner = ScriptedRunner::default();
        runner.push_launch_error();
        runner.push_exit(0);
        let code = call_retry(&runner, &argv(&["true"]), &HashMap::new(), Duration::ZERO, 1)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn nsenter_success_skips_exec() {
        let runtime = RecordingRuntime::default();
        let runner = ScriptedRunner::default();
        let ctx = test_context(runtime.clone(), runner.clone());

        let path = call_in_netns(&ctx, "app-web", &argv(&["ip", "link"]), OnError::Raise, Some(42))
            .await
            .unwrap();
        assert_eq!(path, NetnsPath::Nsenter);
        assert_eq!(
            runner.calls()[0],
            argv(&["nsenter", "--target", "42", "--net", "--no-fork", "ip", "link"])
        );
        assert!(runtime.execs().is_empty());
    }

    #[tokio::test]
    async fn nonzero_nsenter_falls_back_to_exec_once() {
        let runtime = RecordingRuntime::default();
        let runner = ScriptedRunner::default();
        runner.push_exit(1);
        let ctx = test_context(runtime.clone(), runner.clone());

        let path = call_in_netns(&ctx, "app-web", &argv(&["ip", "link"]), OnError::Raise, Some(42))
            .await
            .unwrap();
        assert_eq!(path, NetnsPath::Exec);
        assert_eq!(
            runtime.execs(),
            vec![("app-web".to_string(), argv(&["ip", "link"]), "root".to_string())]
        );
    }

    #[tokio::test]
    async fn fallback_failure_raises_or_is_ignored() {
        let runtime = RecordingRuntime::default();
        runtime.set_exec_code(1);
        let runner = ScriptedRunner::default();
        runner.push_exit(1);
        runner.push_exit(1);
        let ctx = test_context(runtime.clone(), runner.clone());

        let raised = call_in_netns(&ctx, "app-web", &argv(&["ip", "link"]), OnError::Raise, Some(7)).await;
        assert!(matches!(raised, Err(Error::Netns { .. })));

        let ignored = call_in_netns(&ctx, "app-web", &argv(&["ip", "link"]), OnError::Ignore, Some(7))
            .await
            .unwrap();
        assert_eq!(ignored, NetnsPath::Failed);
        assert_eq!(runtime.execs().len(), 2);
    }

    #[tokio::test]
    async fn pid_is_looked_up_when_not_given() {
        let runtime = RecordingRuntime::default();
        runtime.add_container("app-web", Some(1234));
        let runner = ScriptedRunner::default();
        let ctx = test_context(runtime, runner.clone());

        call_in_netns(&ctx, "app-web", &argv(&["true"]), OnError::Raise, None)
            .await
            .unwrap();
        assert_eq!(runner.calls()[0][2], "1234");
    }

    #[tokio::test]
    async fn missing_container_is_an_error() {
        let ctx = test_context(RecordingRuntime::default(), ScriptedRunner::default());
        let result = call_in_netns(&ctx, "gone", &argv(&["true"]), OnError::Ignore, None).await;
        assert!(matches!(result, Err(Error::ContainerNotFound(_))));
    }
}
