//! Bounded, cancellable subprocess execution with streamed output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ProgressReporter, Step, StepFailure};

/// How long output is still collected after a command exits.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// One external command belonging to a build step.
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub step: Step,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub envs: Vec<(String, String)>,
    /// Shown in logs instead of the raw command line, e.g. with
    /// credentials removed.
    pub display: String,
}

impl StepCommand {
    pub fn new(step: Step, program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        let program = program.into();
        Self {
            step,
            display: program.clone(),
            program,
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        self.display.push(' ');
        self.display.push_str(&arg);
        self.args.push(arg);
        self
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        args.into_iter().fold(self, |cmd, a| cmd.arg(a))
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn display_as(mut self, display: impl Into<String>) -> Self {
        self.display = display.into();
        self
    }
}

/// Runs step commands under a deadline and a cancellation token, streaming
/// combined stdout and stderr line by line as log events.
///
/// The command runs in its own process group. On expiry or cancellation the
/// whole group is killed.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run(
        &self,
        cmd: &StepCommand,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        debug!(build_id = %reporter.build_id(), step = %cmd.step, command = %cmd.display, "Running command");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.cwd)
            .envs(cmd.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            StepFailure::new(cmd.step, format!("could not start `{}`: {}", cmd.program, e))
        })?;
        // `Child::id` is gone once the child has been reaped.
        let pid = child.id();

        let (tx, mut rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        // Armed when the command exits; bounds how long leftover background
        // processes may hold the output pipes open.
        let drain = tokio::time::sleep(self.timeout);
        tokio::pin!(drain);

        let mut streaming = true;
        let mut exit = None;
        while streaming || exit.is_none() {
            tokio::select! {
                line = rx.recv(), if streaming => match line {
                    Some(line) => reporter.log(line).await,
                    None => streaming = false,
                },
                status = child.wait(), if exit.is_none() => {
                    let status = status.map_err(|e| {
                        StepFailure::new(cmd.step, format!("waiting for `{}`: {}", cmd.program, e))
                    })?;
                    exit = Some(status);
                    drain.as_mut().reset(Instant::now() + OUTPUT_DRAIN);
                }
                _ = &mut drain, if exit.is_some() => {
                    debug!(
                        build_id = %reporter.build_id(),
                        step = %cmd.step,
                        "Output still open after exit, killing leftover processes"
                    );
                    if let Some(pid) = pid {
                        kill_group(pid).await;
                    }
                    while let Ok(line) = rx.try_recv() {
                        reporter.log(line).await;
                    }
                    streaming = false;
                }
                _ = &mut deadline => {
                    terminate(&mut child, pid).await;
                    return Err(StepFailure::new(
                        cmd.step,
                        format!("`{}` timed out after {}s", cmd.display, self.timeout.as_secs()),
                    ));
                }
                _ = cancel.cancelled() => {
                    terminate(&mut child, pid).await;
                    return Err(StepFailure::new(cmd.step, format!("`{}` was cancelled", cmd.display)));
                }
            }
        }

        match exit {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(StepFailure::new(
                cmd.step,
                format!("`{}` exited with {}", cmd.display, status),
            )),
            None => Err(StepFailure::new(cmd.step, "process exit status unavailable")),
        }
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(clean_line(&buf)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read command output");
                break;
            }
        }
    }
}

/// Decode one raw output line. NUL bytes are dropped since text columns
/// downstream cannot store them.
fn clean_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end();
    if line.contains('\0') {
        line.replace('\0', "")
    } else {
        line.to_string()
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        kill_group(pid).await;
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Child already exited");
    }
    let _ = child.wait().await;
}

#[cfg(unix)]
async fn kill_group(pid: u32) {
    let group = format!("-{}", pid);
    let killed = Command::new("kill")
        .args(["-KILL", "--", group.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = killed {
        warn!(pid, error = %e, "Failed to kill process group");
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_bus::{InMemoryBus, MessageBus, Topic};
    use shipyard_core::{BuildId, ProgressEvent};
    use std::sync::Arc;

    fn has_sh() -> bool {
        std::path::Path::new("/bin/sh").exists()
    }

    fn setup() -> (Arc<InMemoryBus>, ProgressReporter) {
        let bus = Arc::new(InMemoryBus::new(2));
        let dyn_bus: Arc<dyn MessageBus> = bus.clone();
        (bus, ProgressReporter::new(dyn_bus, BuildId::new()))
    }

    fn logged(bus: &InMemoryBus) -> Vec<String> {
        bus.retained(Topic::BuildLogs)
            .iter()
            .filter_map(|d| match d.decode::<ProgressEvent>().ok()? {
                ProgressEvent::LogAppended { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }

    fn sh(step: Step, script: &str) -> StepCommand {
        StepCommand::new(step, "/bin/sh", std::env::temp_dir()).args(["-c", script])
    }

    #[tokio::test]
    async fn test_streams_stdout_and_stderr() {
        if !has_sh() {
            return;
        }
        let (bus, reporter) = setup();
        let runner = CommandRunner::new(Duration::from_secs(30));
        runner
            .run(&sh(Step::Build, "echo one; echo two 1>&2"), &reporter, &CancellationToken::new())
            .await
            .unwrap();

        let mut lines = logged(&bus);
        lines.sort();
        assert_eq!(lines, ["one", "two"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_the_step() {
        if !has_sh() {
            return;
        }
        let (_bus, reporter) = setup();
        let err = CommandRunner::new(Duration::from_secs(30))
            .run(&sh(Step::Install, "exit 3"), &reporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.step, Step::Install);
        assert!(err.to_string().starts_with("install failed"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_the_step() {
        let (_bus, reporter) = setup();
        let cmd = StepCommand::new(Step::Build, "shipyard-no-such-tool", std::env::temp_dir());
        let err = CommandRunner::new(Duration::from_secs(5))
            .run(&cmd, &reporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.reason.contains("could not start"));
    }

    #[tokio::test]
    async fn test_deadline_kills_the_command() {
        if !has_sh() {
            return;
        }
        let (_bus, reporter) = setup();
        let started = std::time::Instant::now();
        let err = CommandRunner::new(Duration::from_millis(200))
            .run(&sh(Step::Build, "sleep 30"), &reporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.reason.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_command() {
        if !has_sh() {
            return;
        }
        let (_bus, reporter) = setup();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = CommandRunner::new(Duration::from_secs(60))
            .run(&sh(Step::Clone, "sleep 30"), &reporter, &cancel)
            .await
            .unwrap_err();
        assert!(err.reason.contains("cancelled"));
    }

    #[test]
    fn test_clean_line_drops_nul_bytes() {
        assert_eq!(clean_line(b"PK\x03\x04\0\0\x14\0\r\n"), "PK\u{3}\u{4}\u{14}");
        assert_eq!(clean_line(b"plain output\n"), "plain output");
    }

    #[tokio::test]
    async fn test_output_with_nul_bytes_is_logged_without_them() {
        if !has_sh() {
            return;
        }
        let (bus, reporter) = setup();
        CommandRunner::new(Duration::from_secs(30))
            .run(&sh(Step::Build, "printf 'a\\000b\\n'"), &reporter, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(logged(&bus), ["ab"]);
    }

    #[tokio::test]
    async fn test_background_process_does_not_hold_the_step() {
        if !has_sh() {
            return;
        }
        let (bus, reporter) = setup();
        let started = std::time::Instant::now();
        CommandRunner::new(Duration::from_secs(60))
            .run(
                &sh(Step::Build, "echo built; sleep 30 &"),
                &reporter,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < OUTPUT_DRAIN + Duration::from_secs(10));
        assert_eq!(logged(&bus), ["built"]);
    }

    #[test]
    fn test_display_can_hide_arguments() {
        let cmd = StepCommand::new(Step::Clone, "git", "/tmp")
            .args(["clone", "https://token@example.com/r.git", "src"])
            .display_as("git clone https://***@example.com/r.git");
        assert_eq!(cmd.args.len(), 3);
        assert!(!cmd.display.contains("token"));
    }
}
