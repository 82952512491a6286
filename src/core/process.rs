//! Process runner - launch external programs, optionally inside the sandbox,
//! and capture their output
//!
//! Callers never block on a process indefinitely: they poll [`ProcessHandle::try_wait`]
//! and, when they have to stop it, call [`ProcessHandle::shutdown`], which escalates
//! from terminate to kill with a bounded wait after each step.

use super::sandbox::{wrap_command, IsolationProfile};
use crate::config::SandboxConfig;
use crate::error::ProcessError;
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Lines kept per stream; older lines are dropped
const MAX_CAPTURED_LINES: usize = 1000;

/// How long to wait for the reader tasks once the process is gone
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded line buffer filled by a reader task
#[derive(Debug, Clone, Default)]
struct OutputBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputBuffer {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.push_back(line);
        if lines.len() > MAX_CAPTURED_LINES {
            lines.pop_front();
        }
    }

    fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn spawn_reader<R>(stream: R, buffer: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    buffer.push(line.trim_end_matches(|c| c == '\n' || c == '\r').to_string());
                }
                Err(e) => {
                    log::debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

/// Everything a finished (or stopped) process left behind
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    /// `None` if the process could not be reaped
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Stdout and stderr joined the way error reports carry them
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    pub fn describe_status(&self) -> String {
        match self.status {
            Some(status) => match status.code() {
                Some(code) => format!("exit code {}", code),
                None => signal_description(&status),
            },
            None => "unknown status".to_string(),
        }
    }
}

#[cfg(unix)]
fn signal_description(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {}", signal),
        None => "terminated".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_description(_status: &ExitStatus) -> String {
    "terminated".to_string()
}

/// Launches processes in a working directory, sandboxed when configured
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    sandbox: SandboxConfig,
}

impl ProcessRunner {
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self { sandbox }
    }

    pub fn sandboxed(&self) -> bool {
        self.sandbox.enabled
    }

    /// Start `command` in `workdir` with stdout and stderr captured
    pub fn spawn(&self, command: &[String], workdir: &Path) -> Result<ProcessHandle, ProcessError> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        let argv = if self.sandbox.enabled {
            let profile = IsolationProfile::for_workdir(&self.sandbox, workdir);
            let path = profile.write(workdir, &self.sandbox.profile_file)?;
            log::info!("Sandbox profile generated at {}", path.display());
            log::debug!("Sandbox profile:\n{}", profile.render());

            let wrapped = wrap_command(&self.sandbox, command);
            log::info!(
                "Running inside the sandbox: {} (effective: {})",
                command.join(" "),
                wrapped.join(" ")
            );
            wrapped
        } else {
            log::info!("Running outside any sandbox: {}", command.join(" "));
            command.to_vec()
        };

        let mut std_cmd = std::process::Command::new(&argv[0]);
        std_cmd
            .args(&argv[1..])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so signals also reach wrapper and shell children
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: argv[0].clone(),
            source,
        })?;

        let stdout = OutputBuffer::default();
        let stderr = OutputBuffer::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, stderr.clone()));
        }

        let pid = child.id();
        log::debug!("Spawned {} (pid {:?})", argv[0], pid);

        Ok(ProcessHandle {
            label: argv[0].clone(),
            pid,
            child,
            stdout,
            stderr,
            readers,
            status: None,
        })
    }
}

/// Steps of a forced stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Terminate,
    AwaitExit,
    Kill,
    AwaitKill,
    Done,
}

/// A running external process with captured output
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    child: Child,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?;
        }
        Ok(self.status)
    }

    /// Output captured so far
    pub fn stdout_snapshot(&self) -> String {
        self.stdout.snapshot()
    }

    pub fn stderr_snapshot(&self) -> String {
        self.stderr.snapshot()
    }

    /// Ask the process (group) to exit
    #[cfg(unix)]
    pub fn terminate(&mut self) -> Result<(), ProcessError> {
        match self.pid {
            Some(pid) if self.status.is_none() => {
                signal_group(pid, nix::sys::signal::Signal::SIGTERM)
            }
            _ => Ok(()),
        }
    }

    #[cfg(not(unix))]
    pub fn terminate(&mut self) -> Result<(), ProcessError> {
        self.kill()
    }

    /// Forcefully kill the process (group)
    pub fn kill(&mut self) -> Result<(), ProcessError> {
        if self.status.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                signal_group(pid, nix::sys::signal::Signal::SIGKILL)?;
            }
        }
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the process: terminate, wait up to `grace`, then kill and wait
    /// up to `grace` again. Failures are logged, never returned.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<ExitStatus> {
        let mut state = Escalation::Terminate;
        loop {
            log::debug!("Stopping {}: {:?}", self.label, state);
            state = match state {
                Escalation::Terminate => match self.try_wait() {
                    Ok(Some(_)) => Escalation::Done,
                    _ => {
                        if let Err(e) = self.terminate() {
                            log::warn!("Failed to terminate {}: {}", self.label, e);
                        }
                        Escalation::AwaitExit
                    }
                },
                Escalation::AwaitExit => {
                    if self.wait_for(grace).await {
                        Escalation::Done
                    } else {
                        log::warn!(
                            "{} did not exit within {:?} of terminate, killing it",
                            self.label,
                            grace
                        );
                        Escalation::Kill
                    }
                }
                Escalation::Kill => {
                    if let Err(e) = self.kill() {
                        log::error!("Failed to kill {}: {}", self.label, e);
                    }
                    Escalation::AwaitKill
                }
                Escalation::AwaitKill => {
                    if !self.wait_for(grace).await {
                        log::error!("{} is still alive {:?} after kill", self.label, grace);
                    }
                    Escalation::Done
                }
                Escalation::Done => return self.status,
            };
        }
    }

    async fn wait_for(&mut self, limit: Duration) -> bool {
        if self.status.is_some() {
            return true;
        }
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.status = Some(status);
                true
            }
            Ok(Err(e)) => {
                log::warn!("Waiting for {} failed: {}", self.label, e);
                false
            }
            Err(_) => false,
        }
    }

    /// Collect the output. Call once the process has exited or been stopped.
    pub async fn finish(mut self) -> CapturedOutput {
        if self.status.is_none() {
            if let Err(e) = self.try_wait() {
                log::warn!("Could not reap {}: {}", self.label, e);
            }
        }

        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                log::warn!("Output of {} still open, giving up on it", self.label);
                abort.abort();
            }
        }

        CapturedOutput {
            status: self.status,
            stdout: self.stdout.snapshot(),
            stderr: self.stderr.snapshot(),
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    match nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ProcessError::Io(std::io::Error::from(errno))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn wait_exit(handle: &mut ProcessHandle) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.try_wait().unwrap().is_none() {
            assert!(Instant::now() < deadline, "process did not exit");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_stdout(handle: &ProcessHandle, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !handle.stdout_snapshot().contains(needle) {
            assert!(Instant::now() < deadline, "never saw {needle:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(SandboxConfig::default());
        let mut handle = runner
            .spawn(&sh("echo out; echo err >&2; exit 3"), dir.path())
            .unwrap();
        wait_exit(&mut handle).await;

        let output = handle.finish().await;
        assert_eq!(output.exit_code(), Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert_eq!(output.combined(), "out\nerr");
        assert_eq!(output.describe_status(), "exit code 3");
    }

    #[tokio::test]
    async fn test_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(SandboxConfig::default());
        let mut handle = runner.spawn(&sh("touch marker"), dir.path()).unwrap();
        wait_exit(&mut handle).await;
        assert!(handle.finish().await.success());
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_empty_and_missing_commands() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(SandboxConfig::default());
        assert!(matches!(
            runner.spawn(&[], dir.path()),
            Err(ProcessError::EmptyCommand)
        ));
        assert!(matches!(
            runner.spawn(&["definitely-not-a-binary-4242".to_string()], dir.path()),
            Err(ProcessError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(SandboxConfig::default());
        let mut handle = runner
            .spawn(&sh("echo started; sleep 30"), dir.path())
            .unwrap();
        wait_for_stdout(&handle, "started").await;

        let began = Instant::now();
        let status = handle.shutdown(Duration::from_secs(5)).await;
        assert!(began.elapsed() < Duration::from_secs(5));
        assert!(status.is_some());

        let output = handle.finish().await;
        assert!(!output.success());
        assert_eq!(output.stdout, "started");
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(SandboxConfig::default());
        let mut handle = runner
            .spawn(&sh("trap '' TERM; echo ready; sleep 30"), dir.path())
            .unwrap();
        wait_for_stdout(&handle, "ready").await;

        let grace = Duration::from_millis(300);
        let began = Instant::now();
        let status = handle.shutdown(grace).await;
        let elapsed = began.elapsed();

        assert!(elapsed >= grace, "kill came before the grace period");
        assert!(elapsed < Duration::from_secs(5));
        assert!(status.is_some());
        assert_eq!(
            handle.finish().await.describe_status(),
            "terminated by signal 9"
        );
    }

    #[tokio::test]
    async fn test_shutdown_of_exited_process_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(SandboxConfig::default());
        let mut handle = runner.spawn(&sh("exit 0"), dir.path()).unwrap();
        wait_exit(&mut handle).await;
        let status = handle.shutdown(Duration::from_millis(100)).await;
        assert!(status.map(|s| s.success()).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_sandboxed_launch_writes_profile() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        // Stand-in wrapper: drops the --profile flag and runs the rest
        let wrapper = bin.path().join("fake-jail");
        std::fs::write(&wrapper, "#!/bin/sh\nshift\nexec \"$@\"\n").unwrap();
        std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sandbox = SandboxConfig {
            enabled: true,
            wrapper: wrapper.display().to_string(),
            paths: Vec::new(),
            ..SandboxConfig::default()
        };
        let runner = ProcessRunner::new(sandbox);
        assert!(runner.sandboxed());

        let mut handle = runner.spawn(&sh("echo jailed"), dir.path()).unwrap();
        wait_exit(&mut handle).await;
        let output = handle.finish().await;
        assert!(output.success());
        assert_eq!(output.stdout, "jailed");

        let profile = std::fs::read_to_string(dir.path().join("firejail.profile")).unwrap();
        assert!(profile.contains(&format!("whitelist {}", dir.path().display())));
    }
}
