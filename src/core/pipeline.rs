//! Build-and-run pipeline - compile (unless prebuilt), then execute
//!
//! Both phases run an external process through the [`ProcessRunner`] and
//! watch it on a fixed tick: the task token and every active deadline are
//! checked before launch and on each tick, and the first one to trip stops
//! the process.

use super::assignment::{FileKind, TaskAssignment};
use super::process::{CapturedOutput, ProcessHandle, ProcessRunner};
use super::token::TaskToken;
use super::transform::{FlowgraphTransformer, ProgramTransformer};
use super::workdir::{ExecutionContext, Manifest};
use crate::config::RunnerConfig;
use anyhow::Result;
use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Compile input missing or rejected, or the compiler failed
    CompileFailed { output: String },
    RunFailed { output: String },
    /// Stopped by the token (remote status or shutdown)
    Cancelled,
    /// A deadline passed
    TimedOut,
}

impl Outcome {
    /// Diagnostic to attach to the task before completing it
    pub fn error_report(&self) -> Option<&str> {
        match self {
            Self::CompileFailed { output } | Self::RunFailed { output } => Some(output),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::CompileFailed { .. } => write!(f, "compile failed"),
            Self::RunFailed { .. } => write!(f, "run failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    name: &'static str,
    /// `None` when the limit lies beyond what `Instant` can represent
    at: Option<Instant>,
}

impl Deadline {
    fn after(name: &'static str, start: Instant, limit: Duration) -> Self {
        Self {
            name,
            at: start.checked_add(limit),
        }
    }

    fn passed(&self, now: Instant) -> bool {
        self.at.map_or(false, |at| now >= at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Compile,
    Execute,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => write!(f, "compile"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Result of watching one process
enum Watched {
    Exited(CapturedOutput),
    Stopped(Outcome),
}

/// Runs one assignment end to end in its own working directory
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<RunnerConfig>,
    runner: ProcessRunner,
    transformer: Arc<dyn ProgramTransformer>,
}

impl Pipeline {
    pub fn new(config: Arc<RunnerConfig>) -> Self {
        let runner = ProcessRunner::new(config.sandbox.clone());
        Self {
            config,
            runner,
            transformer: Arc::new(FlowgraphTransformer),
        }
    }

    /// Replace the compile-input producer
    pub fn with_transformer(mut self, transformer: Arc<dyn ProgramTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Run the assignment. `Err` means an internal failure, not a task outcome.
    ///
    /// The working directory is gone when this returns.
    pub async fn run(
        &self,
        assignment: &TaskAssignment,
        token: &TaskToken,
        acquired_at: Instant,
    ) -> Result<Outcome> {
        let ctx = ExecutionContext::create(acquired_at)?;
        log::info!(
            "Task {} ({}) in {}",
            assignment.task_id,
            assignment.kind,
            ctx.path().display()
        );

        let outcome = self.run_in(&ctx, assignment, token).await;
        ctx.close();

        if let Ok(outcome) = &outcome {
            log::info!("Task {} finished: {}", assignment.task_id, outcome);
        }
        outcome
    }

    async fn run_in(
        &self,
        ctx: &ExecutionContext,
        assignment: &TaskAssignment,
        token: &TaskToken,
    ) -> Result<Outcome> {
        let budget = Deadline::after("maxTime", ctx.acquired_at(), assignment.max_time);

        if let Some(outcome) = self.interrupted(token, &[budget]) {
            return Ok(outcome);
        }

        if assignment.content.trim().is_empty() {
            log::warn!("Task {} has no program input", assignment.task_id);
            return Ok(Outcome::CompileFailed {
                output: "empty program input".to_string(),
            });
        }

        let program = match assignment.kind {
            FileKind::PrebuiltProgram => {
                let content = self.substitute(&assignment.content);
                ctx.write_file(&self.config.toolchain.program_file(), &content)?
            }
            FileKind::SourceDescription => match self.compile(ctx, assignment, token, budget).await? {
                ControlFlow::Continue(program) => program,
                ControlFlow::Break(outcome) => return Ok(outcome),
            },
        };

        self.execute(ctx, assignment, token, budget, &program).await
    }

    /// Hardware addresses for prebuilt programs
    fn substitute(&self, content: &str) -> String {
        self.config
            .substitutions
            .iter()
            .fold(content.to_string(), |acc, sub| {
                acc.replace(&sub.placeholder, &sub.value)
            })
    }

    async fn compile(
        &self,
        ctx: &ExecutionContext,
        assignment: &TaskAssignment,
        token: &TaskToken,
        budget: Deadline,
    ) -> Result<ControlFlow<Outcome, PathBuf>> {
        let toolchain = &self.config.toolchain;
        log::info!("Task {}: compiling", assignment.task_id);

        let input = match self
            .transformer
            .transform(&assignment.content, &toolchain.target_name)
        {
            Ok(input) => input,
            Err(e) => {
                log::warn!("Task {}: rejected job description: {:#}", assignment.task_id, e);
                return Ok(ControlFlow::Break(Outcome::CompileFailed {
                    output: format!("{e:#}"),
                }));
            }
        };
        let input_path = ctx.write_file(&toolchain.input_file, &input)?;
        let program_path = ctx.path().join(toolchain.program_file());

        if let Some(outcome) = self.interrupted(token, &[budget]) {
            return Ok(ControlFlow::Break(outcome));
        }

        let command = render_command(
            &toolchain.compile_command,
            ctx.path(),
            &input_path,
            &program_path,
        );
        let handle = match self.runner.spawn(&command, ctx.path()) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Task {}: could not start compiler: {}", assignment.task_id, e);
                return Ok(ControlFlow::Break(Outcome::CompileFailed {
                    output: e.to_string(),
                }));
            }
        };

        let output = match self.watch(handle, token, &[budget], Phase::Compile).await? {
            Watched::Exited(output) => output,
            Watched::Stopped(outcome) => return Ok(ControlFlow::Break(outcome)),
        };

        if !output.success() {
            log::warn!(
                "Compiler stopped with {}.\nOutput: {}\nError: {}",
                output.describe_status(),
                output.stdout,
                output.stderr
            );
            return Ok(ControlFlow::Break(Outcome::CompileFailed {
                output: output.combined(),
            }));
        }

        if !program_path.is_file() {
            log::warn!(
                "Compiler succeeded but {} was not produced",
                program_path.display()
            );
            return Ok(ControlFlow::Break(Outcome::CompileFailed {
                output: format!(
                    "compiler produced no {}\n{}",
                    toolchain.program_file(),
                    output.combined()
                ),
            }));
        }

        log::info!("Task {}: compiled successfully", assignment.task_id);
        Ok(ControlFlow::Continue(program_path))
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        assignment: &TaskAssignment,
        token: &TaskToken,
        budget: Deadline,
        program: &Path,
    ) -> Result<Outcome> {
        let toolchain = &self.config.toolchain;
        let manifest = Manifest {
            uploader_base_url: self.config.uploader_url.clone(),
            session_id: assignment.session_id.clone(),
            task_id: assignment.task_id.clone(),
            device_id: self.config.device.id.clone(),
        };
        ctx.write_manifest(&toolchain.manifest_file, &manifest)?;

        if let Some(outcome) = self.interrupted(token, &[budget]) {
            return Ok(outcome);
        }

        let input_path = ctx.path().join(&toolchain.input_file);
        let command = render_command(&toolchain.run_command, ctx.path(), &input_path, program);
        let run_cap = Deadline::after("execution cap", Instant::now(), self.config.timeouts.max_run());

        log::info!("Task {}: executing {}", assignment.task_id, program.display());
        let handle = match self.runner.spawn(&command, ctx.path()) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Task {}: could not start program: {}", assignment.task_id, e);
                return Ok(Outcome::RunFailed {
                    output: e.to_string(),
                });
            }
        };

        let output = match self
            .watch(handle, token, &[budget, run_cap], Phase::Execute)
            .await?
        {
            Watched::Exited(output) => output,
            Watched::Stopped(outcome) => return Ok(outcome),
        };

        if output.success() {
            log::info!("Task {}: program finished successfully", assignment.task_id);
            log::debug!("Output: {}\nError: {}", output.stdout, output.stderr);
            Ok(Outcome::Success)
        } else {
            log::warn!(
                "Program stopped with {}.\nOutput: {}\nError: {}",
                output.describe_status(),
                output.stdout,
                output.stderr
            );
            Ok(Outcome::RunFailed {
                output: output.combined(),
            })
        }
    }

    /// Cancellation takes precedence over deadlines
    fn interrupted(&self, token: &TaskToken, deadlines: &[Deadline]) -> Option<Outcome> {
        if token.is_signalled() {
            match token.last_status() {
                Some(status) => log::info!("Task is {} on the scheduler, stopping", status),
                None => log::info!("Task cancelled locally, stopping"),
            }
            return Some(Outcome::Cancelled);
        }
        let now = Instant::now();
        deadlines.iter().find(|d| d.passed(now)).map(|d| {
            log::info!("Deadline {} passed, stopping", d.name);
            Outcome::TimedOut
        })
    }

    /// Poll `handle` until it exits or has to be stopped
    async fn watch(
        &self,
        mut handle: ProcessHandle,
        token: &TaskToken,
        deadlines: &[Deadline],
        phase: Phase,
    ) -> Result<Watched> {
        let timeouts = &self.config.timeouts;
        let started = Instant::now();
        let mut next_heartbeat = started.checked_add(timeouts.heartbeat());

        loop {
            match handle.try_wait() {
                Ok(Some(_)) => return Ok(Watched::Exited(handle.finish().await)),
                Ok(None) => {}
                Err(e) => {
                    log::error!("Lost track of {} during {}: {}", handle.label(), phase, e);
                    handle.shutdown(timeouts.kill_grace()).await;
                    handle.finish().await;
                    return Err(e.into());
                }
            }

            if let Some(outcome) = self.interrupted(token, deadlines) {
                log::info!("Stopping {} ({} phase)", handle.label(), phase);
                handle.shutdown(timeouts.kill_grace()).await;
                let partial = handle.finish().await;
                log::warn!(
                    "{} phase stopped with {}.\nOutput: {}\nError: {}",
                    phase,
                    partial.describe_status(),
                    partial.stdout,
                    partial.stderr
                );
                return Ok(Watched::Stopped(outcome));
            }

            let now = Instant::now();
            if next_heartbeat.map_or(false, |at| now >= at) {
                log::info!(
                    "{} ({} phase) is still running, {:.1}s elapsed",
                    handle.label(),
                    phase,
                    (now - started).as_secs_f64()
                );
                next_heartbeat = now.checked_add(timeouts.heartbeat());
            }

            tokio::time::sleep(timeouts.poll_interval()).await;
        }
    }
}

/// Fill the `{input}`, `{workdir}` and `{program}` placeholders
fn render_command(template: &[String], workdir: &Path, input: &Path, program: &Path) -> Vec<String> {
    let workdir = workdir.display().to_string();
    let input = input.display().to_string();
    let program = program.display().to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{input}", &input)
                .replace("{workdir}", &workdir)
                .replace("{program}", &program)
        })
        .collect()
}
