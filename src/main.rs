//! Radio Runner CLI entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use radio_runner::config::{Profile, RunnerConfig};
use radio_runner::core::{FileKind, Outcome, Supervisor, TaskAssignment};
use radio_runner::scheduler::{HttpSchedulerClient, NoSchedulerClient, UploaderClient};
use radio_runner::shutdown::install_shutdown_handler;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "radio-runner", version, about = "Runs scheduled radio lab tasks on this device")]
struct Cli {
    /// YAML configuration file; the environment is used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Environment profile: development, staging or production
    #[arg(long, global = true, default_value = "development")]
    profile: Profile,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull and run tasks from the scheduler until interrupted
    Run,
    /// Run a single local file as a task, without a scheduler
    Single {
        #[arg(long)]
        file: PathBuf,

        /// Defaults to prebuilt for .py files, source otherwise
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        /// Task budget in seconds
        #[arg(long, default_value_t = 60.0)]
        max_time: f64,

        #[arg(long, default_value = "manual")]
        session_id: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Prebuilt,
    Source,
}

impl From<KindArg> for FileKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Prebuilt => FileKind::PrebuiltProgram,
            KindArg::Source => FileKind::SourceDescription,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    log::info!("Radio Runner v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config.as_deref(), cli.profile)?;

    match cli.command {
        Command::Run => {
            run(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Single {
            file,
            kind,
            max_time,
            session_id,
        } => single(config, &file, kind, max_time, session_id).await,
    }
}

fn load_config(path: Option<&Path>, profile: Profile) -> Result<RunnerConfig> {
    match path {
        Some(path) => {
            log::info!("Loading configuration from: {}", path.display());
            RunnerConfig::from_file(path)
        }
        None => {
            log::info!("Loading configuration from the environment ({:?})", profile);
            RunnerConfig::from_env(profile)
        }
    }
}

async fn run(config: RunnerConfig) -> Result<()> {
    config.validate(true)?;
    log::info!(
        "Device {} as {}, sandbox {}",
        config.device.id,
        config.device.role,
        if config.sandbox.enabled { "enabled" } else { "disabled" }
    );

    let scheduler = HttpSchedulerClient::new(&config).context("creating scheduler client")?;
    let uploader = if config.reset_uploads {
        Some(UploaderClient::new(&config).context("creating uploader client")?)
    } else {
        None
    };

    let config = Arc::new(config);
    let mut supervisor = Supervisor::new(config, Arc::new(scheduler));
    if let Some(uploader) = uploader {
        supervisor = supervisor.with_uploader(uploader);
    }

    let shutdown = install_shutdown_handler();
    supervisor.run_forever(shutdown).await;
    Ok(())
}

async fn single(
    config: RunnerConfig,
    file: &Path,
    kind: Option<KindArg>,
    max_time: f64,
    session_id: String,
) -> Result<ExitCode> {
    config.validate(false)?;
    let max_time = match Duration::try_from_secs_f64(max_time) {
        Ok(max_time) => max_time,
        Err(e) => anyhow::bail!("--max-time {} is not a usable number of seconds: {}", max_time, e),
    };

    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let kind = kind.map(FileKind::from).unwrap_or_else(|| infer_kind(file));
    let mut assignment = TaskAssignment::new(
        "manual",
        session_id,
        kind,
        content,
        max_time,
    );
    if let Some(name) = file.file_name() {
        assignment = assignment.with_file_name(name.to_string_lossy());
    }

    let shutdown = install_shutdown_handler();
    let mut supervisor = Supervisor::new(Arc::new(config), Arc::new(NoSchedulerClient));
    let outcome = supervisor.execute(assignment, &shutdown).await?;

    println!("{}", outcome);
    if let Some(output) = outcome.error_report() {
        eprintln!("{}", output);
    }
    Ok(if outcome == Outcome::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn infer_kind(file: &Path) -> FileKind {
    match file.extension().and_then(|ext| ext.to_str()) {
        Some("py") => FileKind::PrebuiltProgram,
        _ => FileKind::SourceDescription,
    }
}
