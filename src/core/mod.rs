//! Core engine - assignments, sandboxed processes, pipeline and supervision

mod assignment;
mod pipeline;
mod process;
mod sandbox;
mod supervisor;
mod token;
mod transform;
mod watchdog;
mod workdir;

pub use assignment::{FileKind, TaskAssignment, TaskStatus};
pub use pipeline::{Outcome, Pipeline};
pub use process::{CapturedOutput, ProcessHandle, ProcessRunner};
pub use sandbox::{wrap_command, IsolationProfile};
pub use supervisor::Supervisor;
pub use token::TaskToken;
pub use transform::{FlowgraphTransformer, Passthrough, ProgramTransformer};
pub use watchdog::Watchdog;
pub use workdir::{ExecutionContext, Manifest};
