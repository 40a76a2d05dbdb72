mod command;
mod launcher;
pub mod preflight;

use std::{path::PathBuf, sync::Arc};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use command::CommandPlan;
pub use launcher::{ProcessLauncher, TokioLauncher};
pub use preflight::PreflightError;

#[cfg(test)]
pub(crate) use launcher::testing;

use crate::{
    config::Toolchain,
    ledger::{LedgerError, TaskLedger},
    models::{LaunchedTask, ScanKind, ScanRequest, TaskStatus},
};

const COMPLETION_BUFFER: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionFailure {
    #[error("failed to start `{command}`: {source}")]
    CommandLaunchFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {}: {stderr}", exit_label(.code))]
    NonZeroExitFailure {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Outcome of one finished process, handed to the completion consumer.
#[derive(Debug)]
pub struct Completion {
    pub task_id: String,
    pub kind: ScanKind,
    pub log_file_path: PathBuf,
    pub outcome: Result<(), ExecutionFailure>,
}

pub struct CommandRunner {
    toolchain: Arc<Toolchain>,
    ledger: Arc<dyn TaskLedger>,
    launcher: Arc<dyn ProcessLauncher>,
    completions: mpsc::Sender<Completion>,
}

impl CommandRunner {
    /// Verifies privileges and the log directory, then returns the runner and
    /// the receiving end of its completion channel.
    pub async fn new(
        toolchain: Arc<Toolchain>,
        ledger: Arc<dyn TaskLedger>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<(Self, mpsc::Receiver<Completion>), PreflightError> {
        preflight::verify_privileges(&toolchain, launcher.as_ref()).await?;
        preflight::prepare_log_dir(&toolchain.log_dir).await?;

        let (tx, rx) = mpsc::channel(COMPLETION_BUFFER);
        Ok((
            Self {
                toolchain,
                ledger,
                launcher,
                completions: tx,
            },
            rx,
        ))
    }

    pub fn plan(&self, request: &ScanRequest, task_id: &str) -> CommandPlan {
        command::plan(&self.toolchain, request, task_id)
    }

    /// Moves `task_id` to `IN_PROGRESS` and starts `plan` in the background.
    /// Returns as soon as the process has been handed off.
    pub async fn launch(
        &self,
        task_id: &str,
        plan: CommandPlan,
    ) -> Result<LaunchedTask, LedgerError> {
        self.ledger
            .transition(task_id, TaskStatus::InProgress)
            .await?;
        info!(
            task_id,
            kind = plan.kind.as_str(),
            command = %plan.command_line,
            "audit: launching external tool"
        );

        let launched = LaunchedTask {
            task_id: task_id.to_string(),
            command: plan.command_line.clone(),
            log_file_path: plan.log_file_path.display().to_string(),
        };

        let launcher = Arc::clone(&self.launcher);
        let completions = self.completions.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let outcome = execute(launcher.as_ref(), &plan).await;
            if let Err(e) = &outcome {
                warn!(task_id = %task_id, error = %e, "tool execution failed");
            }
            let completion = Completion {
                task_id,
                kind: plan.kind,
                log_file_path: plan.log_file_path,
                outcome,
            };
            if let Err(e) = completions.send(completion).await {
                error!(task_id = %e.0.task_id, "completion channel closed, task left in progress");
            }
        });

        Ok(launched)
    }
}

async fn execute(launcher: &dyn ProcessLauncher, plan: &CommandPlan) -> Result<(), ExecutionFailure> {
    match launcher.run(plan).await {
        Err(source) => Err(ExecutionFailure::CommandLaunchFailure {
            command: plan.command_line.clone(),
            source,
        }),
        Ok(exit) if exit.success => Ok(()),
        Ok(exit) => Err(ExecutionFailure::NonZeroExitFailure {
            command: plan.command_line.clone(),
            code: exit.code,
            stderr: exit.stderr,
        }),
    }
}
