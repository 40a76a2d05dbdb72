use std::{collections::HashSet, path::Path, sync::Arc};

use tokio::{io::AsyncReadExt, sync::mpsc};
use tracing::{error, info, warn};

use crate::{
    ledger::{LedgerError, TaskLedger},
    models::{ScanKind, TaskResults, TaskStatus},
    parser::{parse_fscan_log, FscanEvent, NmapParser},
    runner::Completion,
};

/// Free-form command output kept on the task, in bytes.
pub const LOG_RESULT_LIMIT: u64 = 1024 * 1024;

/// Settles finished processes in the ledger: failures become `FAILED`,
/// successes have their log parsed and stored as `COMPLETED`.
pub struct CompletionHandler {
    ledger: Arc<dyn TaskLedger>,
    nmap: NmapParser,
}

impl CompletionHandler {
    pub fn new(ledger: Arc<dyn TaskLedger>) -> Self {
        Self {
            ledger,
            nmap: NmapParser::new(),
        }
    }

    pub async fn handle(&self, completion: Completion) -> Result<TaskStatus, LedgerError> {
        let task_id = completion.task_id.as_str();
        if let Some(status) = self.ledger.get_status(task_id).await? {
            if status.is_terminal() {
                warn!(task_id, %status, "ignoring completion for a settled task");
                return Ok(status);
            }
        }
        if let Err(e) = &completion.outcome {
            error!(task_id, error = %e, "task failed");
            self.ledger.transition(task_id, TaskStatus::Failed).await?;
            return Ok(TaskStatus::Failed);
        }

        let results = self.collect(completion.kind, &completion.log_file_path).await;
        self.ledger.submit_results(task_id, results).await?;
        info!(task_id, kind = completion.kind.as_str(), "task completed");
        Ok(TaskStatus::Completed)
    }

    /// A log that cannot be normalized still completes the task, with
    /// [`TaskResults::Empty`]: the tool itself succeeded.
    async fn collect(&self, kind: ScanKind, log: &Path) -> TaskResults {
        match kind {
            ScanKind::Fscan => {
                let outcome = parse_fscan_log(log).await;
                match outcome.failure {
                    None => {
                        let targets: HashSet<&str> =
                            outcome.value.iter().filter_map(FscanEvent::target).collect();
                        info!(
                            events = outcome.value.len(),
                            targets = targets.len(),
                            "fscan log parsed"
                        );
                        TaskResults::Fscan(outcome.value)
                    }
                    Some(e) => {
                        warn!(log = %log.display(), error = %e, "fscan log could not be parsed");
                        TaskResults::Empty
                    }
                }
            }
            ScanKind::Nmap => match self.nmap.parse_file_with_summary(log).await {
                Some(report) => TaskResults::Nmap(Box::new(report)),
                None => TaskResults::Empty,
            },
            ScanKind::Diy => match read_log_capped(log, LOG_RESULT_LIMIT).await {
                Ok((text, truncated)) => TaskResults::Log { text, truncated },
                Err(e) => {
                    warn!(log = %log.display(), error = %e, "command log could not be read");
                    TaskResults::Empty
                }
            },
        }
    }
}

async fn read_log_capped(path: &Path, limit: u64) -> std::io::Result<(String, bool)> {
    let file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::new();
    // One byte past the limit tells us whether anything was cut.
    file.take(limit + 1).read_to_end(&mut buf).await?;
    let truncated = buf.len() as u64 > limit;
    if truncated {
        buf.truncate(limit as usize);
    }
    Ok((String::from_utf8_lossy(&buf).into_owned(), truncated))
}

pub async fn completion_loop(ledger: Arc<dyn TaskLedger>, mut rx: mpsc::Receiver<Completion>) {
    let handler = CompletionHandler::new(ledger);
    while let Some(completion) = rx.recv().await {
        let task_id = completion.task_id.clone();
        if let Err(e) = handler.handle(completion).await {
            error!(error = %e, task_id = %task_id, "failed to record task completion");
        }
    }
    info!("completion channel closed");
}
