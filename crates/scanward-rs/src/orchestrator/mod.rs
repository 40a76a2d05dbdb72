use std::sync::Arc;

use crate::{
    ledger::{LedgerError, TaskLedger},
    models::{
        generate_task_id, LaunchedTask, NmapScanSpeed, ScanRequest, Task, TaskResults, TaskStatus,
    },
    runner::CommandRunner,
};

#[derive(Clone)]
pub struct TaskOrchestrator {
    ledger: Arc<dyn TaskLedger>,
    runner: Arc<CommandRunner>,
}

impl TaskOrchestrator {
    pub fn new(ledger: Arc<dyn TaskLedger>, runner: Arc<CommandRunner>) -> Self {
        Self { ledger, runner }
    }

    pub async fn submit(
        &self,
        request: ScanRequest,
        comment: &str,
    ) -> Result<LaunchedTask, LedgerError> {
        let task_id = generate_task_id();
        let plan = self.runner.plan(&request, &task_id);
        self.ledger
            .create(
                &task_id,
                &plan.command_line,
                &plan.log_file_path.display().to_string(),
                comment,
            )
            .await?;
        self.runner.launch(&task_id, plan).await
    }

    pub async fn run_fscan(
        &self,
        target: &str,
        threads: Option<u32>,
    ) -> Result<LaunchedTask, LedgerError> {
        let request = ScanRequest::Fscan {
            target: target.to_string(),
            threads,
        };
        self.submit(request, "run_predefined_fscan").await
    }

    pub async fn run_nmap(
        &self,
        target: &str,
        timeout_secs: Option<u64>,
        ports: Vec<u16>,
        speed: Option<NmapScanSpeed>,
    ) -> Result<LaunchedTask, LedgerError> {
        let request = ScanRequest::Nmap {
            target: target.to_string(),
            timeout_secs,
            ports,
            speed,
        };
        self.submit(request, "run_predefined_nmap").await
    }

    pub async fn run_diy(&self, command: &str) -> Result<LaunchedTask, LedgerError> {
        let request = ScanRequest::Diy {
            command: command.to_string(),
        };
        self.submit(request, "run_diy_command").await
    }

    pub async fn status(&self, task_id: &str) -> Result<Option<TaskStatus>, LedgerError> {
        self.ledger.get_status(task_id).await
    }

    pub async fn task(&self, task_id: &str) -> Result<Option<Task>, LedgerError> {
        self.ledger.get_task(task_id).await
    }

    pub async fn results(&self, task_id: &str) -> Result<Option<TaskResults>, LedgerError> {
        self.ledger.get_results(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::{
        config::Toolchain,
        jobs::completion_loop,
        ledger::MemoryLedger,
        runner::testing::{FakeExit, FakeLauncher},
    };

    struct Harness {
        _dir: tempfile::TempDir,
        launcher: Arc<FakeLauncher>,
        orchestrator: TaskOrchestrator,
    }

    async fn harness(launcher: FakeLauncher) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Toolchain {
            fscan_path: "/opt/fscan".into(),
            nmap_path: "/opt/nmap".into(),
            log_dir: dir.path().join("log"),
            privilege_command: "sudo".to_string(),
            fscan_threads: 200,
            nmap_timeout_secs: 90,
            nmap_speed: NmapScanSpeed::Aggressive,
        };
        let ledger = Arc::new(MemoryLedger::new());
        let launcher = Arc::new(launcher);
        let (runner, rx) = CommandRunner::new(Arc::new(toolchain), ledger.clone(), launcher.clone())
            .await
            .unwrap();
        tokio::spawn(completion_loop(ledger.clone(), rx));

        Harness {
            _dir: dir,
            launcher,
            orchestrator: TaskOrchestrator::new(ledger, Arc::new(runner)),
        }
    }

    async fn wait_for_terminal(orchestrator: &TaskOrchestrator, task_id: &str) -> TaskStatus {
        for _ in 0..200 {
            if let Some(status) = orchestrator.status(task_id).await.unwrap() {
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never finished");
    }

    #[tokio::test]
    async fn submitted_tasks_record_their_command() {
        let gate = Arc::new(Notify::new());
        let h = harness(FakeLauncher::writing("").gated(gate.clone())).await;

        let launched = h
            .orchestrator
            .run_fscan("192.168.1.0/24", Some(50))
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.status(&launched.task_id).await.unwrap(),
            Some(TaskStatus::InProgress)
        );

        let task = h.orchestrator.task(&launched.task_id).await.unwrap().unwrap();
        assert_eq!(task.comment, "run_predefined_fscan");
        assert_eq!(task.command, launched.command);
        assert!(task.command.starts_with("sudo -n /opt/fscan -h 192.168.1.0/24 -t 50 "));
        assert!(task
            .log_file_path
            .ends_with(&format!("fscan_{}.json", launched.task_id)));

        gate.notify_one();
        assert_eq!(
            wait_for_terminal(&h.orchestrator, &launched.task_id).await,
            TaskStatus::Completed
        );
        let runs = h.launcher.runs.lock().unwrap().clone();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].command_line, task.command);
    }

    #[tokio::test]
    async fn tasks_run_to_completion() {
        let h = harness(FakeLauncher::writing("hello from the shell\n")).await;

        let launched = h.orchestrator.run_diy("echo hello").await.unwrap();
        assert_eq!(
            wait_for_terminal(&h.orchestrator, &launched.task_id).await,
            TaskStatus::Completed
        );
        assert_eq!(
            h.orchestrator.results(&launched.task_id).await.unwrap(),
            Some(TaskResults::Log {
                text: "hello from the shell\n".to_string(),
                truncated: false,
            })
        );
    }

    #[tokio::test]
    async fn failing_tools_leave_no_results() {
        let h = harness(FakeLauncher::exiting(FakeExit::Code(1))).await;

        let launched = h
            .orchestrator
            .run_nmap("10.0.0.5", None, vec![22, 80], None)
            .await
            .unwrap();
        assert_eq!(
            wait_for_terminal(&h.orchestrator, &launched.task_id).await,
            TaskStatus::Failed
        );
        assert_eq!(h.orchestrator.results(&launched.task_id).await.unwrap(), None);

        let task = h.orchestrator.task(&launched.task_id).await.unwrap().unwrap();
        assert_eq!(task.comment, "run_predefined_nmap");
        assert!(task.command.contains("-p 22,80 -T4"));
    }

    #[tokio::test]
    async fn each_submission_gets_a_fresh_id() {
        let h = harness(FakeLauncher::writing("")).await;
        let a = h.orchestrator.run_diy("true").await.unwrap();
        let b = h.orchestrator.run_diy("true").await.unwrap();
        assert_ne!(a.task_id, b.task_id);
    }

    #[tokio::test]
    async fn unknown_tasks_have_no_status() {
        let h = harness(FakeLauncher::writing("")).await;
        assert_eq!(h.orchestrator.status("nope").await.unwrap(), None);
        assert_eq!(h.orchestrator.results("nope").await.unwrap(), None);
        assert_eq!(h.orchestrator.task("nope").await.unwrap(), None);
    }
}
