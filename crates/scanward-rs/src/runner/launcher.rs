use std::{io, path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use super::command::{CommandPlan, OutputMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub success: bool,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stderr: String,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// `Err` means the process never started.
    async fn run(&self, plan: &CommandPlan) -> io::Result<ProcessExit>;

    /// Whether `privilege_command` lets the current user run `executable`
    /// without a password prompt.
    async fn can_escalate(&self, privilege_command: &str, executable: &Path) -> io::Result<bool>;
}

pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn run(&self, plan: &CommandPlan) -> io::Result<ProcessExit> {
        let mut command = Command::new(&plan.program);
        command.args(&plan.args).stdin(Stdio::null());

        match plan.output {
            OutputMode::ToolFlag => {
                command.stdout(Stdio::null()).stderr(Stdio::piped());
            }
            OutputMode::Redirect => {
                let log = tokio::fs::File::create(&plan.log_file_path)
                    .await?
                    .into_std()
                    .await;
                command
                    .stdout(Stdio::from(log.try_clone()?))
                    .stderr(Stdio::from(log));
            }
        }

        let out = command.spawn()?.wait_with_output().await?;
        Ok(ProcessExit {
            success: out.status.success(),
            code: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }

    async fn can_escalate(&self, privilege_command: &str, executable: &Path) -> io::Result<bool> {
        let status = Command::new(privilege_command)
            .args(["-n", "-l", "--"])
            .arg(executable)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanKind;

    fn plan(dir: &Path, program: &str, args: &[&str], output: OutputMode) -> CommandPlan {
        CommandPlan {
            kind: ScanKind::Diy,
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            log_file_path: dir.join("out.log"),
            output,
            command_line: String::new(),
        }
    }

    #[tokio::test]
    async fn redirect_merges_stdout_and_stderr_into_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(
            dir.path(),
            "sh",
            &["-c", "echo out; echo err >&2"],
            OutputMode::Redirect,
        );
        let exit = TokioLauncher.run(&plan).await.unwrap();
        assert!(exit.success);
        let log = std::fs::read_to_string(&plan.log_file_path).unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err"));
    }

    #[tokio::test]
    async fn tool_flag_mode_captures_stderr_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(
            dir.path(),
            "sh",
            &["-c", "echo boom >&2; exit 3"],
            OutputMode::ToolFlag,
        );
        let exit = TokioLauncher.run(&plan).await.unwrap();
        assert!(!exit.success);
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.stderr, "boom");
    }

    #[tokio::test]
    async fn missing_programs_fail_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(
            dir.path(),
            "/definitely/not/a/real/binary",
            &[],
            OutputMode::ToolFlag,
        );
        assert!(TokioLauncher.run(&plan).await.is_err());
    }
}
