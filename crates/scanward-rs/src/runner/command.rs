use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

use crate::{
    config::Toolchain,
    models::{ScanKind, ScanRequest},
};

const ALL_PORTS: &str = "1-65535";

/// How the process output reaches the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The tool writes the log itself (`-o`, `-oX`).
    ToolFlag,
    /// stdout and stderr are merged into the log by the launcher.
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub kind: ScanKind,
    pub program: String,
    pub args: Vec<String>,
    pub log_file_path: PathBuf,
    pub output: OutputMode,
    /// Shell rendering of the invocation, stored on the task for audit.
    pub command_line: String,
}

pub fn log_file_path(log_dir: &Path, kind: ScanKind, task_id: &str) -> PathBuf {
    log_dir.join(format!("{}_{task_id}.{}", kind.as_str(), kind.log_extension()))
}

pub fn plan(toolchain: &Toolchain, request: &ScanRequest, task_id: &str) -> CommandPlan {
    let kind = request.kind();
    let log = log_file_path(&toolchain.log_dir, kind, task_id);
    let log_arg = log.display().to_string();

    let (args, output) = match request {
        ScanRequest::Fscan { target, threads } => {
            let threads = threads.unwrap_or(toolchain.fscan_threads);
            let args = vec![
                "-n".to_string(),
                toolchain.fscan_path.display().to_string(),
                "-h".to_string(),
                target.clone(),
                "-t".to_string(),
                threads.to_string(),
                "-fingerprint".to_string(),
                "-log".to_string(),
                "ALL".to_string(),
                "-nopoc".to_string(),
                "-nobr".to_string(),
                "-f".to_string(),
                "json".to_string(),
                "-o".to_string(),
                log_arg.clone(),
            ];
            (args, OutputMode::ToolFlag)
        }
        ScanRequest::Nmap {
            target,
            timeout_secs,
            ports,
            speed,
        } => {
            let timeout = timeout_secs.unwrap_or(toolchain.nmap_timeout_secs);
            let speed = speed.unwrap_or(toolchain.nmap_speed);
            let ports = if ports.is_empty() {
                ALL_PORTS.to_string()
            } else {
                ports
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            };
            let args = vec![
                "-n".to_string(),
                toolchain.nmap_path.display().to_string(),
                "-n".to_string(),
                target.clone(),
                "--host-timeout".to_string(),
                format!("{timeout}s"),
                "-O".to_string(),
                "--osscan-guess".to_string(),
                "-sS".to_string(),
                "-p".to_string(),
                ports,
                format!("-T{}", speed.level()),
                "-oX".to_string(),
                log_arg.clone(),
            ];
            (args, OutputMode::ToolFlag)
        }
        ScanRequest::Diy { command } => {
            let args = vec![
                "-n".to_string(),
                "bash".to_string(),
                "-c".to_string(),
                command.clone(),
            ];
            (args, OutputMode::Redirect)
        }
    };

    let mut command_line = std::iter::once(toolchain.privilege_command.as_str())
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ");
    if output == OutputMode::Redirect {
        command_line.push_str(&format!(" > {} 2>&1", shell_quote(&log_arg)));
    }

    CommandPlan {
        kind,
        program: toolchain.privilege_command.clone(),
        args,
        log_file_path: log,
        output,
        command_line,
    }
}

fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:,=@%+".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}
