use std::{
    env,
    path::{Path, PathBuf},
};

use tracing::info;

use super::launcher::ProcessLauncher;
use crate::config::{AppConfig, Toolchain};

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("unsupported platform {os}/{arch}: only linux x86_64 is supported")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("{tool} executable not found at path: {}", .path.display())]
    ExecutableNotFound { tool: &'static str, path: PathBuf },

    #[error(
        "{privilege} cannot run {tool} ({}) without a password: {reason}. Add a sudoers entry such as `{hint}`",
        .path.display()
    )]
    PrivilegeCheckFailed {
        tool: &'static str,
        path: PathBuf,
        privilege: String,
        reason: String,
        hint: String,
    },

    #[error("cannot prepare log directory {}: {source}", .path.display())]
    LogDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn ensure_supported_platform() -> Result<(), PreflightError> {
    check_platform(env::consts::OS, env::consts::ARCH)
}

fn check_platform(os: &str, arch: &str) -> Result<(), PreflightError> {
    if os == "linux" && arch == "x86_64" {
        Ok(())
    } else {
        Err(PreflightError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        })
    }
}

fn resolve_executable(tool: &'static str, raw: &Path) -> Result<PathBuf, PreflightError> {
    let not_found = || PreflightError::ExecutableNotFound {
        tool,
        path: raw.to_path_buf(),
    };
    if !raw.exists() {
        return Err(not_found());
    }
    raw.canonicalize().map_err(|_| not_found())
}

/// Validates the configured tool paths and freezes them into a [`Toolchain`].
pub fn resolve_toolchain(cfg: &AppConfig) -> Result<Toolchain, PreflightError> {
    let fscan_path = resolve_executable("fscan", &cfg.fscan_path)?;
    let nmap_path = resolve_executable("nmap", &cfg.nmap_path)?;
    info!(fscan = %fscan_path.display(), nmap = %nmap_path.display(), "tool paths resolved");

    Ok(Toolchain {
        fscan_path,
        nmap_path,
        log_dir: cfg.log_dir.clone(),
        privilege_command: cfg.privilege_command.clone(),
        fscan_threads: cfg.fscan_threads,
        nmap_timeout_secs: cfg.nmap_timeout_secs,
        nmap_speed: cfg.nmap_speed,
    })
}

pub async fn verify_privileges(
    toolchain: &Toolchain,
    launcher: &dyn ProcessLauncher,
) -> Result<(), PreflightError> {
    let privilege = toolchain.privilege_command.as_str();
    for (tool, path) in [("nmap", &toolchain.nmap_path), ("fscan", &toolchain.fscan_path)] {
        let reason = match launcher.can_escalate(privilege, path).await {
            Ok(true) => continue,
            Ok(false) => "a password would be required".to_string(),
            Err(e) => e.to_string(),
        };
        let user = env::var("USER").unwrap_or_else(|_| "<user>".to_string());
        return Err(PreflightError::PrivilegeCheckFailed {
            tool,
            path: path.clone(),
            privilege: privilege.to_string(),
            reason,
            hint: format!("{user} ALL=(ALL) NOPASSWD: {}", path.display()),
        });
    }
    info!(privilege, "passwordless privilege check passed for nmap and fscan");
    Ok(())
}

pub async fn prepare_log_dir(dir: &Path) -> Result<(), PreflightError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| PreflightError::LogDirectory {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::launcher::testing::{FakeExit, FakeLauncher};

    fn config_with_tools(dir: &Path) -> AppConfig {
        let fscan = dir.join("fscan");
        let nmap = dir.join("nmap");
        std::fs::write(&fscan, "").unwrap();
        std::fs::write(&nmap, "").unwrap();
        AppConfig {
            fscan_path: fscan,
            nmap_path: nmap,
            log_dir: dir.join("log"),
            ..AppConfig::default()
        }
    }

    #[test]
    fn only_linux_x86_64_is_supported() {
        assert!(check_platform("linux", "x86_64").is_ok());
        assert!(matches!(
            check_platform("macos", "aarch64"),
            Err(PreflightError::UnsupportedPlatform { .. })
        ));
        assert!(check_platform("linux", "aarch64").is_err());
    }

    #[test]
    fn missing_executables_name_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_with_tools(dir.path());
        cfg.nmap_path = dir.path().join("nowhere/nmap");

        let err = resolve_toolchain(&cfg).unwrap_err();
        assert!(matches!(err, PreflightError::ExecutableNotFound { tool: "nmap", .. }));
        assert!(err.to_string().contains("nowhere/nmap"));
    }

    #[test]
    fn resolved_paths_are_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_with_tools(dir.path());
        cfg.fscan_path = dir.path().join("log/../fscan");
        std::fs::create_dir_all(dir.path().join("log")).unwrap();

        let toolchain = resolve_toolchain(&cfg).unwrap();
        assert_eq!(
            toolchain.fscan_path,
            dir.path().join("fscan").canonicalize().unwrap()
        );
        assert_eq!(toolchain.fscan_threads, cfg.fscan_threads);
    }

    #[tokio::test]
    async fn privilege_failures_carry_a_sudoers_hint() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = resolve_toolchain(&config_with_tools(dir.path())).unwrap();

        let launcher = FakeLauncher::exiting(FakeExit::Code(0)).unprivileged();
        let err = verify_privileges(&toolchain, &launcher).await.unwrap_err();
        match err {
            PreflightError::PrivilegeCheckFailed { tool, hint, .. } => {
                assert_eq!(tool, "nmap");
                assert!(hint.contains("NOPASSWD"));
                assert!(hint.ends_with(&toolchain.nmap_path.display().to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }

        let launcher = FakeLauncher::exiting(FakeExit::Code(0));
        verify_privileges(&toolchain, &launcher).await.unwrap();
    }

    #[tokio::test]
    async fn log_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("a/b/log");
        prepare_log_dir(&log_dir).await.unwrap();
        assert!(log_dir.is_dir());

        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        assert!(matches!(
            prepare_log_dir(&blocker.join("log")).await,
            Err(PreflightError::LogDirectory { .. })
        ));
    }
}
