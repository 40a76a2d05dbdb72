use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::NmapScanSpeed;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub fscan_path: PathBuf,
    pub nmap_path: PathBuf,
    pub log_dir: PathBuf,
    pub privilege_command: String,
    pub fscan_threads: u32,
    pub nmap_timeout_secs: u64,
    pub nmap_speed: NmapScanSpeed,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SCANWARD_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SW_HOST") {
            self.host = v;
        }
        if let Some(v) = var("PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("SW_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("FSCAN_PATH_LINUX") {
            self.fscan_path = v.into();
        }
        if let Some(v) = var("NMAP_PATH_LINUX") {
            self.nmap_path = v.into();
        }
        if let Some(v) = var("SW_LOG_DIR") {
            self.log_dir = v.into();
        }
        if let Some(v) = var("SW_PRIVILEGE_COMMAND") {
            self.privilege_command = v;
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_url: "sqlite://scanward.db?mode=rwc".to_string(),
            fscan_path: "/usr/local/bin/fscan".into(),
            nmap_path: "/usr/local/bin/nmap".into(),
            log_dir: "./log".into(),
            privilege_command: "sudo".to_string(),
            fscan_threads: 200,
            nmap_timeout_secs: 90,
            nmap_speed: NmapScanSpeed::Aggressive,
        }
    }
}

/// Tool locations and defaults after startup validation. Built once, shared
/// read-only; executable paths are canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub fscan_path: PathBuf,
    pub nmap_path: PathBuf,
    pub log_dir: PathBuf,
    pub privilege_command: String,
    pub fscan_threads: u32,
    pub nmap_timeout_secs: u64,
    pub nmap_speed: NmapScanSpeed,
}
