use std::{collections::BTreeMap, path::Path};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use super::{scalar, ParseError, ParseOutcome};

// `-f json` writes objects back to back with no delimiter.
static EVENT_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\}\s*\{").expect("static regex is valid"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FscanEvent {
    #[serde(rename = "HOST")]
    Host(HostEvent),
    #[serde(rename = "PORT")]
    Port(PortEvent),
    #[serde(rename = "SERVICE")]
    Service(ServiceEvent),
    #[serde(other)]
    Unknown,
}

impl FscanEvent {
    pub fn target(&self) -> Option<&str> {
        match self {
            FscanEvent::Host(e) => Some(&e.target),
            FscanEvent::Port(e) => Some(&e.target),
            FscanEvent::Service(e) => Some(&e.target),
            FscanEvent::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    pub time: String,
    pub target: String,
    pub status: String,
    pub details: HostDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDetails {
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortEvent {
    pub time: String,
    pub target: String,
    pub status: String,
    pub details: PortDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDetails {
    #[serde(deserialize_with = "scalar::port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub time: String,
    pub target: String,
    pub status: String,
    #[serde(default)]
    pub details: ServiceDetails,
}

// Each fingerprint plugin fills a different subset of these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDetails {
    #[serde(rename = "Url", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(
        default,
        deserialize_with = "scalar::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub length: Option<String>,
    /// fscan writes this as a string for some plugins and a number for others.
    #[serde(
        default,
        deserialize_with = "scalar::opt_u16",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(
        default,
        deserialize_with = "scalar::opt_u16",
        skip_serializing_if = "Option::is_none"
    )]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstation_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,
    /// Keys not modelled above (`fingerprints`, plugin specific extras).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub async fn parse_fscan_log(path: &Path) -> ParseOutcome<Vec<FscanEvent>> {
    debug!(path = %path.display(), "parsing fscan log");
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_fscan_str(&content),
        Err(source) => {
            error!(path = %path.display(), error = %source, "failed to read fscan log");
            ParseOutcome::failed(
                Vec::new(),
                ParseError::Io {
                    path: path.to_path_buf(),
                    source,
                },
            )
        }
    }
}

pub fn parse_fscan_str(content: &str) -> ParseOutcome<Vec<FscanEvent>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return ParseOutcome::clean(Vec::new());
    }

    let joined = format!("[{}]", EVENT_BOUNDARY.replace_all(trimmed, "},{"));
    match serde_json::from_str::<Vec<FscanEvent>>(&joined) {
        Ok(events) => ParseOutcome::clean(events),
        Err(e) => {
            error!(error = %e, content = %joined, "failed to decode fscan event stream");
            ParseOutcome::failed(
                Vec::new(),
                ParseError::ParseFailure {
                    reason: e.to_string(),
                    content: joined,
                },
            )
        }
    }
}
