use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use super::{scalar, summary::build_summary, xml::XmlFlattener, NmapSummary, ParseError};

/// Always decoded as sequences, even when they occur once.
pub const NMAP_ARRAY_ELEMENTS: &[&str] = &[
    "host",
    "address",
    "hostname",
    "port",
    "portused",
    "osmatch",
    "osclass",
    "cpe",
    "extraports",
    "extrareasons",
    "scaninfo",
];

const ROOT_ELEMENT: &str = "nmaprun";
/// Bytes of a rejected report kept on the error.
const CONTENT_EXCERPT: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NmapRun {
    #[serde(rename = "@scanner", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub scanner: Option<String>,
    #[serde(rename = "@args", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(rename = "@start", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(rename = "@startstr", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub start_str: Option<String>,
    #[serde(rename = "@version", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "@xmloutputversion", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub xml_output_version: Option<String>,
    #[serde(default)]
    pub scaninfo: Vec<ScanInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<Level>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debugging: Option<Level>,
    #[serde(rename = "host", default)]
    pub hosts: Vec<Host>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runstats: Option<RunStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    #[serde(rename = "@type", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub scan_type: Option<String>,
    #[serde(rename = "@protocol", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "@numservices", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub num_services: Option<u64>,
    #[serde(rename = "@services", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub services: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Level {
    #[serde(rename = "@level", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub level: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    #[serde(rename = "@starttime", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(rename = "@endtime", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    /// Set when `--host-timeout` expired; ports and os are then usually absent.
    #[serde(rename = "@timedout", default, deserialize_with = "scalar::opt_bool", skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<HostStatus>,
    #[serde(rename = "address", default)]
    pub addresses: Vec<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostnames: Option<Hostnames>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Ports>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Os>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<Distance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<Times>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    #[serde(rename = "@state", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(rename = "@reason", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "@reason_ttl", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub reason_ttl: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Ipv4,
    Ipv6,
    Mac,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(rename = "@addr", deserialize_with = "scalar::string")]
    pub addr: String,
    #[serde(rename = "@addrtype", default)]
    pub addr_type: AddressType,
    /// Only present on `mac` entries.
    #[serde(rename = "@vendor", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hostnames {
    #[serde(rename = "hostname", default)]
    pub hostnames: Vec<Hostname>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hostname {
    #[serde(rename = "@name", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "@type", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ports {
    /// Ports collapsed into one line per state ("997 closed ports").
    #[serde(rename = "extraports", default)]
    pub extra_ports: Vec<ExtraPorts>,
    #[serde(rename = "port", default)]
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraPorts {
    #[serde(rename = "@state", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(rename = "@count", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(rename = "extrareasons", default)]
    pub reasons: Vec<ExtraReasons>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraReasons {
    #[serde(rename = "@reason", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "@count", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(rename = "@proto", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(rename = "@ports", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    #[serde(rename = "@protocol", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "@portid", default, deserialize_with = "scalar::opt_u16", skip_serializing_if = "Option::is_none")]
    pub port_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PortState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortState {
    #[serde(rename = "@state", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(rename = "@reason", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "@reason_ttl", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub reason_ttl: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "@name", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "@method", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(rename = "@conf", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub conf: Option<u64>,
    #[serde(rename = "@product", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(rename = "@version", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "@extrainfo", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<String>,
    #[serde(default, deserialize_with = "scalar::text_list", skip_serializing_if = "Vec::is_empty")]
    pub cpe: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Os {
    #[serde(rename = "portused", default)]
    pub ports_used: Vec<PortUsed>,
    #[serde(rename = "osmatch", default)]
    pub matches: Vec<OsMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortUsed {
    #[serde(rename = "@state", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(rename = "@proto", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(rename = "@portid", default, deserialize_with = "scalar::opt_u16", skip_serializing_if = "Option::is_none")]
    pub port_id: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsMatch {
    #[serde(rename = "@name", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "@accuracy", default, deserialize_with = "scalar::opt_u32", skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<u32>,
    #[serde(rename = "@line", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(rename = "osclass", default)]
    pub classes: Vec<OsClass>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsClass {
    #[serde(rename = "@type", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(rename = "@vendor", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(rename = "@osfamily", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub os_family: Option<String>,
    #[serde(rename = "@osgen", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub os_gen: Option<String>,
    #[serde(rename = "@accuracy", default, deserialize_with = "scalar::opt_u32", skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<u32>,
    #[serde(default, deserialize_with = "scalar::text_list", skip_serializing_if = "Vec::is_empty")]
    pub cpe: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distance {
    #[serde(rename = "@value", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Times {
    #[serde(rename = "@srtt", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub srtt: Option<u64>,
    #[serde(rename = "@rttvar", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub rttvar: Option<u64>,
    #[serde(rename = "@to", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<Finished>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<HostCounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finished {
    #[serde(rename = "@time", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(rename = "@timestr", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub time_str: Option<String>,
    #[serde(rename = "@summary", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(rename = "@elapsed", default, deserialize_with = "scalar::opt_f64", skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(rename = "@exit", default, deserialize_with = "scalar::opt_string", skip_serializing_if = "Option::is_none")]
    pub exit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCounts {
    #[serde(rename = "@up", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub up: Option<u64>,
    #[serde(rename = "@down", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub down: Option<u64>,
    #[serde(rename = "@total", default, deserialize_with = "scalar::opt_u64", skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NmapReport {
    pub raw: NmapRun,
    pub summary: NmapSummary,
}

#[derive(Debug, Clone)]
pub struct NmapParser {
    flattener: XmlFlattener,
}

impl Default for NmapParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NmapParser {
    pub fn new() -> Self {
        Self {
            flattener: XmlFlattener::new(NMAP_ARRAY_ELEMENTS),
        }
    }

    pub fn decode(&self, xml: &str) -> Result<NmapRun, ParseError> {
        let mut tree = self
            .flattener
            .flatten(xml)
            .map_err(|e| ParseError::ParseFailure {
                reason: e.to_string(),
                content: excerpt(xml),
            })?;

        let root = match tree.get_mut(ROOT_ELEMENT).map(Value::take) {
            Some(root) => root,
            None => {
                return Err(ParseError::InvalidFormat(format!(
                    "missing {ROOT_ELEMENT} element"
                )))
            }
        };

        serde_json::from_value(root).map_err(|e| ParseError::ParseFailure {
            reason: e.to_string(),
            content: excerpt(xml),
        })
    }

    pub fn parse_str(&self, xml: &str) -> Option<NmapRun> {
        debug!("parsing nmap xml content");
        match self.decode(xml) {
            Ok(run) => {
                debug!(hosts = run.hosts.len(), "parsed nmap xml content");
                Some(run)
            }
            Err(e) => {
                error!(error = %e, content = e.content().unwrap_or_default(), "failed to parse nmap xml content");
                None
            }
        }
    }

    pub async fn parse_file(&self, path: &Path) -> Option<NmapRun> {
        debug!(path = %path.display(), "parsing nmap xml report");
        let xml = match tokio::fs::read_to_string(path).await {
            Ok(xml) => xml,
            Err(source) => {
                let e = ParseError::Io {
                    path: path.to_path_buf(),
                    source,
                };
                error!(error = %e, "failed to read nmap xml report");
                return None;
            }
        };
        match self.decode(&xml) {
            Ok(run) => {
                debug!(path = %path.display(), hosts = run.hosts.len(), "parsed nmap xml report");
                Some(run)
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    content = e.content().unwrap_or_default(),
                    "failed to parse nmap xml report"
                );
                None
            }
        }
    }

    pub async fn parse_file_with_summary(&self, path: &Path) -> Option<NmapReport> {
        let raw = self.parse_file(path).await?;
        let summary = build_summary(&raw);
        Some(NmapReport { raw, summary })
    }
}

fn excerpt(xml: &str) -> String {
    let mut end = xml.len().min(CONTENT_EXCERPT);
    while !xml.is_char_boundary(end) {
        end -= 1;
    }
    xml[..end].to_string()
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{fixtures, *};

    #[test]
    fn host_cardinality_never_changes_the_shape() {
        let parser = NmapParser::new();
        let one = parser.parse_str(&fixtures::hosts(1)).unwrap();
        let three = parser.parse_str(&fixtures::hosts(3)).unwrap();
        assert_eq!(one.hosts.len(), 1);
        assert_eq!(three.hosts.len(), 3);
        assert_eq!(one.hosts[0].addresses.len(), 1);
        assert_eq!(three.hosts[2].addresses[0].addr, "10.0.0.3");
    }

    #[test]
    fn missing_root_is_an_invalid_format() {
        let parser = NmapParser::new();
        let xml = r#"<scan><host><address addr="10.0.0.1" addrtype="ipv4"/></host></scan>"#;
        assert!(parser.parse_str(xml).is_none());
        assert!(matches!(
            parser.decode(xml),
            Err(ParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn malformed_xml_yields_none() {
        let parser = NmapParser::new();
        assert!(parser.parse_str("<nmaprun><host>").is_none());
        assert!(parser.parse_str("").is_none());
    }

    #[test]
    fn decode_failures_keep_the_rejected_content() {
        let parser = NmapParser::new();
        match parser.decode("<nmaprun><host>") {
            Err(e @ ParseError::ParseFailure { .. }) => {
                assert_eq!(e.content(), Some("<nmaprun><host>"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let big = format!("<nmaprun><host>{}", "é".repeat(CONTENT_EXCERPT));
        let err = parser.decode(&big).unwrap_err();
        let content = err.content().unwrap();
        assert!(content.len() <= CONTENT_EXCERPT);
        assert!(big.starts_with(content));
    }

    #[test]
    fn address_type_defaults_to_ipv4() {
        let xml = r#"<nmaprun><host><address addr="1.2.3.4"/></host></nmaprun>"#;
        let run = NmapParser::new().parse_str(xml).unwrap();
        assert_eq!(run.hosts[0].addresses[0].addr, "1.2.3.4");
        assert_eq!(run.hosts[0].addresses[0].addr_type, AddressType::Ipv4);
    }

    #[test]
    fn decodes_a_full_report() {
        let run = NmapParser::new().parse_str(fixtures::SCAN).unwrap();
        assert_eq!(run.scanner.as_deref(), Some("nmap"));
        assert_eq!(run.version.as_deref(), Some("7.94"));
        assert_eq!(run.start, Some(1718000000));
        assert_eq!(run.scaninfo.len(), 1);
        assert_eq!(run.scaninfo[0].services.as_deref(), Some("1-1000"));

        let host = &run.hosts[0];
        assert_eq!(host.status.as_ref().unwrap().state.as_deref(), Some("up"));
        assert_eq!(host.addresses[1].addr_type, AddressType::Mac);
        assert_eq!(host.addresses[1].vendor.as_deref(), Some("Acme Networks"));
        assert_eq!(
            host.hostnames.as_ref().unwrap().hostnames[0].name.as_deref(),
            Some("files.lan")
        );

        let ports = host.ports.as_ref().unwrap();
        assert_eq!(ports.ports.len(), 3);
        assert_eq!(ports.extra_ports[0].count, Some(997));
        assert_eq!(ports.extra_ports[0].reasons[0].ports.as_deref(), Some("1-21,23-79"));
        assert_eq!(ports.ports[2].service.as_ref().unwrap().cpe, vec!["cpe:/a:nginx:nginx"]);

        let os = host.os.as_ref().unwrap();
        assert_eq!(os.ports_used.len(), 2);
        assert_eq!(os.matches.len(), 2);
        assert_eq!(os.matches[0].classes.len(), 2);
        assert_eq!(os.matches[1].classes[0].cpe, vec!["cpe:/o:linux:linux_kernel:5"]);

        assert_eq!(host.distance.as_ref().unwrap().value, Some(1));
        assert_eq!(host.times.as_ref().unwrap().timeout, Some(100000));

        let finished = run.runstats.as_ref().unwrap().finished.as_ref().unwrap();
        assert_eq!(finished.elapsed, Some(30.12));
        assert_eq!(finished.exit.as_deref(), Some("success"));
    }

    #[test]
    fn non_canonical_versions_survive_as_text() {
        let run = NmapParser::new().parse_str(&fixtures::hosts(1)).unwrap();
        assert_eq!(run.version.as_deref(), Some("7.80"));
    }

    #[test]
    fn stored_reports_decode_back_to_the_same_tree() {
        let run = NmapParser::new().parse_str(fixtures::SCAN).unwrap();
        let stored = serde_json::to_string(&run).unwrap();
        let restored: NmapRun = serde_json::from_str(&stored).unwrap();
        assert_eq!(restored, run);
    }

    #[tokio::test]
    async fn parses_reports_from_disk_with_summary() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(fixtures::SCAN.as_bytes()).unwrap();

        let parser = NmapParser::new();
        let report = parser.parse_file_with_summary(file.path()).await.unwrap();
        assert_eq!(report.raw.hosts.len(), 1);
        assert_eq!(report.summary.hosts.len(), 1);

        assert!(parser
            .parse_file(Path::new("/nonexistent/nmap_x.xml"))
            .await
            .is_none());
    }
}
