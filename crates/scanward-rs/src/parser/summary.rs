use serde::{Deserialize, Serialize};

use super::nmap::{AddressType, Host, NmapRun, OsMatch, Port};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NmapSummary {
    pub scanner: String,
    pub version: Option<String>,
    pub started_at: Option<String>,
    pub args: Option<String>,
    pub hosts: Vec<HostSummary>,
    pub runstats: RunStatsSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSummary {
    pub ipv4: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub status: Option<String>,
    pub open_ports: Vec<OpenPort>,
    pub os_matches: Vec<OsMatchSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPort {
    pub protocol: String,
    pub port: u16,
    pub service: Option<String>,
    pub reason: Option<String>,
    pub reason_ttl: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsMatchSummary {
    pub name: Option<String>,
    pub accuracy: u32,
    pub classes: Vec<OsClassSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsClassSummary {
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub vendor: Option<String>,
    pub family: Option<String>,
    pub gen: Option<String>,
    pub cpe: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatsSummary {
    pub summary: Option<String>,
    pub elapsed: Option<f64>,
    pub exit: Option<String>,
    pub up: Option<u64>,
    pub down: Option<u64>,
    pub total: Option<u64>,
}

/// Projects a parsed run onto the fields most callers need. Pure: the same
/// tree always yields the same summary.
pub fn build_summary(run: &NmapRun) -> NmapSummary {
    let finished = run.runstats.as_ref().and_then(|r| r.finished.as_ref());
    let counts = run.runstats.as_ref().and_then(|r| r.hosts.as_ref());

    NmapSummary {
        scanner: run.scanner.clone().unwrap_or_else(|| "nmap".to_string()),
        version: run.version.clone(),
        started_at: run.start_str.clone(),
        args: run.args.clone(),
        hosts: run.hosts.iter().map(summarize_host).collect(),
        runstats: RunStatsSummary {
            summary: finished.and_then(|f| f.summary.clone()),
            elapsed: finished.and_then(|f| f.elapsed),
            exit: finished.and_then(|f| f.exit.clone()),
            up: counts.and_then(|c| c.up),
            down: counts.and_then(|c| c.down),
            total: counts.and_then(|c| c.total),
        },
    }
}

fn summarize_host(host: &Host) -> HostSummary {
    let ipv4 = host
        .addresses
        .iter()
        .find(|a| a.addr_type == AddressType::Ipv4);
    let mac = host
        .addresses
        .iter()
        .find(|a| a.addr_type == AddressType::Mac);

    let open_ports = host
        .ports
        .iter()
        .flat_map(|p| p.ports.iter())
        .filter(|p| is_open(p))
        .map(|p| {
            let state = p.state.as_ref();
            OpenPort {
                protocol: p.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
                port: p.port_id.unwrap_or(0),
                service: p.service.as_ref().and_then(|s| s.name.clone()),
                reason: state.and_then(|s| s.reason.clone()),
                reason_ttl: state.and_then(|s| s.reason_ttl),
            }
        })
        .collect();

    let mut os_matches: Vec<OsMatchSummary> = host
        .os
        .iter()
        .flat_map(|os| os.matches.iter())
        .map(summarize_os_match)
        .collect();
    // Stable, so equal accuracies keep report order.
    os_matches.sort_by(|a, b| b.accuracy.cmp(&a.accuracy));

    HostSummary {
        ipv4: ipv4.map(|a| a.addr.clone()),
        mac: mac.map(|a| a.addr.clone()),
        vendor: mac.and_then(|a| a.vendor.clone()),
        status: host.status.as_ref().and_then(|s| s.state.clone()),
        open_ports,
        os_matches,
    }
}

fn is_open(port: &Port) -> bool {
    port.state
        .as_ref()
        .and_then(|s| s.state.as_deref())
        .is_some_and(|state| state == "open")
}

fn summarize_os_match(m: &OsMatch) -> OsMatchSummary {
    OsMatchSummary {
        name: m.name.clone(),
        accuracy: m.accuracy.unwrap_or(0),
        classes: m
            .classes
            .iter()
            .map(|c| OsClassSummary {
                device_type: c.device_type.clone(),
                vendor: c.vendor.clone(),
                family: c.os_family.clone(),
                gen: c.os_gen.clone(),
                cpe: c.cpe.clone(),
            })
            .collect(),
    }
}
