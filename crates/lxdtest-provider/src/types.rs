//! Common types for hypervisor adapters

use crate::{ProviderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Container name wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerName(pub String);

impl ContainerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Container status as reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Unknown,
    Stopped,
    Running,
    Other(String),
}

impl ContainerStatus {
    /// Case-insensitive substring match on "running".
    ///
    /// Transitional states and unrecognised values count as not running.
    pub fn indicates_running(&self) -> bool {
        match self {
            Self::Running => true,
            Self::Other(raw) => raw.to_lowercase().contains("running"),
            Self::Unknown | Self::Stopped => false,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Other(raw) => write!(f, "{}", raw),
        }
    }
}

impl From<&str> for ContainerStatus {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "" | "unknown" => Self::Unknown,
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Other(s.trim().to_string()),
        }
    }
}

/// Interface type from the network section of a container state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    Loopback,
    Other(String),
}

impl From<&str> for InterfaceKind {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("loopback") {
            Self::Loopback
        } else {
            Self::Other(s.to_string())
        }
    }
}

/// Address family of an interface address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(String),
}

impl From<&str> for AddressFamily {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "inet" => Self::Inet,
            "inet6" => Self::Inet6,
            _ => Self::Other(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub family: AddressFamily,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub kind: InterfaceKind,
    pub addresses: Vec<InterfaceAddress>,
}

/// Snapshot of one container as the hypervisor sees it.
///
/// Never cached: callers re-fetch to observe transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    pub status: ContainerStatus,
    /// Interfaces in the order the hypervisor enumerated them
    pub interfaces: Vec<NetworkInterface>,
}

impl ContainerRecord {
    /// First IPv4 address on a non-loopback interface.
    ///
    /// Interfaces and addresses are visited in enumeration order; an
    /// interface without any IPv4 address is skipped.
    pub fn first_ipv4_address(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .filter(|iface| iface.kind != InterfaceKind::Loopback)
            .flat_map(|iface| iface.addresses.iter())
            .find(|addr| addr.family == AddressFamily::Inet)
            .map(|addr| addr.address.as_str())
    }
}

/// Everything needed for one `launch` call
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub ephemeral: bool,
    pub profiles: Vec<String>,
    pub config: BTreeMap<String, String>,
}

/// Ownership and mode applied to a pushed file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePushOptions {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Octal mode string, e.g. "0644"
    pub mode: Option<String>,
}

/// Result of a single command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// Raw shapes of `lxc list --format json` and the REST state endpoint.

#[derive(Debug, Deserialize)]
struct RawContainer {
    name: String,
    #[serde(default)]
    state: Option<RawState>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawState {
    #[serde(default)]
    pub(crate) status: Option<String>,
    #[serde(default)]
    network: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawInterface {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    addresses: Vec<RawAddress>,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
    #[serde(default)]
    family: String,
    #[serde(default)]
    address: String,
}

impl RawState {
    fn interfaces(&self) -> Result<Vec<NetworkInterface>> {
        let Some(network) = &self.network else {
            return Ok(Vec::new());
        };

        network
            .iter()
            .map(|(name, value)| {
                let raw: RawInterface = serde_json::from_value(value.clone()).map_err(|e| {
                    ProviderError::Parse(format!("interface {}: {}", name, e))
                })?;
                Ok(NetworkInterface {
                    name: name.clone(),
                    kind: InterfaceKind::from(raw.kind.as_str()),
                    addresses: raw
                        .addresses
                        .into_iter()
                        .map(|a| InterfaceAddress {
                            family: AddressFamily::from(a.family.as_str()),
                            address: a.address,
                        })
                        .collect(),
                })
            })
            .collect()
    }
}

/// Parse the JSON array printed by `lxc list --format json`
pub fn parse_list_output(output: &str) -> Result<Vec<ContainerRecord>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawContainer> = serde_json::from_str(trimmed)?;
    raw.into_iter()
        .map(|c| {
            let state = c.state.unwrap_or_default();
            let status = state
                .status
                .as_deref()
                .or(c.status.as_deref())
                .map(ContainerStatus::from)
                .unwrap_or(ContainerStatus::Unknown);
            Ok(ContainerRecord {
                interfaces: state.interfaces()?,
                name: c.name,
                status,
            })
        })
        .collect()
}

/// Parse the `metadata` of `GET /1.0/containers/<name>/state`
pub(crate) fn parse_state(name: &str, metadata: serde_json::Value) -> Result<ContainerRecord> {
    let state: RawState = serde_json::from_value(metadata)?;
    Ok(ContainerRecord {
        name: name.to_string(),
        status: state
            .status
            .as_deref()
            .map(ContainerStatus::from)
            .unwrap_or(ContainerStatus::Unknown),
        interfaces: state.interfaces()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_OUTPUT: &str = r#"[
      {
        "name": "default-ubuntu-1604",
        "status": "Running",
        "state": {
          "status": "Running",
          "status_code": 103,
          "network": {
            "eth0": {
              "type": "broadcast",
              "addresses": [
                {"family": "inet6", "address": "fd42:1::5", "netmask": "64"},
                {"family": "inet", "address": "10.0.0.5", "netmask": "24"}
              ]
            },
            "lo": {
              "type": "loopback",
              "addresses": [{"family": "inet", "address": "127.0.0.1"}]
            }
          }
        }
      }
    ]"#;

    #[test]
    fn test_parse_list_output() {
        let records = parse_list_output(LIST_OUTPUT).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.name, "default-ubuntu-1604");
        assert_eq!(record.status, ContainerStatus::Running);
        assert_eq!(record.interfaces.len(), 2);
        assert_eq!(record.interfaces[0].name, "eth0");
        assert_eq!(record.interfaces[1].kind, InterfaceKind::Loopback);
    }

    #[test]
    fn test_first_ipv4_skips_loopback_and_inet6() {
        let records = parse_list_output(LIST_OUTPUT).unwrap();
        assert_eq!(records[0].first_ipv4_address(), Some("10.0.0.5"));
    }

    #[test]
    fn test_first_ipv4_keeps_enumeration_order() {
        let output = r#"[{"name": "c", "state": {"status": "Running", "network": {
            "lo": {"type": "loopback", "addresses": [{"family": "inet", "address": "127.0.0.1"}]},
            "veth1": {"type": "broadcast", "addresses": [{"family": "inet", "address": "10.1.1.1"}]},
            "eth0": {"type": "broadcast", "addresses": [{"family": "inet", "address": "10.0.0.9"}]}
        }}}]"#;
        let records = parse_list_output(output).unwrap();
        assert_eq!(records[0].interfaces[1].name, "veth1");
        assert_eq!(records[0].first_ipv4_address(), Some("10.1.1.1"));
    }

    #[test]
    fn test_first_ipv4_absent() {
        let output = r#"[{"name": "c", "state": {"status": "Running", "network": {
            "lo": {"type": "loopback", "addresses": [{"family": "inet", "address": "127.0.0.1"}]},
            "eth0": {"type": "broadcast", "addresses": [{"family": "inet6", "address": "fe80::1"}]}
        }}}]"#;
        let records = parse_list_output(output).unwrap();
        assert_eq!(records[0].first_ipv4_address(), None);
    }

    #[test]
    fn test_parse_list_empty_output() {
        assert!(parse_list_output("").unwrap().is_empty());
        assert!(parse_list_output("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_list_stopped_without_network() {
        let output = r#"[{"name": "c", "status": "Stopped", "state": {"status": "Stopped", "network": null}}]"#;
        let records = parse_list_output(output).unwrap();
        assert_eq!(records[0].status, ContainerStatus::Stopped);
        assert!(records[0].interfaces.is_empty());
    }

    #[test]
    fn test_parse_list_missing_state_uses_top_level_status() {
        let output = r#"[{"name": "c", "status": "Frozen", "state": null}]"#;
        let records = parse_list_output(output).unwrap();
        assert_eq!(records[0].status, ContainerStatus::Other("Frozen".into()));
    }

    #[test]
    fn test_parse_list_invalid_json() {
        assert!(parse_list_output("not json").is_err());
    }

    #[test]
    fn test_status_matching() {
        assert!(ContainerStatus::from("RUNNING").indicates_running());
        assert!(ContainerStatus::from("Running").indicates_running());
        assert!(!ContainerStatus::from("Stopped").indicates_running());
        assert!(!ContainerStatus::from("Starting").indicates_running());
        assert!(!ContainerStatus::from("").indicates_running());
        assert_eq!(ContainerStatus::from("Frozen").to_string(), "Frozen");
    }
}
