//! Port specification parsing
//!
//! Service definitions carry ports as `"host:container[/proto]"` strings;
//! a bare `"port"` means exposed-only with no host binding. Malformed
//! entries are rejected before any platform call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error for malformed port specifications
#[derive(Error, Debug, PartialEq)]
#[error("Invalid port spec '{0}'")]
pub struct InvalidPortSpec(pub String);

/// Transport protocol of a port binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A parsed port specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Host port to bind; None means exposed-only
    pub host_port: Option<u16>,

    /// Port inside the container/workload
    pub container_port: u16,

    pub protocol: Protocol,
}

impl PortSpec {
    /// Parse a `"host:container[/proto]"` or `"container[/proto]"` string
    pub fn parse(spec: &str) -> Result<Self, InvalidPortSpec> {
        let malformed = || InvalidPortSpec(spec.to_string());

        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, proto)) => {
                let protocol = match proto {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    _ => return Err(malformed()),
                };
                (ports, protocol)
            }
            None => (spec, Protocol::Tcp),
        };

        match ports.split_once(':') {
            Some((host, container)) => {
                let host_port = host.parse::<u16>().map_err(|_| malformed())?;
                let container_port = container.parse::<u16>().map_err(|_| malformed())?;
                Ok(Self {
                    host_port: Some(host_port),
                    container_port,
                    protocol,
                })
            }
            None => {
                let container_port = ports.parse::<u16>().map_err(|_| malformed())?;
                Ok(Self {
                    host_port: None,
                    container_port,
                    protocol,
                })
            }
        }
    }

    /// Parse a whole list, failing on the first malformed entry
    pub fn parse_all(specs: &[String]) -> Result<Vec<Self>, InvalidPortSpec> {
        specs.iter().map(|s| Self::parse(s)).collect()
    }

    /// Container-side key in the engine's `"port/proto"` format
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol.as_str())
    }
}
