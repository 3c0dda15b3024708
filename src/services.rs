//! Service catalog: which ports map to which service names.
//!
//! The file format is one service per line, `name port/proto`, e.g.
//! `https 443/tcp`. Blank lines and lines starting with `#` are skipped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use eyre::{Result, WrapErr};

use crate::error::CatalogError;

pub const DEFAULT_SERVICES: &str = "\
# name port/proto
ftp 21/tcp
ssh 22/tcp
telnet 23/tcp
smtp 25/tcp
http 80/tcp
https 443/tcp
smb 445/tcp
mysql 3306/tcp
rdp 3389/tcp
postgresql 5432/tcp
vnc 5900/tcp
vnc 5901/tcp
http 8000/tcp
http 8080/tcp
https 8443/tcp
";

const WEB_SCHEMES: [&str; 2] = ["http", "https"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl FromStr for Transport {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            _ => Err(()),
        }
    }
}

/// A service discovered on (or expected at) a port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub port: u16,
    pub transport: Transport,
}

impl Service {
    pub fn new(name: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            name: name.into(),
            port,
            transport,
        }
    }

    pub fn is_web(&self) -> bool {
        WEB_SCHEMES.contains(&self.name.as_str())
    }

    pub fn is_remote_desktop(&self) -> bool {
        self.name == "vnc"
    }

    /// `scheme://host`, with IPv6 hosts bracketed
    pub fn url_for(&self, host: IpAddr) -> String {
        match host {
            IpAddr::V4(v4) => format!("{}://{}", self.name, v4),
            IpAddr::V6(v6) => format!("{}://[{}]", self.name, v6),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.name, self.port, self.transport.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: Vec<Service>,
}

impl Default for ServiceCatalog {
    fn default() -> Self {
        // the built-in table is covered by tests
        Self::parse(DEFAULT_SERVICES).unwrap_or_else(|_| Self { services: Vec::new() })
    }
}

impl ServiceCatalog {
    pub fn parse(text: &str) -> std::result::Result<Self, CatalogError> {
        let mut services = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let invalid = |reason: &'static str| CatalogError {
                line: idx + 1,
                content: line.to_string(),
                reason,
            };

            let mut fields = line.split_whitespace();
            let name = fields.next().ok_or_else(|| invalid("missing service name"))?;
            let port_proto = fields.next().ok_or_else(|| invalid("missing port/proto"))?;
            if fields.next().is_some() {
                return Err(invalid("service names cannot contain spaces"));
            }

            let (port, proto) = port_proto.split_once('/').ok_or_else(|| invalid("expected port/proto"))?;
            let port = port.parse::<u16>().map_err(|_| invalid("port must be within 0-65535"))?;
            let transport = proto.parse::<Transport>().map_err(|_| invalid("protocol must be tcp or udp"))?;

            services.push(Service::new(name.to_ascii_lowercase(), port, transport));
        }

        log::debug!("[services] parse: services={}", services.len());
        Ok(Self { services })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read services file {}", path.display()))?;
        Self::parse(&text).wrap_err_with(|| format!("Invalid services file {}", path.display()))
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn lookup(&self, port: u16, transport: Transport) -> Option<&Service> {
        self.services.iter().find(|s| s.port == port && s.transport == transport)
    }

    /// Distinct TCP ports, ascending
    pub fn tcp_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .services
            .iter()
            .filter(|s| s.transport == Transport::Tcp)
            .map(|s| s.port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}
