use async_trait::async_trait;
use eyre::Result;
use std::net::IpAddr;
use std::time::Duration;

use crate::services::Service;
use crate::target::Target;

/// Open services found on one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostServices {
    pub address: IpAddr,
    pub services: Vec<Service>,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub target: Target,
    /// Only hosts with at least one open service
    pub hosts: Vec<HostServices>,
    pub duration: Duration,
}

impl ScanReport {
    pub fn services_for(&self, address: IpAddr) -> &[Service] {
        self.hosts
            .iter()
            .find(|h| h.address == address)
            .map(|h| h.services.as_slice())
            .unwrap_or(&[])
    }

    pub fn service_count(&self) -> usize {
        self.hosts.iter().map(|h| h.services.len()).sum()
    }
}

#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scanner identifier for logs
    fn name(&self) -> &'static str;

    /// Discover services on every host covered by `target`
    async fn scan(&self, target: &Target) -> Result<ScanReport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Transport;

    #[test]
    fn test_services_for_unknown_host_is_empty() {
        let report = ScanReport {
            target: Target::parse("10.0.0.0/30").unwrap(),
            hosts: vec![HostServices {
                address: "10.0.0.1".parse().unwrap(),
                services: vec![Service::new("ssh", 22, Transport::Tcp), Service::new("http", 80, Transport::Tcp)],
            }],
            duration: Duration::from_millis(5),
        };

        assert_eq!(report.services_for("10.0.0.1".parse().unwrap()).len(), 2);
        assert!(report.services_for("10.0.0.2".parse().unwrap()).is_empty());
        assert_eq!(report.service_count(), 2);
    }
}
