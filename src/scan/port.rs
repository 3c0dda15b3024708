use crate::scanner::{HostServices, ScanReport, Scanner};
use crate::services::{Service, ServiceCatalog, Transport};
use crate::target::Target;
use async_trait::async_trait;
use eyre::Result;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1500;
const DEFAULT_MAX_CONCURRENT: usize = 50;
const MAX_SWEEP_HOSTS: u128 = 65536;

/// TCP connect scanner over the ports of a service catalog
#[derive(Debug, Clone)]
pub struct PortScanner {
    catalog: ServiceCatalog,
    tcp_timeout: Duration,
    max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PortState {
    Open,
    Closed,
    Filtered,
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new(ServiceCatalog::default())
    }
}

impl PortScanner {
    pub fn new(catalog: ServiceCatalog) -> Self {
        log::debug!("[scan::port] new: ports={} timeout={}ms concurrency={}",
            catalog.tcp_ports().len(), DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_CONCURRENT);
        Self {
            catalog,
            tcp_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    async fn probe(&self, ip: IpAddr, port: u16) -> (IpAddr, u16, PortState) {
        let socket_addr = SocketAddr::new(ip, port);
        let state = match timeout(self.tcp_timeout, TcpStream::connect(socket_addr)).await {
            Ok(Ok(_stream)) => PortState::Open,
            Ok(Err(_)) => PortState::Closed, // Connection refused
            Err(_) => PortState::Filtered,   // Timed out
        };
        (ip, port, state)
    }

    fn service_for(&self, port: u16) -> Service {
        self.catalog
            .lookup(port, Transport::Tcp)
            .cloned()
            .unwrap_or_else(|| Service::new("unknown", port, Transport::Tcp))
    }
}

#[async_trait]
impl Scanner for PortScanner {
    fn name(&self) -> &'static str {
        "port"
    }

    async fn scan(&self, target: &Target) -> Result<ScanReport> {
        let network = target.as_network();
        let address_bits: u8 = if network.is_ipv4() { 32 } else { 128 };
        let host_count = 1u128
            .checked_shl(u32::from(address_bits - network.prefix()))
            .unwrap_or(u128::MAX);
        if host_count > MAX_SWEEP_HOSTS {
            eyre::bail!("Refusing to sweep {} ({} hosts, limit {})", target, host_count, MAX_SWEEP_HOSTS);
        }

        let ports = self.catalog.tcp_ports();
        log::debug!("[scan::port] scan: target={} hosts={} ports={}", target, host_count, ports.len());

        let started = Instant::now();
        let probes = target
            .hosts()
            .flat_map(|ip| ports.clone().into_iter().map(move |port| (ip, port)))
            .collect::<Vec<_>>();

        let results = stream::iter(probes)
            .map(|(ip, port)| self.probe(ip, port))
            .buffer_unordered(self.max_concurrent)
            .collect::<Vec<_>>()
            .await;

        let mut open: BTreeMap<IpAddr, Vec<u16>> = BTreeMap::new();
        let mut closed = 0usize;
        let mut filtered = 0usize;
        for (ip, port, state) in results {
            match state {
                PortState::Open => open.entry(ip).or_default().push(port),
                PortState::Closed => closed += 1,
                PortState::Filtered => filtered += 1,
            }
        }

        let hosts = open
            .into_iter()
            .map(|(address, mut ports)| {
                ports.sort_unstable();
                HostServices {
                    address,
                    services: ports.into_iter().map(|port| self.service_for(port)).collect(),
                }
            })
            .collect::<Vec<_>>();

        let duration = started.elapsed();
        log::debug!("[scan::port] scan_completed: target={} duration={}ms hosts_up={} closed={} filtered={}",
            target, duration.as_millis(), hosts.len(), closed, filtered);

        Ok(ScanReport {
            target: *target,
            hosts,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_port_scanner_creation() {
        let scanner = PortScanner::default()
            .with_timeout(Duration::from_millis(200))
            .with_concurrency(0);
        assert_eq!(scanner.name(), "port");
        assert_eq!(scanner.tcp_timeout, Duration::from_millis(200));
        assert_eq!(scanner.max_concurrent, 1);
    }

    #[test]
    fn test_unknown_port_gets_placeholder_name() {
        let scanner = PortScanner::default();
        assert_eq!(scanner.service_for(443).name, "https");
        assert_eq!(scanner.service_for(31337).name, "unknown");
    }

    #[tokio::test]
    async fn test_scan_finds_listening_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        let closed_port = {
            let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            tmp.local_addr().unwrap().port()
        };

        let catalog = ServiceCatalog::parse(&format!("http {}/tcp\nssh {}/tcp\n", open_port, closed_port)).unwrap();
        let scanner = PortScanner::new(catalog).with_timeout(Duration::from_secs(2));
        let target = Target::parse("127.0.0.1").unwrap();

        let report = scanner.scan(&target).await.unwrap();
        let services = report.services_for("127.0.0.1".parse().unwrap());
        assert_eq!(services, &[Service::new("http", open_port, Transport::Tcp)]);
    }

    #[tokio::test]
    async fn test_refuses_huge_sweeps() {
        let scanner = PortScanner::default();
        let target = Target::parse("10.0.0.0/8").unwrap();
        assert!(scanner.scan(&target).await.is_err());
    }
}
