pub mod port;

pub use port::PortScanner;

use crate::config::AgentConfig;
use crate::services::ServiceCatalog;
use eyre::Result;

/// Catalog from the configured services file, or the built-in one
pub fn load_catalog(config: &AgentConfig) -> Result<ServiceCatalog> {
    match &config.services_file {
        Some(path) => ServiceCatalog::from_file(path),
        None => Ok(ServiceCatalog::default()),
    }
}

pub fn create_default_scanner(config: &AgentConfig) -> Result<PortScanner> {
    let catalog = load_catalog(config)?;
    Ok(PortScanner::new(catalog)
        .with_timeout(config.connect_timeout())
        .with_concurrency(config.max_concurrent))
}
