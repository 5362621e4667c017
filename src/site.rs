use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper;

/// One engine per site (the pgwire `database`). Each site has its own WAL,
/// sweeper and compactor, and shares nothing with the others.
pub struct SiteManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    sweep_interval: Duration,
}

impl SiteManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, sweep_interval: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            sweep_interval,
        }
    }

    /// Get or lazily open the engine for a site.
    pub fn get_or_create(&self, site: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(site) {
            return Ok(engine.value().clone());
        }
        if site.len() > MAX_SITE_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "site name too long"));
        }
        if self.engines.len() >= MAX_SITES {
            return Err(io::Error::other("too many sites"));
        }

        // File name only, no path components.
        let safe_name: String = site
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty site name"));
        }

        // Two connections may race to open the same site; the entry API
        // keeps a single engine (and a single writer on the WAL file).
        let engine = match self.engines.entry(site.to_string()) {
            dashmap::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
                slot.insert(engine.clone());
                engine
            }
        };
        tracing::info!("opened site {site}");

        tokio::spawn(sweeper::run_sweeper(engine.clone(), self.sweep_interval));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.compact_threshold));

        metrics::gauge!(crate::observability::SITES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
