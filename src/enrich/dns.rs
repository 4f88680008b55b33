//! Reverse DNS of exporters, cached and refreshed in the background.
//!
//! `get` never blocks on the resolver: a miss returns the empty string and
//! schedules an asynchronous resolution, so the first flows of a new
//! exporter go out unnamed and later ones carry the learned hostname. An
//! hourly sweep re-resolves every entry and overwrites only on a non-empty
//! result.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

/// Reverse lookup seam: the cache only ever calls this one function, so
/// tests can substitute a table and production wires in hickory.
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    /// PTR name for an address, or `None` when resolution fails.
    async fn lookup(&self, ip: IpAddr) -> Option<String>;
}

pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Resolver against the system configuration, falling back to defaults
    /// when none can be read.
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReverseResolver for HickoryResolver {
    async fn lookup(&self, ip: IpAddr) -> Option<String> {
        let response = self.inner.reverse_lookup(ip).await.ok()?;
        let name = response.iter().next()?;
        let mut hostname = name.0.to_utf8();
        if hostname.ends_with('.') {
            hostname.pop();
        }
        Some(hostname)
    }
}

/// Resolver that never answers. Used when reverse DNS is disabled and in
/// tests that must not touch the network.
pub struct NullResolver;

#[async_trait]
impl ReverseResolver for NullResolver {
    async fn lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

#[derive(Clone)]
pub struct DnsCache {
    entries: Arc<RwLock<HashMap<IpAddr, String>>>,
    resolver: Arc<dyn ReverseResolver>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn ReverseResolver>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            resolver,
        }
    }

    /// Cache that never resolves anything; `get` always returns empty.
    pub fn disconnected() -> Self {
        Self::new(Arc::new(NullResolver))
    }

    /// Hostname for an exporter. Never blocks: a miss schedules resolution
    /// and returns empty immediately. Racing calls for the same address
    /// schedule at most one resolution; resolving twice would be harmless
    /// anyway.
    pub fn get(&self, ip: IpAddr) -> String {
        {
            let entries = self.entries.read();
            if let Some(hostname) = entries.get(&ip) {
                return hostname.clone();
            }
        }

        let vacant = {
            let mut entries = self.entries.write();
            match entries.entry(ip) {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(String::new());
                    true
                }
                std::collections::hash_map::Entry::Occupied(_) => false,
            }
        };

        if vacant {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let entries = Arc::clone(&self.entries);
                let resolver = Arc::clone(&self.resolver);
                handle.spawn(async move {
                    resolve_into(entries, resolver, ip).await;
                });
            }
        }

        String::new()
    }

    /// Re-resolves every cached address, overwriting only on a non-empty
    /// result so a transient resolver failure never erases a learned name.
    pub async fn refresh(&self) {
        let addresses: Vec<IpAddr> = self.entries.read().keys().copied().collect();
        for ip in addresses {
            if let Some(hostname) = self.resolver.lookup(ip).await {
                if !hostname.is_empty() {
                    self.entries.write().insert(ip, hostname);
                }
            }
        }
    }

    /// Spawns the periodic refresh sweep.
    pub fn start_refresher(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick carries no work
            loop {
                ticker.tick().await;
                cache.refresh().await;
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

async fn resolve_into(
    entries: Arc<RwLock<HashMap<IpAddr, String>>>,
    resolver: Arc<dyn ReverseResolver>,
    ip: IpAddr,
) {
    if let Some(hostname) = resolver.lookup(ip).await {
        if !hostname.is_empty() {
            debug!(%ip, %hostname, "new sampler discovered");
            entries.write().insert(ip, hostname);
        }
    }
}
