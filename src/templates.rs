//! Per-exporter template store for NetFlow v9 and IPFIX.
//!
//! Template IDs are only unique within one exporter (RFC 3954 §5.2,
//! RFC 7011 §3.4.1): different routers can and do use the same template ID
//! with completely different schemas, and a single router can run several
//! observation domains. The cache is therefore keyed by [`ExporterKey`] —
//! remote address plus observation domain — and data records are decoded
//! against the templates of their own exporter only.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::RwLock;
use serde::Serialize;

/// Field length marking an IPFIX variable-length field whose actual length
/// is read inline from the record (RFC 7011 §7).
pub const VARIABLE_FIELD_LENGTH: u16 = 0xFFFF;

const BUCKETS: usize = 16;

/// Identity of a flow source as observed on the wire.
///
/// The observation domain is the v9 "Source ID" / IPFIX "Observation Domain
/// ID" (a `u32`); NetFlow v5 and sFlow have no such field and use zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExporterKey {
    pub addr: IpAddr,
    pub observation_domain: u32,
}

impl ExporterKey {
    pub fn new(addr: IpAddr, observation_domain: u32) -> Self {
        Self {
            addr,
            observation_domain,
        }
    }

    /// Key for protocols without an observation domain (v5, sFlow).
    pub fn legacy(addr: IpAddr) -> Self {
        Self {
            addr,
            observation_domain: 0,
        }
    }
}

impl fmt::Display for ExporterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.observation_domain)
    }
}

/// One field specifier of a template record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TemplateField {
    /// IPFIX enterprise number when the enterprise bit was set.
    pub enterprise_number: Option<u32>,
    pub field_type: u16,
    pub field_length: u16,
}

impl TemplateField {
    pub fn new(field_type: u16, field_length: u16) -> Self {
        Self {
            enterprise_number: None,
            field_type,
            field_length,
        }
    }

    pub fn enterprise(enterprise_number: u32, field_type: u16, field_length: u16) -> Self {
        Self {
            enterprise_number: Some(enterprise_number),
            field_type,
            field_length,
        }
    }

    pub fn is_variable_length(&self) -> bool {
        self.field_length == VARIABLE_FIELD_LENGTH
    }
}

/// A v9/IPFIX descriptor of a data record layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub template_id: u16,
    pub is_options_template: bool,
    /// Scope field specifiers; empty for data templates.
    pub scope_fields: Vec<TemplateField>,
    pub fields: Vec<TemplateField>,
}

impl Template {
    pub fn data(template_id: u16, fields: Vec<TemplateField>) -> Self {
        Self {
            template_id,
            is_options_template: false,
            scope_fields: Vec::new(),
            fields,
        }
    }

    pub fn options(
        template_id: u16,
        scope_fields: Vec<TemplateField>,
        fields: Vec<TemplateField>,
    ) -> Self {
        Self {
            template_id,
            is_options_template: true,
            scope_fields,
            fields,
        }
    }

    /// Byte length of one record, or `None` if any field is variable-length.
    pub fn fixed_record_length(&self) -> Option<usize> {
        let mut total = 0usize;
        for field in self.scope_fields.iter().chain(self.fields.iter()) {
            if field.is_variable_length() {
                return None;
            }
            total += field.field_length as usize;
        }
        Some(total)
    }
}

/// Counters for template cache behaviour, readable without taking the
/// bucket locks.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub insertions: AtomicU64,
    pub replacements: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub replacements: u64,
}

impl CacheMetrics {
    fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
        }
    }
}

type ExporterTemplates = LruCache<u16, Arc<Template>>;

/// Thread-safe mapping `ExporterKey -> (template_id -> Template)`.
///
/// Buckets of exporters each sit behind their own `RwLock`; data decoding
/// takes read locks, Template Set parsing takes the write lock of one
/// bucket. Templates live for the process lifetime unless a per-exporter
/// cap evicts the least recently inserted one.
pub struct TemplateCache {
    buckets: Vec<RwLock<HashMap<ExporterKey, ExporterTemplates>>>,
    per_exporter_cap: Option<NonZeroUsize>,
    metrics: CacheMetrics,
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateCache {
    /// Cache without a per-exporter size cap.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Cache evicting beyond `cap` templates per exporter.
    pub fn with_capacity(cap: NonZeroUsize) -> Self {
        Self::build(Some(cap))
    }

    fn build(per_exporter_cap: Option<NonZeroUsize>) -> Self {
        let mut buckets = Vec::with_capacity(BUCKETS);
        for _ in 0..BUCKETS {
            buckets.push(RwLock::new(HashMap::new()));
        }
        Self {
            buckets,
            per_exporter_cap,
            metrics: CacheMetrics::default(),
        }
    }

    fn bucket(&self, key: &ExporterKey) -> &RwLock<HashMap<ExporterKey, ExporterTemplates>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % BUCKETS]
    }

    fn new_exporter_templates(&self) -> ExporterTemplates {
        match self.per_exporter_cap {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        }
    }

    /// Looks up a template. Counts a hit or a miss either way.
    pub fn get(&self, key: &ExporterKey, template_id: u16) -> Option<Arc<Template>> {
        let bucket = self.bucket(key).read();
        let found = bucket
            .get(key)
            .and_then(|templates| templates.peek(&template_id).cloned());
        match found {
            Some(template) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_template_lookup(true);
                Some(template)
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_template_lookup(false);
                None
            }
        }
    }

    /// Inserts or replaces a template. Returns `true` when a template with
    /// the same id already existed and was replaced (exporters re-issue).
    pub fn insert(&self, key: ExporterKey, template: Template) -> bool {
        let template_id = template.template_id;
        let mut bucket = self.bucket(&key).write();
        let templates = bucket
            .entry(key)
            .or_insert_with(|| self.new_exporter_templates());
        let replaced = templates.put(template_id, Arc::new(template)).is_some();
        self.metrics.insertions.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.metrics.replacements.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    /// Number of exporters with at least one cached template.
    pub fn exporter_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    /// Total number of cached templates across all exporters.
    pub fn template_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.read().values().map(|t| t.len()).sum::<usize>())
            .sum()
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}
