//! Per-exporter sampling rates learned from Options Data records.
//!
//! A sampled exporter tells the collector its packet sampling rate out of
//! band, through v9/IPFIX Options Data. Rates are scoped to the exporter:
//! two routers may reuse the same sampler ids with different meanings, and
//! mixing them corrupts traffic estimates. Within an exporter, rates can be
//! scoped further by a sampler id (flow sampler id, selector id); an options
//! record without one maintains the default entry `sampler_id = 0`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::templates::ExporterKey;

/// Mapping `(ExporterKey, sampler_id) -> sampling_rate`.
///
/// Lookups prefer the exact sampler id, fall back to the exporter default
/// (`sampler_id = 0`), and finally to 1 (unscaled). Updates take a short
/// per-exporter write lock; the outer map only locks when a new exporter
/// appears.
#[derive(Debug, Default)]
pub struct SamplingRegistry {
    exporters: RwLock<HashMap<ExporterKey, Arc<RwLock<HashMap<u64, u32>>>>>,
}

impl SamplingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a rate learned from an Options Data record.
    pub fn update(&self, key: ExporterKey, sampler_id: u64, rate: u32) {
        let rates = {
            let exporters = self.exporters.read();
            exporters.get(&key).cloned()
        };
        let rates = match rates {
            Some(rates) => rates,
            None => self
                .exporters
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
                .clone(),
        };
        rates.write().insert(sampler_id, rate);
        crate::metrics::record_sampling_table_size(self.len());
    }

    /// Effective sampling rate for a data record.
    pub fn lookup(&self, key: &ExporterKey, sampler_id: u64) -> u32 {
        let rates = {
            let exporters = self.exporters.read();
            exporters.get(key).cloned()
        };
        let Some(rates) = rates else {
            return 1;
        };
        let rates = rates.read();
        rates
            .get(&sampler_id)
            .or_else(|| rates.get(&0))
            .copied()
            .unwrap_or(1)
    }

    /// Total number of entries across all exporters.
    pub fn len(&self) -> usize {
        self.exporters
            .read()
            .values()
            .map(|rates| rates.read().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
