use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Extraction metrics collector
pub struct ExtractMetrics {
    /// Entries handled, by outcome (written, linked, skipped, failed)
    pub entries_total: IntCounterVec,
    /// Output ranges fully processed
    pub ranges_total: IntCounter,
    /// Decompressed bytes written to layer directories
    pub bytes_total: IntCounter,
    /// Checkpoint signals released
    pub checkpoints_total: IntCounter,
    /// Wall time of a full extraction pass in seconds
    pub extraction_duration: Histogram,
}

impl ExtractMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let entries_total = IntCounterVec::new(
            Opts::new("deltabox_extract_entries_total", "Entries handled by the extractor"),
            &["outcome"],
        )?;

        let ranges_total =
            IntCounter::new("deltabox_extract_ranges_total", "Output ranges fully processed")?;

        let bytes_total =
            IntCounter::new("deltabox_extract_bytes_total", "Decompressed bytes written")?;

        let checkpoints_total =
            IntCounter::new("deltabox_checkpoints_released_total", "Checkpoint signals released")?;

        let extraction_duration = Histogram::with_opts(HistogramOpts::new(
            "deltabox_extraction_duration_seconds",
            "Duration of a full extraction pass in seconds",
        ))?;

        registry.register(Box::new(entries_total.clone()))?;
        registry.register(Box::new(ranges_total.clone()))?;
        registry.register(Box::new(bytes_total.clone()))?;
        registry.register(Box::new(checkpoints_total.clone()))?;
        registry.register(Box::new(extraction_duration.clone()))?;

        Ok(Self { entries_total, ranges_total, bytes_total, checkpoints_total, extraction_duration })
    }

    pub fn record_entry(&self, outcome: &str) {
        self.entries_total.with_label_values(&[outcome]).inc();
    }
}
