//! Progress reporting for query batches.

use dashmap::DashMap;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Observer of batch progress.
///
/// `advance` is called exactly once per completed query (success or
/// failure), never per internal retry.
pub trait ProgressSink: Send + Sync {
    fn begin_source(&self, _source_id: &str, _iterations: u32) {}

    fn advance(&self, source_id: &str, n: u64);

    fn finish_source(&self, _source_id: &str) {}
}

/// Counts completed queries, overall and per source.
#[derive(Debug, Default)]
pub struct QueryCounter {
    total: AtomicU64,
    per_source: DashMap<String, u64>,
}

impl QueryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn for_source(&self, source_id: &str) -> u64 {
        self.per_source.get(source_id).map_or(0, |c| *c)
    }
}

impl ProgressSink for QueryCounter {
    fn advance(&self, source_id: &str, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        *self.per_source.entry(source_id.to_string()).or_insert(0) += n;
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Terminal progress bars: one for the whole batch, one per active source.
pub struct BatchProgress {
    multi: MultiProgress,
    overall: ProgressBar,
    sources: DashMap<String, ProgressBar>,
}

impl BatchProgress {
    pub fn new(total_queries: u64) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(total_queries));
        overall.set_style(bar_style(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
        ));
        overall.set_message("queries");
        Self {
            multi,
            overall,
            sources: DashMap::new(),
        }
    }

    pub fn finish(&self) {
        self.overall.finish_with_message("done");
    }
}

impl ProgressSink for BatchProgress {
    fn begin_source(&self, source_id: &str, iterations: u32) {
        let bar = self.multi.add(ProgressBar::new(iterations as u64));
        bar.set_style(bar_style("  {bar:30.green/white} {pos}/{len} {msg}"));
        bar.set_message(source_id.to_string());
        self.sources.insert(source_id.to_string(), bar);
    }

    fn advance(&self, source_id: &str, n: u64) {
        self.overall.inc(n);
        if let Some(bar) = self.sources.get(source_id) {
            bar.inc(n);
        }
    }

    fn finish_source(&self, source_id: &str) {
        if let Some((_, bar)) = self.sources.remove(source_id) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
    }
}

/// Cooperative cancellation flag, checked between sources.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = QueryCounter::new();
        counter.advance("a", 1);
        counter.advance("a", 1);
        counter.advance("b", 3);
        assert_eq!(counter.total(), 5);
        assert_eq!(counter.for_source("a"), 2);
        assert_eq!(counter.for_source("missing"), 0);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_batch_progress_tracks_sources() {
        let progress = BatchProgress::new(4);
        progress.begin_source("a", 2);
        progress.advance("a", 2);
        progress.finish_source("a");
        progress.advance("unknown", 1);
        assert_eq!(progress.overall.position(), 3);
        assert!(progress.sources.is_empty());
        progress.finish();
    }
}
