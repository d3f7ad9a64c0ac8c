//! Efficiency and purity accounting over a simulated run.

use helixtrack_core::{TrackResult, V0Candidate};
use serde::{Deserialize, Serialize};

use crate::event::GeneratedEvent;

/// Aggregated counters over all processed events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub events: usize,
    /// Seeds handed to the tracker
    pub seeds: usize,
    /// Seeds whose truth left enough clusters to be findable
    pub findable: usize,
    pub reconstructed: usize,
    pub fakes: usize,
    pub clusters_committed: usize,
    pub v0_generated: usize,
    pub v0_found: usize,
    pub v0_good: usize,
}

impl RunReport {
    pub fn record(
        &mut self,
        event: &GeneratedEvent,
        results: &[TrackResult],
        v0s: &[V0Candidate],
        min_clusters: usize,
    ) {
        self.events += 1;
        self.seeds += event.seeds.len();
        self.findable += event
            .truths
            .iter()
            .filter(|t| t.hit_layers.len() >= min_clusters)
            .count();
        self.reconstructed += results.iter().filter(|r| r.reconstructed).count();
        self.fakes += results.iter().filter(|r| r.fake == Some(true)).count();
        self.clusters_committed += results.iter().map(|r| r.clusters.len()).sum::<usize>();
        self.v0_generated += event.n_v0_generated;
        self.v0_found += v0s.len();
        self.v0_good += v0s.iter().filter(|v| v.good).count();
    }

    /// Reconstructed tracks over findable truths.
    pub fn efficiency(&self) -> f64 {
        if self.findable == 0 {
            return 0.0;
        }
        self.reconstructed as f64 / self.findable as f64
    }

    /// Fake-flagged tracks over all reconstructed.
    pub fn fake_rate(&self) -> f64 {
        if self.reconstructed == 0 {
            return 0.0;
        }
        self.fakes as f64 / self.reconstructed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::GeneratedEvent;

    fn empty_event() -> GeneratedEvent {
        GeneratedEvent {
            streams: vec![Vec::new(); 6],
            seeds: Vec::new(),
            truths: Vec::new(),
            n_v0_generated: 0,
        }
    }

    #[test]
    fn test_empty_run_has_zero_rates() {
        let mut report = RunReport::default();
        report.record(&empty_event(), &[], &[], 4);
        assert_eq!(report.events, 1);
        assert_eq!(report.efficiency(), 0.0);
        assert_eq!(report.fake_rate(), 0.0);
    }
}
