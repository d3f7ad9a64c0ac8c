//! Event-level orchestration: cluster ingestion, the two-pass seed loop,
//! hypothesis selection, conflict resolution, result write-back and the V0
//! pass.
//!
//! Processing is single-threaded and batch-per-event: clusters and seeds are
//! fully materialized before the search starts, and an event with zero
//! reconstructable tracks is a valid, silent outcome.

use nalgebra::Vector3;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterRecord, ClusterRef};
use crate::config::{MaterialConfig, TrackerConfig, V0Config};
use crate::geometry::Geometry;
use crate::hypothesis::{
    fake_fraction, normalized_chi2, resolve_conflicts, select_best, FinalTrack, HypothesisSet,
    Refitter,
};
use crate::layer::LayerIndex;
use crate::material::MaterialBudget;
use crate::prolongation::{ProlongationSearch, SearchContext};
use crate::track::TrackState;
use crate::v0::{Daughter, V0Candidate, V0Finder};

/// Fatal input problems. Per-record inconsistencies are never fatal; they
/// are skipped with a diagnostic.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("expected {expected} per-layer cluster streams, got {got}")]
    LayerCountMismatch { expected: usize, got: usize },
}

/// An externally supplied starting track to be extended inward.
#[derive(Debug, Clone)]
pub struct Seed {
    /// State at the seed's reference plane, outside the barrel
    pub state: TrackState,
    /// Identity tag from the seeding detector, -1 if unknown
    pub label: i32,
}

/// Per-seed write-back after an event.
#[derive(Debug, Clone)]
pub struct TrackResult {
    pub seed_index: u32,
    /// Refit state at the seed's reference plane, present when reconstructed
    pub state: Option<TrackState>,
    /// Committed clusters, outermost first
    pub clusters: Vec<ClusterRef>,
    /// Accumulated chi-square of the winning chain
    pub chi2: f64,
    pub reconstructed: bool,
    /// Provenance verdict against the seed's identity tag, when resolvable
    pub fake: Option<bool>,
}

impl TrackResult {
    fn unreconstructed(seed_index: u32) -> Self {
        Self {
            seed_index,
            state: None,
            clusters: Vec::new(),
            chi2: 0.0,
            reconstructed: false,
            fake: None,
        }
    }

    /// Attached clusters in the packed integer format of the external
    /// storage boundary.
    pub fn packed_cluster_ids(&self) -> Vec<u32> {
        self.clusters.iter().map(|r| r.pack()).collect()
    }
}

/// Outcome of one cluster load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSummary {
    pub loaded: usize,
    pub skipped: usize,
}

/// Outcome of one tracking pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindSummary {
    pub reconstructed: usize,
    pub fakes: usize,
}

impl FindSummary {
    pub fn from_results(results: &[TrackResult]) -> Self {
        Self {
            reconstructed: results.iter().filter(|r| r.reconstructed).count(),
            fakes: results.iter().filter(|r| r.fake == Some(true)).count(),
        }
    }
}

/// The track finder for one detector configuration.
pub struct Tracker {
    geometry: Geometry,
    material: MaterialBudget,
    layers: Vec<LayerIndex>,
    config: TrackerConfig,
    v0_config: V0Config,
    sets: Vec<HypothesisSet>,
    finals: Vec<FinalTrack>,
}

impl Tracker {
    pub fn new(
        geometry: Geometry,
        material_config: &MaterialConfig,
        config: TrackerConfig,
        v0_config: V0Config,
    ) -> Self {
        let material = MaterialBudget::new(material_config, &geometry);
        let layers = geometry
            .layers
            .iter()
            .enumerate()
            .map(|(i, l)| LayerIndex::new(i as u8, l.radius, l.n_segments))
            .collect();
        Self {
            geometry,
            material,
            layers,
            config,
            v0_config,
            sets: Vec::new(),
            finals: Vec::new(),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn layers(&self) -> &[LayerIndex] {
        &self.layers
    }

    /// Load one event's clusters, one stream per layer. Malformed records
    /// are skipped with a diagnostic; only a stream-count mismatch is fatal.
    pub fn load_clusters(
        &mut self,
        streams: &[Vec<ClusterRecord>],
    ) -> Result<LoadSummary, TrackerError> {
        if streams.len() != self.geometry.n_layers() {
            return Err(TrackerError::LayerCountMismatch {
                expected: self.geometry.n_layers(),
                got: streams.len(),
            });
        }
        self.sets.clear();
        self.finals.clear();
        self.material.clear_cache();

        let mut summary = LoadSummary::default();
        for (layer, stream) in streams.iter().enumerate() {
            let lgeo = &self.geometry.layers[layer];
            let mut clusters = Vec::with_capacity(stream.len());
            for rec in stream {
                if !Self::record_is_sane(rec, lgeo.n_segments) {
                    warn!(layer, segment = rec.segment, "skipping malformed cluster record");
                    summary.skipped += 1;
                    continue;
                }
                let phi = (lgeo.segment_phi(rec.segment as usize)
                    + (rec.y / lgeo.radius).atan())
                .rem_euclid(std::f64::consts::TAU);
                let arc = lgeo.radius * phi;
                clusters.push(Cluster::from_record(rec, layer as u8, arc));
                summary.loaded += 1;
            }
            self.layers[layer].load(clusters);
        }
        debug!(loaded = summary.loaded, skipped = summary.skipped, "clusters loaded");
        Ok(summary)
    }

    fn record_is_sane(rec: &ClusterRecord, n_segments: usize) -> bool {
        rec.y.is_finite()
            && rec.z.is_finite()
            && rec.sigma_y2 > 0.0
            && rec.sigma_z2 > 0.0
            && (rec.segment as usize) < n_segments
            && rec.charge >= 0.0
    }

    /// Run the full per-event tracking: two search passes, best-track
    /// selection, conflict resolution and write-back.
    pub fn find_tracks(&mut self, seeds: &[Seed], primary_vertex: Vector3<f64>) -> Vec<TrackResult> {
        let mut results: Vec<TrackResult> = (0..seeds.len())
            .map(|i| TrackResult::unreconstructed(i as u32))
            .collect();
        let mut sets: Vec<HypothesisSet> =
            (0..seeds.len()).map(|i| HypothesisSet::empty(i as u32)).collect();
        let mut finals: Vec<FinalTrack> = Vec::new();

        for pass in 0..2u8 {
            let base_ctx = if pass == 0 {
                SearchContext::constrained(primary_vertex)
            } else {
                SearchContext::unconstrained()
            };
            for (i, seed) in seeds.iter().enumerate() {
                if finals.iter().any(|f| f.seed_index == i as u32) {
                    continue;
                }
                let search = ProlongationSearch {
                    geometry: &self.geometry,
                    material: &self.material,
                    layers: &self.layers,
                    config: &self.config,
                };
                let set = search.search(&seed.state, i as u32, &base_ctx);
                if set.is_empty() {
                    continue;
                }

                // Fresh per-seed context: the reference-error cache never
                // leaks into the next seed
                let mut sel_ctx = base_ctx.clone();
                if let Some(best) = set.best() {
                    sel_ctx.reference_errors =
                        Some(Self::reference_errors(best, self.geometry.n_layers()));
                }
                let refitter = Refitter {
                    geometry: &self.geometry,
                    material: &self.material,
                    layers: &self.layers,
                    config: &self.config,
                };
                if let Some((idx, refit)) =
                    select_best(&seed.state, &set, &refitter, &self.layers, &self.config, &sel_ctx)
                {
                    finals.push(FinalTrack {
                        seed_index: i as u32,
                        candidate: set.candidates()[idx].clone(),
                        refit,
                    });
                }
                sets[i] = set;
            }
        }

        let ctx = SearchContext::unconstrained();
        resolve_conflicts(&mut finals, &sets, &mut self.layers, &self.config, &ctx);

        // Commit in quality order so arbitration losers cannot grab a used
        // cluster back
        finals.sort_by(|a, b| {
            normalized_chi2(&a.candidate, &self.layers, &self.config, &ctx)
                .total_cmp(&normalized_chi2(&b.candidate, &self.layers, &self.config, &ctx))
        });
        for f in &finals {
            let seed = &seeds[f.seed_index as usize];
            let fake = fake_fraction(&f.candidate, &self.layers, seed.label)
                > self.config.fake_fraction_max;
            let mut committed = Vec::new();
            for r in f.candidate.cluster_refs() {
                let cl = self.layers[r.layer as usize].get_mut(r.index);
                if cl.used {
                    // Lost to a better track during arbitration
                    continue;
                }
                committed.push(r);
                if !fake {
                    cl.used = true;
                }
            }
            results[f.seed_index as usize] = TrackResult {
                seed_index: f.seed_index,
                state: Some(f.refit.state.clone()),
                clusters: committed,
                chi2: f.candidate.chi2,
                reconstructed: true,
                fake: if seed.label >= 0 { Some(fake) } else { None },
            };
        }

        let summary = FindSummary::from_results(&results);
        info!(
            seeds = seeds.len(),
            reconstructed = summary.reconstructed,
            fakes = summary.fakes,
            "tracking pass finished"
        );
        self.sets = sets;
        self.finals = finals;
        results
    }

    /// Per-layer prediction errors of the best candidate, used as scoring
    /// reference for its competitors.
    fn reference_errors(
        best: &crate::prolongation::Candidate,
        n_layers: usize,
    ) -> Vec<(f64, f64)> {
        let mut refs = vec![(f64::INFINITY, f64::INFINITY); n_layers];
        for link in &best.chain {
            if let Some(slot) = refs.get_mut(link.layer as usize) {
                *slot = (link.sigma_y2, link.sigma_z2);
            }
        }
        refs
    }

    /// V0 pass over the finalized best tracks. Unresolved daughters get one
    /// on-demand re-run of the prolongation search.
    pub fn find_vertices(&mut self, seeds: &[Seed], primary_vertex: Vector3<f64>) -> Vec<V0Candidate> {
        let ctx = SearchContext::unconstrained();
        let mut daughters: Vec<Daughter> = self
            .finals
            .iter()
            .map(|f| Daughter {
                index: f.seed_index as usize,
                state: f.candidate.state.clone(),
                clusters: f.candidate.cluster_refs(),
                quality: normalized_chi2(&f.candidate, &self.layers, &self.config, &ctx),
            })
            .collect();

        // On-demand re-run for seeds that never produced a final track
        for (i, seed) in seeds.iter().enumerate() {
            if self.finals.iter().any(|f| f.seed_index == i as u32) {
                continue;
            }
            let search = ProlongationSearch {
                geometry: &self.geometry,
                material: &self.material,
                layers: &self.layers,
                config: &self.config,
            };
            let set = search.search(&seed.state, i as u32, &ctx);
            if let Some(best) = set.best() {
                debug!(seed = i, "daughter resolved by on-demand re-run");
                daughters.push(Daughter {
                    index: i,
                    state: best.state.clone(),
                    clusters: best.cluster_refs(),
                    quality: normalized_chi2(best, &self.layers, &self.config, &ctx),
                });
            }
        }

        let finder = V0Finder {
            config: &self.v0_config,
            geometry: &self.geometry,
            b_field: self.config.b_field,
        };
        finder.find(&daughters, primary_vertex)
    }
}
