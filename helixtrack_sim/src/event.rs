//! Ground truth event generator.
//!
//! The generator maintains the god's-eye view of one simulated collision:
//! - True helix parameters of every charged particle
//! - Cluster production by swimming each helix through the barrel with the
//!   same propagation operators the tracker uses
//! - Measurement smearing, detection inefficiency and combinatorial noise
//!
//! All randomness is drawn from a single seeded ChaCha8 stream, so a run is
//! reproducible from its seed alone.

use helixtrack_core::geometry::SegmentLookup;
use helixtrack_core::{ClusterRecord, Geometry, Seed, TrackState};
use nalgebra::{Matrix5, Vector5};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use tracing::debug;

/// Reference radius at which seeds are handed to the tracker, cm.
pub const SEED_RADIUS: f64 = 50.0;

/// Tuning of the generated events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Primary tracks per event
    pub n_tracks: usize,
    /// Displaced opposite-charge pairs per event
    pub n_v0_pairs: usize,
    /// Transverse momentum range, GeV/c
    pub pt_min: f64,
    pub pt_max: f64,
    /// Dip range: tan(lambda) drawn uniformly in [-tgl_max, tgl_max]
    pub tgl_max: f64,
    /// Measurement smearing, cm
    pub sigma_y: f64,
    pub sigma_z: f64,
    /// Probability that a crossed layer actually produces a cluster
    pub detection_efficiency: f64,
    /// Uncorrelated noise clusters added per layer
    pub noise_per_layer: usize,
    /// Decay radius range of the generated pairs, cm
    pub v0_r_min: f64,
    pub v0_r_max: f64,
    /// Diagonal seed covariance handed to the tracker
    pub seed_cov: [f64; 5],
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            n_tracks: 12,
            n_v0_pairs: 1,
            pt_min: 0.3,
            pt_max: 3.0,
            tgl_max: 0.6,
            sigma_y: 0.0008,
            sigma_z: 0.0020,
            detection_efficiency: 0.98,
            noise_per_layer: 3,
            v0_r_min: 2.0,
            v0_r_max: 12.0,
            seed_cov: [1e-4, 1e-4, 1e-5, 1e-5, 1e-4],
        }
    }
}

/// One generated particle with its generator label.
#[derive(Debug, Clone)]
pub struct TruthTrack {
    pub label: i32,
    /// State at the production point
    pub state: TrackState,
    /// Set for the daughters of a generated displaced pair
    pub from_v0: bool,
    /// Layers on which the particle left a cluster
    pub hit_layers: Vec<usize>,
}

/// One complete generated event.
#[derive(Debug, Clone)]
pub struct GeneratedEvent {
    pub streams: Vec<Vec<ClusterRecord>>,
    pub seeds: Vec<Seed>,
    pub truths: Vec<TruthTrack>,
    /// Number of generated displaced pairs whose daughters both got seeds
    pub n_v0_generated: usize,
}

/// Deterministic generator over one barrel geometry.
pub struct EventGenerator {
    geometry: Geometry,
    config: EventConfig,
    b_field: f64,
    rng: ChaCha8Rng,
}

impl EventGenerator {
    pub fn new(geometry: Geometry, config: EventConfig, b_field: f64, seed: u64) -> Self {
        Self {
            geometry,
            config,
            b_field,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Generate the next event of the stream.
    pub fn generate(&mut self) -> GeneratedEvent {
        let n_layers = self.geometry.n_layers();
        let mut streams: Vec<Vec<ClusterRecord>> = vec![Vec::new(); n_layers];
        let mut seeds = Vec::new();
        let mut truths = Vec::new();
        let mut label = 0i32;

        for _ in 0..self.config.n_tracks {
            let state = self.primary_state();
            self.emit_track(state, label, false, &mut streams, &mut seeds, &mut truths);
            label += 1;
        }

        let mut n_v0_generated = 0;
        for _ in 0..self.config.n_v0_pairs {
            let (neg, pos) = self.displaced_pair();
            let before = seeds.len();
            self.emit_track(neg, label, true, &mut streams, &mut seeds, &mut truths);
            label += 1;
            self.emit_track(pos, label, true, &mut streams, &mut seeds, &mut truths);
            label += 1;
            if seeds.len() == before + 2 {
                n_v0_generated += 1;
            }
        }

        for (layer, stream) in streams.iter_mut().enumerate() {
            self.add_noise(layer, stream);
        }

        debug!(
            tracks = truths.len(),
            seeds = seeds.len(),
            clusters = streams.iter().map(|s| s.len()).sum::<usize>(),
            "event generated"
        );
        GeneratedEvent { streams, seeds, truths, n_v0_generated }
    }

    /// A primary particle from the beam line.
    fn primary_state(&mut self) -> TrackState {
        let phi0 = self.rng.gen_range(0.0..TAU);
        let pt = self.rng.gen_range(self.config.pt_min..self.config.pt_max);
        let sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let tgl = self.rng.gen_range(-self.config.tgl_max..self.config.tgl_max);
        TrackState::new(
            phi0,
            0.0,
            Vector5::new(0.0, 0.0, 0.0, tgl, sign / pt),
            Matrix5::identity() * 1e-10,
        )
    }

    /// An oppositely charged pair born at a displaced radius.
    fn displaced_pair(&mut self) -> (TrackState, TrackState) {
        let phi = self.rng.gen_range(0.0..TAU);
        let r = self.rng.gen_range(self.config.v0_r_min..self.config.v0_r_max);
        let pt = self.rng.gen_range(self.config.pt_min.max(0.5)..self.config.pt_max);
        let tgl = self.rng.gen_range(-self.config.tgl_max..self.config.tgl_max);
        let opening = self.rng.gen_range(0.05..0.15);
        let cov = Matrix5::identity() * 1e-10;
        let neg = TrackState::new(
            phi,
            r,
            Vector5::new(0.0, 0.0, opening, tgl, -1.0 / pt),
            cov,
        );
        let pos = TrackState::new(
            phi,
            r,
            Vector5::new(0.0, 0.0, -opening, tgl, 1.0 / pt),
            cov,
        );
        (neg, pos)
    }

    /// Swim one truth helix outward, producing smeared clusters and a seed.
    /// Particles that curl up before the seed radius are dropped silently.
    fn emit_track(
        &mut self,
        truth: TrackState,
        label: i32,
        from_v0: bool,
        streams: &mut [Vec<ClusterRecord>],
        seeds: &mut Vec<Seed>,
        truths: &mut Vec<TruthTrack>,
    ) {
        let smear_y = Normal::new(0.0, self.config.sigma_y).unwrap();
        let smear_z = Normal::new(0.0, self.config.sigma_z).unwrap();

        let mut seed_state = truth.clone();
        if seed_state.propagate_to_radius(SEED_RADIUS, self.b_field).is_err() {
            return;
        }

        let r_start = truth.global_radius();
        let mut st = truth.clone();
        let mut hit_layers = Vec::new();
        for layer in 0..self.geometry.n_layers() {
            let radius = self.geometry.layer_radius(layer);
            if radius <= r_start {
                continue;
            }
            if st.propagate_to_radius(radius, self.b_field).is_err() {
                break;
            }
            if !self.rng.gen_bool(self.config.detection_efficiency) {
                continue;
            }
            let phi = st.global_phi().rem_euclid(TAU);
            let segment = match self.geometry.find_segment(layer, phi, st.z()) {
                SegmentLookup::Inside(s) | SegmentLookup::Boundary(s) => s,
                SegmentLookup::EdgeZ => continue,
            };
            let seg = self.geometry.segment_geometry(layer, segment);
            let mut plane = st.clone();
            if plane.propagate_to_plane(seg.phi, seg.r, self.b_field).is_err() {
                continue;
            }
            streams[layer].push(ClusterRecord {
                y: plane.y() + smear_y.sample(&mut self.rng),
                z: plane.z() + smear_z.sample(&mut self.rng),
                sigma_y2: self.config.sigma_y * self.config.sigma_y,
                sigma_z2: self.config.sigma_z * self.config.sigma_z,
                segment: segment as u16,
                charge: self.rng.gen_range(60.0..110.0),
                ny: self.rng.gen_range(1..=2u8),
                nz: self.rng.gen_range(1..=2u8),
                label,
            });
            hit_layers.push(layer);
        }

        seeds.push(Seed {
            state: TrackState::new(
                seed_state.alpha(),
                seed_state.x(),
                *seed_state.params(),
                Matrix5::from_diagonal(&Vector5::from_row_slice(&self.config.seed_cov)),
            ),
            label,
        });
        truths.push(TruthTrack { label, state: truth, from_v0, hit_layers });
    }

    /// Uncorrelated noise clusters spread over the layer.
    fn add_noise(&mut self, layer: usize, stream: &mut Vec<ClusterRecord>) {
        let lgeo = &self.geometry.layers[layer];
        for _ in 0..self.config.noise_per_layer {
            let segment = self.rng.gen_range(0..lgeo.n_segments) as u16;
            let half_width = lgeo.segment_half_width();
            stream.push(ClusterRecord {
                y: self.rng.gen_range(-half_width..half_width),
                z: self.rng.gen_range(-lgeo.z_half_length..lgeo.z_half_length),
                sigma_y2: self.config.sigma_y * self.config.sigma_y,
                sigma_z2: self.config.sigma_z * self.config.sigma_z,
                segment,
                charge: self.rng.gen_range(20.0..200.0),
                ny: self.rng.gen_range(1..=3u8),
                nz: self.rng.gen_range(1..=3u8),
                label: -1,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(seed: u64) -> EventGenerator {
        EventGenerator::new(
            Geometry::default_barrel(),
            EventConfig::default(),
            5.0,
            seed,
        )
    }

    #[test]
    fn test_same_seed_same_event() {
        let a = generator(7).generate();
        let b = generator(7).generate();
        assert_eq!(a.seeds.len(), b.seeds.len());
        for (sa, sb) in a.streams.iter().zip(&b.streams) {
            assert_eq!(sa.len(), sb.len());
            for (ca, cb) in sa.iter().zip(sb) {
                assert_eq!(ca.y, cb.y);
                assert_eq!(ca.z, cb.z);
                assert_eq!(ca.label, cb.label);
            }
        }
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = generator(7).generate();
        let b = generator(8).generate();
        let ya: Vec<f64> = a.streams[0].iter().map(|c| c.y).collect();
        let yb: Vec<f64> = b.streams[0].iter().map(|c| c.y).collect();
        assert_ne!(ya, yb);
    }

    #[test]
    fn test_truth_tracks_leave_clusters() {
        let event = generator(1).generate();
        assert!(!event.truths.is_empty());
        // With 98% efficiency, most primaries cross most of the six layers
        let total_hits: usize = event.truths.iter().map(|t| t.hit_layers.len()).sum();
        assert!(total_hits > 4 * event.truths.len());
    }

    #[test]
    fn test_noise_clusters_unlabeled() {
        let event = generator(3).generate();
        let noise: usize = event
            .streams
            .iter()
            .flat_map(|s| s.iter())
            .filter(|c| c.label == -1)
            .count();
        assert_eq!(noise, EventConfig::default().noise_per_layer * 6);
    }

    #[test]
    fn test_displaced_pair_is_opposite_charge() {
        let mut gen = generator(5);
        let (neg, pos) = gen.displaced_pair();
        assert!(neg.charge_sign() < 0.0);
        assert!(pos.charge_sign() > 0.0);
        assert!(neg.global_radius() >= EventConfig::default().v0_r_min - 1e-9);
    }
}
