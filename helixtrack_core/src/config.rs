//! Tuning surface for the track finder.
//!
//! Every numeric threshold used by the search, scoring, material and V0
//! machinery lives here. The defaults reproduce the reference tune for the
//! six-layer barrel; all of them are plain data and can be loaded from JSON
//! for recalibration.

use serde::{Deserialize, Serialize};

/// Number of silicon layers in the default barrel.
pub const N_LAYERS: usize = 6;

/// Configuration for the prolongation search and hypothesis scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Axial magnetic field in kilogauss (default: 5.0 kG)
    pub b_field: f64,

    /// Mass hypothesis in GeV/c² used for energy-loss corrections
    /// (default: charged pion, 0.13957)
    pub mass_hypothesis: f64,

    /// Road half-width in standard deviations of the propagated covariance
    pub n_sigma_road: f64,

    /// Per-layer chi-square gate for attaching a cluster
    pub layer_chi2_gate: [f64; N_LAYERS],

    /// Fixed misalignment term added in quadrature to the road, cm
    pub misalign_sigma_y: f64,
    /// Fixed misalignment term added in quadrature to the road, cm
    pub misalign_sigma_z: f64,

    /// Multiplicative widening of the azimuthal road near a segment boundary
    pub boundary_widen: f64,

    /// Multiplicative tightening of the road when the vertex constraint is on
    pub vertex_tighten: f64,

    /// Transverse and longitudinal sigma of the primary-vertex pseudo
    /// measurement used by the vertex-improvement branch, cm
    pub vertex_sigma: f64,

    /// Candidates with at most this many clusters are eligible for the
    /// vertex-improvement branch
    pub low_itinerary_clusters: u8,

    /// The vertex-improvement branch is tried only on the innermost
    /// this-many layers
    pub vertex_branch_layers: usize,

    /// Base surviving-candidate cap after the outermost processed layer
    pub cap_base: usize,
    /// Cap growth per layer of depth
    pub cap_per_depth: usize,
    /// Extra cap slots per "good" (low chi-square) candidate
    pub cap_per_good: usize,
    /// Hard ceiling on the per-layer candidate pool
    pub cap_max: usize,
    /// Layer-local normalized chi-square below which a candidate counts as good
    pub good_chi2: f64,

    /// Minimum attached clusters for a candidate to be registered
    pub min_clusters: u8,
    /// Maximum normalized chi-square per reached layer at registration
    pub max_norm_chi2: f64,
    /// Maximum retained hypotheses per seed
    pub max_hypotheses: usize,

    /// Penalty added to the normalized chi-square per skipped layer
    pub skip_penalty: f64,
    /// Penalty added to the normalized chi-square per dead-zone crossing
    pub deadzone_penalty: f64,
    /// Weight of the amplitude-vs-expected-energy-loss mismatch penalty
    pub amplitude_penalty_weight: f64,
    /// Amplitude a minimum-ionizing track deposits in one layer, ADC counts
    pub mip_amplitude: f64,
    /// Weight of the cluster-shape mismatch penalty
    pub shape_penalty_weight: f64,
    /// Effective-DoF discount per skipped layer
    pub skip_dof_discount: f64,

    /// Absolute gate on the backward-refit chi-square per cluster
    pub max_chi2_backward: f64,
    /// Absolute gate on the refit-to-seed match chi-square
    pub max_chi2_match: f64,
    /// A candidate is kept for arbitration only if its normalized chi-square
    /// is within this factor of the rank-0 candidate's
    pub rel_chi2_factor: f64,

    /// Two tracks enter pairwise arbitration when their shared-cluster
    /// fraction exceeds this value
    pub shared_fraction_max: f64,
    /// Candidates per track probed during pairwise arbitration
    pub arbitration_depth: usize,
    /// Clusters are marked used only if the fraction of attached clusters
    /// with a provenance label differing from the seed's stays below this
    pub fake_fraction_max: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            b_field: 5.0,
            mass_hypothesis: 0.13957,
            n_sigma_road: 4.0,
            layer_chi2_gate: [20.0, 20.0, 24.0, 24.0, 30.0, 30.0],
            misalign_sigma_y: 0.0010,
            misalign_sigma_z: 0.0010,
            boundary_widen: 1.5,
            vertex_tighten: 0.6,
            vertex_sigma: 0.0100,
            low_itinerary_clusters: 2,
            vertex_branch_layers: 2,
            cap_base: 6,
            cap_per_depth: 3,
            cap_per_good: 2,
            cap_max: 40,
            good_chi2: 6.0,
            min_clusters: 4,
            max_norm_chi2: 12.0,
            max_hypotheses: 20,
            skip_penalty: 6.0,
            deadzone_penalty: 2.0,
            amplitude_penalty_weight: 0.5,
            mip_amplitude: 80.0,
            shape_penalty_weight: 1.0,
            skip_dof_discount: 0.5,
            max_chi2_backward: 14.0,
            max_chi2_match: 30.0,
            rel_chi2_factor: 3.0,
            shared_fraction_max: 0.3,
            arbitration_depth: 4,
            fake_fraction_max: 0.3,
        }
    }
}

/// Configuration of the secondary-vertex (V0) finder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V0Config {
    /// Minimum decay radius, cm
    pub r_min: f64,
    /// Maximum decay radius, cm
    pub r_max: f64,
    /// Maximum distance of closest approach between the daughters, cm
    pub dca_max: f64,
    /// Minimum cosine of the pointing angle to the primary vertex
    pub cos_pointing_min: f64,
    /// Minimum causality score (clusters before the candidate radius
    /// count against it)
    pub causality_min: f64,
    /// Minimum combined likelihood for the "good" flag
    pub likelihood_min: f64,
    /// Pointing-angle resolution model: sigma = pa_res_a / (pt * r) + pa_res_b
    pub pa_res_a: f64,
    pub pa_res_b: f64,
}

impl Default for V0Config {
    fn default() -> Self {
        Self {
            r_min: 0.5,
            r_max: 40.0,
            dca_max: 1.5,
            cos_pointing_min: 0.98,
            causality_min: 0.5,
            likelihood_min: 0.4,
            pa_res_a: 0.05,
            pa_res_b: 0.005,
        }
    }
}

/// Which source the material budget model draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterialSourceKind {
    /// Fixed per-element parametrization
    Parametrized,
    /// Lookup table built once per run by Monte-Carlo sampling of the
    /// detailed geometry description
    SampledTable,
    /// Per-track-per-element memo over the selected base source
    TrackCache,
}

/// Configuration of the material budget model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialConfig {
    pub source: MaterialSourceKind,
    /// RNG seed for the Monte-Carlo table build
    pub sample_seed: u64,
    /// Samples per element for the table build
    pub n_samples: usize,
}

impl Default for MaterialConfig {
    fn default() -> Self {
        Self {
            source: MaterialSourceKind::Parametrized,
            sample_seed: 0x5eed_1234,
            n_samples: 2048,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_round_trip() {
        let config = TrackerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: TrackerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.layer_chi2_gate, config.layer_chi2_gate);
        assert_eq!(back.cap_max, config.cap_max);
    }

    #[test]
    fn test_default_gates_cover_all_layers() {
        let config = TrackerConfig::default();
        assert_eq!(config.layer_chi2_gate.len(), N_LAYERS);
        assert!(config.layer_chi2_gate.iter().all(|&g| g > 0.0));
    }
}
