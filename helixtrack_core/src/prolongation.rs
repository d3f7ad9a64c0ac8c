//! Inward layer-by-layer prolongation search.
//!
//! One instance per seed grows a bounded tree of track hypotheses from the
//! outermost layer to the innermost. At every layer each surviving candidate
//! branches over the compatible clusters in its road, one explicit
//! no-cluster branch, dead-zone crossings and, for vertex-constrained
//! candidates with few clusters, an explicit vertex-improvement branch.
//! A per-layer cap on surviving candidates is the sole defense against
//! combinatorial blow-up; hitting it is policy, not an error.

use nalgebra::Vector3;
use tracing::trace;

use crate::cluster::{Cluster, ClusterRecord, ClusterRef};
use crate::config::TrackerConfig;
use crate::geometry::{Geometry, MaterialElement, SegmentLookup};
use crate::hypothesis::HypothesisSet;
use crate::layer::{LayerIndex, Window};
use crate::material::{Direction, MaterialBudget};
use crate::track::TrackState;

/// Explicit search context threaded through every call; there is no ambient
/// "current pass" state.
#[derive(Debug, Clone)]
pub struct SearchContext {
    /// 0: vertex-constrained pass, 1: unconstrained pass
    pub pass: u8,
    pub vertex_constraint: bool,
    /// Primary-vertex estimate, global frame, cm
    pub vertex: Vector3<f64>,
    /// Per-layer (sigma_y2, sigma_z2) of the current best candidate, used as
    /// reference errors during scoring
    pub reference_errors: Option<Vec<(f64, f64)>>,
}

impl SearchContext {
    pub fn constrained(vertex: Vector3<f64>) -> Self {
        Self { pass: 0, vertex_constraint: true, vertex, reference_errors: None }
    }

    pub fn unconstrained() -> Self {
        Self {
            pass: 1,
            vertex_constraint: false,
            vertex: Vector3::zeros(),
            reference_errors: None,
        }
    }
}

/// What happened at one layer of a candidate's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// A cluster was attached and the Kalman update applied
    Cluster,
    /// Explicit no-cluster branch
    Skip,
    /// Dead zone or acceptance edge crossed
    DeadZone,
    /// Vertex-improvement pseudo measurement
    VertexImproved,
}

/// Per-layer record kept on a candidate for later scoring.
#[derive(Debug, Clone)]
pub struct ChainLink {
    pub layer: u8,
    pub segment: u16,
    pub cluster: Option<u16>,
    pub kind: LinkKind,
    /// Update chi-square of this link (0 for non-cluster links)
    pub chi2: f64,
    /// Prediction variance cached at attach time
    pub sigma_y2: f64,
    pub sigma_z2: f64,
    /// Footprint expected for the incidence angle at attach time
    pub expected_ny: f64,
    pub expected_nz: f64,
}

/// One hypothesis: a cluster-assignment chain with its fitted state.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub state: TrackState,
    /// Accumulated update chi-square along the chain
    pub chi2: f64,
    pub chain: Vec<ChainLink>,
    pub n_clusters: u8,
    pub n_skipped: u8,
    pub n_deadzone: u8,
    /// Set when the vertex-improvement branch touched this chain; documented
    /// exception to chain chi-square monotonicity
    pub improved_toward_vertex: bool,
    pub seed_index: u32,
}

impl Candidate {
    pub fn from_seed(state: TrackState, seed_index: u32) -> Self {
        Self {
            state,
            chi2: 0.0,
            chain: Vec::new(),
            n_clusters: 0,
            n_skipped: 0,
            n_deadzone: 0,
            improved_toward_vertex: false,
            seed_index,
        }
    }

    /// Chi-square per attached cluster, the layer-local ranking score.
    pub fn local_norm_chi2(&self) -> f64 {
        self.chi2 / (self.n_clusters.max(1) as f64)
    }

    /// References to all attached clusters, outermost first.
    pub fn cluster_refs(&self) -> Vec<ClusterRef> {
        self.chain
            .iter()
            .filter(|l| l.kind == LinkKind::Cluster)
            .filter_map(|l| l.cluster.map(|index| ClusterRef { layer: l.layer, index }))
            .collect()
    }
}

/// Rank the pool by layer-local normalized chi-square and truncate to the
/// depth- and quality-dependent cap.
pub(crate) fn truncate_pool(pool: &mut Vec<Candidate>, depth: usize, config: &TrackerConfig) {
    pool.sort_by(|a, b| a.local_norm_chi2().total_cmp(&b.local_norm_chi2()));
    let good = pool
        .iter()
        .take_while(|c| c.local_norm_chi2() < config.good_chi2)
        .count();
    let cap = (config.cap_base + depth * config.cap_per_depth + good * config.cap_per_good)
        .min(config.cap_max);
    pool.truncate(cap);
}

/// The per-seed tree search.
pub struct ProlongationSearch<'a> {
    pub geometry: &'a Geometry,
    pub material: &'a MaterialBudget,
    pub layers: &'a [LayerIndex],
    pub config: &'a TrackerConfig,
}

impl<'a> ProlongationSearch<'a> {
    /// Grow the hypothesis tree inward and return the surviving set.
    pub fn search(&self, seed: &TrackState, seed_index: u32, ctx: &SearchContext) -> HypothesisSet {
        let mut pool = vec![Candidate::from_seed(seed.clone(), seed_index)];
        let n_layers = self.layers.len();

        for layer in (0..n_layers).rev() {
            let mut next = Vec::new();
            for parent in &pool {
                self.extend(parent, layer, ctx, &mut next);
            }
            let depth = n_layers - layer;
            truncate_pool(&mut next, depth, self.config);
            trace!(layer, survivors = next.len(), "prolongation layer done");
            pool = next;
            if pool.is_empty() {
                break;
            }
        }

        let survivors: Vec<Candidate> = pool
            .into_iter()
            .filter(|c| {
                c.n_clusters >= self.config.min_clusters
                    && c.local_norm_chi2() <= self.config.max_norm_chi2
            })
            .collect();
        HypothesisSet::new(seed_index, survivors, self.layers, self.config, ctx)
    }

    /// Branch one candidate over one layer.
    fn extend(&self, parent: &Candidate, layer: usize, ctx: &SearchContext, out: &mut Vec<Candidate>) {
        let layer_index = &self.layers[layer];
        let radius = self.geometry.layer_radius(layer);

        let mut state = parent.state.clone();
        // Silicon of the layer just left, then the material in the gap
        if layer + 1 < self.layers.len() {
            let (x0, xrho) = self.material.budget_cached(
                parent.seed_index,
                MaterialElement::Layer(layer + 1),
                Direction::Inward,
            );
            if state
                .correct_for_material(x0, xrho, self.config.mass_hypothesis, true)
                .is_err()
            {
                return;
            }
        }
        let r_from = state.global_radius();
        for element in self.geometry.elements_between(r_from, radius) {
            let (x0, xrho) = self
                .material
                .budget_cached(parent.seed_index, element, Direction::Inward);
            if state
                .correct_for_material(x0, xrho, self.config.mass_hypothesis, true)
                .is_err()
            {
                return;
            }
        }
        if state.propagate_to_radius(radius, self.config.b_field).is_err() {
            // Geometric failure: this branch ends here, the parent's other
            // branches are unaffected
            return;
        }

        let phi = state.global_phi().rem_euclid(std::f64::consts::TAU);
        let (segment, boundary) = match self.geometry.find_segment(layer, phi, state.z()) {
            SegmentLookup::EdgeZ => {
                // Acceptance edge: branch without consulting the index
                out.push(self.skip_branch(parent, state, layer, LinkKind::DeadZone));
                return;
            }
            SegmentLookup::Inside(s) => (s, false),
            SegmentLookup::Boundary(s) => (s, true),
        };

        // Road sized from the propagated covariance
        let cfg = self.config;
        let mut dy = cfg.n_sigma_road
            * (state.sigma_y2() + cfg.misalign_sigma_y * cfg.misalign_sigma_y).sqrt();
        let mut dz = cfg.n_sigma_road
            * (state.sigma_z2() + cfg.misalign_sigma_z * cfg.misalign_sigma_z).sqrt();
        if ctx.vertex_constraint {
            dy *= cfg.vertex_tighten;
            dz *= cfg.vertex_tighten;
        }
        if boundary {
            dy *= cfg.boundary_widen;
        }

        let circ = layer_index.circumference();
        let arc = radius * phi;
        // A road wider than the layer covers the whole circle; wrapping it
        // would fold the window onto a small arc instead
        let window = if 2.0 * dy >= circ {
            Window {
                z_min: state.z() - dz,
                z_max: state.z() + dz,
                arc_min: 0.0,
                arc_max: circ,
            }
        } else {
            Window {
                z_min: state.z() - dz,
                z_max: state.z() + dz,
                arc_min: (arc - dy).rem_euclid(circ),
                arc_max: (arc + dy).rem_euclid(circ),
            }
        };

        let mut cursor = layer_index.select_clusters(window);
        while let Some(ci) = layer_index.next_cluster(&mut cursor) {
            let cl = layer_index.get(ci);
            if cl.used {
                continue;
            }
            if cl.is_dead_zone() {
                let mut branch = self.skip_branch(parent, state.clone(), layer, LinkKind::DeadZone);
                if let Some(l) = branch.chain.last_mut() {
                    l.cluster = Some(ci);
                    l.segment = cl.segment;
                }
                out.push(branch);
                continue;
            }
            self.cluster_branch(parent, &state, layer, segment, ci, cl, out);
        }

        // Always at most one explicit no-cluster branch per parent
        out.push(self.skip_branch(parent, state.clone(), layer, LinkKind::Skip));

        if ctx.vertex_constraint
            && layer < cfg.vertex_branch_layers
            && parent.n_clusters <= cfg.low_itinerary_clusters
        {
            if let Some(branch) = self.vertex_branch(parent, &state, layer, ctx) {
                out.push(branch);
            }
        }
    }

    fn cluster_branch(
        &self,
        parent: &Candidate,
        state: &TrackState,
        layer: usize,
        segment: usize,
        ci: u16,
        cl: &Cluster,
        out: &mut Vec<Candidate>,
    ) {
        let seg = self.geometry.segment_geometry(layer, cl.segment as usize);
        let mut branch_state = state.clone();
        if branch_state
            .propagate_to_plane(seg.phi, seg.r, self.config.b_field)
            .is_err()
        {
            return;
        }
        let gate_chi2 = branch_state.predicted_chi2(cl, self.config.shape_penalty_weight);
        if gate_chi2 > self.config.layer_chi2_gate[layer.min(self.config.layer_chi2_gate.len() - 1)]
        {
            return;
        }
        let sigma_y2 = branch_state.sigma_y2();
        let sigma_z2 = branch_state.sigma_z2();
        let (expected_ny, expected_nz) = branch_state.expected_shape();
        let chi2 = match branch_state.update(cl) {
            Ok(chi2) => chi2,
            Err(_) => return,
        };
        let mut cand = parent.clone();
        cand.state = branch_state;
        cand.chi2 += chi2;
        cand.n_clusters += 1;
        cand.chain.push(ChainLink {
            layer: layer as u8,
            segment: segment as u16,
            cluster: Some(ci),
            kind: LinkKind::Cluster,
            chi2,
            sigma_y2,
            sigma_z2,
            expected_ny,
            expected_nz,
        });
        out.push(cand);
    }

    fn skip_branch(
        &self,
        parent: &Candidate,
        state: TrackState,
        layer: usize,
        kind: LinkKind,
    ) -> Candidate {
        let sigma_y2 = state.sigma_y2();
        let sigma_z2 = state.sigma_z2();
        let mut cand = parent.clone();
        cand.state = state;
        match kind {
            LinkKind::DeadZone => cand.n_deadzone += 1,
            _ => cand.n_skipped += 1,
        }
        cand.chain.push(ChainLink {
            layer: layer as u8,
            segment: u16::MAX,
            cluster: None,
            kind,
            chi2: 0.0,
            sigma_y2,
            sigma_z2,
            expected_ny: 0.0,
            expected_nz: 0.0,
        });
        cand
    }

    /// Pull a low-itinerary candidate toward the primary vertex with a
    /// pseudo measurement; the only sanctioned non-monotonic chi-square step.
    fn vertex_branch(
        &self,
        parent: &Candidate,
        state: &TrackState,
        layer: usize,
        ctx: &SearchContext,
    ) -> Option<Candidate> {
        let mut vstate = state.clone();
        let (sa, ca) = vstate.alpha().sin_cos();
        // Vertex in the local frame of the current plane
        let vx = ctx.vertex.x * ca + ctx.vertex.y * sa;
        let vy = -ctx.vertex.x * sa + ctx.vertex.y * ca;
        vstate.propagate_to_x(vx.max(0.0), self.config.b_field).ok()?;
        let sigma2 = self.config.vertex_sigma * self.config.vertex_sigma;
        let pseudo = Cluster::from_record(
            &ClusterRecord {
                y: vy,
                z: ctx.vertex.z,
                sigma_y2: sigma2,
                sigma_z2: sigma2,
                segment: 0,
                charge: 1.0,
                ny: 1,
                nz: 1,
                label: -1,
            },
            layer as u8,
            0.0,
        );
        let sigma_y2 = vstate.sigma_y2();
        let sigma_z2 = vstate.sigma_z2();
        let chi2 = vstate.update(&pseudo).ok()?;
        let mut cand = parent.clone();
        cand.state = vstate;
        cand.chi2 += chi2;
        cand.improved_toward_vertex = true;
        cand.chain.push(ChainLink {
            layer: layer as u8,
            segment: u16::MAX,
            cluster: None,
            kind: LinkKind::VertexImproved,
            chi2,
            sigma_y2,
            sigma_z2,
            expected_ny: 0.0,
            expected_nz: 0.0,
        });
        Some(cand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use nalgebra::{Matrix5, Vector5};

    fn candidate_with(chi2: f64, n_clusters: u8) -> Candidate {
        let state = TrackState::new(
            0.0,
            40.0,
            Vector5::new(0.0, 0.0, 0.0, 0.1, 1.0),
            Matrix5::identity() * 1e-4,
        );
        let mut c = Candidate::from_seed(state, 0);
        c.chi2 = chi2;
        c.n_clusters = n_clusters;
        c
    }

    #[test]
    fn test_truncate_pool_respects_cap() {
        let config = TrackerConfig::default();
        let mut pool: Vec<Candidate> =
            (0..200).map(|i| candidate_with(100.0 + i as f64, 1)).collect();
        truncate_pool(&mut pool, 6, &config);
        assert!(pool.len() <= config.cap_max);
    }

    #[test]
    fn test_truncate_pool_keeps_best_first() {
        let config = TrackerConfig::default();
        let mut pool = vec![
            candidate_with(50.0, 2),
            candidate_with(2.0, 2),
            candidate_with(10.0, 2),
        ];
        truncate_pool(&mut pool, 1, &config);
        assert!(pool[0].local_norm_chi2() <= pool[1].local_norm_chi2());
        assert_eq!(pool[0].chi2, 2.0);
    }

    #[test]
    fn test_good_candidates_grow_cap() {
        let mut config = TrackerConfig::default();
        config.cap_base = 2;
        config.cap_per_depth = 0;
        config.cap_per_good = 1;
        config.cap_max = 100;
        config.good_chi2 = 5.0;

        // Three good candidates: cap = base 2 + 3 good = 5
        let mut pool: Vec<Candidate> = (0..10)
            .map(|i| candidate_with(if i < 3 { 1.0 } else { 50.0 }, 1))
            .collect();
        truncate_pool(&mut pool, 0, &config);
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn test_local_norm_chi2_guards_zero_clusters() {
        let c = candidate_with(7.0, 0);
        assert_eq!(c.local_norm_chi2(), 7.0);
    }
}
