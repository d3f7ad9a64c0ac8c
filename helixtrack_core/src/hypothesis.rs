//! Hypothesis scoring, best-track selection and shared-cluster arbitration.
//!
//! The ranking score is a normalized chi-square: residual chi-square per
//! attached cluster, penalized for amplitude and shape mismatches, skipped
//! layers and dead-zone crossings, divided by an effective degrees-of-freedom
//! count. Best-track selection additionally gates on a backward refit and on
//! the match against the original seed state. Conflict resolution arbitrates
//! clusters claimed by more than one finalized track.

use nalgebra::Matrix5;

use crate::cluster::ClusterRef;
use crate::config::TrackerConfig;
use crate::geometry::{Geometry, MaterialElement};
use crate::layer::LayerIndex;
use crate::material::{Direction, MaterialBudget};
use crate::prolongation::{Candidate, LinkKind, SearchContext};
use crate::track::{bethe_bloch_silicon, TrackState};

/// Normalized chi-square of one candidate. Pure: two calls on an unmodified
/// candidate return the same value.
pub fn normalized_chi2(
    cand: &Candidate,
    layers: &[LayerIndex],
    config: &TrackerConfig,
    ctx: &SearchContext,
) -> f64 {
    let mut chi2 = 0.0;
    let beta_gamma = cand.state.momentum() / config.mass_hypothesis;
    let dedx_ratio = bethe_bloch_silicon(beta_gamma) / bethe_bloch_silicon(3.5);

    for link in &cand.chain {
        if link.kind != LinkKind::Cluster {
            continue;
        }
        let Some(ci) = link.cluster else { continue };
        let cl = layers[link.layer as usize].get(ci);

        // Use the reference errors of the current best candidate when they
        // are more precise than this candidate's own
        let mut link_chi2 = link.chi2;
        if let Some(refs) = &ctx.reference_errors {
            if let Some(&(ry2, rz2)) = refs.get(link.layer as usize) {
                let own = link.sigma_y2 + link.sigma_z2;
                let reference = ry2 + rz2;
                if reference > 0.0 && reference < own {
                    link_chi2 *= own / reference;
                }
            }
        }
        chi2 += link_chi2;

        // Amplitude against the expected energy loss
        let expected = config.mip_amplitude * dedx_ratio;
        if expected > 0.0 && cl.charge > 0.0 {
            chi2 += config.amplitude_penalty_weight * (cl.charge / expected - 1.0).abs();
        }

        // Footprint larger than expected hints at an undetected shared cluster
        let excess = (cl.ny as f64 - link.expected_ny).max(0.0)
            + (cl.nz as f64 - link.expected_nz).max(0.0);
        chi2 += config.shape_penalty_weight * excess;
    }

    chi2 += config.skip_penalty * cand.n_skipped as f64;
    chi2 += config.deadzone_penalty * cand.n_deadzone as f64;

    let ndof = (2.0 * cand.n_clusters as f64 - config.skip_dof_discount * cand.n_skipped as f64)
        .max(1.0);
    chi2 / ndof
}

/// Bounded, ranked set of surviving hypotheses for one seed.
#[derive(Debug, Clone)]
pub struct HypothesisSet {
    pub seed_index: u32,
    candidates: Vec<Candidate>,
}

impl HypothesisSet {
    pub fn new(
        seed_index: u32,
        mut candidates: Vec<Candidate>,
        layers: &[LayerIndex],
        config: &TrackerConfig,
        ctx: &SearchContext,
    ) -> Self {
        candidates.sort_by(|a, b| {
            normalized_chi2(a, layers, config, ctx)
                .total_cmp(&normalized_chi2(b, layers, config, ctx))
        });
        candidates.truncate(config.max_hypotheses);
        Self { seed_index, candidates }
    }

    pub fn empty(seed_index: u32) -> Self {
        Self { seed_index, candidates: Vec::new() }
    }

    /// The rank-0 candidate: best track until conflict resolution says
    /// otherwise.
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Outcome of the backward refit of one candidate.
#[derive(Debug, Clone)]
pub struct RefitOutcome {
    /// Refit state at the seed's reference plane
    pub state: TrackState,
    /// Chi-square accumulated by the outward refit
    pub chi2_backward: f64,
    /// Mahalanobis match between the refit and the original seed state
    pub chi2_match: f64,
}

/// Refits candidates outward over their recorded chains.
pub struct Refitter<'a> {
    pub geometry: &'a Geometry,
    pub material: &'a MaterialBudget,
    pub layers: &'a [LayerIndex],
    pub config: &'a TrackerConfig,
}

impl<'a> Refitter<'a> {
    /// Walk the chain from the innermost attached cluster back out to the
    /// seed reference, re-applying the Kalman updates.
    pub fn refit(&self, cand: &Candidate, seed: &TrackState) -> Option<RefitOutcome> {
        let mut state = cand.state.clone();
        let mut chi2_backward = 0.0;
        let b = self.config.b_field;
        let mass = self.config.mass_hypothesis;
        let mut left_layer: Option<usize> = None;

        for link in cand.chain.iter().rev() {
            if link.kind != LinkKind::Cluster {
                continue;
            }
            let ci = link.cluster?;
            let cl = self.layers[link.layer as usize].get(ci);
            let seg = self
                .geometry
                .segment_geometry(link.layer as usize, cl.segment as usize);

            // Silicon of the layer being left, then the material in the gap
            // (skipped layers are reported by the gap lookup)
            if let Some(left) = left_layer.take() {
                let (x0, xrho) = self.material.budget_cached(
                    cand.seed_index,
                    MaterialElement::Layer(left),
                    Direction::Outward,
                );
                state.correct_for_material(x0, xrho, mass, true).ok()?;
            }
            let r_from = state.global_radius();
            for element in self.geometry.elements_between(r_from, seg.r) {
                let (x0, xrho) =
                    self.material
                        .budget_cached(cand.seed_index, element, Direction::Outward);
                state.correct_for_material(x0, xrho, mass, true).ok()?;
            }
            state.propagate_to_plane(seg.phi, seg.r, b).ok()?;
            chi2_backward += state.update(cl).ok()?;
            left_layer = Some(link.layer as usize);
        }

        // Leaving the outermost attached layer toward the seed reference
        if let Some(left) = left_layer {
            let (x0, xrho) = self.material.budget_cached(
                cand.seed_index,
                MaterialElement::Layer(left),
                Direction::Outward,
            );
            state.correct_for_material(x0, xrho, mass, true).ok()?;
            for element in self.geometry.elements_between(state.global_radius(), seed.x()) {
                let (x0, xrho) =
                    self.material
                        .budget_cached(cand.seed_index, element, Direction::Outward);
                state.correct_for_material(x0, xrho, mass, true).ok()?;
            }
        }
        state.rotate(seed.alpha()).ok()?;
        state.propagate_to_x(seed.x(), b).ok()?;
        let chi2_match = match_chi2(&state, seed);
        Some(RefitOutcome { state, chi2_backward, chi2_match })
    }
}

/// 5D Mahalanobis distance between two states in the same frame, using the
/// sum of their covariances. `f64::MAX` when the sum is singular.
pub fn match_chi2(a: &TrackState, b: &TrackState) -> f64 {
    let d = a.params() - b.params();
    let s: Matrix5<f64> = a.covariance() + b.covariance();
    match s.try_inverse() {
        Some(s_inv) => (d.transpose() * s_inv * d)[(0, 0)],
        None => f64::MAX,
    }
}

/// Pick the best candidate of a set: the first, in rank order, that clears
/// the forward, backward and match gates.
pub fn select_best(
    seed: &TrackState,
    set: &HypothesisSet,
    refitter: &Refitter<'_>,
    layers: &[LayerIndex],
    config: &TrackerConfig,
    ctx: &SearchContext,
) -> Option<(usize, RefitOutcome)> {
    let best_norm = normalized_chi2(set.best()?, layers, config, ctx);
    for (i, cand) in set.candidates().iter().enumerate() {
        let norm = normalized_chi2(cand, layers, config, ctx);
        if norm > best_norm * config.rel_chi2_factor {
            break;
        }
        let Some(refit) = refitter.refit(cand, seed) else { continue };
        if refit.chi2_backward / (cand.n_clusters.max(1) as f64) > config.max_chi2_backward {
            continue;
        }
        if refit.chi2_match > config.max_chi2_match {
            continue;
        }
        return Some((i, refit));
    }
    None
}

/// One committed track before result write-back.
#[derive(Debug, Clone)]
pub struct FinalTrack {
    pub seed_index: u32,
    pub candidate: Candidate,
    pub refit: RefitOutcome,
}

impl FinalTrack {
    /// Arbitration weight: smaller impact parameter, tighter covariance and
    /// lower chi-square all make a track harder to displace.
    fn weight(&self, layers: &[LayerIndex], config: &TrackerConfig, ctx: &SearchContext) -> f64 {
        let impact = self.candidate.state.y().abs() + 0.1;
        let cov = self.candidate.state.sigma_y2() + self.candidate.state.sigma_z2();
        let norm = normalized_chi2(&self.candidate, layers, config, ctx).max(1e-3);
        1.0 / (impact * (1.0 + cov.sqrt()) * norm)
    }
}

fn shared_fraction(a: &Candidate, b: &Candidate) -> f64 {
    let refs_a = a.cluster_refs();
    let refs_b = b.cluster_refs();
    if refs_a.is_empty() {
        return 0.0;
    }
    let shared = refs_a.iter().filter(|r| refs_b.contains(r)).count();
    shared as f64 / refs_a.len().min(refs_b.len()).max(1) as f64
}

fn register_refs(layers: &mut [LayerIndex], refs: &[ClusterRef], id: u32) {
    for r in refs {
        layers[r.layer as usize].get_mut(r.index).register_claim(id);
    }
}

fn unregister_refs(layers: &mut [LayerIndex], refs: &[ClusterRef], id: u32) {
    for r in refs {
        layers[r.layer as usize].get_mut(r.index).unregister_claim(id);
    }
}

/// Arbitrate clusters claimed by more than one finalized track.
///
/// For every conflicted pair the candidate sets of both tracks are re-scored
/// as a weighted combination and the lowest-cost compatible assignment is
/// committed; cluster ownership is re-registered for the winners only.
pub fn resolve_conflicts(
    finals: &mut [FinalTrack],
    sets: &[HypothesisSet],
    layers: &mut [LayerIndex],
    config: &TrackerConfig,
    ctx: &SearchContext,
) {
    // Register the provisional claims
    for f in finals.iter() {
        register_refs(layers, &f.candidate.cluster_refs(), f.seed_index);
    }

    // Multiply-claimed clusters accumulate overlap probability
    for layer in layers.iter_mut() {
        for index in 0..layer.len() {
            let cl = layer.get_mut(index as u16);
            let n = cl.n_claims();
            if n > 1 {
                cl.delta += (n - 1) as f64 / n as f64;
            }
        }
    }

    for i in 0..finals.len() {
        for j in (i + 1)..finals.len() {
            let fraction = shared_fraction(&finals[i].candidate, &finals[j].candidate);
            if fraction <= config.shared_fraction_max {
                continue;
            }
            let set_i = sets.iter().find(|s| s.seed_index == finals[i].seed_index);
            let set_j = sets.iter().find(|s| s.seed_index == finals[j].seed_index);
            let (Some(set_i), Some(set_j)) = (set_i, set_j) else { continue };

            let w_i = finals[i].weight(layers, config, ctx);
            let w_j = finals[j].weight(layers, config, ctx);

            // Probe the top of both candidate sets for the cheapest
            // compatible assignment
            let mut best: Option<(usize, usize, f64)> = None;
            for (a, ca) in set_i.candidates().iter().take(config.arbitration_depth).enumerate() {
                for (b, cb) in set_j.candidates().iter().take(config.arbitration_depth).enumerate()
                {
                    if shared_fraction(ca, cb) > config.shared_fraction_max {
                        continue;
                    }
                    let cost = w_i * normalized_chi2(ca, layers, config, ctx)
                        + w_j * normalized_chi2(cb, layers, config, ctx);
                    if best.map_or(true, |(_, _, c)| cost < c) {
                        best = Some((a, b, cost));
                    }
                }
            }
            let Some((a, b, _)) = best else { continue };

            // Commit the winners, re-registering ownership
            let old_i = finals[i].candidate.cluster_refs();
            let old_j = finals[j].candidate.cluster_refs();
            unregister_refs(layers, &old_i, finals[i].seed_index);
            unregister_refs(layers, &old_j, finals[j].seed_index);
            finals[i].candidate = set_i.candidates()[a].clone();
            finals[j].candidate = set_j.candidates()[b].clone();
            let id_i = finals[i].seed_index;
            let id_j = finals[j].seed_index;
            register_refs(layers, &finals[i].candidate.cluster_refs(), id_i);
            register_refs(layers, &finals[j].candidate.cluster_refs(), id_j);
        }
    }
}

/// Fraction of attached clusters whose provenance label differs from the
/// seed's identity tag. Unlabeled clusters are neutral.
pub fn fake_fraction(cand: &Candidate, layers: &[LayerIndex], seed_label: i32) -> f64 {
    if seed_label < 0 {
        return 0.0;
    }
    let refs = cand.cluster_refs();
    if refs.is_empty() {
        return 0.0;
    }
    let mut labeled = 0usize;
    let mut wrong = 0usize;
    for r in &refs {
        let cl = layers[r.layer as usize].get(r.index);
        if cl.label >= 0 {
            labeled += 1;
            if cl.label != seed_label {
                wrong += 1;
            }
        }
    }
    if labeled == 0 {
        0.0
    } else {
        wrong as f64 / labeled as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, ClusterRecord};
    use crate::prolongation::{Candidate, ChainLink};
    use nalgebra::{Matrix5, Vector5};

    fn test_layers() -> Vec<LayerIndex> {
        let mut layers: Vec<LayerIndex> = (0..6)
            .map(|i| LayerIndex::new(i as u8, 4.0 + i as f64, 20))
            .collect();
        for (i, layer) in layers.iter_mut().enumerate() {
            let rec = ClusterRecord {
                y: 0.0,
                z: 0.0,
                sigma_y2: 1e-6,
                sigma_z2: 1e-6,
                segment: 0,
                charge: 80.0,
                ny: 1,
                nz: 1,
                label: 3,
            };
            layer.load(vec![Cluster::from_record(&rec, i as u8, 0.0)]);
        }
        layers
    }

    fn chained_candidate(n_clusters: usize, chi2_per: f64) -> Candidate {
        let state = TrackState::new(
            0.0,
            4.0,
            Vector5::new(0.0, 0.0, 0.0, 0.1, 1.0),
            Matrix5::identity() * 1e-4,
        );
        let mut cand = Candidate::from_seed(state, 0);
        for layer in (0..n_clusters).rev() {
            cand.chain.push(ChainLink {
                layer: layer as u8,
                segment: 0,
                cluster: Some(0),
                kind: LinkKind::Cluster,
                chi2: chi2_per,
                sigma_y2: 1e-5,
                sigma_z2: 1e-5,
                expected_ny: 2.0,
                expected_nz: 2.0,
            });
            cand.chi2 += chi2_per;
            cand.n_clusters += 1;
        }
        cand
    }

    #[test]
    fn test_normalized_chi2_idempotent() {
        let layers = test_layers();
        let config = TrackerConfig::default();
        let ctx = SearchContext::unconstrained();
        let cand = chained_candidate(5, 1.5);
        let a = normalized_chi2(&cand, &layers, &config, &ctx);
        let b = normalized_chi2(&cand, &layers, &config, &ctx);
        assert_eq!(a, b);
    }

    #[test]
    fn test_skip_penalty_raises_score() {
        let layers = test_layers();
        let config = TrackerConfig::default();
        let ctx = SearchContext::unconstrained();
        let clean = chained_candidate(5, 1.5);
        let mut skipped = chained_candidate(5, 1.5);
        skipped.n_skipped = 2;
        assert!(
            normalized_chi2(&skipped, &layers, &config, &ctx)
                > normalized_chi2(&clean, &layers, &config, &ctx)
        );
    }

    #[test]
    fn test_reference_errors_tighten_score() {
        let layers = test_layers();
        let config = TrackerConfig::default();
        let mut ctx = SearchContext::unconstrained();
        let cand = chained_candidate(5, 1.5);
        let loose = normalized_chi2(&cand, &layers, &config, &ctx);
        // A best candidate with much smaller errors makes residuals count more
        ctx.reference_errors = Some(vec![(1e-7, 1e-7); 6]);
        let tight = normalized_chi2(&cand, &layers, &config, &ctx);
        assert!(tight > loose);
    }

    #[test]
    fn test_hypothesis_set_ranked() {
        let layers = test_layers();
        let config = TrackerConfig::default();
        let ctx = SearchContext::unconstrained();
        let set = HypothesisSet::new(
            0,
            vec![chained_candidate(5, 4.0), chained_candidate(5, 0.5)],
            &layers,
            &config,
            &ctx,
        );
        assert_eq!(set.len(), 2);
        assert!(set.best().unwrap().chi2 < 5.0);
    }

    #[test]
    fn test_fake_fraction() {
        let layers = test_layers();
        let cand = chained_candidate(4, 1.0);
        // All loaded clusters carry label 3
        assert_eq!(fake_fraction(&cand, &layers, 3), 0.0);
        assert_eq!(fake_fraction(&cand, &layers, 9), 1.0);
        // Unknown seed identity: neutral
        assert_eq!(fake_fraction(&cand, &layers, -1), 0.0);
    }

    #[test]
    fn test_match_chi2_zero_for_identical_states() {
        let state = TrackState::new(
            0.0,
            40.0,
            Vector5::new(0.1, 0.2, 0.05, 0.3, 1.2),
            Matrix5::identity() * 1e-3,
        );
        assert!(match_chi2(&state, &state.clone()) < 1e-12);
    }
}
