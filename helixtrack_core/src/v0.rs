//! Secondary-vertex (V0) finder.
//!
//! Pairs oppositely-charged finalized tracks, solves the two-helix closest
//! approach in the transverse plane (0, 1 or 2 geometric solutions), builds
//! the candidate vertex from the daughter states at the crossing, and scores
//! it with pointing-angle, causality and likelihood heuristics. Each cut is
//! independently tunable through `V0Config`.

use nalgebra::{Vector2, Vector3};

use crate::cluster::ClusterRef;
use crate::config::V0Config;
use crate::geometry::Geometry;
use crate::track::TrackState;

/// One daughter handed to the finder: a finalized best track.
#[derive(Debug, Clone)]
pub struct Daughter {
    /// Index into the best-track set
    pub index: usize,
    /// State at the innermost reached point
    pub state: TrackState,
    pub clusters: Vec<ClusterRef>,
    /// Normalized chi-square of the underlying candidate
    pub quality: f64,
}

/// A candidate secondary vertex.
#[derive(Debug, Clone)]
pub struct V0Candidate {
    /// Index of the negative daughter in the best-track set
    pub neg: usize,
    /// Index of the positive daughter
    pub pos: usize,
    pub position: Vector3<f64>,
    /// Diagonal of the vertex covariance, cm²
    pub sigma2: Vector3<f64>,
    /// Decay radius, cm
    pub radius: f64,
    /// 3D distance between the daughters at the crossing, cm
    pub dca_daughters: f64,
    pub cos_pointing: f64,
    /// 1.0 when no daughter cluster sits below the candidate radius
    pub causality: f64,
    pub likelihood: f64,
    pub good: bool,
}

/// Transverse circle of a helix: center and signed curvature.
#[derive(Debug, Clone, Copy)]
struct HelixCircle {
    center: Vector2<f64>,
    radius: f64,
}

fn helix_circle(state: &TrackState, b_field: f64) -> Option<HelixCircle> {
    let crv = state.curvature(b_field);
    if crv.abs() < 1e-12 {
        return None;
    }
    let pos = state.global_position();
    let dir = state.global_momentum_xy().normalize();
    // The center sits 1/crv to the left of the flight direction
    let center = Vector2::new(pos.x, pos.y) + Vector2::new(-dir.y, dir.x) / crv;
    Some(HelixCircle { center, radius: 1.0 / crv.abs() })
}

/// Transverse crossing points of two circles. Empty when the circles are
/// disjoint; the separation is then reported through `gap`.
struct CircleCrossing {
    points: Vec<Vector2<f64>>,
    /// Transverse gap between the circles when they do not intersect
    gap: f64,
    /// Closest transverse point when there is no intersection
    closest: Option<Vector2<f64>>,
}

fn cross_circles(a: &HelixCircle, b: &HelixCircle) -> CircleCrossing {
    let delta = b.center - a.center;
    let d = delta.norm();
    if d < 1e-9 {
        // Concentric: degenerate, no usable solution
        return CircleCrossing { points: Vec::new(), gap: (a.radius - b.radius).abs(), closest: None };
    }
    let u = delta / d;
    if d > a.radius + b.radius {
        let gap = d - a.radius - b.radius;
        let closest = a.center + u * (a.radius + gap / 2.0);
        return CircleCrossing { points: Vec::new(), gap, closest: Some(closest) };
    }
    if d < (a.radius - b.radius).abs() {
        let gap = (a.radius - b.radius).abs() - d;
        let closest = a.center + u * (a.radius - gap / 2.0) * (a.radius - b.radius).signum();
        return CircleCrossing { points: Vec::new(), gap, closest: Some(closest) };
    }
    let l = (d * d + a.radius * a.radius - b.radius * b.radius) / (2.0 * d);
    let h2 = a.radius * a.radius - l * l;
    let h = h2.max(0.0).sqrt();
    let base = a.center + u * l;
    let perp = Vector2::new(-u.y, u.x);
    let mut points = vec![base + perp * h];
    if h > 1e-9 {
        points.push(base - perp * h);
    }
    CircleCrossing { points, gap: 0.0, closest: None }
}

pub struct V0Finder<'a> {
    pub config: &'a V0Config,
    pub geometry: &'a Geometry,
    pub b_field: f64,
}

impl<'a> V0Finder<'a> {
    /// Run the pair loop over the finalized best tracks.
    pub fn find(&self, daughters: &[Daughter], primary: Vector3<f64>) -> Vec<V0Candidate> {
        let mut out = Vec::new();
        for neg in daughters.iter().filter(|d| d.state.charge_sign() < 0.0) {
            for pos in daughters.iter().filter(|d| d.state.charge_sign() > 0.0) {
                if let Some(cand) = self.try_pair(neg, pos, primary) {
                    out.push(cand);
                }
            }
        }
        out
    }

    /// Evaluate one negative/positive pair; `None` when no geometric
    /// solution survives the radius and separation bounds.
    pub fn try_pair(
        &self,
        neg: &Daughter,
        pos: &Daughter,
        primary: Vector3<f64>,
    ) -> Option<V0Candidate> {
        let ca = helix_circle(&neg.state, self.b_field)?;
        let cb = helix_circle(&pos.state, self.b_field)?;
        let crossing = cross_circles(&ca, &cb);

        let candidates: Vec<Vector2<f64>> = if crossing.points.is_empty() {
            if crossing.gap > self.config.dca_max {
                return None;
            }
            crossing.closest.into_iter().collect()
        } else {
            crossing.points
        };

        let mut best: Option<V0Candidate> = None;
        for point in candidates {
            let radius = point.norm();
            if radius < self.config.r_min || radius > self.config.r_max {
                continue;
            }
            if let Some(cand) = self.build_candidate(neg, pos, radius, primary) {
                if best.as_ref().map_or(true, |b| cand.likelihood > b.likelihood) {
                    best = Some(cand);
                }
            }
        }
        best
    }

    fn build_candidate(
        &self,
        neg: &Daughter,
        pos: &Daughter,
        radius: f64,
        primary: Vector3<f64>,
    ) -> Option<V0Candidate> {
        // Bring both daughters to the crossing radius with the standard
        // propagation operators; a geometric failure kills the pair only
        let mut sn = neg.state.clone();
        let mut sp = pos.state.clone();
        sn.propagate_to_radius(radius, self.b_field).ok()?;
        sp.propagate_to_radius(radius, self.b_field).ok()?;

        let gn = sn.global_position();
        let gp = sp.global_position();
        let dca = (gn - gp).norm();
        if dca > self.config.dca_max {
            return None;
        }

        // Covariance-weighted vertex position
        let wn = 1.0 / (sn.sigma_y2() + sn.sigma_z2()).max(1e-12);
        let wp = 1.0 / (sp.sigma_y2() + sp.sigma_z2()).max(1e-12);
        let position = (gn * wn + gp * wp) / (wn + wp);
        let spread = dca / 2.0;
        let sigma2 = Vector3::new(
            1.0 / (wn + wp) + spread * spread,
            1.0 / (wn + wp) + spread * spread,
            1.0 / (wn + wp) + spread * spread,
        );

        // Total momentum at the vertex
        let pn = sn.global_momentum_xy();
        let pp = sp.global_momentum_xy();
        let p_tot = Vector3::new(pn.x + pp.x, pn.y + pp.y, sn.pz() + sp.pz());
        let flight = position - primary;
        let cos_pointing = p_tot.dot(&flight) / (p_tot.norm() * flight.norm().max(1e-12));

        let causality = self.causality(neg, radius) * self.causality(pos, radius);

        // Pointing resolution degrades at small radius and low momentum
        let pt_v0 = (p_tot.x * p_tot.x + p_tot.y * p_tot.y).sqrt();
        let sigma_pa =
            self.config.pa_res_a / (pt_v0 * radius).max(1e-6) + self.config.pa_res_b;
        let angle = cos_pointing.clamp(-1.0, 1.0).acos();
        let pointing_term = (-0.5 * (angle / sigma_pa) * (angle / sigma_pa)).exp();
        let quality_term =
            1.0 / (1.0 + 0.5 * (neg.quality + pos.quality).max(0.0));
        let separation_term = (-dca / self.config.dca_max.max(1e-12)).exp();
        let likelihood = 0.4 * pointing_term + 0.3 * causality + 0.2 * separation_term
            + 0.1 * quality_term;

        let good = causality >= self.config.causality_min
            && likelihood >= self.config.likelihood_min
            && cos_pointing >= self.config.cos_pointing_min;

        Some(V0Candidate {
            neg: neg.index,
            pos: pos.index,
            position,
            sigma2,
            radius,
            dca_daughters: dca,
            cos_pointing,
            causality,
            likelihood,
            good,
        })
    }

    /// Fraction-based causality score: daughter clusters below the decay
    /// radius should not exist.
    fn causality(&self, d: &Daughter, radius: f64) -> f64 {
        if d.clusters.is_empty() {
            return 1.0;
        }
        let inside = d
            .clusters
            .iter()
            .filter(|r| self.geometry.layer_radius(r.layer as usize) < radius)
            .count();
        1.0 - inside as f64 / d.clusters.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::V0Config;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix5, Vector5};

    const B: f64 = 5.0;

    fn daughter_from(state: TrackState, index: usize) -> Daughter {
        Daughter { index, state, clusters: Vec::new(), quality: 1.0 }
    }

    /// Two tracks emitted back-to-back-ish from a common point on the x axis.
    fn decay_pair(r_decay: f64) -> (Daughter, Daughter) {
        let cov = Matrix5::from_diagonal(&Vector5::new(1e-6, 1e-6, 1e-6, 1e-6, 1e-4));
        // Both start at the decay point, opposite charges, slight opening
        let neg = TrackState::new(0.0, r_decay, Vector5::new(0.0, 0.0, 0.1, 0.05, -0.8), cov);
        let pos = TrackState::new(0.0, r_decay, Vector5::new(0.0, 0.0, -0.1, 0.05, 0.8), cov);
        (daughter_from(neg, 0), daughter_from(pos, 1))
    }

    #[test]
    fn test_helix_circle_radius_matches_pt() {
        let cov = Matrix5::identity() * 1e-6;
        let state = TrackState::new(0.0, 10.0, Vector5::new(0.0, 0.0, 0.0, 0.0, 1.0), cov);
        let circle = helix_circle(&state, B).unwrap();
        // R = pt / (B * B2C)
        let expected = 1.0 / (B * crate::track::B2C);
        assert_relative_eq!(circle.radius, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_cross_circles_two_solutions() {
        let a = HelixCircle { center: Vector2::new(0.0, 0.0), radius: 5.0 };
        let b = HelixCircle { center: Vector2::new(6.0, 0.0), radius: 5.0 };
        let crossing = cross_circles(&a, &b);
        assert_eq!(crossing.points.len(), 2);
        for p in &crossing.points {
            assert_relative_eq!(p.norm(), 5.0, epsilon = 1e-9);
            assert_relative_eq!((p - b.center).norm(), 5.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_cross_circles_disjoint_reports_gap() {
        let a = HelixCircle { center: Vector2::new(0.0, 0.0), radius: 2.0 };
        let b = HelixCircle { center: Vector2::new(10.0, 0.0), radius: 3.0 };
        let crossing = cross_circles(&a, &b);
        assert!(crossing.points.is_empty());
        assert_relative_eq!(crossing.gap, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_decay_pair_produces_candidate() {
        let geo = Geometry::default_barrel();
        let config = V0Config::default();
        let finder = V0Finder { config: &config, geometry: &geo, b_field: B };
        let (neg, pos) = decay_pair(8.0);
        let found = finder.find(&[neg, pos], Vector3::zeros());
        assert_eq!(found.len(), 1);
        let v0 = &found[0];
        // The daughters genuinely meet at the decay point
        assert!(v0.dca_daughters < 1e-6, "dca = {}", v0.dca_daughters);
        assert_relative_eq!(v0.radius, 8.0, epsilon = 0.5);
        // Closed-form pointing cosine: the transverse components open
        // symmetrically around the x axis and the vertex sits at (8, 0, 0),
        // so only the momentum direction enters
        let pt = 1.0 / 0.8;
        let csp = (1.0f64 - 0.1 * 0.1).sqrt();
        let px = 2.0 * pt * csp;
        let pz = 2.0 * pt * 0.05;
        let expected = px / (px * px + pz * pz).sqrt();
        assert_relative_eq!(v0.cos_pointing, expected, epsilon = 1e-9);
        assert_eq!((v0.neg, v0.pos), (0, 1));
    }

    #[test]
    fn test_radius_bounds_reject() {
        let geo = Geometry::default_barrel();
        let mut config = V0Config::default();
        config.r_min = 20.0;
        let finder = V0Finder { config: &config, geometry: &geo, b_field: B };
        let (neg, pos) = decay_pair(8.0);
        assert!(finder.find(&[neg, pos], Vector3::zeros()).is_empty());
    }

    #[test]
    fn test_same_sign_pairs_are_not_tried() {
        let geo = Geometry::default_barrel();
        let config = V0Config::default();
        let finder = V0Finder { config: &config, geometry: &geo, b_field: B };
        let (neg, _) = decay_pair(8.0);
        let mut neg2 = neg.clone();
        neg2.index = 1;
        assert!(finder.find(&[neg, neg2], Vector3::zeros()).is_empty());
    }

    #[test]
    fn test_causality_counts_inner_clusters() {
        let geo = Geometry::default_barrel();
        let config = V0Config::default();
        let finder = V0Finder { config: &config, geometry: &geo, b_field: B };
        let cov = Matrix5::identity() * 1e-6;
        let state = TrackState::new(0.0, 10.0, Vector5::new(0.0, 0.0, 0.0, 0.0, -1.0), cov);
        let mut d = daughter_from(state, 0);
        d.clusters = vec![
            ClusterRef { layer: 0, index: 0 }, // r = 4, below the decay radius
            ClusterRef { layer: 4, index: 0 }, // r = 38.5, above
        ];
        assert_relative_eq!(finder.causality(&d, 10.0), 0.5, epsilon = 1e-12);
    }
}
