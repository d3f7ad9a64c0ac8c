//! Track state and its Kalman operators.
//!
//! The state is the classic 5-parameter helix parametrization at a reference
//! plane: a frame rotation `alpha`, the local plane coordinate `x`, and
//! `(y, z, sin(phi_local), tan(lambda), q/pt)`, with a 5×5 symmetric
//! covariance. All operators are fallible: geometric failures (no real
//! crossing) and numerical failures (degenerate covariance) abort the
//! branch that triggered them, never the event.

use nalgebra::{Matrix2, Matrix2x5, Matrix5, Matrix5x2, Vector2, Vector3, Vector5};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::Cluster;

/// Conversion factor: curvature = q/pt · B[kG] · B2C, lengths in cm,
/// momenta in GeV/c.
pub const B2C: f64 = 0.299_792_458e-3;

const ALMOST1: f64 = 0.999;
const ALMOST0: f64 = 1e-33;

/// Multiple-scattering constant, GeV.
const MS_CONST: f64 = 0.0136;

/// Recoverable failure of a single propagation/update step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// The trajectory has no real solution for the requested crossing.
    #[error("geometric failure: {0}")]
    Geometric(&'static str),
    /// A covariance inversion or the updated state is degenerate.
    #[error("numerical failure: {0}")]
    Numerical(&'static str),
}

/// 5-parameter track state at a reference plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackState {
    /// Rotation of the local frame around the beam axis, rad
    alpha: f64,
    /// Local plane coordinate (distance from the beam axis for
    /// azimuth-aligned frames), cm
    x: f64,
    /// (y, z, snp, tgl, q/pt)
    p: Vector5<f64>,
    /// Symmetric covariance of `p`
    c: Matrix5<f64>,
}

impl TrackState {
    pub fn new(alpha: f64, x: f64, p: Vector5<f64>, c: Matrix5<f64>) -> Self {
        Self { alpha, x, p, c }
    }

    #[inline]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    #[inline]
    pub fn x(&self) -> f64 {
        self.x
    }

    #[inline]
    pub fn y(&self) -> f64 {
        self.p[0]
    }

    #[inline]
    pub fn z(&self) -> f64 {
        self.p[1]
    }

    #[inline]
    pub fn snp(&self) -> f64 {
        self.p[2]
    }

    #[inline]
    pub fn tgl(&self) -> f64 {
        self.p[3]
    }

    #[inline]
    pub fn qpt(&self) -> f64 {
        self.p[4]
    }

    pub fn params(&self) -> &Vector5<f64> {
        &self.p
    }

    pub fn covariance(&self) -> &Matrix5<f64> {
        &self.c
    }

    /// Variance of the local y prediction.
    #[inline]
    pub fn sigma_y2(&self) -> f64 {
        self.c[(0, 0)]
    }

    /// Variance of the local z prediction.
    #[inline]
    pub fn sigma_z2(&self) -> f64 {
        self.c[(1, 1)]
    }

    /// Transverse momentum, GeV/c.
    pub fn pt(&self) -> f64 {
        1.0 / self.p[4].abs().max(ALMOST0)
    }

    /// Total momentum, GeV/c.
    pub fn momentum(&self) -> f64 {
        self.pt() * (1.0 + self.p[3] * self.p[3]).sqrt()
    }

    /// Sign of the charge (+1.0 or -1.0).
    pub fn charge_sign(&self) -> f64 {
        if self.p[4] < 0.0 {
            -1.0
        } else {
            1.0
        }
    }

    /// Signed transverse curvature in 1/cm for the given field in kG.
    pub fn curvature(&self, b_field: f64) -> f64 {
        self.p[4] * b_field * B2C
    }

    /// Position in the global frame.
    pub fn global_position(&self) -> Vector3<f64> {
        let (sa, ca) = self.alpha.sin_cos();
        Vector3::new(
            self.x * ca - self.p[0] * sa,
            self.x * sa + self.p[0] * ca,
            self.p[1],
        )
    }

    /// Transverse momentum vector in the global frame.
    pub fn global_momentum_xy(&self) -> Vector2<f64> {
        let snp = self.p[2].clamp(-ALMOST1, ALMOST1);
        let csp = (1.0 - snp * snp).sqrt();
        let pt = self.pt();
        let (sa, ca) = self.alpha.sin_cos();
        // Local direction (csp, snp) rotated to global
        Vector2::new(pt * (csp * ca - snp * sa), pt * (csp * sa + snp * ca))
    }

    /// Longitudinal momentum component, GeV/c.
    pub fn pz(&self) -> f64 {
        self.pt() * self.p[3]
    }

    /// Azimuth of the current global position.
    pub fn global_phi(&self) -> f64 {
        let g = self.global_position();
        g.y.atan2(g.x)
    }

    /// Transverse distance of the current position from the beam axis.
    pub fn global_radius(&self) -> f64 {
        let g = self.global_position();
        (g.x * g.x + g.y * g.y).sqrt()
    }

    /// Rotate the reference frame to azimuth `alpha`.
    pub fn rotate(&mut self, alpha: f64) -> Result<(), StepError> {
        let dalpha = alpha - self.alpha;
        if dalpha.abs() < 1e-12 {
            return Ok(());
        }
        let (sa, ca) = dalpha.sin_cos();
        let sf = self.p[2];
        let cf = (1.0 - sf * sf).max(0.0).sqrt();
        if cf < ALMOST0 {
            return Err(StepError::Numerical("track parallel to the plane"));
        }
        let new_snp = sf * ca - cf * sa;
        if new_snp.abs() >= ALMOST1 {
            return Err(StepError::Geometric("rotation turns track parallel"));
        }

        let x = self.x;
        let y = self.p[0];
        self.x = x * ca + y * sa;
        self.p[0] = -x * sa + y * ca;
        self.p[2] = new_snp;

        // First-order Jacobian: only y and snp transform
        let rr = ca + sf / cf * sa;
        let mut jac = Matrix5::identity();
        jac[(0, 0)] = ca;
        jac[(2, 2)] = rr;
        self.c = jac * self.c * jac.transpose();
        self.symmetrize();
        self.alpha = alpha;
        Ok(())
    }

    /// Propagate along the helix to local plane coordinate `x2`.
    pub fn propagate_to_x(&mut self, x2: f64, b_field: f64) -> Result<(), StepError> {
        let dx = x2 - self.x;
        if dx.abs() < 1e-12 {
            return Ok(());
        }
        let crv = self.curvature(b_field);
        let f1 = self.p[2];
        let f2 = f1 + crv * dx;
        if f1.abs() >= ALMOST1 {
            return Err(StepError::Geometric("start direction parallel to plane"));
        }
        if f2.abs() >= ALMOST1 {
            return Err(StepError::Geometric("helix does not reach the plane"));
        }
        let r1 = (1.0 - f1 * f1).sqrt();
        let r2 = (1.0 - f2 * f2).sqrt();
        if r1 < ALMOST0 || r2 < ALMOST0 {
            return Err(StepError::Numerical("degenerate direction cosine"));
        }

        let tgl = self.p[3];
        self.p[0] += dx * (f1 + f2) / (r1 + r2);
        // Transverse arc length: exact for curved tracks, chord for straight
        let s_t = if crv.abs() > ALMOST0 {
            let sin_rot = (f2 * r1 - f1 * r2).clamp(-1.0, 1.0);
            sin_rot.asin() / crv
        } else {
            dx / r1
        };
        self.p[1] += tgl * s_t;
        self.p[2] = f2;

        // Covariance transport, first-order expansion around the start point
        let cc = b_field * B2C;
        let r1_3 = r1 * r1 * r1;
        let f02 = dx / r1_3;
        let f04 = 0.5 * dx * dx / r1_3 * cc;
        let f12 = dx * tgl * f1 / r1_3;
        let f14 = 0.5 * dx * dx * tgl * f1 / r1_3 * cc;
        let f13 = dx / r1;
        let f24 = dx * cc;

        let mut jac = Matrix5::identity();
        jac[(0, 2)] = f02;
        jac[(0, 4)] = f04;
        jac[(1, 2)] = f12;
        jac[(1, 3)] = f13;
        jac[(1, 4)] = f14;
        jac[(2, 4)] = f24;
        self.c = jac * self.c * jac.transpose();
        self.symmetrize();
        self.x = x2;
        Ok(())
    }

    /// Propagate to the crossing with the cylinder of radius `r`, rotating
    /// the frame to the crossing azimuth.
    pub fn propagate_to_radius(&mut self, r: f64, b_field: f64) -> Result<(), StepError> {
        for _ in 0..3 {
            self.propagate_to_x(r, b_field)?;
            let dphi = (self.p[0] / self.x).atan();
            if dphi.abs() < 1e-9 {
                return Ok(());
            }
            self.rotate(self.alpha + dphi)?;
        }
        self.propagate_to_x(r, b_field)
    }

    /// Propagate to a flat detector plane at azimuth `phi` and distance `r`
    /// from the beam axis.
    pub fn propagate_to_plane(&mut self, phi: f64, r: f64, b_field: f64) -> Result<(), StepError> {
        self.rotate(phi)?;
        self.propagate_to_x(r, b_field)
    }

    /// Footprint expected for the current incidence angle, in the same units
    /// as the cluster shape descriptors.
    pub fn expected_shape(&self) -> (f64, f64) {
        let snp = self.p[2].clamp(-ALMOST1, ALMOST1);
        let csp = (1.0 - snp * snp).sqrt();
        let ny = 1.0 + 2.0 * (snp / csp).abs();
        let nz = 1.0 + 1.5 * self.p[3].abs();
        (ny, nz)
    }

    /// Mahalanobis chi-square of the predicted position against a cluster,
    /// plus a penalty for a footprint exceeding the expected shape
    /// (compensates for undetected cluster merging). Returns `f64::MAX`
    /// when the summed covariance is singular.
    pub fn predicted_chi2(&self, cl: &Cluster, shape_weight: f64) -> f64 {
        let residual = Vector2::new(cl.y - self.p[0], cl.z - self.p[1]);
        let s = Matrix2::new(
            self.c[(0, 0)] + cl.sigma_y2,
            self.c[(0, 1)],
            self.c[(1, 0)],
            self.c[(1, 1)] + cl.sigma_z2,
        );
        let chi2 = match s.try_inverse() {
            Some(s_inv) => (residual.transpose() * s_inv * residual)[(0, 0)],
            None => return f64::MAX,
        };
        let (ny_exp, nz_exp) = self.expected_shape();
        let excess =
            (cl.ny as f64 - ny_exp).max(0.0) + (cl.nz as f64 - nz_exp).max(0.0);
        chi2 + shape_weight * excess
    }

    /// Kalman gain update with a 2D (y, z) measurement. Returns the update
    /// chi-square on success.
    pub fn update(&mut self, cl: &Cluster) -> Result<f64, StepError> {
        let h = Matrix2x5::new(
            1.0, 0.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, 0.0,
        );
        let r = Matrix2::new(cl.sigma_y2, 0.0, 0.0, cl.sigma_z2);
        let residual = Vector2::new(cl.y - self.p[0], cl.z - self.p[1]);

        let s = h * self.c * h.transpose() + r;
        let s_inv = s
            .try_inverse()
            .ok_or(StepError::Numerical("singular innovation covariance"))?;
        let chi2 = (residual.transpose() * s_inv * residual)[(0, 0)];

        let k: Matrix5x2<f64> = self.c * h.transpose() * s_inv;
        self.p += k * residual;

        // Joseph form keeps the covariance positive under roundoff
        let ikh = Matrix5::identity() - k * h;
        self.c = ikh * self.c * ikh.transpose() + k * r * k.transpose();
        self.symmetrize();

        if self.p[2].abs() >= ALMOST1 {
            return Err(StepError::Numerical("updated direction out of range"));
        }
        for i in 0..5 {
            if !(self.c[(i, i)] > 0.0) {
                return Err(StepError::Numerical("non-positive updated variance"));
            }
        }
        Ok(chi2)
    }

    /// Apply multiple-scattering covariance inflation and, when
    /// `x_times_rho` is non-zero, the mean energy-loss correction.
    ///
    /// `x_times_rho` is signed: positive for a step that loses energy,
    /// negative when walking the trajectory back toward its origin.
    /// `apply_angle_correction` scales both budget terms by the crossing
    /// angle through the material plane.
    pub fn correct_for_material(
        &mut self,
        x_over_x0: f64,
        x_times_rho: f64,
        mass: f64,
        apply_angle_correction: bool,
    ) -> Result<(), StepError> {
        let snp = self.p[2];
        if snp.abs() >= ALMOST1 {
            return Err(StepError::Numerical("direction out of range"));
        }
        let tgl = self.p[3];
        let angle_factor = if apply_angle_correction {
            ((1.0 + tgl * tgl) / (1.0 - snp * snp)).sqrt()
        } else {
            1.0
        };
        let x_over_x0 = x_over_x0 * angle_factor;
        let x_times_rho = x_times_rho * angle_factor;

        let p = self.momentum();
        let p2 = p * p;
        let e2 = p2 + mass * mass;
        let beta2 = p2 / e2;

        // Multiple scattering
        if x_over_x0 > 0.0 {
            let theta2 = MS_CONST * MS_CONST / (beta2 * p2) * x_over_x0;
            let qpt = self.p[4];
            self.c[(2, 2)] += theta2 * (1.0 - snp * snp) * (1.0 + tgl * tgl);
            self.c[(3, 3)] += theta2 * (1.0 + tgl * tgl) * (1.0 + tgl * tgl);
            self.c[(3, 4)] += theta2 * tgl * qpt * (1.0 + tgl * tgl);
            self.c[(4, 3)] = self.c[(3, 4)];
            self.c[(4, 4)] += theta2 * tgl * tgl * qpt * qpt;
        }

        // Mean energy loss
        if x_times_rho != 0.0 {
            let beta_gamma = p / mass;
            let de = bethe_bloch_silicon(beta_gamma) * x_times_rho;
            let e = e2.sqrt();
            let e_new = e - de;
            if e_new <= mass {
                return Err(StepError::Numerical("energy loss exceeds track energy"));
            }
            let p_new = (e_new * e_new - mass * mass).sqrt();
            self.p[4] *= p / p_new;
            // Straggling contribution to the momentum parameter
            let sigma_de = 0.07 * de.abs();
            let dqpt_rel = sigma_de * e / p2;
            self.c[(4, 4)] += self.p[4] * self.p[4] * dqpt_rel * dqpt_rel;
        }
        Ok(())
    }

    fn symmetrize(&mut self) {
        for i in 0..5 {
            for j in (i + 1)..5 {
                let m = 0.5 * (self.c[(i, j)] + self.c[(j, i)]);
                self.c[(i, j)] = m;
                self.c[(j, i)] = m;
            }
        }
    }
}

/// Mean energy loss in silicon-like material, GeV per g/cm².
///
/// Classic Bethe formula with the low-energy shell terms dropped; adequate
/// for the momentum range of barrel tracking.
pub fn bethe_bloch_silicon(beta_gamma: f64) -> f64 {
    const K: f64 = 3.07075e-4; // GeV mol⁻¹ cm²
    const Z_OVER_A: f64 = 0.49848;
    const M_E: f64 = 0.511e-3; // GeV
    const I: f64 = 173e-9; // GeV

    let bg2 = beta_gamma * beta_gamma;
    let beta2 = bg2 / (1.0 + bg2);
    let t_max = 2.0 * M_E * bg2;
    let arg = (2.0 * M_E * bg2 * t_max / (I * I)).max(1.0 + 1e-9);
    K * Z_OVER_A / beta2 * (0.5 * arg.ln() - beta2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, ClusterRecord};
    use approx::assert_relative_eq;

    const B: f64 = 5.0;

    fn straight_track() -> TrackState {
        // 1 GeV/c positive track along +x with a loose covariance
        let p = Vector5::new(0.0, 0.0, 0.0, 0.1, 1.0);
        let c = Matrix5::from_diagonal(&Vector5::new(1e-4, 1e-4, 1e-4, 1e-4, 1e-2));
        TrackState::new(0.0, 40.0, p, c)
    }

    fn cluster_at(y: f64, z: f64) -> Cluster {
        let rec = ClusterRecord {
            y,
            z,
            sigma_y2: 1e-6,
            sigma_z2: 4e-6,
            segment: 0,
            charge: 80.0,
            ny: 1,
            nz: 1,
            label: 0,
        };
        Cluster::from_record(&rec, 0, 0.0)
    }

    #[test]
    fn test_propagate_to_x_moves_reference() {
        let mut t = straight_track();
        t.propagate_to_x(20.0, B).unwrap();
        assert_relative_eq!(t.x(), 20.0, epsilon = 1e-12);
        // Inward propagation of a curved track bends y away from zero
        assert!(t.y().abs() > 0.0);
    }

    #[test]
    fn test_propagate_to_radius_lands_on_cylinder() {
        let mut t = straight_track();
        t.propagate_to_radius(15.0, B).unwrap();
        assert_relative_eq!(t.global_radius(), 15.0, epsilon = 1e-6);
    }

    #[test]
    fn test_propagation_fails_for_unreachable_radius() {
        // 50 MeV/c track curls up well before r = 40 cm
        let p = Vector5::new(0.0, 0.0, 0.0, 0.0, 20.0);
        let c = Matrix5::identity() * 1e-4;
        let mut t = TrackState::new(0.0, 4.0, p, c);
        let err = t.propagate_to_x(40.0, B).unwrap_err();
        assert!(matches!(err, StepError::Geometric(_)));
    }

    #[test]
    fn test_rotate_preserves_global_position() {
        let mut t = straight_track();
        t.propagate_to_x(20.0, B).unwrap();
        let before = t.global_position();
        t.rotate(0.3).unwrap();
        let after = t.global_position();
        assert_relative_eq!(before.x, after.x, epsilon = 1e-9);
        assert_relative_eq!(before.y, after.y, epsilon = 1e-9);
        assert_relative_eq!(before.z, after.z, epsilon = 1e-9);
    }

    #[test]
    fn test_update_pulls_toward_measurement_and_shrinks_variance() {
        let mut t = straight_track();
        let sigma_before = t.sigma_y2();
        let cl = cluster_at(0.02, -0.01);
        let chi2 = t.update(&cl).unwrap();
        assert!(chi2 > 0.0);
        assert!(t.sigma_y2() < sigma_before);
        assert!(t.y() > 0.0 && t.y() < 0.02);
    }

    #[test]
    fn test_predicted_chi2_zero_for_exact_cluster() {
        let t = straight_track();
        let cl = cluster_at(t.y(), t.z());
        let chi2 = t.predicted_chi2(&cl, 0.0);
        assert_relative_eq!(chi2, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_predicted_chi2_shape_penalty() {
        let t = straight_track();
        let mut cl = cluster_at(t.y(), t.z());
        cl.ny = 6;
        cl.nz = 6;
        let plain = t.predicted_chi2(&cl, 0.0);
        let penalized = t.predicted_chi2(&cl, 1.0);
        assert!(penalized > plain);
    }

    #[test]
    fn test_material_correction_inflates_and_slows() {
        let mut t = straight_track();
        let c33_before = t.covariance()[(3, 3)];
        let qpt_before = t.qpt();
        t.correct_for_material(0.01, 0.5, 0.13957, true).unwrap();
        assert!(t.covariance()[(3, 3)] > c33_before);
        // Losing energy raises q/pt
        assert!(t.qpt() > qpt_before);
    }

    #[test]
    fn test_material_correction_signed_restores_energy() {
        let mut t = straight_track();
        let qpt_before = t.qpt();
        t.correct_for_material(0.0, -0.5, 0.13957, false).unwrap();
        assert!(t.qpt() < qpt_before);
    }

    #[test]
    fn test_bethe_bloch_minimum_ionizing_scale() {
        // A minimum-ionizing particle deposits roughly 1-2 MeV cm²/g
        let dedx = bethe_bloch_silicon(3.5);
        assert!(dedx > 1.0e-3 && dedx < 2.5e-3, "dedx = {}", dedx);
    }
}
