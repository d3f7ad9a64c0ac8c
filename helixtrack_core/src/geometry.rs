//! Static description of the barrel: layer radii, detector segments,
//! acceptance lookup and the passive elements crossed between layers.
//!
//! The geometry is an explicitly constructed, explicitly owned object that is
//! passed by reference into the search components. There is no process-wide
//! detector state.

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

use crate::config::N_LAYERS;

/// One cylindrical silicon layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerGeometry {
    /// Nominal radius, cm
    pub radius: f64,
    /// Number of azimuthal detector segments (ladders)
    pub n_segments: usize,
    /// Azimuth of segment 0's center, rad
    pub phi_offset: f64,
    /// Half-length of the sensitive region along the beam, cm
    pub z_half_length: f64,
}

impl LayerGeometry {
    /// Azimuth of a segment's center, wrapped to [0, 2π).
    pub fn segment_phi(&self, segment: usize) -> f64 {
        let phi = self.phi_offset + TAU * segment as f64 / self.n_segments as f64;
        phi.rem_euclid(TAU)
    }

    /// Half-width of one segment measured along the arc, cm.
    pub fn segment_half_width(&self) -> f64 {
        self.radius * PI / self.n_segments as f64
    }
}

/// Flat-plane description of one detector segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentGeometry {
    /// Azimuth of the plane normal, rad
    pub phi: f64,
    /// Distance of the plane from the beam axis, cm
    pub r: f64,
    /// Transverse half-extent of the plane, cm
    pub half_width: f64,
    /// Longitudinal half-extent of the plane, cm
    pub half_length: f64,
}

/// Result of the acceptance lookup at a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentLookup {
    /// Inside the sensitive region of this segment
    Inside(usize),
    /// Outside the layer's z acceptance: the search must branch without
    /// consulting the cluster index
    EdgeZ,
    /// Inside this segment but close to its azimuthal boundary: the road is
    /// widened to cover the neighbour
    Boundary(usize),
}

/// A passive element crossed during propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaterialElement {
    BeamPipe,
    /// Thermal shields between the detector stations (0: inner, 1: outer)
    Shield(usize),
    Layer(usize),
}

/// The full barrel description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    pub layers: Vec<LayerGeometry>,
    /// Radius of the beam pipe, cm
    pub beam_pipe_radius: f64,
    /// Radii of the thermal shields, cm
    pub shield_radii: [f64; 2],
    /// Fraction of a segment's half-width treated as boundary region
    pub boundary_fraction: f64,
}

impl Geometry {
    /// The reference six-layer barrel.
    pub fn default_barrel() -> Self {
        let spec: [(f64, usize, f64); N_LAYERS] = [
            (4.0, 20, 18.0),
            (7.0, 40, 18.0),
            (15.0, 14, 22.5),
            (24.0, 22, 30.0),
            (38.5, 34, 45.0),
            (43.5, 38, 50.0),
        ];
        let layers = spec
            .iter()
            .map(|&(radius, n_segments, z_half_length)| LayerGeometry {
                radius,
                n_segments,
                phi_offset: 0.0,
                z_half_length,
            })
            .collect();
        Self {
            layers,
            beam_pipe_radius: 3.0,
            shield_radii: [11.0, 31.0],
            boundary_fraction: 0.15,
        }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Nominal radius of a layer, cm.
    pub fn layer_radius(&self, layer: usize) -> f64 {
        self.layers[layer].radius
    }

    /// Flat-plane geometry of one segment.
    pub fn segment_geometry(&self, layer: usize, segment: usize) -> SegmentGeometry {
        let l = &self.layers[layer];
        SegmentGeometry {
            phi: l.segment_phi(segment),
            r: l.radius,
            half_width: l.segment_half_width(),
            half_length: l.z_half_length,
        }
    }

    /// Locate the segment whose sensitive region contains (phi, z).
    pub fn find_segment(&self, layer: usize, phi: f64, z: f64) -> SegmentLookup {
        let l = &self.layers[layer];
        if z.abs() > l.z_half_length {
            return SegmentLookup::EdgeZ;
        }
        let width = TAU / l.n_segments as f64;
        let rel = (phi - l.phi_offset).rem_euclid(TAU);
        let segment = ((rel + width / 2.0) / width) as usize % l.n_segments;
        // Offset from the segment center, wrapped to [-width/2, width/2)
        let off = (rel - width * segment as f64 + width / 2.0).rem_euclid(width) - width / 2.0;
        if off.abs() > width / 2.0 * (1.0 - self.boundary_fraction) {
            SegmentLookup::Boundary(segment)
        } else {
            SegmentLookup::Inside(segment)
        }
    }

    /// Passive elements and silicon layers crossed when propagating from
    /// `r_from` to `r_to`. Layers at the interval endpoints are not reported;
    /// the caller accounts for the silicon it starts or ends on.
    pub fn elements_between(&self, r_from: f64, r_to: f64) -> Vec<MaterialElement> {
        // Sensor planes sit up to half a segment width beyond the nominal
        // layer radius, so endpoints within this margin count as the boundary
        // layer, not a crossed one
        const LAYER_BOUNDARY_TOL: f64 = 0.5;
        let (lo, hi) = if r_from < r_to { (r_from, r_to) } else { (r_to, r_from) };
        let mut crossed = Vec::new();
        for (i, &r) in self.shield_radii.iter().enumerate() {
            if r > lo && r < hi {
                crossed.push(MaterialElement::Shield(i));
            }
        }
        if self.beam_pipe_radius > lo && self.beam_pipe_radius < hi {
            crossed.push(MaterialElement::BeamPipe);
        }
        for (i, l) in self.layers.iter().enumerate() {
            if l.radius > lo + LAYER_BOUNDARY_TOL && l.radius < hi - LAYER_BOUNDARY_TOL {
                crossed.push(MaterialElement::Layer(i));
            }
        }
        crossed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_barrel_shape() {
        let geo = Geometry::default_barrel();
        assert_eq!(geo.n_layers(), N_LAYERS);
        // Radii strictly increasing
        for i in 1..geo.n_layers() {
            assert!(geo.layer_radius(i) > geo.layer_radius(i - 1));
        }
    }

    #[test]
    fn test_segment_phi_wraps() {
        let geo = Geometry::default_barrel();
        let l = &geo.layers[0];
        assert_relative_eq!(l.segment_phi(0), 0.0, epsilon = 1e-12);
        let last = l.segment_phi(l.n_segments - 1);
        assert!(last > 0.0 && last < TAU);
    }

    #[test]
    fn test_find_segment_inside_and_edge() {
        let geo = Geometry::default_barrel();
        match geo.find_segment(0, 0.0, 0.0) {
            SegmentLookup::Inside(s) => assert_eq!(s, 0),
            other => panic!("expected Inside(0), got {:?}", other),
        }
        assert_eq!(geo.find_segment(0, 0.0, 100.0), SegmentLookup::EdgeZ);
    }

    #[test]
    fn test_find_segment_boundary() {
        let geo = Geometry::default_barrel();
        let l = &geo.layers[0];
        let width = TAU / l.n_segments as f64;
        // Just inside the boundary band of segment 0
        let phi = width / 2.0 * 0.95;
        match geo.find_segment(0, phi, 0.0) {
            SegmentLookup::Boundary(_) => {}
            other => panic!("expected Boundary, got {:?}", other),
        }
    }

    #[test]
    fn test_elements_between() {
        let geo = Geometry::default_barrel();
        // Layer 2 (15 cm) down to layer 1 (7 cm) crosses the inner shield
        let crossed = geo.elements_between(15.0, 7.0);
        assert_eq!(crossed, vec![MaterialElement::Shield(0)]);
        // Innermost layer down to the vertex crosses the beam pipe
        let crossed = geo.elements_between(4.0, 0.0);
        assert_eq!(crossed, vec![MaterialElement::BeamPipe]);
        // A span over several stations reports the interior silicon too
        let crossed = geo.elements_between(24.0, 4.0);
        assert!(crossed.contains(&MaterialElement::Layer(1)));
        assert!(crossed.contains(&MaterialElement::Layer(2)));
        assert!(!crossed.contains(&MaterialElement::Layer(0)));
        assert!(!crossed.contains(&MaterialElement::Layer(3)));
    }

    #[test]
    fn test_full_traversal_crosses_layer_silicon() {
        let geo = Geometry::default_barrel();
        let crossed = geo.elements_between(43.5, 0.0);
        let silicon = crossed
            .iter()
            .filter(|e| matches!(e, MaterialElement::Layer(_)))
            .count();
        // Every layer except the one the traversal starts on
        assert_eq!(silicon, 5);
        assert!(crossed.contains(&MaterialElement::BeamPipe));
        assert!(crossed.contains(&MaterialElement::Shield(0)));
        assert!(crossed.contains(&MaterialElement::Shield(1)));
    }
}
