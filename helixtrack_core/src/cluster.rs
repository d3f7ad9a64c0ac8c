//! Cluster data model: one reconstructed detector hit, its measurement
//! covariance, shape descriptors and the per-event ownership bookkeeping.

use serde::{Deserialize, Serialize};

/// Upper bound on the number of in-flight tracks that may claim one cluster.
pub const MAX_CLAIMS: usize = 4;

/// Raw per-cluster record as delivered by the external cluster stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Local transverse coordinate on the segment plane, cm
    pub y: f64,
    /// Local longitudinal coordinate, cm
    pub z: f64,
    /// Variance of y, cm²
    pub sigma_y2: f64,
    /// Variance of z, cm²
    pub sigma_z2: f64,
    /// Detector segment the cluster sits on
    pub segment: u16,
    /// Charge/amplitude; 0 marks a synthetic dead-zone placeholder
    pub charge: f64,
    /// Footprint size in the transverse direction, pixels
    pub ny: u8,
    /// Footprint size in the longitudinal direction, pixels
    pub nz: u8,
    /// Provenance identity tag (generator label), -1 if unknown
    pub label: i32,
}

/// One measurement loaded into a layer index.
///
/// Immutable after load except for the "used" flag, the accumulated overlap
/// probability and the bounded claim fan-in.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub y: f64,
    pub z: f64,
    pub sigma_y2: f64,
    pub sigma_z2: f64,
    pub segment: u16,
    pub layer: u8,
    pub charge: f64,
    pub ny: u8,
    pub nz: u8,
    pub label: i32,
    /// Global azimuthal arc coordinate r·phi at load time, cm
    pub arc: f64,
    /// Set once the cluster is committed to a final track
    pub used: bool,
    /// Accumulated probability that the cluster is shared/overlapping
    pub delta: f64,
    claims: [Option<u32>; MAX_CLAIMS],
}

impl Cluster {
    pub fn from_record(rec: &ClusterRecord, layer: u8, arc: f64) -> Self {
        Self {
            y: rec.y,
            z: rec.z,
            sigma_y2: rec.sigma_y2,
            sigma_z2: rec.sigma_z2,
            segment: rec.segment,
            layer,
            charge: rec.charge,
            ny: rec.ny,
            nz: rec.nz,
            label: rec.label,
            arc,
            used: false,
            delta: 0.0,
            claims: [None; MAX_CLAIMS],
        }
    }

    /// A zero-amplitude cluster is a synthetic dead-zone marker, not a hit.
    #[inline]
    pub fn is_dead_zone(&self) -> bool {
        self.charge == 0.0
    }

    /// Record that a track claims this cluster. Returns false when the
    /// fan-in is exhausted; the claim is then silently dropped.
    pub fn register_claim(&mut self, track_id: u32) -> bool {
        if self.claims.iter().flatten().any(|&id| id == track_id) {
            return true;
        }
        for slot in self.claims.iter_mut() {
            if slot.is_none() {
                *slot = Some(track_id);
                return true;
            }
        }
        false
    }

    /// Drop a track's claim. Must be paired with every `register_claim`
    /// around a scoring probe so retried seeds see a clean table.
    pub fn unregister_claim(&mut self, track_id: u32) {
        for slot in self.claims.iter_mut() {
            if *slot == Some(track_id) {
                *slot = None;
            }
        }
    }

    /// Tracks currently claiming this cluster.
    pub fn claimants(&self) -> impl Iterator<Item = u32> + '_ {
        self.claims.iter().flatten().copied()
    }

    pub fn n_claims(&self) -> usize {
        self.claims.iter().flatten().count()
    }
}

/// Reference to a cluster inside the layer indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub layer: u8,
    pub index: u16,
}

impl ClusterRef {
    /// Packed integer form, kept only for the external emission boundary.
    #[inline]
    pub fn pack(self) -> u32 {
        (self.layer as u32) << 16 | self.index as u32
    }

    #[inline]
    pub fn unpack(packed: u32) -> Self {
        Self {
            layer: (packed >> 16) as u8,
            index: (packed & 0xffff) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cluster() -> Cluster {
        let rec = ClusterRecord {
            y: 0.1,
            z: 1.0,
            sigma_y2: 1e-6,
            sigma_z2: 4e-6,
            segment: 3,
            charge: 80.0,
            ny: 2,
            nz: 2,
            label: 7,
        };
        Cluster::from_record(&rec, 2, 4.5)
    }

    #[test]
    fn test_dead_zone_marker() {
        let mut c = sample_cluster();
        assert!(!c.is_dead_zone());
        c.charge = 0.0;
        assert!(c.is_dead_zone());
    }

    #[test]
    fn test_claim_register_unregister() {
        let mut c = sample_cluster();
        assert!(c.register_claim(1));
        assert!(c.register_claim(2));
        // Registering twice is a no-op
        assert!(c.register_claim(1));
        assert_eq!(c.n_claims(), 2);

        c.unregister_claim(1);
        assert_eq!(c.n_claims(), 1);
        assert_eq!(c.claimants().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_claim_fan_in_bounded() {
        let mut c = sample_cluster();
        for id in 0..MAX_CLAIMS as u32 {
            assert!(c.register_claim(id));
        }
        // Fan-in exhausted: further claims are dropped, not stored
        assert!(!c.register_claim(99));
        assert_eq!(c.n_claims(), MAX_CLAIMS);
    }

    #[test]
    fn test_cluster_ref_pack_round_trip() {
        let r = ClusterRef { layer: 5, index: 1234 };
        assert_eq!(ClusterRef::unpack(r.pack()), r);
    }
}
