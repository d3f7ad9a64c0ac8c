//! Per-layer spatial index over the loaded clusters.
//!
//! Clusters are kept sorted by z and additionally bucketed along the
//! azimuthal arc at two granularities. A road query picks the finest table
//! whose bucket extent still fully contains the requested window, falling
//! back to the coarse table and finally to a plain scan of the z-sorted
//! store. All three paths yield the same clusters in ascending z order.

use crate::cluster::Cluster;

/// Rectangular search window in (z, arc) layer coordinates.
///
/// `arc_min > arc_max` encodes a window wrapping through arc = 0.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub z_min: f64,
    pub z_max: f64,
    pub arc_min: f64,
    pub arc_max: f64,
}

impl Window {
    fn contains_arc(&self, arc: f64) -> bool {
        if self.arc_min <= self.arc_max {
            arc >= self.arc_min && arc <= self.arc_max
        } else {
            arc >= self.arc_min || arc <= self.arc_max
        }
    }

    fn arc_width(&self, circumference: f64) -> f64 {
        if self.arc_min <= self.arc_max {
            self.arc_max - self.arc_min
        } else {
            circumference - self.arc_min + self.arc_max
        }
    }
}

/// Restartable cursor over one active window.
#[derive(Debug, Clone)]
pub struct WindowCursor {
    window: Window,
    /// Which bucket list each lane walks (index into the chosen table)
    lanes: Vec<usize>,
    /// Per-lane position within the bucket's z-sorted index list
    positions: Vec<usize>,
    /// Which table the lanes refer to: 0 fine, 1 coarse, 2 full scan
    table: u8,
}

/// Azimuthal bucket table; each bucket holds cluster indices sorted by z.
#[derive(Debug, Clone, Default)]
struct BucketTable {
    bucket_width: f64,
    buckets: Vec<Vec<u16>>,
}

impl BucketTable {
    fn build(n_buckets: usize, circumference: f64, clusters: &[Cluster]) -> Self {
        let bucket_width = circumference / n_buckets as f64;
        let mut buckets = vec![Vec::new(); n_buckets];
        // Clusters arrive z-sorted, so each bucket list stays z-sorted
        for (i, c) in clusters.iter().enumerate() {
            let b = ((c.arc / bucket_width) as usize).min(n_buckets - 1);
            buckets[b].push(i as u16);
        }
        Self { bucket_width, buckets }
    }

    /// Bucket ids intersecting the arc range of `window` (wrap-aware).
    fn intersecting(&self, window: &Window) -> Vec<usize> {
        let n = self.buckets.len();
        let first = ((window.arc_min / self.bucket_width) as usize).min(n - 1);
        let last = ((window.arc_max / self.bucket_width) as usize).min(n - 1);
        let mut ids = Vec::new();
        let mut b = first;
        loop {
            ids.push(b);
            if b == last {
                break;
            }
            b = (b + 1) % n;
            if ids.len() >= n {
                break;
            }
        }
        ids
    }
}

/// Cluster store and road index for one barrel layer.
#[derive(Debug)]
pub struct LayerIndex {
    pub layer: u8,
    pub radius: f64,
    circumference: f64,
    n_fine: usize,
    n_coarse: usize,
    clusters: Vec<Cluster>,
    fine: BucketTable,
    coarse: BucketTable,
}

impl LayerIndex {
    pub fn new(layer: u8, radius: f64, n_segments: usize) -> Self {
        let circumference = std::f64::consts::TAU * radius;
        Self {
            layer,
            radius,
            circumference,
            n_fine: (n_segments * 4).max(8),
            n_coarse: (n_segments / 4).max(2),
            clusters: Vec::new(),
            fine: BucketTable::default(),
            coarse: BucketTable::default(),
        }
    }

    /// Replace the layer contents and rebuild both bucket tables.
    pub fn load(&mut self, mut clusters: Vec<Cluster>) {
        clusters.sort_by(|a, b| a.z.total_cmp(&b.z));
        self.fine = BucketTable::build(self.n_fine, self.circumference, &clusters);
        self.coarse = BucketTable::build(self.n_coarse, self.circumference, &clusters);
        self.clusters = clusters;
    }

    pub fn clear(&mut self) {
        self.clusters.clear();
        self.fine = BucketTable::default();
        self.coarse = BucketTable::default();
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Arc length of the full layer circle, cm.
    pub fn circumference(&self) -> f64 {
        self.circumference
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn get(&self, index: u16) -> &Cluster {
        &self.clusters[index as usize]
    }

    pub fn get_mut(&mut self, index: u16) -> &mut Cluster {
        &mut self.clusters[index as usize]
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Set the active search window and return a restartable cursor.
    pub fn select_clusters(&self, window: Window) -> WindowCursor {
        if self.clusters.is_empty() {
            return WindowCursor { window, lanes: Vec::new(), positions: Vec::new(), table: 2 };
        }
        let width = window.arc_width(self.circumference);
        let (table, lanes) = if width <= self.fine.bucket_width {
            (0u8, self.fine.intersecting(&window))
        } else if width <= self.coarse.bucket_width {
            (1u8, self.coarse.intersecting(&window))
        } else {
            // Window wider than any bucket: scan the whole z-sorted store
            let pos = self.clusters.partition_point(|c| c.z < window.z_min);
            return WindowCursor { window, lanes: vec![0], positions: vec![pos], table: 2 };
        };
        let mut positions = Vec::with_capacity(lanes.len());
        for &lane in &lanes {
            let list = self.lane_list(table, lane);
            // First index whose z reaches the window
            let pos = list.partition_point(|&i| self.clusters[i as usize].z < window.z_min);
            positions.push(pos);
        }
        WindowCursor { window, lanes, positions, table }
    }

    fn lane_list(&self, table: u8, lane: usize) -> &[u16] {
        match table {
            0 => &self.fine.buckets[lane],
            1 => &self.coarse.buckets[lane],
            _ => &[],
        }
    }

    /// Next cluster intersecting the active window, in ascending z.
    pub fn next_cluster(&self, cursor: &mut WindowCursor) -> Option<u16> {
        if cursor.table == 2 {
            // Full scan lane over the z-sorted store
            let pos = cursor.positions.get_mut(0)?;
            while *pos < self.clusters.len() {
                let i = *pos as u16;
                let c = &self.clusters[*pos];
                *pos += 1;
                if c.z > cursor.window.z_max {
                    return None;
                }
                if cursor.window.contains_arc(c.arc) {
                    return Some(i);
                }
            }
            return None;
        }
        loop {
            // Pick the lane whose head has the smallest z
            let mut best: Option<(usize, f64)> = None;
            for (li, (&lane, &pos)) in cursor.lanes.iter().zip(cursor.positions.iter()).enumerate() {
                let list = self.lane_list(cursor.table, lane);
                if pos >= list.len() {
                    continue;
                }
                let z = self.clusters[list[pos] as usize].z;
                if z > cursor.window.z_max {
                    continue;
                }
                if best.map_or(true, |(_, bz)| z < bz) {
                    best = Some((li, z));
                }
            }
            let (li, _) = best?;
            let lane = cursor.lanes[li];
            let idx = self.lane_list(cursor.table, lane)[cursor.positions[li]];
            cursor.positions[li] += 1;
            if cursor.window.contains_arc(self.clusters[idx as usize].arc) {
                return Some(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterRecord;

    fn cluster_at(z: f64, arc: f64) -> Cluster {
        let rec = ClusterRecord {
            y: 0.0,
            z,
            sigma_y2: 1e-6,
            sigma_z2: 1e-6,
            segment: 0,
            charge: 50.0,
            ny: 1,
            nz: 1,
            label: 0,
        };
        Cluster::from_record(&rec, 0, arc)
    }

    fn loaded_layer(points: &[(f64, f64)]) -> LayerIndex {
        let mut layer = LayerIndex::new(0, 4.0, 20);
        layer.load(points.iter().map(|&(z, arc)| cluster_at(z, arc)).collect());
        layer
    }

    fn collect(layer: &LayerIndex, window: Window) -> Vec<(f64, f64)> {
        let mut cursor = layer.select_clusters(window);
        let mut out = Vec::new();
        while let Some(i) = layer.next_cluster(&mut cursor) {
            let c = layer.get(i);
            out.push((c.z, c.arc));
        }
        out
    }

    #[test]
    fn test_window_yields_ascending_z() {
        let layer = loaded_layer(&[(3.0, 1.0), (-2.0, 1.1), (0.5, 0.9), (1.0, 20.0)]);
        let hits = collect(
            &layer,
            Window { z_min: -5.0, z_max: 5.0, arc_min: 0.5, arc_max: 1.5 },
        );
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_window_excludes_outside() {
        let layer = loaded_layer(&[(0.0, 1.0), (0.0, 5.0), (10.0, 1.0)]);
        let hits = collect(
            &layer,
            Window { z_min: -1.0, z_max: 1.0, arc_min: 0.5, arc_max: 1.5 },
        );
        assert_eq!(hits, vec![(0.0, 1.0)]);
    }

    #[test]
    fn test_wrapped_arc_window() {
        let circumference = std::f64::consts::TAU * 4.0;
        let layer = loaded_layer(&[(0.0, 0.05), (0.0, circumference - 0.05), (0.0, 10.0)]);
        let hits = collect(
            &layer,
            Window {
                z_min: -1.0,
                z_max: 1.0,
                arc_min: circumference - 0.2,
                arc_max: 0.2,
            },
        );
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_wide_window_falls_back_to_scan() {
        let circumference = std::f64::consts::TAU * 4.0;
        let layer = loaded_layer(&[(0.0, 1.0), (1.0, 12.0), (2.0, 24.0), (9.0, 1.0)]);
        let hits = collect(
            &layer,
            Window { z_min: -1.0, z_max: 5.0, arc_min: 0.0, arc_max: circumference },
        );
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_cursor_restartable() {
        let layer = loaded_layer(&[(0.0, 1.0), (1.0, 1.0)]);
        let window = Window { z_min: -1.0, z_max: 2.0, arc_min: 0.5, arc_max: 1.5 };
        let first = collect(&layer, window);
        let second = collect(&layer, window);
        assert_eq!(first, second);
    }

    #[test]
    fn test_reload_rebuilds_buckets() {
        let mut layer = loaded_layer(&[(0.0, 1.0)]);
        layer.load(vec![cluster_at(5.0, 2.0), cluster_at(4.0, 2.0)]);
        assert_eq!(layer.len(), 2);
        let hits = collect(
            &layer,
            Window { z_min: 0.0, z_max: 10.0, arc_min: 1.5, arc_max: 2.5 },
        );
        assert_eq!(hits.len(), 2);
        assert!(hits[0].0 <= hits[1].0);
    }
}
