//! HelixTrack Core - Kalman-filter track finding for a cylindrical
//! silicon barrel
//!
//! The crate reconstructs charged-particle trajectories from per-layer
//! cluster streams and externally supplied seeds:
//! 1. **Prolongation search**: a bounded multi-hypothesis tree grown inward
//!    layer by layer, with explicit skip, dead-zone and vertex branches
//! 2. **Hypothesis scoring**: normalized chi-square with amplitude, shape
//!    and itinerary penalties, backward refit and seed-match gates
//! 3. **Conflict resolution**: pairwise arbitration of clusters claimed by
//!    more than one finalized track
//! 4. **V0 finding**: secondary vertices from oppositely charged track pairs

pub mod cluster;
pub mod config;
pub mod geometry;
pub mod hypothesis;
pub mod layer;
pub mod material;
pub mod prolongation;
pub mod track;
pub mod tracker;
pub mod v0;

// Re-export key types for convenience
pub use cluster::{Cluster, ClusterRecord, ClusterRef};
pub use config::{MaterialConfig, TrackerConfig, V0Config};
pub use geometry::Geometry;
pub use track::TrackState;
pub use tracker::{Seed, TrackResult, Tracker, TrackerError};
pub use v0::V0Candidate;
