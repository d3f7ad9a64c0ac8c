//! HelixTrack simulation harness.
//!
//! Deterministic event generation and efficiency accounting for exercising
//! the track finder end to end. All entropy derives from a single 64-bit
//! seed, so any run can be replayed exactly.

pub mod event;
pub mod report;

pub use event::{EventConfig, EventGenerator, GeneratedEvent, TruthTrack};
pub use report::RunReport;
