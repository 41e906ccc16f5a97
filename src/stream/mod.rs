//! Stream adapters over media packet sequences.

mod paced;

pub use paced::{MAX_PACING_GAP, PacedExt, Paced, Presented};
