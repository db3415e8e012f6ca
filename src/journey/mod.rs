//! Journey construction from raw touchpoint events.

pub mod builder;
pub mod index;

pub use builder::{BuildOutcome, JourneyBuilder};
pub use index::{JourneyEntry, JourneyIndex};
