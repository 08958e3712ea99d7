//! Small shared utilities for the fleet controller crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};
