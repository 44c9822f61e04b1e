//! The fleet coordination engine and the pieces that drive it.

pub mod clock;
pub mod emergency;
pub mod engine;
pub mod handle;
pub mod insights;
pub mod motion;
pub mod scheduler;

pub use clock::{ClockState, SimulationClock};
pub use emergency::EmergencyLatch;
pub use engine::FleetEngine;
pub use handle::FleetHandle;
