//! Clocks, instants, and the one-shot [`Timer`] service consumed by timed
//! waits.
pub use self::clock::{Clock, Instant, Ticks};
pub use self::timer::{Sleep, Timer};
pub use core::time::Duration;

mod clock;
mod timer;
