//! Ports: the seams the dispatcher and the cleanup gate depend on.

pub mod clock;
pub mod id_generator;
pub mod runner;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::runner::{ProgressReporter, StepContext, StepRunner};
