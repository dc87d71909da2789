//! Tuner management: lease arbitration, child-process supervision and
//! live-stream sessions.

pub mod arbiter;
pub mod command;
pub mod session;
pub mod supervisor;

pub use arbiter::{CancelHandle, Lease, LeaseKind, TunerArbiter};
pub use session::{LiveStream, SessionRegistry};
