/// Builder for constructing run queue instances.
pub mod builder;
/// Run queue, its background loops and the shutdown token.
pub mod supervisor;
/// Per-task wait loop and process supervision.
mod worker;

pub use builder::RunQueueBuilder;
pub use supervisor::{RunQueue, ShutdownToken};
