//! Test doubles for the runq dispatch queue.
//!
//! - [`FakeRunner`] and [`FakeRunnerServerClient`] stand in for remote runner servers
//! - [`FakeBuilderService`] replays a scripted build status sequence
//! - [`StaticConfigProvider`] serves workspace and project settings from memory
//! - [`RecordingPublisher`] keeps every published event

mod events;
mod mock;
mod provider;

pub use events::RecordingPublisher;
pub use mock::{BuildRecord, FakeBuilderService, FakeRunner, FakeRunnerServerClient};
pub use provider::StaticConfigProvider;

use tracing_subscriber::filter::LevelFilter;

/// Install a test-friendly `tracing` subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}
