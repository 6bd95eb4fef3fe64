//! runq - run dispatch queue for a cloud IDE control plane.
//!
//! Accepts "run this project" requests, optionally builds the project first,
//! places the run on a live runner out of a dynamically registering fleet of
//! runner servers, enforces per-workspace memory quotas and runner disk limits,
//! and supervises the resulting process through a bounded waiting period with
//! cancellation and timeout.
//!
//! # Core Concepts
//!
//! - **Runner servers**: remote hosts exposing named runners, registered under
//!   an [`AccessCriteria`] scope in the [`RunnerServerRegistry`] and reached
//!   through the [`RunnerServerClient`] and [`RunnerHandle`] traits.
//!
//! - **Selection**: a [`RunnerSelectionStrategy`] picks one runner out of the
//!   candidates visible to a run; [`LeastRecentlyUsed`] is the default.
//!
//! - **Admission**: the [`ResourceAdmissionChecker`] reserves workspace memory
//!   before a task exists and checks runner disk usage on every poll.
//!
//! - **Builds**: the [`BuildCoordinator`] starts a build through a
//!   [`BuilderService`] and waits for it before the run is queued.
//!
//! - **Tasks**: every accepted run is a [`RunQueueTask`] moving through
//!   `WAITING → RUNNING → DONE | CANCELLED | ERROR`, tracked by the
//!   [`TaskRegistry`].
//!
//! - **Events**: lifecycle transitions are published as [`RunEvent`]s through an
//!   [`EventPublisher`]; [`InProcEventBus`] fans them out in process.
//!
//! - **Runtime**: the [`RunQueue`] ties everything together and runs the
//!   cleaner and liveness sweeps.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use runq::*;
//!
//! let queue = RunQueueBuilder::new(RunQueueConfig::default())
//!     .with_provider(provider)
//!     .with_client(Arc::new(HttpRunnerServerClient::new()?))
//!     .build()?;
//! queue.start().await?;
//!
//! queue
//!     .register_runner_server("http://runner-1:8080", AccessCriteria::infra("community"))
//!     .await?;
//! let task = queue.run("ws1", "/app", RunOptions::new().skip_build()).await?;
//! task.wait_until_terminal().await;
//! ```

/// Workspace memory admission and runner disk checks.
pub mod admission;

/// Optional build step run before a task is queued.
pub mod build;

/// Run queue configuration.
pub mod config;

/// The error taxonomy.
pub mod error;

/// Run lifecycle events and the in-process event bus.
///
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub
/// - [`RunEvent`] and [`RunEventPayload`] for event data
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// HTTP implementations of the runner server and builder seams.
pub mod http;

#[cfg(feature = "metrics")]
/// Prometheus collectors, enabled by the `metrics` feature.
pub mod metrics;

/// Caller options for a run and how they combine with project settings.
pub mod options;

/// Project and workspace configuration source.
pub mod provider;

/// Runner server registrations and access scopes.
pub mod registry;

/// Runner handles, run requests and processes.
pub mod runner;

/// The run queue runtime.
///
/// - [`RunQueue`] - queue admission, dispatch and background sweeps
/// - [`RunQueueBuilder`] - wiring of collaborators
/// - [`ShutdownToken`] - cooperative cancellation
pub mod runtime;

/// Runner selection strategies.
pub mod strategy;

/// Tasks and the task registry.
pub mod task;

/// Tracing spans and record helpers.
pub mod telemetry;

pub use admission::*;
pub use build::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use http::*;
pub use options::*;
pub use provider::*;
pub use registry::*;
pub use runner::*;
pub use runtime::*;
pub use strategy::*;
pub use task::*;
