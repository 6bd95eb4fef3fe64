use std::fmt;
use std::sync::Arc;

use crate::admission::ResourceAdmissionChecker;
use crate::build::BuilderService;
use crate::config::RunQueueConfig;
use crate::events::{EventPublisher, RunEvent};
use crate::provider::ConfigProvider;
use crate::registry::RunnerServerRegistry;
use crate::runner::RunnerServerClient;
use crate::strategy::{LeastRecentlyUsed, RunnerSelectionStrategy};
use crate::task::TaskContext;

use super::supervisor::RunQueue;

/// Builder for constructing a [`RunQueue`] with explicit dependencies.
///
/// The config provider and runner server client are required. The selection
/// strategy defaults to [`LeastRecentlyUsed`]. Events always reach the
/// queue's in-process bus (see [`RunQueue::subscribe_events`]); a publisher set
/// with [`with_events`](Self::with_events) receives them as well. Without a
/// builder service runs that need a build are rejected.
///
/// # Example
///
/// ```ignore
/// use runq::*;
///
/// let queue = RunQueueBuilder::new(RunQueueConfig::default())
///     .with_provider(provider)
///     .with_client(client)
///     .with_builder_service(builder)
///     .with_events(events)
///     .build()?;
/// queue.start().await?;
/// ```
pub struct RunQueueBuilder {
    config: RunQueueConfig,
    provider: Option<Arc<dyn ConfigProvider>>,
    client: Option<Arc<dyn RunnerServerClient>>,
    strategy: Option<Arc<dyn RunnerSelectionStrategy>>,
    builder_service: Option<Arc<dyn BuilderService>>,
    events: Option<Arc<dyn EventPublisher<RunEvent>>>,
}

impl fmt::Debug for RunQueueBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunQueueBuilder")
            .field("config", &self.config)
            .field("provider_set", &self.provider.is_some())
            .field("client_set", &self.client.is_some())
            .field("strategy_set", &self.strategy.is_some())
            .field("builder_service_set", &self.builder_service.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl RunQueueBuilder {
    pub fn new(config: RunQueueConfig) -> Self {
        Self {
            config,
            provider: None,
            client: None,
            strategy: None,
            builder_service: None,
            events: None,
        }
    }

    /// Set the project/workspace configuration provider.
    pub fn with_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the client used to connect to and ping runner servers.
    pub fn with_client(mut self, client: Arc<dyn RunnerServerClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn RunnerSelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_builder_service(mut self, service: Arc<dyn BuilderService>) -> Self {
        self.builder_service = Some(service);
        self
    }

    /// Forward events to an external publisher in addition to the in-process bus.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher<RunEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the [`RunQueue`].
    ///
    /// # Errors
    ///
    /// Returns an error if the provider or the client is missing, or if the
    /// configuration is out of range.
    pub fn build(self) -> anyhow::Result<RunQueue> {
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("provider dependency missing"))?;
        let client = self
            .client
            .ok_or_else(|| anyhow::anyhow!("client dependency missing"))?;

        let threshold = self.config.disk_usage_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("disk_usage_threshold must be within [0, 1], got {threshold}");
        }
        let intervals = [
            ("poll_interval_ms", self.config.poll_interval_ms),
            ("build_poll_interval_ms", self.config.build_poll_interval_ms),
            ("cleaner_interval_ms", self.config.cleaner_interval_ms),
            ("liveness_interval_ms", self.config.liveness_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("{name} must be positive");
            }
        }

        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(LeastRecentlyUsed) as Arc<dyn RunnerSelectionStrategy>);

        let registry = Arc::new(RunnerServerRegistry::new(
            client,
            self.config.connect_timeout(),
            self.config.liveness_failure_threshold,
        ));
        let admission = Arc::new(ResourceAdmissionChecker::new(
            Arc::clone(&provider),
            threshold,
        ));
        let context = Arc::new(TaskContext::new(
            Arc::clone(&admission),
            self.config.event_capacity,
            self.events,
        ));

        Ok(RunQueue::new(
            self.config,
            provider,
            registry,
            strategy,
            admission,
            self.builder_service,
            context,
        ))
    }
}
