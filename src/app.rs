//! Wires the service counter and the limiter registry together.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::RatewatchConfig;
use crate::error::Result;
use crate::http::AppState;
use crate::lifetime::Lifetime;
use crate::ratelimit::{LimiterRegistry, WindowCounter};

/// The running core of the service.
#[derive(Debug)]
pub struct App {
    counter: Arc<WindowCounter>,
    registry: Option<Arc<LimiterRegistry>>,
}

impl App {
    /// Restore or build the counter and, when enabled, the limiter registry,
    /// then start their background loops inside `lifetime`.
    ///
    /// If any loop fails later on, `lifetime` is cancelled.
    pub async fn start(config: &RatewatchConfig, lifetime: &Lifetime) -> Result<Self> {
        let counter_persistence = config.counter_persistence()?;
        let limiter_persistence = config.limiter_persistence()?;

        if let Some(dir) = &config.persistence.dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let counter = Arc::new(WindowCounter::restore_or_new(
            config.counter_settings()?,
            counter_persistence,
        )?);
        info!(value = counter.value(), "Window counter ready");

        supervise(lifetime, "window counter", {
            let counter = Arc::clone(&counter);
            let scope = lifetime.clone();
            async move { counter.run(&scope).await }
        });

        let registry = if config.limiter_enabled() {
            let registry = Arc::new(LimiterRegistry::restore_or_new(
                config.limiter_settings()?,
                config.limiter.limit,
                limiter_persistence,
                lifetime.child(),
            )?);
            info!(
                keys = registry.len(),
                limit = registry.limit(),
                "Limiter registry ready"
            );

            supervise(lifetime, "limiter registry", {
                let registry = Arc::clone(&registry);
                async move { registry.run().await }
            });
            Some(registry)
        } else {
            info!("Admission control disabled");
            None
        };

        Ok(Self { counter, registry })
    }

    pub fn counter(&self) -> &Arc<WindowCounter> {
        &self.counter
    }

    pub fn registry(&self) -> Option<&Arc<LimiterRegistry>> {
        self.registry.as_ref()
    }

    /// State for the HTTP handlers.
    pub fn state(&self) -> AppState {
        AppState::new(Arc::clone(&self.counter), self.registry.clone())
    }
}

/// Run `task` inside `lifetime`, cancelling the whole lifetime if it returns
/// an error or panics.
fn supervise<F>(lifetime: &Lifetime, component: &'static str, task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let handle = lifetime.spawn(task);
    let root = lifetime.clone();
    lifetime.spawn(async move {
        let failure = match handle.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        error!(component, error = %failure, "Background task failed, shutting down");
        root.cancel();
    });
}
