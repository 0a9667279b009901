//! Named, lazily built, time-limited clients.
//!
//! One build per name per cache window: concurrent callers share a
//! [`tokio::sync::OnceCell`] stored in the cache entry, so they await the same
//! build instead of racing to create transports. Expired entries are replaced,
//! never mutated; clients handed out earlier keep their handler. Every cache
//! miss also drops the expired entries of other names.

use crate::client::HttpClient;
use crate::config::RegistryConfig;
use crate::error::ConfigError;
use crate::name::ClientName;
use crate::options::{ClientConfiguration, OptionsMonitor};
use crate::pipeline::{BackchannelPipeline, BuildContext, BuildPipeline, PipelineProvider};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::Instant;

struct CacheEntry {
    expires_at: Instant,
    client: OnceCell<HttpClient>,
}

impl CacheEntry {
    fn new(expires_at: Instant) -> Self {
        Self {
            expires_at,
            client: OnceCell::new(),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Registry of named clients.
///
/// Which stages a name's build runs is decided by the registered
/// [`PipelineProvider`]s, in registration order. A name no provider owns is
/// built with plain defaults.
pub struct ClientRegistry {
    config: RegistryConfig,
    providers: Vec<Arc<dyn PipelineProvider>>,
    entries: DashMap<ClientName, Arc<CacheEntry>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            entries: DashMap::new(),
        }
    }

    /// Registry serving the hardened back-channel client from `options`.
    #[must_use]
    pub fn with_backchannel(
        config: RegistryConfig,
        options: OptionsMonitor<ClientConfiguration>,
    ) -> Self {
        Self::new(config).with_provider(BackchannelPipeline::new(options))
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl PipelineProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Cached client for `name`, building it if absent or expired.
    ///
    /// A failed build is not cached; the next call tries again.
    ///
    /// # Errors
    /// Returns the `ConfigError` of a failed build.
    pub async fn get_or_create(&self, name: &ClientName) -> Result<HttpClient, ConfigError> {
        let entry = self.active_entry(name);
        let client = entry
            .client
            .get_or_try_init(|| async { self.build(name) })
            .await?;
        Ok(client.clone())
    }

    /// Drop the cached entry for `name`; returns whether one existed.
    ///
    /// Clients already handed out keep working.
    pub fn evict(&self, name: &ClientName) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Names with a built, unexpired client.
    #[must_use]
    pub fn active_names(&self) -> Vec<ClientName> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_live(now) && entry.value().client.initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn active_entry(&self, name: &ClientName) -> Arc<CacheEntry> {
        let now = Instant::now();

        // Read guard must be released before `entry()` takes the shard lock
        let cached = self.entries.get(name).map(|entry| Arc::clone(entry.value()));
        if let Some(entry) = cached
            && entry.is_live(now)
        {
            return entry;
        }

        self.sweep_expired(now);

        let fresh = Arc::new(CacheEntry::new(now + self.config.handler_lifetime));
        match self.entries.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Arc::clone(occupied.get());
                }
                occupied.insert(Arc::clone(&fresh));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&fresh));
            }
        }
        fresh
    }

    /// Drop every expired entry, so names that are never requested again
    /// release their client and connection pool.
    ///
    /// Must not be called while holding a guard into `entries`.
    fn sweep_expired(&self, now: Instant) {
        let lifetime = self.config.handler_lifetime;
        self.entries.retain(|name, entry| {
            let live = entry.is_live(now);
            if !live {
                tracing::info!(client = %name, ?lifetime, "client handler expired; dropping it");
            }
            live
        });
    }

    fn build(&self, name: &ClientName) -> Result<HttpClient, ConfigError> {
        tracing::debug!(client = %name, "building client");

        let pipeline = self
            .providers
            .iter()
            .filter_map(|provider| provider.pipeline_for(name))
            .fold(BuildPipeline::new(), BuildPipeline::extend);
        let pipeline = if name.is_backchannel() {
            pipeline.ending_with_verification()
        } else {
            pipeline
        };
        let mut ctx = BuildContext::new(name.clone());
        pipeline.run(&mut ctx)?;

        let BuildContext { settings, handler } = ctx;
        let has_resiliency = handler.has_resiliency();
        let service = handler.into_service(&settings)?;
        let client = HttpClient::new(name.clone(), service, &settings, self.config.buffer_capacity);

        tracing::debug!(
            client = %name,
            timeout = ?settings.timeout,
            max_response_buffer_size = settings.max_response_buffer_size,
            resiliency = has_resiliency,
            "client built"
        );
        Ok(client)
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("config", &self.config)
            .field("providers", &self.providers.len())
            .field("entries", &self.entries.len())
            .finish()
    }
}
