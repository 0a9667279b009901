use crate::config::{BackchannelConfig, RetryConfig, TransportSecurity};
use crate::error::ConfigError;
use crate::handler::{ClientSettings, HandlerBuilder};
use crate::policy::{BackoffPolicy, RetryPolicy};
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// Mutation of the client-level settings, run during a build.
pub type ClientAction = Arc<dyn Fn(&mut ClientSettings) -> Result<(), ConfigError> + Send + Sync>;

/// Mutation of the handler under construction, run during a build.
pub type HandlerAction = Arc<dyn Fn(&mut HandlerBuilder) -> Result<(), ConfigError> + Send + Sync>;

/// Configuration feeding one client build.
///
/// Actions run in insertion order. `retry_policy: None` means no resiliency
/// layer is installed.
#[derive(Clone, Default)]
pub struct ClientConfiguration {
    pub client_actions: Vec<ClientAction>,
    pub handler_actions: Vec<HandlerAction>,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl ClientConfiguration {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client_action(
        mut self,
        action: impl Fn(&mut ClientSettings) -> Result<(), ConfigError> + Send + Sync + 'static,
    ) -> Self {
        self.client_actions.push(Arc::new(action));
        self
    }

    #[must_use]
    pub fn with_handler_action(
        mut self,
        action: impl Fn(&mut HandlerBuilder) -> Result<(), ConfigError> + Send + Sync + 'static,
    ) -> Self {
        self.handler_actions.push(Arc::new(action));
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

impl fmt::Debug for ClientConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfiguration")
            .field("client_actions", &self.client_actions.len())
            .field("handler_actions", &self.handler_actions.len())
            .field("retry_policy", &self.retry_policy.is_some())
            .finish()
    }
}

/// Hot-reloadable configuration snapshot.
///
/// Readers never block: [`current`](Self::current) is a lock-free load, and
/// an [`update`](Self::update) is seen by the next reader. Clones share the
/// same slot.
pub struct OptionsMonitor<T> {
    slot: Arc<ArcSwap<T>>,
}

impl<T> OptionsMonitor<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            slot: Arc::new(ArcSwap::from_pointee(value)),
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<T> {
        self.slot.load_full()
    }

    pub fn update(&self, value: T) {
        self.slot.store(Arc::new(value));
    }
}

impl<T> Clone for OptionsMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Default> Default for OptionsMonitor<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for OptionsMonitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OptionsMonitor")
            .field(&*self.slot.load())
            .finish()
    }
}

impl BackchannelConfig {
    /// Turn the declarative config into build actions.
    ///
    /// `retry` becomes a [`BackoffPolicy`]; TLS roots and insecure HTTP are
    /// applied to the primary transport; `user_agent` replaces the default
    /// User-Agent header.
    #[must_use]
    pub fn into_configuration(self) -> ClientConfiguration {
        let mut configuration = ClientConfiguration::new();

        if let Some(retry) = &self.retry {
            let policy: Arc<dyn RetryPolicy> = Arc::new(BackoffPolicy::new(RetryConfig::from(retry)));
            configuration = configuration.with_retry_policy(policy);
        }

        let tls_roots = self.tls_roots;
        let transport_security = if self.allow_insecure_http {
            TransportSecurity::AllowInsecureHttp
        } else {
            TransportSecurity::TlsOnly
        };
        configuration = configuration.with_handler_action(move |handler| {
            let transport = handler.hyper_transport_mut()?;
            transport.tls_roots = tls_roots;
            transport.transport_security = transport_security;
            Ok(())
        });

        if let Some(user_agent) = self.user_agent {
            configuration = configuration
                .with_client_action(move |settings| settings.set_user_agent(&user_agent));
        }

        configuration
    }
}
