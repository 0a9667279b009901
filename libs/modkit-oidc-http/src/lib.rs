#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Hardened back-channel HTTP clients for OAuth/OIDC validation
//!
//! The [`ClientRegistry`] hands out named [`HttpClient`]s, builds each at
//! most once per cache window and rebuilds it after `handler_lifetime`.
//! Every build of the back-channel client ([`ClientName::backchannel`]) runs
//! a fixed pipeline:
//!
//! 1. security defaults: 60 s per-attempt timeout, 10 MiB response cap, no
//!    cookie jar on the hyper transport
//! 2. user client actions ([`ClientSettings`])
//! 3. the [`ResiliencyLayer`], if a [`RetryPolicy`] is configured
//! 4. user handler actions ([`HandlerBuilder`])
//! 5. verification that the hardened transport is still the primary handler
//!
//! Configuration lives in an [`OptionsMonitor`] and is read on every build,
//! so updates apply to the next build after expiry or [`ClientRegistry::evict`].
//! Other client names are never hardened.
//!
//! # Example
//!
//! ```ignore
//! use modkit_oidc_http::{BackchannelConfig, ClientName, ClientRegistry, OptionsMonitor,
//!     RegistryConfig};
//!
//! let options = OptionsMonitor::new(BackchannelConfig::default().into_configuration());
//! let registry = ClientRegistry::with_backchannel(RegistryConfig::default(), options);
//!
//! let client = registry.get_or_create(&ClientName::backchannel()).await?;
//! let metadata: serde_json::Value = client
//!     .get("https://idp.example.com/.well-known/openid-configuration")
//!     .send()
//!     .await?
//!     .json()
//!     .await?;
//! ```

mod client;
mod config;
mod error;
mod handler;
pub mod hardener;
mod layers;
mod name;
mod options;
mod pipeline;
mod policy;
mod registry;
mod request;
mod response;
mod tls;

pub use client::{BufferedService, HttpClient, ServiceFuture};
pub use config::{
    BackchannelConfig, DEFAULT_HANDLER_LIFETIME, DEFAULT_MAX_RESPONSE_BUFFER_SIZE,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT, DEFAULT_USER_AGENT,
    ExponentialBackoff, IDEMPOTENCY_KEY_HEADER, MAX_RESPONSE_BUFFER_SIZE, REQUEST_TIMEOUT,
    RegistryConfig, RetryConfig, RetryPolicyConfig, RetryTrigger, TlsRootConfig,
    TransportSecurity, is_idempotent_method,
};
pub use error::{ConfigError, HttpError};
pub use handler::{
    ClientSettings, DelegatingLayer, HandlerBuilder, HandlerService, HyperTransport,
    PrimaryHandler, TransportKind,
};
pub use layers::{
    AttemptDeadlineLayer, AttemptDeadlineService, CookieJar, CookieLayer, CookieService,
    DeadlineBody, DefaultHeadersLayer, DefaultHeadersService,
    RETRY_ATTEMPT_HEADER, ResiliencyLayer, ResiliencyService, ResponseLimitLayer,
    ResponseLimitService,
};
pub use name::ClientName;
pub use options::{ClientAction, ClientConfiguration, HandlerAction, OptionsMonitor};
pub use pipeline::{
    BackchannelPipeline, BuildContext, BuildPipeline, NamedClientPipeline, PipelineProvider,
};
pub use policy::{
    AttemptContext, AttemptOutcome, BackoffPolicy, RetryDecision, RetryPolicy, calculate_backoff,
};
pub use registry::ClientRegistry;
pub use request::RequestBuilder;
pub use response::{ERROR_BODY_PREVIEW_LIMIT, HttpResponse, LimitedBody, ResponseBody, parse_retry_after};
