use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Maximum buffered response size for the back-channel client (10 MiB).
pub const MAX_RESPONSE_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Per-attempt request timeout for the back-channel client.
///
/// Bounds slow-connect and slow-body (trickling) attacks that the size cap
/// alone cannot stop.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-attempt timeout for clients that are not hardened.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

/// Response buffer cap for clients that are not hardened.
pub const DEFAULT_MAX_RESPONSE_BUFFER_SIZE: usize = 0x7FFF_FFFF;

/// How long a built handler stays in the registry before it is recycled.
pub const DEFAULT_HANDLER_LIFETIME: Duration = Duration::from_secs(120);

/// Default User-Agent string for outbound requests
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-oidc-http/", env!("CARGO_PKG_VERSION"));

/// Standard idempotency key header name (display form)
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Default drain limit for response bodies discarded before a retry (64 KiB)
pub const DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT: usize = 64 * 1024;

const IDEMPOTENCY_KEY_HEADER_LOWER: &str = "idempotency-key";

/// Conditions a retry policy classifies outcomes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RetryTrigger {
    /// Connection refused, reset, DNS failure and other transport errors
    TransportError,
    /// The attempt exceeded its timeout
    Timeout,
    /// The server answered with this status code
    Status(u16),
    /// Anything a policy must never retry (size cap exceeded, closed service)
    NonRetryable,
}

impl RetryTrigger {
    pub const TOO_MANY_REQUESTS: Self = Self::Status(429);
    pub const REQUEST_TIMEOUT: Self = Self::Status(408);
    pub const INTERNAL_SERVER_ERROR: Self = Self::Status(500);
    pub const BAD_GATEWAY: Self = Self::Status(502);
    pub const SERVICE_UNAVAILABLE: Self = Self::Status(503);
    pub const GATEWAY_TIMEOUT: Self = Self::Status(504);
}

/// Whether `method` is idempotent per RFC 9110 (GET, HEAD, PUT, DELETE, OPTIONS, TRACE).
#[must_use]
pub fn is_idempotent_method(method: &http::Method) -> bool {
    matches!(
        *method,
        http::Method::GET
            | http::Method::HEAD
            | http::Method::PUT
            | http::Method::DELETE
            | http::Method::OPTIONS
            | http::Method::TRACE
    )
}

/// Exponential backoff: `min(initial * multiplier^n, max)`, plus up to 25% jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Backoff for tests: 1ms initial, 100ms max, no jitter
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Parameters of [`BackoffPolicy`](crate::BackoffPolicy).
///
/// Triggers in `always_retry` are retried for every method. Triggers in
/// `idempotent_retry` are retried only for idempotent methods, or when the
/// request carries the idempotency key header.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt; total attempts = 1 + `max_retries`
    pub max_retries: usize,
    pub backoff: ExponentialBackoff,
    pub always_retry: HashSet<RetryTrigger>,
    pub idempotent_retry: HashSet<RetryTrigger>,
    /// Use the backoff curve even when the server sends `Retry-After`
    pub ignore_retry_after: bool,
    /// Bytes drained from a discarded response so its connection can be reused
    pub retry_response_drain_limit: usize,
    pub idempotency_key_header: Option<http::header::HeaderName>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            always_retry: HashSet::from([RetryTrigger::TOO_MANY_REQUESTS]),
            idempotent_retry: HashSet::from([
                RetryTrigger::TransportError,
                RetryTrigger::Timeout,
                RetryTrigger::REQUEST_TIMEOUT,
                RetryTrigger::INTERNAL_SERVER_ERROR,
                RetryTrigger::BAD_GATEWAY,
                RetryTrigger::SERVICE_UNAVAILABLE,
                RetryTrigger::GATEWAY_TIMEOUT,
            ]),
            ignore_retry_after: false,
            retry_response_drain_limit: DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT,
            idempotency_key_header: Some(http::header::HeaderName::from_static(
                IDEMPOTENCY_KEY_HEADER_LOWER,
            )),
        }
    }
}

impl RetryConfig {
    /// Whether `trigger` warrants a retry for a request with this method.
    #[must_use]
    pub fn should_retry(
        &self,
        trigger: RetryTrigger,
        method: &http::Method,
        has_idempotency_key: bool,
    ) -> bool {
        if self.always_retry.contains(&trigger) {
            return true;
        }
        self.idempotent_retry.contains(&trigger)
            && (is_idempotent_method(method) || has_idempotency_key)
    }
}

/// TLS root certificate source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// OS native root certificate store
    Native,
}

/// Whether the transport may speak plain HTTP
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    #[default]
    TlsOnly,
    /// Plain HTTP allowed; only for local mock servers
    AllowInsecureHttp,
}

/// Registry-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Lifetime of a cached handler; the next access after expiry builds a new one.
    #[serde(with = "humantime_serde")]
    pub handler_lifetime: Duration,

    /// Capacity of the request buffer in front of each client stack (min 1).
    pub buffer_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            handler_lifetime: DEFAULT_HANDLER_LIFETIME,
            buffer_capacity: 1024,
        }
    }
}

/// Declarative retry policy, turned into a [`BackoffPolicy`](crate::BackoffPolicy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicyConfig {
    pub max_retries: usize,

    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    pub multiplier: f64,

    pub jitter: bool,

    /// Status codes retried for idempotent requests; 429 is always retried.
    pub retry_on_status: Vec<u16>,

    pub ignore_retry_after: bool,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        let backoff = ExponentialBackoff::default();
        Self {
            max_retries: 3,
            initial_backoff: backoff.initial,
            max_backoff: backoff.max,
            multiplier: backoff.multiplier,
            jitter: backoff.jitter,
            retry_on_status: vec![408, 500, 502, 503, 504],
            ignore_retry_after: false,
        }
    }
}

impl From<&RetryPolicyConfig> for RetryConfig {
    fn from(cfg: &RetryPolicyConfig) -> Self {
        let mut idempotent_retry =
            HashSet::from([RetryTrigger::TransportError, RetryTrigger::Timeout]);
        idempotent_retry.extend(cfg.retry_on_status.iter().copied().map(RetryTrigger::Status));

        Self {
            max_retries: cfg.max_retries,
            backoff: ExponentialBackoff {
                initial: cfg.initial_backoff,
                max: cfg.max_backoff,
                multiplier: cfg.multiplier,
                jitter: cfg.jitter,
            },
            idempotent_retry,
            ignore_retry_after: cfg.ignore_retry_after,
            ..Self::default()
        }
    }
}

/// Operator configuration of the back-channel client.
///
/// Converted into a [`ClientConfiguration`](crate::ClientConfiguration) with
/// [`into_configuration`](Self::into_configuration); swap the result into the
/// [`OptionsMonitor`](crate::OptionsMonitor) to reconfigure at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackchannelConfig {
    /// Retry policy; `None` means no resiliency layer.
    pub retry: Option<RetryPolicyConfig>,

    pub tls_roots: TlsRootConfig,

    /// Allow plain HTTP authorization servers (local testing only).
    pub allow_insecure_http: bool,

    /// Override for the default User-Agent.
    pub user_agent: Option<String>,
}
