//! Handler construction: the primary transport plus the layers wrapped
//! around it during a build.
//!
//! Request flow of a built handler (outer → inner):
//!
//! ```text
//! DefaultHeaders → user layers → Resiliency → ResponseLimit → AttemptDeadline → primary
//! ```
//!
//! The resiliency layer has its own slot next to the transport, so every
//! retried attempt goes through the size cap, the per-attempt deadline and the
//! transport's cookie setting again. User layers always wrap it from outside.
//! The deadline covers the response body as well as the wait for headers.

use crate::config::{
    DEFAULT_MAX_RESPONSE_BUFFER_SIZE, DEFAULT_REQUEST_TIMEOUT, DEFAULT_USER_AGENT, TlsRootConfig,
    TransportSecurity,
};
use crate::error::{ConfigError, HttpError};
use crate::layers::{
    AttemptDeadlineLayer, CookieLayer, DefaultHeadersLayer, ResiliencyLayer, ResponseLimitLayer,
};
use crate::name::ClientName;
use crate::response::ResponseBody;
use crate::tls;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

/// Type-erased service produced at every step of the handler assembly.
pub type HandlerService = BoxCloneService<Request<Full<Bytes>>, Response<ResponseBody>, HttpError>;

/// Capability tag of a primary handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// The pooled hyper transport ([`HyperTransport`])
    Hyper,
    /// Anything else, named by its implementation
    Custom(&'static str),
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hyper => f.write_str("hyper"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// The innermost, connection-owning handler of a client.
pub trait PrimaryHandler: Send + 'static {
    fn kind(&self) -> TransportKind;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Turn the configured handler into the service every attempt runs on.
    ///
    /// # Errors
    /// Returns `ConfigError` if the transport cannot be created.
    fn into_service(self: Box<Self>) -> Result<HandlerService, ConfigError>;
}

/// Pooled hyper transport with rustls.
///
/// A new value (from `Default`) is never hardened; only the hardener marks a
/// transport as such, which is how a replaced primary is detected.
#[derive(Debug, Clone)]
pub struct HyperTransport {
    /// Keep a per-handler cookie jar
    pub use_cookies: bool,
    pub transport_security: TransportSecurity,
    pub tls_roots: TlsRootConfig,
    /// `None` keeps idle connections forever
    pub pool_idle_timeout: Option<Duration>,
    /// `0` disables connection reuse
    pub pool_max_idle_per_host: usize,
    hardened: bool,
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self {
            use_cookies: true,
            transport_security: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::WebPki,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
            hardened: false,
        }
    }
}

impl HyperTransport {
    #[must_use]
    pub fn is_hardened(&self) -> bool {
        self.hardened
    }

    pub(crate) fn mark_hardened(&mut self) {
        self.hardened = true;
    }
}

impl PrimaryHandler for HyperTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Hyper
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_service(self: Box<Self>) -> Result<HandlerService, ConfigError> {
        if self.transport_security == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let https = tls::https_connector(self.tls_roots, self.transport_security)?;

        // pool_timer is required for pool_idle_timeout to take effect
        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .http2_only(false);
        if let Some(idle) = self.pool_idle_timeout {
            builder.pool_idle_timeout(idle);
        }
        let client = builder.build::<_, Full<Bytes>>(https);

        let service = ServiceBuilder::new()
            .layer(DecompressionLayer::new())
            .service(client)
            .map_response(|response| {
                let (parts, body) = response.into_parts();
                let body: ResponseBody = body.map_err(Into::into).boxed();
                Response::from_parts(parts, body)
            })
            .map_err(HttpError::from)
            .boxed_clone();

        if self.use_cookies {
            Ok(CookieLayer::default().layer(service).boxed_clone())
        } else {
            Ok(service)
        }
    }
}

/// Client-level settings mutated by the build pipeline.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Cap on buffered and streamed response bodies
    pub max_response_buffer_size: usize,
    /// Headers added to requests that don't set them
    pub default_headers: HeaderMap,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_USER_AGENT),
        );
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_response_buffer_size: DEFAULT_MAX_RESPONSE_BUFFER_SIZE,
            default_headers,
        }
    }
}

impl ClientSettings {
    /// # Errors
    /// Returns `ConfigError::InvalidHeaderValue` if `user_agent` is not a valid header value.
    pub fn set_user_agent(&mut self, user_agent: &str) -> Result<(), ConfigError> {
        self.default_headers
            .insert(http::header::USER_AGENT, HeaderValue::from_str(user_agent)?);
        Ok(())
    }
}

/// A user-supplied layer, applied around the resiliency slot.
///
/// The wrap function receives the rest of the handler stack and must keep it
/// and call it for every request. A layer that drops the service it was
/// given fails the build with `ConfigError::LayerBypassesHandler`; one that
/// keeps it but answers on its own is not detected and skips the timeout,
/// the size cap and any retries.
pub struct DelegatingLayer {
    name: Cow<'static, str>,
    wrap: Box<dyn FnOnce(HandlerService) -> HandlerService + Send>,
}

impl DelegatingLayer {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        wrap: impl FnOnce(HandlerService) -> HandlerService + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            wrap: Box::new(wrap),
        }
    }

    /// Wrap a tower layer whose service keeps the handler's request, response
    /// and error types.
    pub fn from_layer<L>(name: impl Into<Cow<'static, str>>, layer: L) -> Self
    where
        L: Layer<HandlerService> + Send + 'static,
        L::Service: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = HttpError>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<Request<Full<Bytes>>>>::Future: Send + 'static,
    {
        Self::new(name, move |inner| layer.layer(inner).boxed_clone())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for DelegatingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DelegatingLayer").field(&self.name).finish()
    }
}

/// Mutable handler under construction.
///
/// Handler actions get `&mut HandlerBuilder` after hardening and after the
/// resiliency slot is filled; they can tune the primary transport, add
/// layers around the resiliency layer or swap the primary, which fails the
/// build for hardened clients.
pub struct HandlerBuilder {
    client: ClientName,
    primary: Box<dyn PrimaryHandler>,
    layers: Vec<DelegatingLayer>,
    resiliency: Option<ResiliencyLayer>,
}

impl HandlerBuilder {
    #[must_use]
    pub fn new(client: ClientName) -> Self {
        Self {
            client,
            primary: Box::new(HyperTransport::default()),
            layers: Vec::new(),
            resiliency: None,
        }
    }

    #[must_use]
    pub fn client_name(&self) -> &ClientName {
        &self.client
    }

    #[must_use]
    pub fn primary_kind(&self) -> TransportKind {
        self.primary.kind()
    }

    #[must_use]
    pub fn primary(&self) -> &dyn PrimaryHandler {
        self.primary.as_ref()
    }

    /// The primary as a [`HyperTransport`], if it is one.
    #[must_use]
    pub fn hyper_transport(&self) -> Option<&HyperTransport> {
        if self.primary.kind() != TransportKind::Hyper {
            return None;
        }
        self.primary.as_any().downcast_ref()
    }

    /// Mutable access to the primary [`HyperTransport`].
    ///
    /// # Errors
    /// Returns `ConfigError::UnexpectedTransport` if the primary is some other transport.
    pub fn hyper_transport_mut(&mut self) -> Result<&mut HyperTransport, ConfigError> {
        let found = self.primary.kind();
        let transport = if found == TransportKind::Hyper {
            self.primary.as_any_mut().downcast_mut::<HyperTransport>()
        } else {
            None
        };
        transport.ok_or_else(|| ConfigError::UnexpectedTransport {
            client: self.client.clone(),
            expected: TransportKind::Hyper,
            found,
        })
    }

    /// Replace the primary handler, returning the previous one.
    pub fn set_primary(&mut self, primary: impl PrimaryHandler) -> Box<dyn PrimaryHandler> {
        tracing::debug!(
            client = %self.client,
            from = %self.primary.kind(),
            to = %primary.kind(),
            "primary handler replaced"
        );
        std::mem::replace(&mut self.primary, Box::new(primary))
    }

    /// Add a layer; layers pushed earlier end up further out.
    pub fn push_layer(&mut self, layer: DelegatingLayer) {
        self.layers.push(layer);
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(DelegatingLayer::name)
    }

    #[must_use]
    pub fn has_resiliency(&self) -> bool {
        self.resiliency.is_some()
    }

    pub(crate) fn install_resiliency(&mut self, layer: ResiliencyLayer) {
        self.resiliency = Some(layer);
    }

    /// Assemble the handler stack.
    pub(crate) fn into_service(
        self,
        settings: &ClientSettings,
    ) -> Result<HandlerService, ConfigError> {
        let primary = self.primary.into_service()?;

        let mut service = ServiceBuilder::new()
            .layer(ResponseLimitLayer::new(settings.max_response_buffer_size))
            .layer(AttemptDeadlineLayer::new(settings.timeout))
            .service(primary)
            .boxed_clone();

        if let Some(resiliency) = self.resiliency {
            service = resiliency.layer(service).boxed_clone();
        }

        for layer in self.layers.into_iter().rev() {
            let held = Arc::new(());
            let inner = Delegated {
                inner: service,
                _held: Arc::clone(&held),
            };
            service = (layer.wrap)(inner.boxed_clone());
            if Arc::strong_count(&held) == 1 {
                return Err(ConfigError::LayerBypassesHandler {
                    client: self.client,
                    layer: layer.name.into_owned(),
                });
            }
        }

        Ok(DefaultHeadersLayer::new(settings.default_headers.clone())
            .layer(service)
            .boxed_clone())
    }
}

/// Inner stack handed to a [`DelegatingLayer`]; `_held` stays alive only
/// while the layer keeps a copy of it.
#[derive(Clone)]
struct Delegated {
    inner: HandlerService,
    _held: Arc<()>,
}

impl Service<Request<Full<Bytes>>> for Delegated {
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = <HandlerService as Service<Request<Full<Bytes>>>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        self.inner.call(req)
    }
}

impl fmt::Debug for HandlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBuilder")
            .field("client", &self.client)
            .field("primary", &self.primary.kind())
            .field("layers", &self.layers)
            .field("resiliency", &self.resiliency.is_some())
            .finish()
    }
}
