use crate::error::HttpError;
use crate::handler::{ClientSettings, HandlerService};
use crate::name::ClientName;
use crate::request::RequestBuilder;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tower::buffer::Buffer;

/// Future of the boxed handler stack
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>>;

/// Handler stack behind a `Buffer` worker
pub type BufferedService = Buffer<Request<Full<Bytes>>, ServiceFuture>;

/// Client handed out by the [`ClientRegistry`](crate::ClientRegistry).
///
/// `Clone + Send + Sync`; clones share one handler and connection pool.
/// The handler stays alive for as long as any clone does, so requests on a
/// client obtained before its registry entry expired keep working.
///
/// ```ignore
/// let client = registry.get_or_create(&ClientName::backchannel()).await?;
/// let jwks: Jwks = client.get("https://idp.example.com/jwks").send().await?.json().await?;
/// ```
#[derive(Clone)]
pub struct HttpClient {
    service: BufferedService,
    name: ClientName,
    timeout: Duration,
    max_body_size: usize,
}

impl HttpClient {
    /// Put a built handler stack behind a `Buffer` of `buffer_capacity` slots
    /// (at least 1). Must be called within a tokio runtime.
    pub(crate) fn new(
        name: ClientName,
        service: HandlerService,
        settings: &ClientSettings,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            service: Buffer::new(service, buffer_capacity.max(1)),
            name,
            timeout: settings.timeout,
            max_body_size: settings.max_response_buffer_size,
        }
    }

    #[must_use]
    pub fn name(&self) -> &ClientName {
        &self.name
    }

    /// Per-attempt timeout this client was built with.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Response buffer cap this client was built with.
    #[must_use]
    pub fn max_response_buffer_size(&self) -> usize {
        self.max_body_size
    }

    pub fn request(&self, method: http::Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.service.clone(), self.max_body_size, method, url.to_owned())
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::PUT, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::DELETE, url)
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("max_body_size", &self.max_body_size)
            .finish_non_exhaustive()
    }
}

/// Recover the inner `HttpError` from a `Buffer` error.
pub fn map_buffer_error(err: tower::BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => {
            tracing::error!(error = %err, "buffer worker closed unexpectedly; service unavailable");
            HttpError::ServiceClosed
        }
    }
}
