use crate::error::HttpError;
use crate::policy::{AttemptContext, AttemptOutcome, RetryDecision, RetryPolicy};
use crate::response::{ResponseBody, body_error};
use bytes::Bytes;
use http::{HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

/// Header carrying the retry number (1-based) on re-issued requests.
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

/// Tower layer that lets a [`RetryPolicy`] re-issue requests.
///
/// Installed closest to the transport: every attempt goes through the
/// per-attempt timeout, the response size cap and the transport's cookie
/// settings again.
#[derive(Clone)]
pub struct ResiliencyLayer {
    policy: Arc<dyn RetryPolicy>,
    drain_limit: usize,
}

impl ResiliencyLayer {
    #[must_use]
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        let drain_limit = policy.drain_limit();
        Self {
            policy,
            drain_limit,
        }
    }
}

impl std::fmt::Debug for ResiliencyLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencyLayer")
            .field("drain_limit", &self.drain_limit)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for ResiliencyLayer {
    type Service = ResiliencyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ResiliencyService {
            inner,
            policy: Arc::clone(&self.policy),
            drain_limit: self.drain_limit,
        }
    }
}

/// Service created by [`ResiliencyLayer`].
///
/// Both `Err(HttpError)` and `Ok(Response)` outcomes are shown to the policy.
/// When the policy stops, the last outcome is returned unchanged, so a
/// request whose retries are exhausted fails exactly like one that was never
/// retried.
#[derive(Clone)]
pub struct ResiliencyService<S> {
    inner: S,
    policy: Arc<dyn RetryPolicy>,
    drain_limit: usize,
}

impl<S> Service<Request<Full<Bytes>>> for ResiliencyService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        // Consume the instance that was poll_ready'd
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let policy = Arc::clone(&self.policy);
        let drain_limit = self.drain_limit;

        let (parts, body) = req.into_parts();

        Box::pin(async move {
            let host = parts
                .uri
                .authority()
                .map_or_else(|| "unknown".to_owned(), ToString::to_string);

            let mut attempt = 1usize;
            loop {
                // Version and extensions travel with the cloned parts
                let mut req = Request::from_parts(parts.clone(), body.clone());
                if attempt > 1
                    && let Ok(value) = HeaderValue::try_from((attempt - 1).to_string())
                {
                    req.headers_mut().insert(RETRY_ATTEMPT_HEADER, value);
                }

                let mut svc = inner.clone();
                svc.ready().await?;
                let result = svc.call(req).await;

                let decision = {
                    let outcome = match &result {
                        Ok(resp) => AttemptOutcome::Response {
                            status: resp.status(),
                            headers: resp.headers(),
                        },
                        Err(err) => AttemptOutcome::Error(err),
                    };
                    policy
                        .decide(&AttemptContext {
                            method: &parts.method,
                            uri: &parts.uri,
                            request_headers: &parts.headers,
                            attempt,
                            outcome,
                        })
                        .await
                };

                let RetryDecision::Retry(backoff) = decision else {
                    return result;
                };

                match result {
                    Ok(resp) => {
                        tracing::debug!(
                            retry = attempt,
                            status = resp.status().as_u16(),
                            method = %parts.method,
                            host = %host,
                            backoff_ms = backoff.as_millis(),
                            "retrying request after status"
                        );
                        drain(resp, drain_limit).await;
                    }
                    Err(err) => {
                        tracing::debug!(
                            retry = attempt,
                            error = %err,
                            method = %parts.method,
                            host = %host,
                            backoff_ms = backoff.as_millis(),
                            "retrying request after error"
                        );
                    }
                }

                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        })
    }
}

/// Read and discard up to `limit` bytes so an HTTP/1.1 connection can go
/// back to the pool.
async fn drain(response: Response<ResponseBody>, limit: usize) {
    let declared = response
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        tracing::trace!(limit, "skipping drain: Content-Length exceeds limit");
        return;
    }

    let mut body = std::pin::pin!(response.into_body());
    let mut drained = 0usize;
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                drained += frame.data_ref().map_or(0, Bytes::len);
                if drained >= limit {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(
                    error = %body_error(e),
                    "failed to drain response body before retry; connection may not be reused"
                );
                break;
            }
        }
    }
}
