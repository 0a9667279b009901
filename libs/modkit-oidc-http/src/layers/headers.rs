use http::{HeaderMap, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tower layer that adds default headers to every request.
///
/// A header the caller already set wins over the default.
#[derive(Clone, Debug)]
pub struct DefaultHeadersLayer {
    headers: HeaderMap,
}

impl DefaultHeadersLayer {
    #[must_use]
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }
}

impl<S> Layer<S> for DefaultHeadersLayer {
    type Service = DefaultHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DefaultHeadersService {
            inner,
            headers: self.headers.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DefaultHeadersService<S> {
    inner: S,
    headers: HeaderMap,
}

impl<S, ReqBody> Service<Request<ReqBody>> for DefaultHeadersService<S>
where
    S: Service<Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        for name in self.headers.keys() {
            if req.headers().contains_key(name) {
                continue;
            }
            for value in self.headers.get_all(name) {
                req.headers_mut().append(name.clone(), value.clone());
            }
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderValue, Response, StatusCode};
    use http_body_util::Full;
    use std::future::{Ready, ready};
    use tower::ServiceExt;

    /// Echoes the User-Agent it received as the response body.
    #[derive(Clone)]
    struct EchoUa;

    impl Service<Request<Full<Bytes>>> for EchoUa {
        type Response = Response<String>;
        type Error = std::convert::Infallible;
        type Future = Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
            let ua = req
                .headers()
                .get_all(http::header::USER_AGENT)
                .iter()
                .map(|v| v.to_str().unwrap().to_owned())
                .collect::<Vec<_>>()
                .join(",");
            ready(Ok(Response::builder()
                .status(StatusCode::OK)
                .body(ua)
                .unwrap()))
        }
    }

    fn layer() -> DefaultHeadersLayer {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_static("modkit-oidc-http/test"),
        );
        DefaultHeadersLayer::new(headers)
    }

    #[tokio::test]
    async fn adds_missing_header() {
        let svc = layer().layer(EchoUa);
        let req = Request::get("https://as.example.com/").body(Full::default()).unwrap();
        let resp = svc.oneshot(req).await.unwrap();
        assert_eq!(resp.body(), "modkit-oidc-http/test");
    }

    #[tokio::test]
    async fn caller_header_wins() {
        let svc = layer().layer(EchoUa);
        let req = Request::get("https://as.example.com/")
            .header(http::header::USER_AGENT, "custom/1.0")
            .body(Full::default())
            .unwrap();
        let resp = svc.oneshot(req).await.unwrap();
        assert_eq!(resp.body(), "custom/1.0");
    }
}
