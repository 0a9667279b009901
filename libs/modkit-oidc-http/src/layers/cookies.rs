use dashmap::DashMap;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderValue, Request, Response};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Cookies received by one handler, keyed by host.
///
/// Only `Max-Age=0` deletion is honoured; `Domain`, `Path`, `Secure` and
/// `Expires` attributes are ignored.
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
    hosts: Arc<DashMap<String, BTreeMap<String, String>>>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `Cookie` header value for `host`, if anything is stored.
    #[must_use]
    pub fn header_for(&self, host: &str) -> Option<HeaderValue> {
        let cookies = self.hosts.get(host)?;
        if cookies.is_empty() {
            return None;
        }
        let joined = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }

    /// Record every `Set-Cookie` header of a response from `host`.
    pub fn store<'a>(&self, host: &str, set_cookies: impl Iterator<Item = &'a HeaderValue>) {
        for raw in set_cookies {
            let Ok(raw) = raw.to_str() else { continue };
            let mut attrs = raw.split(';').map(str::trim);
            let Some((name, value)) = attrs.next().and_then(|pair| pair.split_once('=')) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let expired = attrs.any(|attr| attr.eq_ignore_ascii_case("max-age=0"));

            let mut cookies = self.hosts.entry(host.to_owned()).or_default();
            if expired {
                cookies.remove(name);
            } else {
                cookies.insert(name.to_owned(), value.trim().to_owned());
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.iter().all(|entry| entry.value().is_empty())
    }
}

/// Tower layer that replays cookies from a [`CookieJar`].
///
/// Only installed for handlers that keep cookies enabled; hardened
/// back-channel handlers never carry one.
#[derive(Clone, Debug, Default)]
pub struct CookieLayer {
    jar: CookieJar,
}

impl CookieLayer {
    #[must_use]
    pub fn new(jar: CookieJar) -> Self {
        Self { jar }
    }
}

impl<S> Layer<S> for CookieLayer {
    type Service = CookieService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CookieService {
            inner,
            jar: self.jar.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CookieService<S> {
    inner: S,
    jar: CookieJar,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CookieService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResBody: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let host = req.uri().host().unwrap_or_default().to_ascii_lowercase();
        if !req.headers().contains_key(COOKIE)
            && let Some(value) = self.jar.header_for(&host)
        {
            req.headers_mut().insert(COOKIE, value);
        }

        let jar = self.jar.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            let response = fut.await?;
            jar.store(&host, response.headers().get_all(SET_COOKIE).iter());
            Ok(response)
        })
    }
}
