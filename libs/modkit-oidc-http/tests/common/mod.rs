#![allow(dead_code)]

//! Test doubles shared by the integration tests.

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use modkit_oidc_http::{
    ConfigError, HandlerService, HttpError, PrimaryHandler, ResponseBody, TransportKind,
};
use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tower::ServiceExt;

/// What the scripted server does with the next request.
pub enum Reply {
    /// Read the request, then close the connection without answering
    Drop,
    Respond {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    },
    /// Wait `delay`, then answer `200` with `body`
    Stall { delay: Duration, body: &'static str },
    /// Send the head with the full `Content-Length`, then the body one byte
    /// every `every`
    Trickle {
        status: u16,
        body: &'static str,
        every: Duration,
    },
}

impl Reply {
    pub fn ok(body: &'static str) -> Self {
        Self::Respond {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Respond {
            status,
            headers: Vec::new(),
            body: "",
        }
    }

    pub fn with_cookie(cookie: &'static str) -> Self {
        Self::Respond {
            status: 200,
            headers: vec![("Set-Cookie", cookie)],
            body: "ok",
        }
    }
}

/// Raw HTTP/1.1 server replaying a script, one connection per request.
///
/// Once the script is exhausted every request gets `200 ok`.
pub struct ScriptedServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedServer {
    pub async fn start(script: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let seen = Arc::clone(&seen);
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    let Some(request_head) = read_head(&mut socket).await else {
                        return;
                    };
                    seen.lock().unwrap().push(request_head);
                    let reply = script.lock().unwrap().pop_front();
                    match reply.unwrap_or_else(|| Reply::ok("ok")) {
                        Reply::Drop => drop(socket),
                        Reply::Respond {
                            status,
                            headers,
                            body,
                        } => {
                            let out = format!("{}{body}", head(status, body.len(), &headers));
                            socket.write_all(out.as_bytes()).await.ok();
                            socket.shutdown().await.ok();
                        }
                        Reply::Stall { delay, body } => {
                            tokio::time::sleep(delay).await;
                            let out = format!("{}{body}", head(200, body.len(), &[]));
                            socket.write_all(out.as_bytes()).await.ok();
                            socket.shutdown().await.ok();
                        }
                        Reply::Trickle {
                            status,
                            body,
                            every,
                        } => {
                            let out = head(status, body.len(), &[]);
                            if socket.write_all(out.as_bytes()).await.is_err() {
                                return;
                            }
                            for byte in body.as_bytes().chunks(1) {
                                tokio::time::sleep(every).await;
                                if socket.write_all(byte).await.is_err() {
                                    return;
                                }
                            }
                            socket.shutdown().await.ok();
                        }
                    }
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Value of `name` in the n-th request head (case-insensitive name match).
    pub fn header(&self, request: usize, name: &str) -> Option<String> {
        let requests = self.requests.lock().unwrap();
        requests[request].lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_owned())
        })
    }
}

fn head(status: u16, content_length: usize, headers: &[(&str, &str)]) -> String {
    let extra: String = headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}\r\n"))
        .collect();
    format!(
        "HTTP/1.1 {status} Scripted\r\nContent-Length: {content_length}\r\n\
         Connection: close\r\n{extra}\r\n"
    )
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// In-memory primary handler that counts how often it is turned into a service.
#[derive(Clone)]
pub struct CountingPrimary {
    pub builds: Arc<AtomicUsize>,
    /// Blocking pause inside the build, to widen race windows
    pub build_delay: Duration,
}

impl CountingPrimary {
    pub fn new(builds: &Arc<AtomicUsize>) -> Self {
        Self {
            builds: Arc::clone(builds),
            build_delay: Duration::ZERO,
        }
    }
}

impl PrimaryHandler for CountingPrimary {
    fn kind(&self) -> TransportKind {
        TransportKind::Custom("counting")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_service(self: Box<Self>) -> Result<HandlerService, ConfigError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.build_delay);
        Ok(ok_service())
    }
}

/// Service answering every request with `200 ok`.
pub fn ok_service() -> HandlerService {
    tower::service_fn(|_req: Request<Full<Bytes>>| async {
        let body: ResponseBody = Full::new(Bytes::from_static(b"ok"))
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
            .boxed();
        Ok::<_, HttpError>(Response::new(body))
    })
    .boxed_clone()
}
