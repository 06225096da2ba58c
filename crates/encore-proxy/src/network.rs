use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, request, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use bytes::Bytes;
use encore_store::{CachedEntry, RequestKey};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use std::time::Duration;
use thiserror::Error;

pub type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Body>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
    #[error("failed to read upstream body: {0}")]
    Body(String),
}

/// An intercepted request, independent of the HTTP stack it arrived on.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path and query, rooted at the proxy scope (`/mp3/a.mp3?x=1`).
    pub url: String,
    pub headers: HeaderMap,
    pub is_navigation: bool,
    pub body: Bytes,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            is_navigation: false,
            body: Bytes::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Build from the parts of an incoming HTTP request.
    pub fn from_parts(parts: &request::Parts, body: Bytes) -> Self {
        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            method: parts.method.clone(),
            url,
            is_navigation: is_navigation(&parts.method, &parts.headers),
            headers: parts.headers.clone(),
            body,
        }
    }

    /// Store identity of this request. Range headers are not part of it.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.method.as_str(), &self.url)
    }

    pub fn has_range(&self) -> bool {
        self.headers.contains_key(header::RANGE)
    }
}

/// `Sec-Fetch-Mode: navigate` marks a navigation. Clients that do not send
/// fetch metadata are judged by a GET whose Accept lists `text/html`.
fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    if let Some(mode) = headers.get("sec-fetch-mode") {
        return mode.as_bytes().eq_ignore_ascii_case(b"navigate");
    }
    *method == Method::GET
        && headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

/// A response as seen by the router.
#[derive(Debug, Clone)]
pub struct ResponseDescriptor {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseDescriptor {
    /// Any 2xx.
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn to_cached_entry(&self) -> CachedEntry {
        let headers = self
            .headers
            .iter()
            .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        CachedEntry::new(self.status.as_u16(), headers, self.body.clone())
    }

    /// Rebuild a stored response. `Age` is the stored value, if any, plus the
    /// whole seconds the entry has spent in the store.
    pub fn from_cached(entry: &CachedEntry) -> Self {
        let mut headers = HeaderMap::new();
        for (k, v) in &entry.headers {
            if k.eq_ignore_ascii_case("age") {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                headers.append(name, value);
            }
        }
        let stored_age = entry
            .header("age")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let age = stored_age + entry.inserted_at.elapsed().as_secs();
        headers.insert(header::AGE, HeaderValue::from(age));
        Self {
            status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
            headers,
            body: entry.body.clone(),
        }
    }
}

#[cfg(test)]
impl RequestDescriptor {
    /// A top-level page load.
    pub fn navigate(url: impl Into<String>) -> Self {
        let mut req = Self::get(url);
        req.is_navigation = true;
        req
    }

    pub fn with_header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.insert(name, HeaderValue::from_static(value));
        self
    }
}

#[cfg(test)]
impl ResponseDescriptor {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Headers that describe a single connection and must not be forwarded or
/// stored.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// The fetch capability the router and lifecycle depend on.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, req: &RequestDescriptor) -> Result<ResponseDescriptor, NetworkError>;
}

/// Forwards requests to the configured origin.
pub struct UpstreamNetwork {
    client: HttpClient,
    base_url: String,
    timeout: Duration,
}

impl UpstreamNetwork {
    pub fn new(client: HttpClient, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Network for UpstreamNetwork {
    async fn fetch(&self, req: &RequestDescriptor) -> Result<ResponseDescriptor, NetworkError> {
        let upstream_uri = format!("{}{}", self.base_url.trim_end_matches('/'), req.url);

        let mut builder = Request::builder().method(req.method.clone()).uri(&upstream_uri);
        for (key, value) in req.headers.iter() {
            if !is_hop_by_hop(key.as_str()) {
                builder = builder.header(key, value);
            }
        }
        let upstream_req = builder
            .body(Body::from(req.body.clone()))
            .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;

        let exchange = async {
            let resp = self
                .client
                .request(upstream_req)
                .await
                .map_err(|e| NetworkError::Unreachable(e.to_string()))?;
            let (parts, body) = resp.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| NetworkError::Body(e.to_string()))?
                .to_bytes();
            Ok::<_, NetworkError>(ResponseDescriptor {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::debug!(error = %e, upstream = %upstream_uri, "upstream request failed");
                }
                result
            }
            Err(_) => Err(NetworkError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! Scripted in-memory network for router and lifecycle tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone)]
    enum Script {
        Respond(StatusCode, Bytes),
        Fail,
    }

    /// Each URL has a list of scripted answers served in order; once the list
    /// is used up the last answer repeats. Answers added later are served
    /// after the ones already consumed.
    #[derive(Default)]
    pub struct FakeNetwork {
        routes: Mutex<HashMap<String, (Vec<Script>, usize)>>,
        delays: Mutex<HashMap<String, Duration>>,
        calls: Mutex<Vec<(String, bool)>>,
        offline: AtomicBool,
    }

    impl FakeNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, url: &str, status: StatusCode, body: &'static str) -> &Self {
            self.push(url, Script::Respond(status, Bytes::from_static(body.as_bytes())))
        }

        pub fn ok(&self, url: &str, body: &'static str) -> &Self {
            self.respond(url, StatusCode::OK, body)
        }

        pub fn fail(&self, url: &str) -> &Self {
            self.push(url, Script::Fail)
        }

        pub fn delay(&self, url: &str, delay: Duration) -> &Self {
            self.delays.lock().insert(url.to_string(), delay);
            self
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        /// Number of fetches seen for `url`.
        pub fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().iter().filter(|(u, _)| u == url).count()
        }

        /// Number of fetches for `url` that carried a Range header.
        pub fn ranged_calls_for(&self, url: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|(u, ranged)| u == url && *ranged)
                .count()
        }

        fn push(&self, url: &str, script: Script) -> &Self {
            self.routes
                .lock()
                .entry(url.to_string())
                .or_default()
                .0
                .push(script);
            self
        }

        fn next_script(&self, url: &str) -> Option<Script> {
            let mut routes = self.routes.lock();
            let (scripts, cursor) = routes.get_mut(url)?;
            let script = scripts.get((*cursor).min(scripts.len().checked_sub(1)?))?.clone();
            *cursor += 1;
            Some(script)
        }
    }

    #[async_trait]
    impl Network for FakeNetwork {
        async fn fetch(&self, req: &RequestDescriptor) -> Result<ResponseDescriptor, NetworkError> {
            self.calls.lock().push((req.url.clone(), req.has_range()));

            let delay = self.delays.lock().get(&req.url).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.offline.load(Ordering::SeqCst) {
                return Err(NetworkError::Unreachable("offline".into()));
            }

            match self.next_script(&req.url) {
                Some(Script::Respond(status, body)) if req.has_range() && status == StatusCode::OK => {
                    let mut resp = ResponseDescriptor::new(
                        StatusCode::PARTIAL_CONTENT,
                        body.slice(..body.len().min(2)),
                    );
                    resp.headers.insert(
                        header::CONTENT_RANGE,
                        HeaderValue::from_static("bytes 0-1/*"),
                    );
                    Ok(resp)
                }
                Some(Script::Respond(status, body)) => Ok(ResponseDescriptor::new(status, body)),
                Some(Script::Fail) => Err(NetworkError::Unreachable("scripted failure".into())),
                None => Ok(ResponseDescriptor::new(StatusCode::NOT_FOUND, "not found")),
            }
        }
    }
}
