//! Per-request routing between the active store generation and the network.
//!
//! Classification, first match wins:
//!
//! 1. non-GET → pass-through
//! 2. media extension → store hit, else ranged pass-through, else fetch and
//!    admit under the FIFO song bound
//! 3. excluded extension (lyrics) → pass-through, never stored
//! 4. navigation or critical extension → network raced against a timeout,
//!    falling back to the store and then to the shell entry
//! 5. everything else → store first, network on miss

use crate::config::WorkerConfig;
use crate::lifecycle::Worker;
use crate::network::{Network, NetworkError, RequestDescriptor, ResponseDescriptor};
use axum::http::{Method, StatusCode};
use encore_store::{FifoBound, Generation, RequestKey};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    StreamedMedia,
    Excluded,
    Critical,
    Default,
    PassThrough,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::StreamedMedia => "media",
            Lane::Excluded => "excluded",
            Lane::Critical => "critical",
            Lane::Default => "default",
            Lane::PassThrough => "pass-through",
        }
    }
}

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Served from the active generation.
    Cache,
    /// Fetched from the network; the lane may have stored it.
    Network,
    /// Fetched from the network and deliberately not stored.
    PassThrough,
    /// A navigation answered with the stored shell entry.
    ShellFallback,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Network => "network",
            Source::PassThrough => "pass-through",
            Source::ShellFallback => "shell-fallback",
        }
    }
}

#[derive(Debug)]
pub struct Routed {
    pub lane: Lane,
    pub source: Source,
    pub response: ResponseDescriptor,
}

/// Why the critical lane had to fall back.
#[derive(Debug, Error)]
pub enum FallbackCause {
    #[error("network did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Network(NetworkError),
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("nothing stored for {key} and {cause}")]
    Offline { key: RequestKey, cause: FallbackCause },
    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl RouteError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RouteError::Offline {
                cause: FallbackCause::Timeout(_) | FallbackCause::Network(NetworkError::Timeout(_)),
                ..
            } | RouteError::Network(NetworkError::Timeout(_))
        )
    }
}

/// Lower-cased extension of the last path segment, if any.
pub fn extension(path: &str) -> Option<String> {
    let last = path.rsplit('/').next()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn has_extension(path: &str, extensions: &[String]) -> bool {
    extension(path).is_some_and(|ext| extensions.iter().any(|e| *e == ext))
}

/// Whether a stored key belongs to the bounded media set.
pub fn is_media(config: &WorkerConfig, key: &RequestKey) -> bool {
    has_extension(key.path(), &config.media_extensions)
}

pub fn classify(config: &WorkerConfig, req: &RequestDescriptor) -> Lane {
    if req.method != Method::GET {
        return Lane::PassThrough;
    }
    let key = req.key();
    let path = key.path();
    if has_extension(path, &config.media_extensions) {
        Lane::StreamedMedia
    } else if has_extension(path, &config.excluded_extensions) {
        Lane::Excluded
    } else if req.is_navigation || has_extension(path, &config.critical_extensions) {
        Lane::Critical
    } else {
        Lane::Default
    }
}

/// Store a full `200` answer to a non-ranged request, logging instead of
/// failing. Partial bodies would be served back under the range-free key, so
/// they are never stored. The caller's response is unaffected either way.
fn persist(generation: &Generation, key: RequestKey, ranged: bool, response: &ResponseDescriptor) {
    if ranged || response.status != StatusCode::OK {
        return;
    }
    if let Err(e) = generation.put(key.clone(), response.to_cached_entry()) {
        metrics::counter!("encore_store_write_failures_total").increment(1);
        tracing::warn!(key = %key, error = %e, "store write failed, serving network response");
    }
}

pub struct RequestRouter {
    network: Arc<dyn Network>,
}

impl RequestRouter {
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self { network }
    }

    /// Decide exactly one response for `req` using `worker`'s generation.
    pub async fn route(&self, worker: &Worker, req: RequestDescriptor) -> Result<Routed, RouteError> {
        let lane = classify(&worker.config, &req);
        tracing::debug!(url = %req.url, lane = lane.as_str(), "routing request");

        match lane {
            Lane::StreamedMedia => self.streamed_media(worker, req).await,
            Lane::Excluded | Lane::PassThrough => self.pass_through(lane, &req).await,
            Lane::Critical => self.network_first(worker, req).await,
            Lane::Default => self.cache_first(worker, req).await,
        }
    }

    async fn pass_through(&self, lane: Lane, req: &RequestDescriptor) -> Result<Routed, RouteError> {
        let response = self.network.fetch(req).await?;
        Ok(Routed {
            lane,
            source: Source::PassThrough,
            response,
        })
    }

    async fn streamed_media(&self, worker: &Worker, req: RequestDescriptor) -> Result<Routed, RouteError> {
        let key = req.key();
        let generation = &worker.generation;

        if let Some(entry) = generation.get(&key) {
            return Ok(Routed {
                lane: Lane::StreamedMedia,
                source: Source::Cache,
                response: ResponseDescriptor::from_cached(&entry),
            });
        }

        // Partial bodies must never reach the store.
        if req.has_range() {
            return self.pass_through(Lane::StreamedMedia, &req).await;
        }

        let response = self.network.fetch(&req).await?;
        if response.status == StatusCode::OK {
            let config = &worker.config;
            let bound = FifoBound::new(config.max_cached_songs, |k: &RequestKey| is_media(config, k));
            match bound.admit(generation, key.clone(), response.to_cached_entry()) {
                Ok(admission) => {
                    if !admission.evicted.is_empty() {
                        metrics::counter!("encore_media_evictions_total")
                            .increment(admission.evicted.len() as u64);
                    }
                    tracing::debug!(
                        key = %key,
                        evicted = admission.evicted.len(),
                        "media stored"
                    );
                }
                Err(e) => {
                    metrics::counter!("encore_store_write_failures_total").increment(1);
                    tracing::warn!(key = %key, error = %e, "media store failed, serving network response");
                }
            }
        }

        Ok(Routed {
            lane: Lane::StreamedMedia,
            source: Source::Network,
            response,
        })
    }

    /// Race the network against the worker's timeout. The fetch runs as its
    /// own task, so losing the race does not abort it; a late answer still
    /// lands in the store.
    async fn network_first(&self, worker: &Worker, req: RequestDescriptor) -> Result<Routed, RouteError> {
        let key = req.key();
        let is_navigation = req.is_navigation;
        let timeout = worker.config.network_timeout;

        let network = Arc::clone(&self.network);
        let generation = Arc::clone(&worker.generation);
        let task_key = key.clone();
        let ranged = req.has_range();
        let fetch = tokio::spawn(async move {
            let response = network.fetch(&req).await?;
            persist(&generation, task_key, ranged, &response);
            Ok::<_, NetworkError>(response)
        });

        let cause = match tokio::time::timeout(timeout, fetch).await {
            Ok(Ok(Ok(response))) => {
                return Ok(Routed {
                    lane: Lane::Critical,
                    source: Source::Network,
                    response,
                })
            }
            Ok(Ok(Err(e))) => FallbackCause::Network(e),
            Ok(Err(join)) => FallbackCause::Network(NetworkError::Unreachable(join.to_string())),
            Err(_) => FallbackCause::Timeout(timeout),
        };
        tracing::debug!(key = %key, cause = %cause, "critical lane falling back to store");

        if let Some(entry) = worker.generation.get(&key) {
            return Ok(Routed {
                lane: Lane::Critical,
                source: Source::Cache,
                response: ResponseDescriptor::from_cached(&entry),
            });
        }

        if is_navigation {
            let shell = RequestKey::for_manifest_path(&worker.config.shell_entry);
            if let Some(entry) = worker.generation.get(&shell) {
                return Ok(Routed {
                    lane: Lane::Critical,
                    source: Source::ShellFallback,
                    response: ResponseDescriptor::from_cached(&entry),
                });
            }
        }

        Err(RouteError::Offline { key, cause })
    }

    async fn cache_first(&self, worker: &Worker, req: RequestDescriptor) -> Result<Routed, RouteError> {
        let key = req.key();

        if let Some(entry) = worker.generation.get(&key) {
            return Ok(Routed {
                lane: Lane::Default,
                source: Source::Cache,
                response: ResponseDescriptor::from_cached(&entry),
            });
        }

        let response = self.network.fetch(&req).await?;
        persist(&worker.generation, key, req.has_range(), &response);
        Ok(Routed {
            lane: Lane::Default,
            source: Source::Network,
            response,
        })
    }
}
