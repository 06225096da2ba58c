use crate::config::{UpdateFlow, WorkerConfig};
use crate::network::{Network, NetworkError, RequestDescriptor};
use crate::router::is_media;
use arc_swap::ArcSwapOption;
use axum::http::StatusCode;
use encore_store::{
    resolve_scope_path, CacheStorage, CachedEntry, Generation, RequestKey, StoreError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("manifest asset {path} unreachable: {source}")]
    AssetUnreachable {
        path: String,
        #[source]
        source: NetworkError,
    },
    #[error("manifest asset {path} answered {status}")]
    AssetStatus { path: String, status: StatusCode },
    #[error("failed to store manifest: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Installing,
    /// Installed and waiting for activation.
    Installed,
    Activating,
    Activated,
    /// Replaced or failed install.
    Redundant,
}

/// Control messages a hosting page may post.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    SkipWaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Activated,
    Waiting,
}

/// One worker generation: its frozen config and its store generation.
pub struct Worker {
    pub config: Arc<WorkerConfig>,
    pub generation: Arc<Generation>,
    state: Mutex<WorkerState>,
}

impl Worker {
    fn new(config: Arc<WorkerConfig>, generation: Arc<Generation>) -> Self {
        Self {
            config,
            generation,
            state: Mutex::new(WorkerState::Installing),
        }
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
        tracing::debug!(version = %self.config.version, ?state, "worker state changed");
    }

    pub fn status(&self) -> WorkerStatus {
        let stats = self.generation.stats();
        WorkerStatus {
            version: self.config.version.clone(),
            state: self.state(),
            entries: stats.entries,
            media_entries: self
                .generation
                .count_matching(|key| is_media(&self.config, key)),
            max_cached_songs: self.config.max_cached_songs,
            bytes: stats.bytes,
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub version: String,
    pub state: WorkerState,
    pub entries: usize,
    pub media_entries: usize,
    pub max_cached_songs: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub active: Option<WorkerStatus>,
    pub waiting: Option<WorkerStatus>,
    pub generations: Vec<String>,
}

/// Owns install and activation of worker generations and hands the router the
/// active one.
pub struct LifecycleManager {
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    active: ArcSwapOption<Worker>,
    waiting: Mutex<Option<Arc<Worker>>>,
}

impl LifecycleManager {
    pub fn new(storage: Arc<CacheStorage>, network: Arc<dyn Network>) -> Self {
        Self {
            storage,
            network,
            active: ArcSwapOption::const_empty(),
            waiting: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    /// The worker currently controlling requests, if any.
    pub fn active(&self) -> Option<Arc<Worker>> {
        self.active.load_full()
    }

    pub fn waiting(&self) -> Option<Arc<Worker>> {
        self.waiting.lock().clone()
    }

    /// Pre-populate the generation named by `config.version` with every
    /// manifest asset, then activate or wait according to the update flow.
    ///
    /// All-or-nothing: the assets are fetched first and stored in one batch.
    /// The generation is only opened once every fetch has succeeded, so an
    /// install dropped mid-fetch leaves nothing behind. A generation created by
    /// a failed batch insert is deleted again.
    pub async fn install(&self, config: Arc<WorkerConfig>) -> Result<InstallOutcome, LifecycleError> {
        tracing::info!(
            version = %config.version,
            assets = config.manifest.len(),
            "worker installing"
        );

        let entries = match self.precache(&config).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(version = %config.version, error = %e, "worker install failed");
                return Err(e);
            }
        };

        let (generation, created) = self.storage.open(&config.version);
        if let Err(e) = generation.put_all(entries) {
            if created {
                self.storage.delete(&config.version);
            }
            tracing::error!(version = %config.version, error = %e, "worker install failed");
            return Err(e.into());
        }

        let worker = Arc::new(Worker::new(Arc::clone(&config), Arc::clone(&generation)));
        worker.set_state(WorkerState::Installed);
        if let Some(previous) = self.waiting.lock().replace(Arc::clone(&worker)) {
            previous.set_state(WorkerState::Redundant);
        }
        tracing::info!(
            version = %config.version,
            entries = generation.len(),
            "worker installed"
        );

        // With nothing active there is no page to wait on.
        if config.update_flow == UpdateFlow::UserGated && self.active().is_some() {
            tracing::info!(version = %config.version, "update waiting for SKIP_WAITING");
            return Ok(InstallOutcome::Waiting);
        }

        self.activate();
        Ok(InstallOutcome::Activated)
    }

    async fn precache(
        &self,
        config: &WorkerConfig,
    ) -> Result<Vec<(RequestKey, CachedEntry)>, LifecycleError> {
        let network = &self.network;
        let fetches = config.manifest.iter().map(|path| async move {
            let req = RequestDescriptor::get(resolve_scope_path(path));
            let resp = network
                .fetch(&req)
                .await
                .map_err(|source| LifecycleError::AssetUnreachable {
                    path: path.clone(),
                    source,
                })?;
            if !resp.is_ok() {
                return Err(LifecycleError::AssetStatus {
                    path: path.clone(),
                    status: resp.status,
                });
            }
            Ok((req.key(), resp.to_cached_entry()))
        });

        futures_util::future::try_join_all(fetches).await
    }

    /// Promote the waiting worker (or re-run for the active one), delete every
    /// other store generation, and route all new requests through it.
    /// Safe to call repeatedly.
    pub fn activate(&self) -> Option<Arc<Worker>> {
        let promoted = self.waiting.lock().take();
        let Some(worker) = promoted.or_else(|| self.active()) else {
            tracing::debug!("activate: no worker to activate");
            return None;
        };

        worker.set_state(WorkerState::Activating);
        tracing::info!(version = %worker.version(), "worker activating");

        for name in self.storage.keys() {
            if name != worker.version() {
                tracing::info!(generation = %name, "deleting old store generation");
                self.storage.delete(&name);
            }
        }

        let previous = self.active.swap(Some(Arc::clone(&worker)));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &worker) {
                previous.set_state(WorkerState::Redundant);
            }
        }
        worker.set_state(WorkerState::Activated);
        tracing::info!(version = %worker.version(), "worker activated, clients claimed");
        Some(worker)
    }

    /// Handle a control message. Returns whether it changed anything.
    pub fn handle_message(&self, message: &ControlMessage) -> bool {
        match message {
            ControlMessage::SkipWaiting => self.skip_waiting(),
        }
    }

    /// Activate the waiting worker now. No-op when nothing is waiting.
    pub fn skip_waiting(&self) -> bool {
        if self.waiting.lock().is_none() {
            tracing::debug!("SKIP_WAITING with no waiting worker");
            return false;
        }
        self.activate().is_some()
    }

    pub fn status(&self) -> LifecycleStatus {
        LifecycleStatus {
            active: self.active().map(|w| w.status()),
            waiting: self.waiting().map(|w| w.status()),
            generations: self.storage.keys(),
        }
    }
}

/// Keep installing `config` until it succeeds or `shutdown` fires. A
/// cancelled install in flight is dropped before it can activate.
pub async fn install_with_retry(
    lifecycle: Arc<LifecycleManager>,
    config: Arc<WorkerConfig>,
    retry: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(version = %config.version, "install cancelled");
                return;
            }
            result = lifecycle.install(Arc::clone(&config)) => result,
        };

        match result {
            Ok(outcome) => {
                tracing::info!(version = %config.version, ?outcome, "install complete");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    version = %config.version,
                    error = %e,
                    retry_ms = retry.as_millis() as u64,
                    "install failed, retrying"
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

/// Runs at most one install retry loop at a time. Starting a loop cancels the
/// previous one, so an older version still retrying can never activate over a
/// newer one.
pub struct Installer {
    lifecycle: Arc<LifecycleManager>,
    shutdown: CancellationToken,
    runtime: Handle,
    current: Mutex<Option<CancellationToken>>,
}

impl Installer {
    /// Must be called from within the tokio runtime.
    pub fn new(lifecycle: Arc<LifecycleManager>, shutdown: CancellationToken) -> Self {
        Self {
            lifecycle,
            shutdown,
            runtime: Handle::current(),
            current: Mutex::new(None),
        }
    }

    /// Cancel any running install loop and start one for `config`. Safe to
    /// call from threads outside the runtime.
    pub fn start(&self, config: Arc<WorkerConfig>, retry: Duration) -> JoinHandle<()> {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        tracing::debug!(version = %config.version, "install loop started");
        self.runtime.spawn(install_with_retry(
            Arc::clone(&self.lifecycle),
            config,
            retry,
            token,
        ))
    }
}
