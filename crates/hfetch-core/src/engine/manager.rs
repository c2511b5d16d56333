//! Fetch engine - owns the runtime, client and store every transfer shares
//!
//! This is the top-level coordinator that:
//! - Accepts requests and hands back handles immediately
//! - Runs transfers on its own worker threads
//! - Keeps track of transfers that have not reached a terminal state
//! - Exposes the persistent store to callers

use crate::attr::FetchAttr;
use crate::engine::{FetchStore, RateLimiter, TransferRequest, TransferSettings, TransferTask};
use crate::error::FetchError;
use crate::handle::{mark_engine_thread, Fetch, Registry};
use hfetch_types::{EngineConfig, ProxyMode, ProxySettings, StoredEntry};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

/// Engine that performs fetches on a private multi-threaded runtime.
///
/// The engine's worker threads are its driving context: callbacks usually
/// run there, and [`Fetch::wait`] refuses to block on them.
pub struct FetchEngine {
    runtime: Option<Runtime>,
    handle: Handle,
    client: Client,
    store: Option<FetchStore>,
    rate_limiter: RateLimiter,
    settings: TransferSettings,
    config: EngineConfig,
    active: Arc<Registry>,
}

impl FetchEngine {
    /// Create an engine. Must be called outside of any async runtime.
    pub fn new(config: EngineConfig) -> Result<Self, FetchError> {
        if Handle::try_current().is_ok() {
            return Err(FetchError::Runtime(
                "a fetch engine cannot be created from inside an async runtime".to_string(),
            ));
        }

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .enable_all()
            .thread_name("hfetch-worker")
            .on_thread_start(mark_engine_thread);
        if let Some(threads) = config.worker_threads {
            builder.worker_threads(threads.max(1));
        }
        let runtime = builder.build()?;

        let client = build_client(&config)?;

        let store = match &config.data_dir {
            Some(dir) => Some(runtime.block_on(FetchStore::open(dir))?),
            None => {
                info!("No data directory configured, persistent store disabled");
                None
            }
        };

        let settings = TransferSettings {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
        };

        info!(
            "Fetch engine started (store: {}, speed_limit: {:?}, max_retries: {})",
            config
                .data_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "disabled".to_string()),
            config.speed_limit,
            config.max_retries
        );

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            client,
            store,
            rate_limiter: RateLimiter::new(config.speed_limit),
            settings,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Start a fetch of `url` as described by `attr`.
    ///
    /// Never blocks and never fails here: problems with the request are
    /// reported through the `onerror` callback of the returned handle.
    pub fn fetch(&self, attr: &FetchAttr, url: &str) -> Fetch {
        let fetch = Fetch::new(attr, url, Arc::downgrade(&self.active));
        self.active.lock().insert(fetch.id(), fetch.clone());

        let request = TransferRequest {
            url: url.to_string(),
            method: attr.method_or_default().to_string(),
            flags: attr.attributes,
            destination_path: attr.destination_path.as_str().to_string(),
            headers: attr.request_headers.clone(),
            body: attr.request_body.clone(),
            timeout: attr.timeout,
            credentials: attr.credentials.clone(),
        };

        let task = TransferTask::new(
            fetch.clone(),
            request,
            self.client.clone(),
            self.store.clone(),
            self.rate_limiter.clone(),
            self.settings.clone(),
        );
        self.handle.spawn(task.run());

        debug!("Submitted fetch {} for {}", fetch.id(), url);
        fetch
    }

    /// Number of fetches that have not reached a terminal state
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The persistent store, if one is configured
    pub fn store(&self) -> Option<&FetchStore> {
        self.store.as_ref()
    }

    /// Change the shared speed limit; `None` or 0 lifts it
    pub fn set_speed_limit(&self, bytes_per_second: Option<u64>) -> Result<(), FetchError> {
        self.block_on(self.rate_limiter.set_limit(bytes_per_second))
    }

    // ========================================================================
    // Blocking store access
    // ========================================================================

    pub fn stored_files(&self) -> Result<Vec<StoredEntry>, FetchError> {
        let store = self.require_store()?;
        self.block_on(store.list())?
    }

    pub fn stored_file(&self, path: &str) -> Result<Option<StoredEntry>, FetchError> {
        let store = self.require_store()?;
        self.block_on(store.lookup(path))?
    }

    /// Delete one stored file; returns whether it existed
    pub fn remove_stored(&self, path: &str) -> Result<bool, FetchError> {
        let store = self.require_store()?;
        self.block_on(store.remove(path))?
    }

    /// Delete every stored file; returns how many there were
    pub fn clear_store(&self) -> Result<usize, FetchError> {
        let store = self.require_store()?;
        self.block_on(store.clear())?
    }

    fn require_store(&self) -> Result<&FetchStore, FetchError> {
        self.store.as_ref().ok_or(FetchError::StoreUnavailable)
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output, FetchError> {
        if Handle::try_current().is_ok() {
            return Err(FetchError::Runtime(
                "blocking engine call made from inside an async runtime".to_string(),
            ));
        }
        Ok(self.handle.block_on(future))
    }
}

impl Drop for FetchEngine {
    fn drop(&mut self) {
        let pending: Vec<Fetch> = self.active.lock().drain().map(|(_, f)| f).collect();
        if !pending.is_empty() {
            info!("Shutting down with {} fetches in flight", pending.len());
        }
        for fetch in pending {
            if let Err(e) = fetch.close() {
                debug!("Fetch {} already closed at shutdown: {}", fetch.id(), e);
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = self.block_on(store.close()) {
                warn!("Could not close persistent store cleanly: {}", e);
            }
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn build_client(config: &EngineConfig) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.as_str())
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(secs) = config.request_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    let proxy = &config.proxy;
    match proxy.mode {
        ProxyMode::None => builder = builder.no_proxy(),
        ProxyMode::System => {}
        ProxyMode::Manual => {
            if let Some(url) = &proxy.http_proxy {
                builder = builder.proxy(configure_proxy(reqwest::Proxy::http(url.as_str())?, proxy));
            }
            if let Some(url) = &proxy.https_proxy {
                builder = builder.proxy(configure_proxy(reqwest::Proxy::https(url.as_str())?, proxy));
            }
        }
    }

    Ok(builder.build()?)
}

fn configure_proxy(mut p: reqwest::Proxy, settings: &ProxySettings) -> reqwest::Proxy {
    if let (Some(user), Some(password)) = (&settings.username, &settings.password) {
        p = p.basic_auth(user, password);
    }
    let no_proxy = settings
        .no_proxy
        .as_deref()
        .and_then(reqwest::NoProxy::from_string);
    p.no_proxy(no_proxy)
}
