use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use orchard_core::DriveClient;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::control::{self, ControlState};
use crate::store::{ROOT_OBJECT_ID, StateStore};
use crate::sync::backoff::Backoff;
use crate::sync::engine::{EngineOptions, SyncEngine};
use crate::sync::queue::Lane;

const WORKER_IDLE: Duration = Duration::from_millis(250);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Owns the store, the cache and the engine. Background tasks start in a
/// fixed order and shut down in reverse under one cancellation token.
pub struct DaemonRuntime {
    config: Config,
    store: StateStore,
    cache: CacheStore,
    engine: Arc<SyncEngine<DriveClient>>,
}

pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Cooperative shutdown: stop claiming, let in-flight work drain within
    /// the grace period, abort stragglers.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for mut handle in self.handles.drain(..).rev() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                eprintln!("[orchardd] background task did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}

impl DaemonRuntime {
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_root)
            .await
            .with_context(|| format!("failed to create cache root at {:?}", config.cache_root))?;

        let token = config.require_token()?.to_string();
        let remote = match &config.api_base_url {
            Some(base_url) => DriveClient::with_base_url(base_url, token),
            None => DriveClient::new(token),
        }
        .context("failed to build drive client")?;

        let store = StateStore::open(&config.db_path)
            .await
            .context("failed to open state store")?;
        let recovered = store.recover_orphaned_actions().await?;
        if recovered > 0 {
            eprintln!("[orchardd] recovered {recovered} orphaned actions from previous run");
        }

        let cache = CacheStore::new(
            config.cache_root.clone(),
            store.clone(),
            config.chunk_size_bytes,
            config.small_file_threshold_bytes,
            config.cache_max_bytes,
        );
        let swept = cache.ensure_layout().await?;
        if swept > 0 {
            eprintln!("[orchardd] swept {swept} leaked partial downloads");
        }

        let engine = Arc::new(SyncEngine::new(
            remote,
            store.clone(),
            cache.clone(),
            EngineOptions {
                conflict_policy: config.conflict_policy,
                backoff: Backoff::from_millis(config.retry_base_ms, config.retry_max_ms),
                max_retries: config.max_retries,
            },
        ));

        Ok(Self {
            config,
            store,
            cache,
            engine,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn engine(&self) -> Arc<SyncEngine<DriveClient>> {
        Arc::clone(&self.engine)
    }

    /// Spawns workers, heartbeat, poll loop, eviction loop and the control
    /// API. The returned handle owns their lifetimes.
    pub fn start_background(&self) -> BackgroundTasks {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        for index in 0..self.config.worker_count_io {
            handles.push(tokio::spawn(self.engine().run_worker(
                format!("io-{index}"),
                Lane::Io,
                shutdown.clone(),
                WORKER_IDLE,
            )));
        }
        for index in 0..self.config.worker_count_meta {
            handles.push(tokio::spawn(self.engine().run_worker(
                format!("meta-{index}"),
                Lane::Meta,
                shutdown.clone(),
                WORKER_IDLE,
            )));
        }

        handles.push(tokio::spawn(
            self.engine()
                .run_heartbeat(HEARTBEAT_INTERVAL, shutdown.clone()),
        ));
        handles.push(tokio::spawn(self.engine().run_poll_loop(
            ROOT_OBJECT_ID.to_string(),
            Duration::from_secs(self.config.poll_interval_secs),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(
            self.engine()
                .run_eviction_loop(EVICTION_INTERVAL, shutdown.clone()),
        ));

        let control_state = ControlState::new(self.engine());
        let control_port = self.config.control_port;
        let control_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = control::serve(control_state, control_port, control_shutdown).await {
                eprintln!("[orchardd] control api error: {err}");
            }
        }));

        BackgroundTasks { shutdown, handles }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[orchardd] started: db={}, cache_root={}, workers={}+{}",
            self.config.db_path.display(),
            self.config.cache_root.display(),
            self.config.worker_count_io,
            self.config.worker_count_meta
        );
        let background = self.start_background();
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        eprintln!("[orchardd] shutting down");
        background.shutdown().await;
        Ok(())
    }
}
