//! Wiring: builds every component from configuration and owns the background workers.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ContinuumConfig;
use crate::context::ContextLoader;
use crate::curator::{self, RelationshipCurator};
use crate::cursor::CursorManager;
use crate::db::{self, lock};
use crate::events::EventStore;
use crate::graph::{GraphStore, SqliteGraphStore};
use crate::similarity;
use crate::sync::{SyncEngine, SyncQueue, SyncSignal};

pub struct Continuum {
    pub config: ContinuumConfig,
    pub events: Arc<EventStore>,
    pub cursors: Arc<CursorManager>,
    pub sync: Arc<SyncEngine>,
    pub curator: Arc<RelationshipCurator>,
    pub context: Arc<ContextLoader>,
    pub graph: Arc<dyn GraphStore>,
    receivers: Mutex<Option<(mpsc::Receiver<SyncSignal>, mpsc::Receiver<String>)>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Continuum {
    /// Open with the SQLite graph store and the configured similarity scorer.
    pub fn open(config: ContinuumConfig) -> Result<Self> {
        let scorer = similarity::create_scorer(&config.similarity)?;
        let graph = SqliteGraphStore::open(
            config.resolved_graph_db_path(),
            config.storage.pool_size,
            scorer,
            config.curation.scan_limit,
        )?;
        Self::with_graph(config, Arc::new(graph))
    }

    /// Open local state and wire components around an existing graph store.
    ///
    /// Re-enqueues any logged events the sync queue lost in a crash. Workers are
    /// not started; call [`Continuum::start_workers`] from inside a runtime.
    pub fn with_graph(config: ContinuumConfig, graph: Arc<dyn GraphStore>) -> Result<Self> {
        let conn = db::open_database(config.resolved_state_db_path())?;
        let state = Arc::new(Mutex::new(conn));
        let queue = SyncQueue::new(state.clone());

        let capacity = config.sync.channel_capacity.max(1);
        let (sync_tx, sync_rx) = mpsc::channel(capacity);
        let (curation_tx, curation_rx) = mpsc::channel(capacity);

        let events = Arc::new(
            EventStore::open(config.resolved_streams_dir(), queue.clone())
                .context("failed to open event store")?
                .with_signals(sync_tx.clone()),
        );
        let recovered = events
            .recover_pending()
            .context("failed to recover pending events")?;
        if recovered > 0 {
            info!(recovered, "re-enqueued events missing from the sync queue");
        }

        let sync = Arc::new(
            SyncEngine::new(queue, graph.clone(), config.sync.clone())
                .with_curation_feed(curation_tx),
        );
        let curator = Arc::new(RelationshipCurator::new(
            graph.clone(),
            config.curation.clone(),
        ));
        let cursors = Arc::new(CursorManager::new(state, events.clone()).with_signals(sync_tx));
        let context = Arc::new(ContextLoader::new(
            events.clone(),
            cursors.clone(),
            graph.clone(),
            config.context.clone(),
        ));

        Ok(Self {
            config,
            events,
            cursors,
            sync,
            curator,
            context,
            graph,
            receivers: Mutex::new(Some((sync_rx, curation_rx))),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the sync and curation workers. Idempotent.
    pub fn start_workers(&self) {
        let Some((sync_rx, curation_rx)) = lock(&self.receivers).take() else {
            return;
        };
        let mut workers = lock(&self.workers);
        workers.push(tokio::spawn(
            self.sync.clone().run(sync_rx, self.shutdown.clone()),
        ));
        workers.push(tokio::spawn(curator::run_worker(
            self.curator.clone(),
            curation_rx,
            self.shutdown.clone(),
        )));
    }

    /// Token that stops the workers when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the workers and make one last attempt to drain the sync queue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "worker ended abnormally");
            }
        }
        match self.sync.flush().await {
            Ok(report) if report.failed > 0 || report.deferred > 0 => {
                info!(
                    pending = report.failed + report.deferred,
                    "events left queued for the next start"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "final sync flush failed"),
        }
        info!("continuum shut down");
    }
}
