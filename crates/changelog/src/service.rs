use crate::cn_index_db::ChangeNumberIndexDB;
use crate::cn_indexer::ChangeNumberIndexer;
use crate::config::ChangelogConfig;
use crate::csn::{Csn, diff_seq_num};
use crate::csn_generator::{Clock, CsnGenerator, SystemClock};
use crate::domain_db::ReplicationDomainDB;
use crate::error::{CookieError, Result};
use crate::multi_domain_state::MultiDomainServerState;
use crate::replica_db::ReplicaDBStatus;
use crate::storage::KeyValueStore;
use crate::update_msg::UpdateMsg;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub server_id: u16,
    pub status: ReplicaDBStatus,
    pub oldest_csn: Option<Csn>,
    pub newest_csn: Option<Csn>,
    pub open_cursors: usize,
    pub offline: bool,
    /// Changes the replica announced through heartbeats but never published here
    pub missing_changes: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    pub domain: String,
    pub generation_id: Option<i64>,
    pub medium_consistency_csn: Option<Csn>,
    pub latest_trim_millis: Option<u64>,
    pub stale_replicas: Vec<u16>,
    pub replicas: Vec<ReplicaStatus>,
}

/// Changelog of one server
///
/// Glue between the layers:
/// - Keeps the local CSN generators in step with every CSN seen
/// - Appends published changes to the domain DB
/// - Wakes the change number indexer, suspending publishers while its
///   queue is full
/// - Runs the indexer and the purge as background tasks
pub struct ChangelogService<S> {
    server_id: u16,
    config: ChangelogConfig,
    clock: Arc<dyn Clock>,
    domain_db: Arc<ReplicationDomainDB<S>>,
    cn_index_db: Arc<ChangeNumberIndexDB<S>>,
    indexer: Arc<ChangeNumberIndexer<S>>,
    generators: Mutex<HashMap<String, Arc<CsnGenerator>>>,
    notify_tx: mpsc::Sender<()>,
    notify_rx: Mutex<Option<mpsc::Receiver<()>>>,
    indexer_running: AtomicBool,
}

impl<S: KeyValueStore + 'static> ChangelogService<S> {
    pub fn open(storage: Arc<S>, server_id: u16, config: ChangelogConfig) -> Result<Self> {
        Self::with_clock(storage, server_id, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<S>,
        server_id: u16,
        config: ChangelogConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let domain_db = Arc::new(ReplicationDomainDB::open(Arc::clone(&storage))?);
        let cn_index_db = Arc::new(ChangeNumberIndexDB::open(Arc::clone(&storage))?);
        let indexer = Arc::new(ChangeNumberIndexer::new(
            Arc::clone(&domain_db),
            Arc::clone(&cn_index_db),
            storage,
            config.excluded_domains.clone(),
        )?);
        let (notify_tx, notify_rx) = mpsc::channel(config.index_queue_size.max(1));

        info!("Changelog service opened for server {}", server_id);
        Ok(Self {
            server_id,
            config,
            clock,
            domain_db,
            cn_index_db,
            indexer,
            generators: Mutex::new(HashMap::new()),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            indexer_running: AtomicBool::new(false),
        })
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn config(&self) -> &ChangelogConfig {
        &self.config
    }

    pub fn domain_db(&self) -> &Arc<ReplicationDomainDB<S>> {
        &self.domain_db
    }

    pub fn cn_index_db(&self) -> &Arc<ChangeNumberIndexDB<S>> {
        &self.cn_index_db
    }

    pub fn indexer(&self) -> &Arc<ChangeNumberIndexer<S>> {
        &self.indexer
    }

    /// Generator of the local server for `domain`, created ahead of the domain's newest CSNs
    fn generator(&self, domain: &str) -> Arc<CsnGenerator> {
        let mut generators = self.generators.lock();
        let generator = generators.entry(domain.to_string()).or_insert_with(|| {
            Arc::new(CsnGenerator::from_state(
                self.server_id,
                &self.domain_db.get_domain_newest_csns(domain),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(generator)
    }

    /// Issue a CSN for a change made on this server
    pub fn new_csn(&self, domain: &str) -> Csn {
        self.generator(domain).new_csn()
    }

    /// Store a change and wake the indexer
    ///
    /// Waits while the indexer's queue is full. Returns whether a new
    /// ReplicaDB was created for the change's replica.
    pub async fn publish(&self, domain: &str, msg: &UpdateMsg) -> Result<bool> {
        self.generator(domain).adjust(&msg.csn);
        let created = self.domain_db.publish_update_msg(domain, msg)?;

        if self.indexing_active() && self.notify_tx.send(()).await.is_err() {
            debug!("Indexer stopped, publish notification dropped");
        }
        Ok(created)
    }

    /// A replica is alive as of `csn`
    pub fn heartbeat(&self, domain: &str, csn: &Csn) {
        self.generator(domain).adjust(csn);
        self.domain_db.replica_heartbeat(domain, csn);
        self.try_notify();
    }

    /// A replica was stopped on purpose at `csn`
    pub fn replica_offline(&self, domain: &str, csn: &Csn) {
        self.domain_db.replica_offline(domain, csn);
        self.try_notify();
    }

    fn indexing_active(&self) -> bool {
        self.config.change_number_indexing && self.indexer_running.load(Ordering::SeqCst)
    }

    fn try_notify(&self) {
        if self.indexing_active() {
            // a full queue already guarantees another indexing run
            let _ = self.notify_tx.try_send(());
        }
    }

    fn is_excluded(&self, domain: &str, excluded: &[String]) -> bool {
        excluded.iter().any(|d| d == domain) || self.indexer.is_excluded(domain)
    }

    /// Cookie pointing after the newest change of every domain
    pub fn newest_cookie(&self) -> MultiDomainServerState {
        let cookie = MultiDomainServerState::new();
        for domain in self.domain_db.domains() {
            if self.is_excluded(&domain, &[]) {
                continue;
            }
            cookie.replace(&domain, self.domain_db.get_domain_newest_csns(&domain));
        }
        cookie
    }

    /// Check that a consumer can resume from `cookie`
    ///
    /// Domains missing from the cookie are read from their oldest change.
    /// A cookie is outdated when a replica has purged changes the consumer
    /// has not seen yet.
    pub fn validate_cookie(
        &self,
        cookie: &MultiDomainServerState,
        excluded: &[String],
    ) -> std::result::Result<(), CookieError> {
        let active: Vec<String> = self
            .domain_db
            .domains()
            .into_iter()
            .filter(|domain| !self.is_excluded(domain, excluded))
            .filter(|domain| !self.domain_db.get_domain_newest_csns(domain).is_empty())
            .collect();

        let unknown: Vec<String> = cookie
            .domains()
            .into_iter()
            .filter(|domain| !active.contains(domain))
            .collect();
        if !unknown.is_empty() {
            let current = MultiDomainServerState::new();
            for domain in &active {
                current.replace(domain, cookie.get_server_state(domain).unwrap_or_default());
            }
            return Err(CookieError::UnknownDomains {
                unknown,
                current: current.to_cookie(),
            });
        }

        for domain in &active {
            let Some(provided) = cookie.get_server_state(domain) else {
                continue;
            };
            let oldest = self.domain_db.get_domain_oldest_csns(domain);
            let outdated = oldest.iter().any(|oldest_csn| {
                provided
                    .csn(oldest_csn.server_id())
                    .is_some_and(|csn| csn.is_older_than(oldest_csn))
            });
            if outdated {
                return Err(CookieError::Outdated(domain.clone()));
            }
        }
        Ok(())
    }

    /// Trim changes older than the purge delay
    ///
    /// Changes still needed by the change number index are kept: replica
    /// logs are never trimmed past the oldest indexed change. Returns the
    /// number of changes removed from the replica logs.
    pub fn purge_now(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut limit = Csn::new(now.saturating_sub(self.config.purge_delay_ms), 0, 0);

        if self.config.change_number_indexing {
            match self.cn_index_db.purge_up_to(&limit)? {
                Some(oldest_indexed) => limit = limit.min(oldest_indexed),
                None => {
                    debug!("Change number index is empty, keeping replica logs");
                    return Ok(0);
                }
            }
        }

        let removed = self.domain_db.purge_up_to(&limit)?;
        if removed > 0 {
            info!("Purged {} changes up to {}", removed, limit);
        }
        Ok(removed)
    }

    /// Forget a decommissioned domain entirely
    pub fn remove_domain(&self, domain: &str) -> Result<bool> {
        let known = self.domain_db.remove_domain(domain)?;
        self.cn_index_db.clear_domain(domain)?;
        self.indexer.remove_domain(domain)?;
        self.generators.lock().remove(domain);
        Ok(known)
    }

    pub fn domain_statuses(&self) -> Result<Vec<DomainStatus>> {
        let timeout = self.config.heartbeat_timeout();
        let offline = self.domain_db.offline_state();
        let alive = self.domain_db.last_alive_state();
        let mut statuses = Vec::new();

        for domain in self.domain_db.domains() {
            let replicas = self
                .domain_db
                .server_ids(&domain)
                .into_iter()
                .filter_map(|server_id| self.domain_db.get_replica_db(&domain, server_id))
                .map(|replica| ReplicaStatus {
                    server_id: replica.server_id(),
                    status: replica.status(),
                    oldest_csn: replica.oldest_csn(),
                    newest_csn: replica.newest_csn(),
                    open_cursors: replica.open_cursor_count(),
                    offline: offline.get_csn(&domain, replica.server_id()).is_some(),
                    missing_changes: diff_seq_num(
                        alive.get_csn(&domain, replica.server_id()).as_ref(),
                        replica.newest_csn().as_ref(),
                    ),
                })
                .collect();

            statuses.push(DomainStatus {
                generation_id: self.domain_db.get_generation_id(&domain)?,
                medium_consistency_csn: self.domain_db.get_medium_consistency_csn(&domain),
                latest_trim_millis: self
                    .domain_db
                    .get_domain_latest_trim_date(&domain)
                    .and_then(|date| date.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64),
                stale_replicas: self.domain_db.get_stale_replicas(&domain, timeout),
                replicas,
                domain,
            });
        }
        Ok(statuses)
    }

    /// Spawn the indexer and purge tasks
    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if self.config.change_number_indexing {
            match self.notify_rx.lock().take() {
                Some(notify_rx) => {
                    self.indexer_running.store(true, Ordering::SeqCst);
                    let service = Arc::clone(self);
                    let shutdown = shutdown_rx.clone();
                    tasks.push(tokio::spawn(async move {
                        service.run_indexer(notify_rx, shutdown).await;
                    }));
                }
                None => warn!("Change number indexer already started"),
            }
        }

        let service = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            service.run_purge(shutdown_rx).await;
        }));

        info!("Changelog background tasks started");
        ServiceHandle { shutdown_tx, tasks }
    }

    async fn run_indexer(
        self: Arc<Self>,
        mut notify_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.index_interval());
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                received = notify_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            // one run covers every pending notification
            while notify_rx.try_recv().is_ok() {}

            let indexer = Arc::clone(&self.indexer);
            match tokio::task::spawn_blocking(move || indexer.index_available_changes()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Change number indexing failed: {}", e),
                Err(e) => error!("Change number indexing task failed: {}", e),
            }
        }
        self.indexer_running.store(false, Ordering::SeqCst);
        info!("Change number indexer stopped");
    }

    async fn run_purge(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.purge_interval());
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let service = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || service.purge_now()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Changelog purge failed: {}", e),
                Err(e) => error!("Changelog purge task failed: {}", e),
            }
        }
        info!("Changelog purge stopped");
    }

    /// Close every replica log; publishing fails afterwards
    pub fn close(&self) {
        self.domain_db.shutdown();
    }
}

/// Handle on the background tasks of a started service
pub struct ServiceHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Stop the background tasks and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Changelog task ended abnormally: {}", e);
            }
        }
    }
}
