//! The controller loop.
//!
//! Each tick:
//! 1. moves the store cursor to `now` and stops nodes whose deadline passed,
//! 2. polls both log filters and folds locations, then deadlines, into the store,
//! 3. starts nodes for DApps that are funded and have a known machine location.
//!
//! The store is only touched from `tick`, which runs to completion before the
//! next one is scheduled. Driver calls within a tick run concurrently and each
//! is bounded by `driver_timeout`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use sunodo_chain::{
    ChainClient, ChainError, DeadlineEvent, EventKind, FilterId, LocationEvent, RawLog,
    RpcChainClient,
};
use sunodo_driver::{DriverError, NodeDriver, NodeStatus, build_driver};
use sunodo_store::{Address, DApp, DAppStore};
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{ControllerConfig, ControllerError, now_millis};

/// The protocol contracts whose events drive the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contracts {
    pub financial: Address,
    pub machine: Address,
}

impl Contracts {
    pub fn from_config(config: &ControllerConfig) -> Result<Self, ControllerError> {
        let financial = config.financial_protocol.ok_or_else(|| {
            ControllerError::Config("no financial protocol contract address configured".into())
        })?;
        let machine = config.machine_protocol.ok_or_else(|| {
            ControllerError::Config("no machine protocol contract address configured".into())
        })?;
        Ok(Self { financial, machine })
    }

    fn for_kind(&self, kind: EventKind) -> Address {
        match kind {
            EventKind::FinancialRunway => self.financial,
            EventKind::MachineLocation => self.machine,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub stopped: usize,
    pub started: usize,
    /// Driver calls that failed or timed out.
    pub failed: usize,
    /// Location events folded into the store.
    pub locations: usize,
    /// Deadline events folded into the store.
    pub deadlines: usize,
    /// Logs dropped as pending or malformed.
    pub discarded: usize,
    /// Starts not dispatched: already running from the same location, or no
    /// location known yet.
    pub skipped: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
struct Filter {
    id: FilterId,
    /// Installed but not yet read; the first read fetches history.
    fresh: bool,
}

/// One event kind's filter and how far its logs have been read.
#[derive(Debug)]
struct Watch {
    filter: Option<Filter>,
    /// Every log of this kind up to this block has been delivered. A
    /// reinstalled filter starts here.
    resume: u64,
}

#[derive(Debug)]
struct Filters {
    runway: Watch,
    location: Watch,
}

impl Filters {
    fn new(block: u64) -> Self {
        let watch = |resume| Watch {
            filter: None,
            resume,
        };
        Self {
            runway: watch(block),
            location: watch(block),
        }
    }

    fn watch(&mut self, kind: EventKind) -> &mut Watch {
        match kind {
            EventKind::FinancialRunway => &mut self.runway,
            EventKind::MachineLocation => &mut self.location,
        }
    }

    /// Block up to which both kinds have been delivered; what a restarted
    /// controller resumes from.
    fn resume_block(&self) -> u64 {
        self.runway.resume.min(self.location.resume)
    }
}

pub struct Controller {
    chain: Arc<dyn ChainClient>,
    driver: Arc<dyn NodeDriver>,
    store: DAppStore,
    store_path: PathBuf,
    contracts: Contracts,
    config: ControllerConfig,
    filters: Filters,
    /// Location each running node was started from.
    started: HashMap<Address, String>,
    /// DApps whose start failed; retried while they stay funded.
    retry_starts: BTreeSet<Address>,
    /// Nodes whose stop failed; retried until the stop succeeds or the DApp
    /// is funded again.
    retry_stops: BTreeMap<Address, DApp>,
}

impl Controller {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        driver: Arc<dyn NodeDriver>,
        store: DAppStore,
        store_path: PathBuf,
        contracts: Contracts,
        config: ControllerConfig,
    ) -> Self {
        let filters = Filters::new(store.block());
        Self {
            chain,
            driver,
            store,
            store_path,
            contracts,
            config,
            filters,
            started: HashMap::new(),
            retry_starts: BTreeSet::new(),
            retry_stops: BTreeMap::new(),
        }
    }

    /// Connect to the chain, load the persisted store and install the log
    /// filters. Any failure here is a configuration or connectivity problem
    /// and the controller should not run.
    pub async fn connect(config: ControllerConfig) -> Result<Self, ControllerError> {
        let contracts = Contracts::from_config(&config)?;
        let url = Url::parse(&config.rpc_url)
            .map_err(|e| ControllerError::Config(format!("rpc url {}: {e}", config.rpc_url)))?;
        let mut chain = RpcChainClient::new(url, config.rpc_timeout)?;
        if let Some(poll_interval) = config.poll_interval {
            chain = chain.with_polling_interval(poll_interval);
        }

        let chain_id = chain.chain_id().await?;
        let store_path = config.store_path(chain_id);
        let store = DAppStore::open(&store_path, now_millis())?;
        info!(
            chain_id,
            path = %store_path.display(),
            block = store.block(),
            dapps = store.len(),
            "store loaded"
        );

        let driver = build_driver(&config.driver)?;
        info!(driver = driver.kind(), "driver ready");

        let mut controller = Self::new(Arc::new(chain), driver, store, store_path, contracts, config);
        controller.install_filters().await?;
        Ok(controller)
    }

    pub fn store(&self) -> &DAppStore {
        &self.store
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Location the node for `address` was last started from, if it is running.
    pub fn started_location(&self, address: &Address) -> Option<&str> {
        self.started.get(address).map(String::as_str)
    }

    pub fn polling_interval(&self) -> Duration {
        self.config
            .poll_interval
            .unwrap_or_else(|| self.chain.polling_interval())
    }

    /// Install both log filters, each resuming from the last block it delivered.
    pub async fn install_filters(&mut self) -> Result<(), ChainError> {
        self.install_filter(EventKind::MachineLocation).await?;
        self.install_filter(EventKind::FinancialRunway).await?;
        Ok(())
    }

    async fn install_filter(&mut self, kind: EventKind) -> Result<(), ChainError> {
        let contract = self.contracts.for_kind(kind);
        let from_block = self.filters.watch(kind).resume;
        let id = self.chain.create_filter(kind, contract, from_block).await?;
        info!(event = kind.name(), %contract, from_block, filter = %id, "watching events");
        self.filters.watch(kind).filter = Some(Filter { id, fresh: true });
        Ok(())
    }

    /// Save the store. The recorded block is the one the lagging filter has
    /// reached, so a restart re-reads whatever that filter has not delivered.
    pub fn persist(&self) -> Result<(), ControllerError> {
        let mut snapshot = self.store.snapshot();
        snapshot.block = self.filters.resume_block();
        snapshot.save(&self.store_path)?;
        debug!(path = %self.store_path.display(), block = snapshot.block, "store persisted");
        Ok(())
    }

    /// Start every funded DApp with a known location. Run once before the
    /// first tick so nodes survive a controller restart.
    pub async fn reconcile(&mut self, now: u128) -> TickReport {
        let mut report = TickReport::default();
        let live: BTreeSet<Address> = self.store.live(now).map(|dapp| dapp.address).collect();
        info!(dapps = live.len(), "reconciling running nodes");
        self.dispatch_starts(live, now, &mut report).await;
        report
    }

    pub async fn tick(&mut self, now: u128) -> TickReport {
        let mut report = TickReport::default();
        let block_before = self.store.block();
        let resume_before = self.filters.resume_block();

        let mut due = self.store.advance(now);
        let retry_stops = std::mem::take(&mut self.retry_stops);
        due.extend(retry_stops.into_values().filter(|dapp| {
            !self
                .store
                .get(&dapp.address)
                .is_some_and(|current| current.is_live(now))
        }));
        self.dispatch_stops(due, &mut report).await;

        let mut candidates = std::mem::take(&mut self.retry_starts);

        for log in self.poll(EventKind::MachineLocation).await {
            let event = LocationEvent::from(&log);
            match event.apply(&mut self.store) {
                Ok(address) => {
                    report.locations += 1;
                    info!(
                        %address,
                        location = event.location.as_deref().unwrap_or_default(),
                        block = event.block_number,
                        "machine location updated"
                    );
                    if self.store.get(&address).is_some_and(|dapp| dapp.is_live(now)) {
                        candidates.insert(address);
                    }
                }
                Err(err) => {
                    report.discarded += 1;
                    warn!(error = %err, tx = event.transaction_hash.as_deref(), "discarding log");
                }
            }
        }

        let mut expired = BTreeSet::new();
        for log in self.poll(EventKind::FinancialRunway).await {
            let event = DeadlineEvent::from(&log);
            match event.apply(&mut self.store, now) {
                Ok(Some(dapp)) => {
                    report.deadlines += 1;
                    info!(
                        address = %dapp.address,
                        shutdown_at = %dapp.shutdown_at,
                        chain_id = ?event.chain_id,
                        block = dapp.block_number,
                        "deadline updated"
                    );
                    candidates.insert(dapp.address);
                }
                Ok(None) => {
                    report.deadlines += 1;
                    let address = event.address.unwrap_or(Address::ZERO);
                    debug!(%address, until = ?event.until, "deadline already passed");
                    expired.insert(address);
                }
                Err(err) => {
                    report.discarded += 1;
                    warn!(error = %err, tx = event.transaction_hash.as_deref(), "discarding log");
                }
            }
        }

        // A running node whose deadline was moved into the past is behind the
        // cursor already and will never be returned by `advance`.
        let defunded: Vec<DApp> = expired
            .into_iter()
            .filter(|address| self.started.contains_key(address))
            .filter_map(|address| self.store.get(&address))
            .filter(|dapp| !dapp.is_live(now))
            .cloned()
            .collect();
        self.dispatch_stops(defunded, &mut report).await;

        self.dispatch_starts(candidates, now, &mut report).await;

        let changed = self.store.block() != block_before
            || self.filters.resume_block() != resume_before
            || report.locations + report.deadlines > 0;
        if changed && self.config.persist_every_tick {
            if let Err(err) = self.persist() {
                error!(error = %err, "failed to persist store");
            }
        }
        report
    }

    /// Tick every polling interval until `shutdown` fires, then persist.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ControllerError> {
        let period = self.polling_interval();
        info!(driver = self.driver.kind(), ?period, "controller started");

        let report = self.reconcile(now_millis()).await;
        if !report.is_idle() {
            info!(started = report.started, failed = report.failed, "reconciled");
        }

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
            let report = self.tick(now_millis()).await;
            if !report.is_idle() {
                info!(
                    stopped = report.stopped,
                    started = report.started,
                    failed = report.failed,
                    locations = report.locations,
                    deadlines = report.deadlines,
                    discarded = report.discarded,
                    skipped = report.skipped,
                    block = self.store.block(),
                    "tick"
                );
            }
        }

        self.persist()?;
        info!("controller stopped");
        Ok(())
    }

    async fn poll(&mut self, kind: EventKind) -> Vec<RawLog> {
        if self.filters.watch(kind).filter.is_none() {
            if let Err(err) = self.install_filter(kind).await {
                warn!(event = kind.name(), error = %err, "failed to install filter");
                return Vec::new();
            }
        }
        let Some(filter) = self.filters.watch(kind).filter.clone() else {
            return Vec::new();
        };
        // Blocks already seen exist on the node, so a successful read covers them.
        let seen = self.store.block();

        let result = if filter.fresh {
            self.chain.filter_logs(&filter.id).await
        } else {
            self.chain.poll_filter(&filter.id).await
        };
        match result {
            Ok(logs) => {
                let watch = self.filters.watch(kind);
                if let Some(filter) = watch.filter.as_mut() {
                    filter.fresh = false;
                }
                let delivered = logs.iter().filter_map(|log| log.block_number).max();
                watch.resume = watch.resume.max(seen).max(delivered.unwrap_or(0));
                logs
            }
            Err(ChainError::FilterNotFound(id)) => {
                warn!(event = kind.name(), filter = %id, "filter lost, reinstalling");
                self.filters.watch(kind).filter = None;
                if let Err(err) = self.install_filter(kind).await {
                    warn!(event = kind.name(), error = %err, "failed to install filter");
                }
                Vec::new()
            }
            Err(err) => {
                warn!(event = kind.name(), error = %err, "failed to poll filter");
                Vec::new()
            }
        }
    }

    async fn dispatch_stops(&mut self, dapps: Vec<DApp>, report: &mut TickReport) {
        if dapps.is_empty() {
            return;
        }
        let driver = &self.driver;
        let limit = self.config.driver_timeout;
        let results = join_all(dapps.iter().map(|dapp| async move {
            info!(address = %dapp.address, shutdown_at = %dapp.shutdown_at, "stopping node");
            bounded(limit, driver.stop(dapp)).await
        }))
        .await;

        for (dapp, result) in dapps.into_iter().zip(results) {
            self.started.remove(&dapp.address);
            self.retry_starts.remove(&dapp.address);
            match result {
                Ok(status) => {
                    debug!(address = %dapp.address, %status, "stop dispatched");
                    report.stopped += 1;
                }
                // Already gone.
                Err(err) if err.is_not_found() => {
                    debug!(address = %dapp.address, "node already removed");
                    report.stopped += 1;
                }
                Err(err) => {
                    error!(address = %dapp.address, error = %err, "failed to stop node");
                    report.failed += 1;
                    if retryable(&err) {
                        self.retry_stops.insert(dapp.address, dapp);
                    }
                }
            }
        }
    }

    async fn dispatch_starts(&mut self, candidates: BTreeSet<Address>, now: u128, report: &mut TickReport) {
        let mut starts = Vec::new();
        for address in candidates {
            let Some(dapp) = self.store.get(&address).filter(|dapp| dapp.is_live(now)) else {
                continue;
            };
            let Some(location) = self.store.location(&address) else {
                info!(%address, "no machine location yet, start deferred");
                report.skipped += 1;
                continue;
            };
            if self.started.get(&address).map(String::as_str) == Some(location) {
                debug!(%address, location, "node already started from this location");
                report.skipped += 1;
                continue;
            }
            starts.push((dapp.clone(), location.to_string()));
        }
        if starts.is_empty() {
            return;
        }

        let driver = &self.driver;
        let limit = self.config.driver_timeout;
        let results = join_all(starts.iter().map(|(dapp, location)| async move {
            info!(address = %dapp.address, location = %location, "starting node");
            bounded(limit, driver.start(dapp, location)).await
        }))
        .await;

        for ((dapp, location), result) in starts.into_iter().zip(results) {
            match result {
                Ok(status) => {
                    debug!(address = %dapp.address, %status, "start dispatched");
                    report.started += 1;
                    self.retry_stops.remove(&dapp.address);
                    self.started.insert(dapp.address, location);
                }
                Err(err) => {
                    error!(address = %dapp.address, error = %err, "failed to start node");
                    report.failed += 1;
                    if retryable(&err) {
                        self.retry_starts.insert(dapp.address);
                    }
                }
            }
        }
    }
}

async fn bounded<F>(limit: Duration, call: F) -> Result<NodeStatus, DriverError>
where
    F: Future<Output = Result<NodeStatus, DriverError>>,
{
    timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(DriverError::Timeout(limit)))
}

/// Calls that can never succeed are not repeated.
fn retryable(err: &DriverError) -> bool {
    !matches!(
        err,
        DriverError::Unsupported(_) | DriverError::InvalidLocation(_) | DriverError::Config(_)
    )
}
