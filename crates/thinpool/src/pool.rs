use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender};
use mapstore::{DeviceId, MetadataStore};
use parking_lot::Mutex;

use barrier::DeferredSet;
use copier::Copier;
use prison::Prison;

use crate::admin::{self, AdminCommand};
use crate::error::PoolError;
use crate::mapping::{BreakWaiter, NewMapping};
use crate::orchestrator;
use crate::request::{PendingRequest, RequestBox};
use crate::worker::{AdminJob, ControlMsg, WorkItem, Worker};

/// One sector is 512 bytes, matching the block layer's native unit; block
/// sizes and device sizes in the admin protocol are expressed in sectors.
pub const SECTOR_SIZE: u64 = 512;

/// A pool target's construction arguments: `metadata_dev data_dev
/// block_size_sectors low_water_mark_sectors [skip_block_zeroing]`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub metadata_dev: String,
    pub data_dev: String,
    pub block_size_sectors: u64,
    pub low_water_sectors: u64,
    pub zero_new_blocks: bool,
}

impl PoolConfig {
    pub fn parse(table_line: &str) -> Result<Self, PoolError> {
        let mut tokens = table_line.split_whitespace();
        let metadata_dev = tokens
            .next()
            .ok_or_else(|| PoolError::Invalid("missing metadata_dev".into()))?
            .to_string();
        let data_dev = tokens
            .next()
            .ok_or_else(|| PoolError::Invalid("missing data_dev".into()))?
            .to_string();
        let block_size_sectors = admin::parse_u64(&mut tokens, "block_size_sectors")?;
        if block_size_sectors == 0 || !block_size_sectors.is_power_of_two() {
            return Err(PoolError::Invalid("block_size_sectors must be a power of two".into()));
        }
        let low_water_sectors = admin::parse_u64(&mut tokens, "low_water_mark_sectors")?;
        let mut zero_new_blocks = true;
        if let Some(flag) = tokens.next() {
            if flag == "skip_block_zeroing" {
                zero_new_blocks = false;
            } else {
                return Err(PoolError::Invalid(format!("unknown pool feature: {flag}")));
            }
        }
        if tokens.next().is_some() {
            return Err(PoolError::Invalid("trailing arguments in pool table line".into()));
        }
        Ok(PoolConfig { metadata_dev, data_dev, block_size_sectors, low_water_sectors, zero_new_blocks })
    }
}

/// State shared between the worker thread, admin dispatch, and every `Thin`
/// handle bound to this pool. Lives for as long as any of them do.
pub(crate) struct PoolInner {
    pub metadata_dev: String,
    pub data_dev: String,
    pub metadata: Arc<dyn MetadataStore>,
    pub copier: Arc<dyn Copier>,
    pub virtual_prison: Prison<RequestBox>,
    pub data_prison: Arc<Prison<BreakWaiter>>,
    pub deferred: Arc<DeferredSet<NewMapping>>,
    pub deferred_tx: Sender<WorkItem>,
    pub prepared_tx: Sender<NewMapping>,
    pub block_size_sectors: u64,
    pub low_water_blocks: AtomicU64,
    pub low_water_triggered: AtomicBool,
    pub zero_new_blocks: AtomicBool,
    pub retry_list: Mutex<Vec<PendingRequest>>,
}

impl PoolInner {
    pub fn raise_low_water_if_needed(&self) {
        let free = self.metadata.free_data_blocks();
        if free <= self.low_water_blocks.load(Ordering::SeqCst) {
            if !self.low_water_triggered.swap(true, Ordering::SeqCst) {
                tracing::warn!(free_data_blocks = free, "pool free space below low water mark");
            }
        }
    }

    pub fn park_for_resize(&self, items: Vec<RequestBox>, dev_id: DeviceId) {
        tracing::warn!(dev_id, count = items.len(), "pool out of data space, parking requests");
        let mut retry = self.retry_list.lock();
        retry.extend(items.into_iter().map(|request| PendingRequest { dev_id, request }));
    }
}

/// A running thin-provisioning pool: owns the single worker thread that
/// serialises every mapping-tree mutation, and the admin/control channel
/// used to talk to it.
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
    worker: Option<JoinHandle<()>>,
    control_tx: Sender<ControlMsg>,
}

impl Pool {
    /// Creates and binds a pool, spawning its worker thread.
    pub fn create(
        config: PoolConfig,
        metadata: Arc<dyn MetadataStore>,
        copier: Arc<dyn Copier>,
    ) -> Pool {
        let low_water_blocks = config.low_water_sectors / config.block_size_sectors.max(1);
        let (deferred_tx, deferred_rx) = unbounded::<WorkItem>();
        let (prepared_tx, prepared_rx) = unbounded::<NewMapping>();
        let (control_tx, control_rx) = unbounded::<ControlMsg>();

        let inner = Arc::new(PoolInner {
            metadata_dev: config.metadata_dev.clone(),
            data_dev: config.data_dev.clone(),
            metadata,
            copier,
            virtual_prison: Prison::new(),
            data_prison: Arc::new(Prison::new()),
            deferred: Arc::new(DeferredSet::new()),
            deferred_tx,
            prepared_tx,
            block_size_sectors: config.block_size_sectors,
            low_water_blocks: AtomicU64::new(low_water_blocks),
            low_water_triggered: AtomicBool::new(false),
            zero_new_blocks: AtomicBool::new(config.zero_new_blocks),
            retry_list: Mutex::new(Vec::new()),
        });

        let worker = Worker { pool: inner.clone(), prepared_rx, deferred_rx, control_rx };
        let handle = std::thread::Builder::new()
            .name("thinpool-worker".into())
            .spawn(move || worker.run())
            .expect("failed to spawn pool worker thread");

        Pool { inner, worker: Some(handle), control_tx }
    }

    /// Re-binds a suspended pool's low water mark and zeroing policy, as
    /// happens on a table reload.
    pub fn rebind(&self, low_water_sectors: u64, zero_new_blocks: bool) {
        let low_water_blocks = low_water_sectors / self.inner.block_size_sectors.max(1);
        self.inner.low_water_blocks.store(low_water_blocks, Ordering::SeqCst);
        self.inner.zero_new_blocks.store(zero_new_blocks, Ordering::SeqCst);
    }

    pub(crate) fn handle(&self) -> Arc<PoolInner> {
        self.inner.clone()
    }

    pub fn block_size_sectors(&self) -> u64 {
        self.inner.block_size_sectors
    }

    /// The fast-path entry point: a non-blocking lookup, remapping
    /// and issuing immediately on a hit, or handing the request to the
    /// worker's deferred path otherwise.
    pub fn map_request(&self, dev_id: DeviceId, request: RequestBox) {
        orchestrator::fast_path(&self.inner, dev_id, request);
    }

    /// Grows the data device and clears any requests parked on a prior
    /// no-space condition, re-driving them against the new capacity.
    pub fn resize_data_device(&self, new_total_blocks: u64) -> Result<(), PoolError> {
        self.inner.metadata.resize_data_dev(new_total_blocks)?;
        self.inner.metadata.commit()?;
        self.requeue_parked();
        Ok(())
    }

    /// Clears the low-water trigger and re-sends every request parked on a
    /// prior no-space condition onto the deferred queue, waking the worker.
    fn requeue_parked(&self) {
        self.inner.low_water_triggered.store(false, Ordering::SeqCst);
        let parked = std::mem::take(&mut *self.inner.retry_list.lock());
        for pending in parked {
            let _ = self.inner.deferred_tx.send(WorkItem::New(pending));
        }
    }

    pub fn low_water_triggered(&self) -> bool {
        self.inner.low_water_triggered.load(Ordering::SeqCst)
    }

    /// Runs an admin message on the worker thread, blocking for its
    /// result.
    pub fn message(&self, line: &str) -> Result<String, PoolError> {
        let command = admin::parse(line)?;
        self.dispatch(command)
    }

    fn dispatch(&self, command: AdminCommand) -> Result<String, PoolError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.control_tx
            .send(ControlMsg::Admin(AdminJob { command, reply: reply_tx }))
            .map_err(|_| PoolError::Invalid("pool worker is not running".into()))?;
        reply_rx.recv().map_err(|_| PoolError::Invalid("pool worker dropped the reply".into()))?
    }

    /// Blocks until every already-queued mapping and request has been
    /// drained, then commits. The host is expected to have stopped issuing
    /// new requests and to have waited for in-flight ones to complete before
    /// calling this, mirroring the external suspend protocol.
    pub fn postsuspend(&self) -> Result<(), PoolError> {
        let (reply_tx, reply_rx) = bounded(1);
        let _ = self.control_tx.send(ControlMsg::Flush(reply_tx));
        let _ = reply_rx.recv();
        self.inner.metadata.commit().map_err(PoolError::from)
    }

    /// Reconciles the bound table's data device size against what is
    /// currently on disk: grows and commits if the table now claims a larger
    /// device, rejects a table that claims a smaller one, then always clears
    /// the low-water trigger and re-drives anything parked behind it.
    pub fn preresume(&self, table_data_size_blocks: u64) -> Result<(), PoolError> {
        let on_disk_blocks = self.inner.metadata.total_data_blocks();
        if table_data_size_blocks < on_disk_blocks {
            return Err(PoolError::Invalid(format!(
                "table requests a data device of {table_data_size_blocks} blocks, \
                 smaller than the on-disk size of {on_disk_blocks} blocks"
            )));
        }
        if table_data_size_blocks > on_disk_blocks {
            self.inner.metadata.resize_data_dev(table_data_size_blocks)?;
            self.inner.metadata.commit()?;
        }
        self.requeue_parked();
        Ok(())
    }

    pub fn status_info(&self) -> String {
        crate::status::status_info(&self.inner)
    }

    pub fn status_table(&self) -> String {
        crate::status::status_table(&self.inner)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let _ = self.control_tx.send(ControlMsg::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
