use std::sync::Arc;

use crossbeam_channel::{Receiver, Select, Sender};

use prison::CellHandle;

use crate::admin::{self, AdminCommand};
use crate::error::PoolError;
use crate::mapping::NewMapping;
use crate::orchestrator;
use crate::pool::PoolInner;
use crate::request::{PendingRequest, RequestBox};

/// Work queued for the worker's deferred-requests pass: either a fresh
/// request that has never been driven, or a request whose virtual-key cell
/// is already held and just needs re-deciding (e.g. after being released
/// from a data-key cell that another break-of-sharing attempt was holding).
pub(crate) enum WorkItem {
    New(PendingRequest),
    Redrive { dev_id: mapstore::DeviceId, virt_block: u64, cell: CellHandle<RequestBox> },
}

pub(crate) struct AdminJob {
    pub command: AdminCommand,
    pub reply: Sender<Result<String, PoolError>>,
}

pub(crate) enum ControlMsg {
    Admin(AdminJob),
    Flush(Sender<()>),
    Shutdown,
}

/// The single-threaded serial executor: drains prepared mappings
/// ahead of deferred requests on every pass, then blocks for more work
/// rather than polling.
pub(crate) struct Worker {
    pub pool: Arc<PoolInner>,
    pub prepared_rx: Receiver<NewMapping>,
    pub deferred_rx: Receiver<WorkItem>,
    pub control_rx: Receiver<ControlMsg>,
}

impl Worker {
    pub fn run(self) {
        loop {
            while let Ok(mapping) = self.prepared_rx.try_recv() {
                orchestrator::install_prepared_mapping(&self.pool, mapping);
            }
            while let Ok(item) = self.deferred_rx.try_recv() {
                self.handle_work_item(item);
            }
            while let Ok(msg) = self.control_rx.try_recv() {
                if self.handle_control(msg) {
                    return;
                }
            }

            let mut select = Select::new();
            let prepared_idx = select.recv(&self.prepared_rx);
            let deferred_idx = select.recv(&self.deferred_rx);
            let control_idx = select.recv(&self.control_rx);
            let op = select.select();
            match op.index() {
                i if i == prepared_idx => {
                    if let Ok(mapping) = op.recv(&self.prepared_rx) {
                        orchestrator::install_prepared_mapping(&self.pool, mapping);
                    }
                }
                i if i == deferred_idx => {
                    if let Ok(item) = op.recv(&self.deferred_rx) {
                        self.handle_work_item(item);
                    }
                }
                i if i == control_idx => {
                    if let Ok(msg) = op.recv(&self.control_rx) {
                        if self.handle_control(msg) {
                            return;
                        }
                    }
                }
                _ => unreachable!("Select only registered three receivers"),
            }
        }
    }

    fn handle_work_item(&self, item: WorkItem) {
        match item {
            WorkItem::New(pending) => orchestrator::handle_request(&self.pool, pending),
            WorkItem::Redrive { dev_id, virt_block, cell } => {
                orchestrator::drive_cell(&self.pool, dev_id, virt_block, cell)
            }
        }
    }

    /// Returns `true` if the worker should stop.
    fn handle_control(&self, msg: ControlMsg) -> bool {
        match msg {
            ControlMsg::Admin(job) => {
                let result = admin::dispatch(&self.pool, job.command);
                let _ = job.reply.send(result);
                false
            }
            ControlMsg::Flush(reply) => {
                loop {
                    let mut did_work = false;
                    while let Ok(mapping) = self.prepared_rx.try_recv() {
                        orchestrator::install_prepared_mapping(&self.pool, mapping);
                        did_work = true;
                    }
                    while let Ok(item) = self.deferred_rx.try_recv() {
                        self.handle_work_item(item);
                        did_work = true;
                    }
                    if !did_work {
                        break;
                    }
                }
                let _ = reply.send(());
                false
            }
            ControlMsg::Shutdown => true,
        }
    }
}
