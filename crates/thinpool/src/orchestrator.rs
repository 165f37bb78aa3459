//! The mapping orchestrator: decides, for each request, whether it
//! can be remapped immediately or must provision a block or break sharing,
//! and drives those slower paths to completion on the worker thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use copier::Region;
use mapstore::{DeviceId, LookupMode, MetaError};
use prison::{CellHandle, Key};

use crate::error::PoolError;
use crate::mapping::{BreakWaiter, NewMapping};
use crate::pool::PoolInner;
use crate::request::{CompletionHook, PendingRequest, RequestBox};
use crate::worker::WorkItem;

/// The non-blocking fast path, called directly from whatever thread
/// issues the request. A request carrying a flush barrier is never taken
/// down this path: committing metadata ahead of it must happen on the
/// serialised worker thread, so it always goes to the deferred queue even
/// on an uncontended hit.
pub(crate) fn fast_path(pool: &Arc<PoolInner>, dev_id: DeviceId, request: RequestBox) {
    let virt = request.virtual_block();
    if request.has_flush_barrier() {
        let _ = pool.deferred_tx.send(WorkItem::New(PendingRequest { dev_id, request }));
        return;
    }
    match pool.metadata.find_block(dev_id, virt, LookupMode::NonBlocking) {
        Ok(mapping) if !mapping.shared => request.issue(mapping.data_block, None),
        _ => {
            let _ = pool.deferred_tx.send(WorkItem::New(PendingRequest { dev_id, request }));
        }
    }
}

/// Commits metadata before issuing `owner` if it carries a flush barrier,
/// failing it instead of issuing on a commit error.
/// Every issue site reachable from the worker thread routes through this so
/// a FLUSH/FUA request is never acknowledged ahead of the commit it demands.
fn issue_with_flush_barrier(
    pool: &Arc<PoolInner>,
    owner: RequestBox,
    data_block: u64,
    hook: Option<CompletionHook>,
) {
    if owner.has_flush_barrier() {
        if let Err(e) = pool.metadata.commit() {
            owner.fail(PoolError::from(e));
            return;
        }
    }
    owner.issue(data_block, hook);
}

/// Entry point for a request arriving fresh on the deferred-requests queue:
/// detain it against its virtual key, and drive the cell if we're the
/// owner.
pub(crate) fn handle_request(pool: &Arc<PoolInner>, pending: PendingRequest) {
    let dev_id = pending.dev_id;
    let virt = pending.request.virtual_block();
    let key = Key::virtual_block(dev_id, virt);
    let (count_before, cell) = pool.virtual_prison.detain(key, pending.request);
    if count_before > 0 {
        return;
    }
    drive_cell(pool, dev_id, virt, cell);
}

/// Decides what to do with the owner of a held virtual-key cell: remap
/// immediately, provision, or break sharing. Called both for a
/// freshly-detained cell and for one redriven after waiting on a data-key
/// cell.
pub(crate) fn drive_cell(
    pool: &Arc<PoolInner>,
    dev_id: DeviceId,
    virt_block: u64,
    cell: CellHandle<RequestBox>,
) {
    let (is_write, covers_whole_block) = pool
        .virtual_prison
        .peek_first(&cell, |r| (r.is_write(), r.covers_whole_block()))
        .expect("a driven cell is never empty");

    match pool.metadata.find_block(dev_id, virt_block, LookupMode::Blocking) {
        Ok(mapping) if !mapping.shared => {
            let (owner, stragglers) = pool.virtual_prison.release_singleton(cell);
            requeue_stragglers(pool, dev_id, stragglers);
            issue_with_flush_barrier(pool, owner, mapping.data_block, None);
        }
        Ok(mapping) => {
            handle_breaking_sharing(pool, dev_id, virt_block, cell, mapping.data_block, is_write);
        }
        Err(MetaError::NotFound) => {
            handle_provisioning(pool, dev_id, virt_block, cell, covers_whole_block);
        }
        Err(other) => fail_cell(pool, cell, PoolError::from(other)),
    }
}

fn requeue_stragglers(pool: &Arc<PoolInner>, dev_id: DeviceId, stragglers: Vec<RequestBox>) {
    for request in stragglers {
        let _ = pool.deferred_tx.send(WorkItem::New(PendingRequest { dev_id, request }));
    }
}

fn fail_cell(pool: &Arc<PoolInner>, cell: CellHandle<RequestBox>, error: PoolError) {
    let occupants = pool.virtual_prison.fail(cell);
    for request in occupants {
        request.fail(error.clone());
    }
}

fn handle_provisioning(
    pool: &Arc<PoolInner>,
    dev_id: DeviceId,
    virt_block: u64,
    cell: CellHandle<RequestBox>,
    covers_whole_block: bool,
) {
    match pool.metadata.alloc_data_block() {
        Ok(data_block) => {
            pool.raise_low_water_if_needed();
            let skip_zero = covers_whole_block || !pool.zero_new_blocks.load(Ordering::SeqCst);
            if skip_zero {
                let owner =
                    pool.virtual_prison.take_first(&cell).expect("owner present after detain");
                let mapping = NewMapping { dev_id, virt_block, data_block, old_data_block: None, cell, error: None };
                let prepared_tx = pool.prepared_tx.clone();
                let hook = Box::new(move |result: Result<(), String>| {
                    let mut mapping = mapping;
                    if let Err(e) = result {
                        mapping.error = Some(PoolError::IoError(e));
                    }
                    let _ = prepared_tx.send(mapping);
                });
                issue_with_flush_barrier(pool, owner, data_block, Some(hook));
            } else {
                let mapping = NewMapping { dev_id, virt_block, data_block, old_data_block: None, cell, error: None };
                let prepared_tx = pool.prepared_tx.clone();
                pool.copier.zero(
                    Region { block: data_block },
                    Box::new(move |outcome| {
                        let mut mapping = mapping;
                        if !outcome.is_ok() {
                            mapping.error = Some(PoolError::IoError(outcome.to_string()));
                        }
                        let _ = prepared_tx.send(mapping);
                    }),
                );
            }
        }
        Err(MetaError::NoSpace) => {
            let occupants = pool.virtual_prison.release(cell);
            pool.park_for_resize(occupants, dev_id);
        }
        Err(other) => fail_cell(pool, cell, PoolError::from(other)),
    }
}

fn handle_breaking_sharing(
    pool: &Arc<PoolInner>,
    dev_id: DeviceId,
    virt_block: u64,
    cell: CellHandle<RequestBox>,
    old_data_block: u64,
    is_write: bool,
) {
    if !is_write {
        // Shared read: gate installation of any concurrent break-of-sharing
        // write on this read's completion, then remap straight to the old
        // block. Any stragglers that arrived behind the owner are replayed
        // independently; they will make their own fresh decision.
        let entry = pool.deferred.inc();
        let (owner, stragglers) = pool.virtual_prison.release_singleton(cell);
        requeue_stragglers(pool, dev_id, stragglers);

        let deferred = Arc::clone(&pool.deferred);
        let prepared_tx = pool.prepared_tx.clone();
        let hook = Box::new(move |_result: Result<(), String>| {
            for mapping in deferred.dec(entry) {
                let _ = prepared_tx.send(mapping);
            }
        });
        issue_with_flush_barrier(pool, owner, old_data_block, Some(hook));
        return;
    }

    let data_key = Key::data_block(old_data_block);
    let waiter = BreakWaiter { dev_id, virt_block, virtual_cell: cell };
    let (count_before, data_cell) = pool.data_prison.detain(data_key, waiter);
    if count_before > 0 {
        // Another attempt already owns this physical block; our BreakWaiter
        // (carrying our still-held virtual cell) now waits for it to finish
        // and release the data cell.
        return;
    }
    let waiter = pool.data_prison.take_first(&data_cell).expect("sole data-cell owner");
    drive_break(pool, waiter.dev_id, waiter.virt_block, waiter.virtual_cell, data_cell, old_data_block);
}

fn drive_break(
    pool: &Arc<PoolInner>,
    dev_id: DeviceId,
    virt_block: u64,
    virtual_cell: CellHandle<RequestBox>,
    data_cell: CellHandle<BreakWaiter>,
    old_data_block: u64,
) {
    let covers_whole_block = pool
        .virtual_prison
        .peek_first(&virtual_cell, |r| r.covers_whole_block())
        .expect("owner present");

    match pool.metadata.alloc_data_block() {
        Ok(new_data_block) => {
            pool.raise_low_water_if_needed();
            let mapping = NewMapping {
                dev_id,
                virt_block,
                data_block: new_data_block,
                old_data_block: Some(old_data_block),
                cell: virtual_cell,
                error: None,
            };
            let prepared_tx = pool.prepared_tx.clone();
            let deferred = Arc::clone(&pool.deferred);
            let data_prison = Arc::clone(&pool.data_prison);
            let deferred_tx = pool.deferred_tx.clone();

            if covers_whole_block {
                let owner = pool
                    .virtual_prison
                    .take_first(&mapping.cell)
                    .expect("owner present after detain");
                let hook = Box::new(move |result: Result<(), String>| {
                    finish_break(mapping, result, &deferred, &prepared_tx, &data_prison, data_cell, &deferred_tx);
                });
                issue_with_flush_barrier(pool, owner, new_data_block, Some(hook));
            } else {
                pool.copier.copy(
                    Region { block: old_data_block },
                    Region { block: new_data_block },
                    Box::new(move |outcome| {
                        let result = if outcome.is_ok() { Ok(()) } else { Err(outcome.to_string()) };
                        finish_break(mapping, result, &deferred, &prepared_tx, &data_prison, data_cell, &deferred_tx);
                    }),
                );
            }
        }
        Err(MetaError::NoSpace) => {
            release_data_cell(&pool.data_prison, data_cell, &pool.deferred_tx);
            let occupants = pool.virtual_prison.release(virtual_cell);
            pool.park_for_resize(occupants, dev_id);
        }
        Err(other) => {
            release_data_cell(&pool.data_prison, data_cell, &pool.deferred_tx);
            fail_cell(pool, virtual_cell, PoolError::from(other));
        }
    }
}

/// Shared tail of both break-of-sharing completion paths: release the
/// data-key cell so the next claimant (if any) can proceed, then either
/// install immediately or park behind an outstanding shared read.
fn finish_break(
    mut mapping: NewMapping,
    result: Result<(), String>,
    deferred: &barrier::DeferredSet<NewMapping>,
    prepared_tx: &crossbeam_channel::Sender<NewMapping>,
    data_prison: &prison::Prison<BreakWaiter>,
    data_cell: CellHandle<BreakWaiter>,
    deferred_tx: &crossbeam_channel::Sender<WorkItem>,
) {
    if let Err(e) = result {
        mapping.error = Some(PoolError::IoError(e));
    }
    release_data_cell(data_prison, data_cell, deferred_tx);
    if mapping.error.is_some() {
        let _ = prepared_tx.send(mapping);
        return;
    }
    match deferred.add_work(mapping) {
        Some(mapping) => {
            let _ = prepared_tx.send(mapping);
        }
        None => {
            // Parked behind an outstanding shared read against the old
            // block; a future `dec()` will hand it back for installation.
        }
    }
}

fn release_data_cell(
    data_prison: &prison::Prison<BreakWaiter>,
    data_cell: CellHandle<BreakWaiter>,
    deferred_tx: &crossbeam_channel::Sender<WorkItem>,
) {
    for waiter in data_prison.release(data_cell) {
        let _ = deferred_tx.send(WorkItem::Redrive {
            dev_id: waiter.dev_id,
            virt_block: waiter.virt_block,
            cell: waiter.virtual_cell,
        });
    }
}

/// Installs a completed provisioning or break-of-sharing mapping into the
/// metadata tree, then releases its virtual-key cell, replaying every
/// occupant (the fast-path writer, if any, was already issued directly and
/// is never among them).
pub(crate) fn install_prepared_mapping(pool: &Arc<PoolInner>, mapping: NewMapping) {
    if let Some(error) = mapping.error {
        tracing::error!(dev_id = mapping.dev_id, virt_block = mapping.virt_block, %error, "failed to prepare mapping");
        fail_cell(pool, mapping.cell, error);
        return;
    }
    match pool.metadata.insert_block(mapping.dev_id, mapping.virt_block, mapping.data_block, false) {
        Ok(()) => {
            let occupants = pool.virtual_prison.release(mapping.cell);
            requeue_stragglers(pool, mapping.dev_id, occupants);
        }
        Err(e) => fail_cell(pool, mapping.cell, PoolError::from(e)),
    }
}
