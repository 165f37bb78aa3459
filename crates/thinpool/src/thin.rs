use std::sync::Arc;

use mapstore::DeviceId;

use crate::error::PoolError;
use crate::pool::{Pool, PoolInner};
use crate::request::RequestBox;

/// A handle to one thin device bound to a pool. Creation and destruction go
/// through the pool's admin channel so they serialise against every
/// other metadata mutation; mapping a request uses the pool's fast path
/// directly since it never mutates the tree itself.
pub struct Thin {
    pool: Arc<PoolInner>,
    dev_id: DeviceId,
}

impl Thin {
    /// Creates a new, empty thin device on `pool` and returns a handle to it.
    pub fn create(pool: &Pool, dev_id: DeviceId) -> Result<Thin, PoolError> {
        pool.message(&format!("create_thin {dev_id}"))?;
        Ok(Thin { pool: pool.handle(), dev_id })
    }

    /// Creates `dev_id` as a snapshot of `origin`, sharing every mapping
    /// `origin` currently has.
    pub fn create_snapshot(pool: &Pool, dev_id: DeviceId, origin: &Thin) -> Result<Thin, PoolError> {
        pool.message(&format!("create_snap {dev_id} {}", origin.dev_id))?;
        Ok(Thin { pool: pool.handle(), dev_id })
    }

    pub fn device_id(&self) -> DeviceId {
        self.dev_id
    }

    /// Resolves and issues `request` against this device's virtual address
    /// space.
    pub fn map(&self, request: RequestBox) {
        crate::orchestrator::fast_path(&self.pool, self.dev_id, request);
    }

    /// Shrinks the device's logical size, dropping any mappings beyond
    /// `new_size_sectors` and reclaiming data blocks no longer referenced by
    /// any device.
    pub fn trim(&self, pool: &Pool, new_size_sectors: u64) -> Result<(), PoolError> {
        pool.message(&format!("trim {} {new_size_sectors}", self.dev_id)).map(|_| ())
    }

    pub fn destroy(self, pool: &Pool) -> Result<(), PoolError> {
        pool.message(&format!("delete {}", self.dev_id)).map(|_| ())
    }
}
