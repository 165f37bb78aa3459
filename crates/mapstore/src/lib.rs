//! The metadata store contract: the copy-on-write mapping tree, the
//! data-device space map and the transactional superblock, consumed by the
//! thin-pool engine through the [`MetadataStore`] trait.
//!
//! The real on-disk B-tree is out of scope for this crate; [`mem::MemMetadataStore`]
//! is a correctness-oriented in-memory reference implementation, adequate for
//! exercising and testing the engine.

mod mem;

pub use mem::MemMetadataStore;

use std::fmt;

/// A thin device's identifier. The wire format caps this at 2^24-1; we don't
/// enforce that narrower range here since nothing below the admin-message
/// parser needs to reject it early.
pub type DeviceId = u32;

/// A resolved virtual-to-physical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub data_block: u64,
    /// Conservative: may be `true` after sharing has actually been broken,
    /// but never `false` while sharing is still in effect.
    pub shared: bool,
}

/// Whether a `find_block` call may block to fault in a metadata node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    Blocking,
    NonBlocking,
}

/// Errors a metadata store call can return.
#[derive(Debug)]
pub enum MetaError {
    NoSpace,
    NotFound,
    IoError(String),
    Corrupt(String),
    /// Only ever returned from a [`LookupMode::NonBlocking`] lookup.
    WouldBlock,
    Invalid(String),
}

impl fmt::Display for MetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaError::NoSpace => write!(f, "no free data blocks"),
            MetaError::NotFound => write!(f, "not found"),
            MetaError::IoError(msg) => write!(f, "metadata I/O error: {msg}"),
            MetaError::Corrupt(msg) => write!(f, "metadata corrupt: {msg}"),
            MetaError::WouldBlock => write!(f, "lookup would block"),
            MetaError::Invalid(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for MetaError {}

/// The metadata store contract consumed by the engine.
///
/// Implementations must be safe to call concurrently: `find_block` is called
/// both from the host's fast-path hook (any thread) and from the worker;
/// every mutating call is only ever made from the worker thread, but the
/// trait itself makes no such assumption so a future on-disk implementation
/// is free to take its own locks.
pub trait MetadataStore: Send + Sync {
    fn create_thin(&self, dev_id: DeviceId) -> Result<(), MetaError>;
    fn create_snap(&self, dev_id: DeviceId, origin_id: DeviceId) -> Result<(), MetaError>;
    fn delete_thin(&self, dev_id: DeviceId) -> Result<(), MetaError>;
    fn trim_thin(&self, dev_id: DeviceId, new_block_count: u64) -> Result<(), MetaError>;

    fn find_block(
        &self,
        dev_id: DeviceId,
        virt_block: u64,
        mode: LookupMode,
    ) -> Result<Mapping, MetaError>;
    fn insert_block(
        &self,
        dev_id: DeviceId,
        virt_block: u64,
        data_block: u64,
        shared: bool,
    ) -> Result<(), MetaError>;

    fn alloc_data_block(&self) -> Result<u64, MetaError>;
    fn free_data_blocks(&self) -> u64;
    fn total_data_blocks(&self) -> u64;
    fn resize_data_dev(&self, new_total_blocks: u64) -> Result<(), MetaError>;

    fn free_metadata_blocks(&self) -> u64;
    fn total_metadata_blocks(&self) -> u64;

    fn transaction_id(&self) -> u64;
    fn set_transaction_id(&self, old: u64, new: u64) -> Result<(), MetaError>;
    fn held_metadata_root(&self) -> Option<u64>;

    fn commit(&self) -> Result<(), MetaError>;
}
