//! Thin-provisioning block-storage engine.
//!
//! Resolves virtual-to-physical block mappings for one or more thin devices
//! sharing a pool of physical data blocks, lazily allocating on first write
//! and breaking copy-on-write sharing between snapshots, while serialising
//! every metadata mutation onto a single worker thread.

mod admin;
mod error;
mod mapping;
mod orchestrator;
mod pool;
mod request;
mod status;
mod thin;
mod worker;

pub use error::PoolError;
pub use pool::{Pool, PoolConfig, SECTOR_SIZE};
pub use request::{BlockRequest, CompletionHook, RequestBox};
pub use thin::Thin;

pub use copier::{Copier, CopyOutcome, DataDevice, Region, ThreadCopier};
pub use mapstore::{DeviceId, LookupMode, Mapping, MemMetadataStore, MetaError, MetadataStore};
