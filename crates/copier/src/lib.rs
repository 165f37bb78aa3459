//! The asynchronous block-copy engine contract: clones or zeroes a region of
//! the data device and notifies a callback on completion, from the copier's
//! own thread.
//!
//! The real engine would drive DMA or `io_uring` against the data device;
//! [`ThreadCopier`] is a thread-pool reference implementation operating on an
//! in-memory [`DataDevice`], sufficient to exercise the engine's copy/zero
//! scheduling and completion-callback plumbing.

mod thread_copier;

pub use thread_copier::ThreadCopier;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// A single data block, identified by its physical block number. Copy/zero
/// in this domain always operate at block granularity: breaking sharing
/// always clones the whole block, and a freshly provisioned block is always
/// zeroed in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub block: u64,
}

/// Result handed to a copy/zero completion callback.
#[derive(Debug, Default, Clone)]
pub struct CopyOutcome {
    pub read_error: Option<String>,
    pub write_error: Option<String>,
}

impl CopyOutcome {
    pub fn ok() -> Self {
        CopyOutcome::default()
    }

    pub fn is_ok(&self) -> bool {
        self.read_error.is_none() && self.write_error.is_none()
    }
}

impl fmt::Display for CopyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.read_error, &self.write_error) {
            (None, None) => write!(f, "ok"),
            (Some(r), None) => write!(f, "read error: {r}"),
            (None, Some(w)) => write!(f, "write error: {w}"),
            (Some(r), Some(w)) => write!(f, "read error: {r}; write error: {w}"),
        }
    }
}

pub type CopyCallback = Box<dyn FnOnce(CopyOutcome) + Send>;

/// Clones or zeroes regions of the data device, invoking `callback` from the
/// copier's own thread on completion.
pub trait Copier: Send + Sync {
    fn copy(&self, from: Region, to: Region, callback: CopyCallback);
    fn zero(&self, to: Region, callback: CopyCallback);
}

/// A sparse, block-addressed in-memory stand-in for the pool's data device.
/// Blocks that have never been written read back as zeroes.
#[derive(Clone)]
pub struct DataDevice {
    block_size_bytes: usize,
    blocks: Arc<Mutex<std::collections::HashMap<u64, Vec<u8>>>>,
}

impl DataDevice {
    pub fn new(block_size_bytes: usize) -> Self {
        DataDevice { block_size_bytes, blocks: Arc::new(Mutex::new(std::collections::HashMap::new())) }
    }

    pub fn block_size_bytes(&self) -> usize {
        self.block_size_bytes
    }

    pub fn read_block(&self, block: u64) -> Vec<u8> {
        self.blocks
            .lock()
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.block_size_bytes])
    }

    pub fn write_block(&self, block: u64, data: Vec<u8>) {
        debug_assert_eq!(data.len(), self.block_size_bytes);
        self.blocks.lock().insert(block, data);
    }

    pub(crate) fn copy_block(&self, from: u64, to: u64) {
        let data = self.read_block(from);
        self.write_block(to, data);
    }

    pub(crate) fn zero_block(&self, block: u64) {
        self.write_block(block, vec![0u8; self.block_size_bytes]);
    }
}
