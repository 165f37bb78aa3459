use mapstore::DeviceId;
use prison::CellHandle;

use crate::error::PoolError;
use crate::request::RequestBox;

/// An in-flight provisioning or break-of-sharing record: a data block has
/// been allocated and a zero or copy has been scheduled against it, but the
/// result is not yet reflected in the metadata tree.
///
/// `cell` is the virtual-key cell every request against `(dev_id,
/// virt_block)` queued up in; it stays held for as long as this mapping is
/// in flight and is only released once the mapping is installed (or fails),
/// at which point its occupants are replayed against the now-current state.
pub(crate) struct NewMapping {
    pub dev_id: DeviceId,
    pub virt_block: u64,
    pub data_block: u64,
    /// The block being copied away from, for break-of-sharing. `None` for
    /// plain provisioning.
    pub old_data_block: Option<u64>,
    pub cell: CellHandle<RequestBox>,
    /// Set if the scheduled zero/copy reported an I/O error; installation
    /// then fails every queued request instead of inserting the mapping.
    pub error: Option<PoolError>,
}

/// Queued on a data-key cell while breaking sharing against a physical block
/// that another break-of-sharing attempt already claimed. Carries the
/// still-held virtual-key cell so the request can be redriven, from
/// scratch, once that attempt publishes its own mapping and lets go.
pub(crate) struct BreakWaiter {
    pub dev_id: DeviceId,
    pub virt_block: u64,
    pub virtual_cell: CellHandle<RequestBox>,
}
