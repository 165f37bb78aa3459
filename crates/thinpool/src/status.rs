//! Status string formatting: the two lines a host driver renders back to
//! userspace for `dmsetup status`/`dmsetup table`.

use std::sync::atomic::Ordering;

use crate::pool::PoolInner;

/// `<transaction_id> <free_metadata_sectors> <free_data_sectors>
/// <held_metadata_root|->`, converting block counts to sectors the same way
/// the pool's table line expresses sizes.
pub(crate) fn status_info(pool: &PoolInner) -> String {
    let transaction_id = pool.metadata.transaction_id();
    let free_metadata_sectors = pool.metadata.free_metadata_blocks() * pool.block_size_sectors;
    let free_data_sectors = pool.metadata.free_data_blocks() * pool.block_size_sectors;
    let held_root = pool
        .metadata
        .held_metadata_root()
        .map(|root| root.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{transaction_id} {free_metadata_sectors} {free_data_sectors} {held_root}")
}

pub(crate) fn status_table(pool: &PoolInner) -> String {
    let low_water_sectors = pool.low_water_blocks.load(Ordering::SeqCst) * pool.block_size_sectors;
    let mut line = format!(
        "{} {} {} {}",
        pool.metadata_dev, pool.data_dev, pool.block_size_sectors, low_water_sectors
    );
    if !pool.zero_new_blocks.load(Ordering::SeqCst) {
        line.push_str(" 1 skip_block_zeroing");
    } else {
        line.push_str(" 0");
    }
    line
}
