use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::{DeviceId, LookupMode, Mapping, MetaError, MetadataStore};

type DeviceMap = BTreeMap<u64, Mapping>;

#[derive(Clone)]
struct State {
    devices: HashMap<DeviceId, DeviceMap>,
    ref_counts: HashMap<u64, u64>,
    free_list: VecDeque<u64>,
    total_blocks: u64,
    transaction_id: u64,
    held_root: Option<u64>,
}

impl State {
    fn new(total_blocks: u64) -> Self {
        State {
            devices: HashMap::new(),
            ref_counts: HashMap::new(),
            free_list: (0..total_blocks).collect(),
            total_blocks,
            transaction_id: 0,
            held_root: None,
        }
    }

    fn drop_ref(&mut self, block: u64) {
        let count = self.ref_counts.entry(block).or_insert(0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.ref_counts.remove(&block);
            self.free_list.push_back(block);
        }
    }
}

/// In-memory reference implementation of [`MetadataStore`].
///
/// Snapshots are modelled the way the real B-tree makes them O(1): cloning a
/// device's mapping tree (a `BTreeMap`) and marking every entry in both
/// copies `shared`, bumping the data block's reference count once per shared
/// entry. Breaking sharing is not special-cased here: the engine always
/// calls `insert_block` with the already-resolved data block and `shared`
/// flag, and reclaiming the old block falls out naturally from reference
/// counting — it only drops to zero once every device that shared it has
/// moved its own mapping away.
pub struct MemMetadataStore {
    state: Mutex<State>,
    committed: Mutex<State>,
    /// Test hook: non-blocking lookups for these keys return `WouldBlock`
    /// exactly once, simulating an uncached metadata node.
    force_would_block: Mutex<HashSet<(DeviceId, u64)>>,
    metadata_total: u64,
}

impl MemMetadataStore {
    pub fn new(total_data_blocks: u64, metadata_total_blocks: u64) -> Self {
        let state = State::new(total_data_blocks);
        MemMetadataStore {
            committed: Mutex::new(state.clone()),
            state: Mutex::new(state),
            force_would_block: Mutex::new(HashSet::new()),
            metadata_total: metadata_total_blocks,
        }
    }

    /// Test-only: force the next non-blocking `find_block` for `(dev_id,
    /// virt_block)` to report `WouldBlock`, exercising the fast-path defer.
    pub fn force_would_block_once(&self, dev_id: DeviceId, virt_block: u64) {
        self.force_would_block.lock().insert((dev_id, virt_block));
    }

    pub fn set_held_metadata_root(&self, root: Option<u64>) {
        self.state.lock().held_root = root;
    }

    /// Test-only: discard uncommitted state and reload from the last commit,
    /// simulating an unclean stop.
    pub fn simulate_crash(&self) {
        let committed = self.committed.lock().clone();
        *self.state.lock() = committed;
    }
}

impl MetadataStore for MemMetadataStore {
    fn create_thin(&self, dev_id: DeviceId) -> Result<(), MetaError> {
        let mut st = self.state.lock();
        if st.devices.contains_key(&dev_id) {
            tracing::debug!(dev_id, "create_thin rejected, device already exists");
            return Err(MetaError::Invalid(format!("device {dev_id} already exists")));
        }
        st.devices.insert(dev_id, DeviceMap::new());
        Ok(())
    }

    fn create_snap(&self, dev_id: DeviceId, origin_id: DeviceId) -> Result<(), MetaError> {
        let mut st = self.state.lock();
        if st.devices.contains_key(&dev_id) {
            return Err(MetaError::Invalid(format!("device {dev_id} already exists")));
        }
        let origin_map = st.devices.get(&origin_id).ok_or(MetaError::NotFound)?.clone();

        let mut snap_map = origin_map;
        for mapping in snap_map.values_mut() {
            mapping.shared = true;
            *st.ref_counts.entry(mapping.data_block).or_insert(0) += 1;
        }
        if let Some(origin_map) = st.devices.get_mut(&origin_id) {
            for mapping in origin_map.values_mut() {
                mapping.shared = true;
            }
        }
        st.devices.insert(dev_id, snap_map);
        Ok(())
    }

    fn delete_thin(&self, dev_id: DeviceId) -> Result<(), MetaError> {
        let mut st = self.state.lock();
        let map = st.devices.remove(&dev_id).ok_or(MetaError::NotFound)?;
        for mapping in map.values() {
            st.drop_ref(mapping.data_block);
        }
        Ok(())
    }

    fn trim_thin(&self, dev_id: DeviceId, new_block_count: u64) -> Result<(), MetaError> {
        let mut st = self.state.lock();
        let removed: Vec<Mapping> = {
            let map = st.devices.get_mut(&dev_id).ok_or(MetaError::NotFound)?;
            let tail = map.split_off(&new_block_count);
            tail.into_values().collect()
        };
        for mapping in removed {
            st.drop_ref(mapping.data_block);
        }
        Ok(())
    }

    fn find_block(
        &self,
        dev_id: DeviceId,
        virt_block: u64,
        mode: LookupMode,
    ) -> Result<Mapping, MetaError> {
        if mode == LookupMode::NonBlocking
            && self.force_would_block.lock().remove(&(dev_id, virt_block))
        {
            return Err(MetaError::WouldBlock);
        }
        let st = self.state.lock();
        let map = st.devices.get(&dev_id).ok_or(MetaError::NotFound)?;
        map.get(&virt_block).copied().ok_or(MetaError::NotFound)
    }

    fn insert_block(
        &self,
        dev_id: DeviceId,
        virt_block: u64,
        data_block: u64,
        shared: bool,
    ) -> Result<(), MetaError> {
        let mut st = self.state.lock();
        let old = {
            let map = st.devices.get_mut(&dev_id).ok_or(MetaError::NotFound)?;
            map.insert(virt_block, Mapping { data_block, shared })
        };
        if let Some(old) = old {
            st.drop_ref(old.data_block);
        }
        Ok(())
    }

    fn alloc_data_block(&self) -> Result<u64, MetaError> {
        let mut st = self.state.lock();
        let block = st.free_list.pop_front().ok_or_else(|| {
            tracing::warn!("data device exhausted, allocation failed");
            MetaError::NoSpace
        })?;
        st.ref_counts.insert(block, 1);
        Ok(block)
    }

    fn free_data_blocks(&self) -> u64 {
        self.state.lock().free_list.len() as u64
    }

    fn total_data_blocks(&self) -> u64 {
        self.state.lock().total_blocks
    }

    fn resize_data_dev(&self, new_total_blocks: u64) -> Result<(), MetaError> {
        let mut st = self.state.lock();
        if new_total_blocks < st.total_blocks {
            return Err(MetaError::Invalid("data device cannot shrink".into()));
        }
        for block in st.total_blocks..new_total_blocks {
            st.free_list.push_back(block);
        }
        tracing::info!(from = st.total_blocks, to = new_total_blocks, "data device resized");
        st.total_blocks = new_total_blocks;
        Ok(())
    }

    fn free_metadata_blocks(&self) -> u64 {
        // The real B-tree's metadata usage tracks node churn; as a reference
        // implementation we approximate it as one block per open device
        // subtree, which is enough to make `pool_status` output move in the
        // right direction under test.
        let st = self.state.lock();
        self.metadata_total.saturating_sub(st.devices.len() as u64)
    }

    fn total_metadata_blocks(&self) -> u64 {
        self.metadata_total
    }

    fn transaction_id(&self) -> u64 {
        self.state.lock().transaction_id
    }

    fn set_transaction_id(&self, old: u64, new: u64) -> Result<(), MetaError> {
        let mut st = self.state.lock();
        if st.transaction_id != old {
            return Err(MetaError::Invalid(format!(
                "transaction id mismatch: expected {old}, found {}",
                st.transaction_id
            )));
        }
        st.transaction_id = new;
        Ok(())
    }

    fn held_metadata_root(&self) -> Option<u64> {
        self.state.lock().held_root
    }

    fn commit(&self) -> Result<(), MetaError> {
        let st = self.state.lock();
        tracing::debug!(transaction_id = st.transaction_id, "metadata committed");
        *self.committed.lock() = st.clone();
        Ok(())
    }
}
