//! StateStore — redb-backed state persistence for Gantry.
//!
//! Provides typed CRUD operations over devices, vips, load balancers,
//! backend nodes, monitors and bookkeeping rows. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Multi-row picks (`pick_spare_device`, `assign_vip`) and the task-lease
//! conditional update run inside a single write transaction; redb
//! serializes writers, which gives them select-for-update semantics.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing and the
    /// standalone daemon's scratch mode).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.open_table(VIPS).map_err(map_err!(Table))?;
        txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
        txn.open_table(LB_NODES).map_err(map_err!(Table))?;
        txn.open_table(MONITORS).map_err(map_err!(Table))?;
        txn.open_table(POOL_LEASES).map_err(map_err!(Table))?;
        txn.open_table(TASK_LEASES).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.open_table(RATE_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(ALERTS).map_err(map_err!(Table))?;
        txn.open_table(BILLING).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Allocate a fresh row id from the shared counter.
    pub fn allocate_id(&self) -> StoreResult<u64> {
        self.increment_counter("next_id")
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device.
    pub fn put_device(&self, device: &Device) -> StoreResult<()> {
        let key = device.id.to_string();
        let value = serde_json::to_vec(device).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a device by id.
    pub fn get_device(&self, id: DeviceId) -> StoreResult<Option<Device>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        match table.get(id.to_string().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let device: Device =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(device))
            }
            None => Ok(None),
        }
    }

    /// Get a device by its worker name.
    pub fn get_device_by_name(&self, name: &str) -> StoreResult<Option<Device>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|d| d.name == name))
    }

    /// List all devices.
    pub fn list_devices(&self) -> StoreResult<Vec<Device>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let device: Device =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(device);
        }
        Ok(results)
    }

    /// List devices in a given status.
    pub fn list_devices_by_status(&self, status: DeviceStatus) -> StoreResult<Vec<Device>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .filter(|d| d.status == status)
            .collect())
    }

    /// Count devices in a given status.
    pub fn count_devices_by_status(&self, status: DeviceStatus) -> StoreResult<u32> {
        Ok(self.list_devices_by_status(status)?.len() as u32)
    }

    /// Delete a device row. Returns true if it existed.
    pub fn delete_device(&self, id: DeviceId) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            existed = table
                .remove(id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(device_id = id, existed, "device row removed");
        Ok(existed)
    }

    /// Atomically pick one spare device for a rebuild: Offline, zero failed
    /// pings, not attached to any live load balancer. The pick is marked
    /// Building before the transaction commits so concurrent rebuilds
    /// cannot grab the same device.
    pub fn pick_spare_device(&self, now: u64) -> StoreResult<Option<Device>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let picked;
        {
            let mut devices = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let lbs = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;

            // Device ids referenced by any live load balancer.
            let mut attached: Vec<DeviceId> = Vec::new();
            for entry in lbs.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let lb: LoadBalancer =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if lb.status.is_live() {
                    attached.extend(&lb.devices);
                }
            }

            let mut candidate: Option<Device> = None;
            for entry in devices.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let device: Device =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if device.status == DeviceStatus::Offline
                    && device.ping_count == 0
                    && !attached.contains(&device.id)
                {
                    candidate = Some(device);
                    break;
                }
            }

            picked = match candidate {
                Some(mut device) => {
                    device.status = DeviceStatus::Building;
                    device.updated_at = now;
                    let value = serde_json::to_vec(&device).map_err(map_err!(Serialize))?;
                    devices
                        .insert(device.id.to_string().as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(device)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(picked)
    }

    // ── Vips ───────────────────────────────────────────────────────

    /// Insert or update a vip.
    pub fn put_vip(&self, vip: &Vip) -> StoreResult<()> {
        let key = vip.id.to_string();
        let value = serde_json::to_vec(vip).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(VIPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a vip by id.
    pub fn get_vip(&self, id: VipId) -> StoreResult<Option<Vip>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VIPS).map_err(map_err!(Table))?;
        match table.get(id.to_string().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let vip: Vip =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(vip))
            }
            None => Ok(None),
        }
    }

    /// List all vips.
    pub fn list_vips(&self) -> StoreResult<Vec<Vip>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VIPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let vip: Vip =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(vip);
        }
        Ok(results)
    }

    /// Count vips available for assignment.
    pub fn count_unassigned_vips(&self) -> StoreResult<u32> {
        Ok(self
            .list_vips()?
            .iter()
            .filter(|v| v.binding == VipBinding::Unassigned)
            .count() as u32)
    }

    /// List vips in the poisoned state (pending cleanup only).
    pub fn list_poisoned_vips(&self) -> StoreResult<Vec<Vip>> {
        Ok(self
            .list_vips()?
            .into_iter()
            .filter(|v| v.binding == VipBinding::Poisoned)
            .collect())
    }

    /// Atomically bind one unassigned vip to a device. Poisoned vips are
    /// never candidates. Returns `None` when the pool is exhausted.
    pub fn assign_vip(&self, device_id: DeviceId) -> StoreResult<Option<Vip>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let assigned;
        {
            let mut table = txn.open_table(VIPS).map_err(map_err!(Table))?;
            let mut candidate: Option<Vip> = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let vip: Vip =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if vip.binding == VipBinding::Unassigned {
                    candidate = Some(vip);
                    break;
                }
            }
            assigned = match candidate {
                Some(mut vip) => {
                    vip.binding = VipBinding::Assigned { device: device_id };
                    let value = serde_json::to_vec(&vip).map_err(map_err!(Serialize))?;
                    table
                        .insert(vip.id.to_string().as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(vip)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(assigned)
    }

    /// Delete a vip row. Returns true if it existed.
    pub fn delete_vip(&self, id: VipId) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(VIPS).map_err(map_err!(Table))?;
            existed = table
                .remove(id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Load balancers ─────────────────────────────────────────────

    /// Insert or update a load balancer.
    pub fn put_load_balancer(&self, lb: &LoadBalancer) -> StoreResult<()> {
        let key = lb.id.to_string();
        let value = serde_json::to_vec(lb).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a load balancer by id.
    pub fn get_load_balancer(&self, id: LbId) -> StoreResult<Option<LoadBalancer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
        match table.get(id.to_string().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let lb: LoadBalancer =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lb))
            }
            None => Ok(None),
        }
    }

    /// List all load balancers.
    pub fn list_load_balancers(&self) -> StoreResult<Vec<LoadBalancer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let lb: LoadBalancer =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(lb);
        }
        Ok(results)
    }

    /// List live load balancers attached to a device.
    pub fn list_load_balancers_for_device(
        &self,
        device_id: DeviceId,
    ) -> StoreResult<Vec<LoadBalancer>> {
        Ok(self
            .list_load_balancers()?
            .into_iter()
            .filter(|lb| lb.status.is_live() && lb.devices.contains(&device_id))
            .collect())
    }

    /// Delete a load balancer row. Returns true if it existed.
    pub fn delete_load_balancer(&self, id: LbId) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
            existed = table
                .remove(id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Backend nodes ──────────────────────────────────────────────

    /// Insert or update a backend node.
    pub fn put_node(&self, node: &LbNode) -> StoreResult<()> {
        let key = node.table_key();
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LB_NODES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a backend node by composite key.
    pub fn get_node(&self, lb_id: LbId, node_id: NodeId) -> StoreResult<Option<LbNode>> {
        let key = node_key(lb_id, node_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LB_NODES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: LbNode =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all backend nodes for a load balancer.
    pub fn list_nodes_for_lb(&self, lb_id: LbId) -> StoreResult<Vec<LbNode>> {
        let prefix = format!("{lb_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LB_NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let node: LbNode =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(node);
            }
        }
        Ok(results)
    }

    /// Delete all backend nodes for a load balancer. Returns number deleted.
    pub fn delete_nodes_for_lb(&self, lb_id: LbId) -> StoreResult<u32> {
        let prefix = format!("{lb_id}:");
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(LB_NODES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(LB_NODES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Monitors ───────────────────────────────────────────────────

    /// Insert or update the health monitor for a load balancer.
    pub fn put_monitor(&self, monitor: &Monitor) -> StoreResult<()> {
        let key = monitor.lb_id.to_string();
        let value = serde_json::to_vec(monitor).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MONITORS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the health monitor for a load balancer.
    pub fn get_monitor(&self, lb_id: LbId) -> StoreResult<Option<Monitor>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MONITORS).map_err(map_err!(Table))?;
        match table
            .get(lb_id.to_string().as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                let monitor: Monitor =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(monitor))
            }
            None => Ok(None),
        }
    }

    /// Delete the health monitor for a load balancer.
    pub fn delete_monitor(&self, lb_id: LbId) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(MONITORS).map_err(map_err!(Table))?;
            existed = table
                .remove(lb_id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Pool leases ────────────────────────────────────────────────

    /// Record this replica's in-flight build lease.
    pub fn put_pool_lease(&self, lease: &PoolLease) -> StoreResult<()> {
        let key = lease.server_id.to_string();
        let value = serde_json::to_vec(lease).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POOL_LEASES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Drop a replica's build lease.
    pub fn delete_pool_lease(&self, server_id: u32) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(POOL_LEASES).map_err(map_err!(Table))?;
            existed = table
                .remove(server_id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Sum of in-flight build quantities across all replicas.
    pub fn total_leased_qty(&self) -> StoreResult<u32> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POOL_LEASES).map_err(map_err!(Table))?;
        let mut total = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let lease: PoolLease =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            total += lease.qty;
        }
        Ok(total)
    }

    // ── Task leases ────────────────────────────────────────────────

    /// Try to take ownership of a periodic task until `now + ttl_secs`.
    ///
    /// Succeeds if no lease exists, the existing lease has expired, or this
    /// owner already holds it (renewal). The conditional check and the
    /// insert share one write transaction.
    pub fn acquire_task_lease(
        &self,
        task: &str,
        owner: &str,
        ttl_secs: u64,
        now: u64,
    ) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(TASK_LEASES).map_err(map_err!(Table))?;
            let current: Option<TaskLease> = match table.get(task).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            let free = match &current {
                Some(lease) => lease.expires_at <= now || lease.owner == owner,
                None => true,
            };
            if free {
                let lease = TaskLease {
                    task: task.to_string(),
                    owner: owner.to_string(),
                    expires_at: now + ttl_secs,
                };
                let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                table
                    .insert(task, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            acquired = free;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acquired)
    }

    /// Release a task lease if this owner still holds it.
    pub fn release_task_lease(&self, task: &str, owner: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASK_LEASES).map_err(map_err!(Table))?;
            let held = match table.get(task).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lease: TaskLease = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    lease.owner == owner
                }
                None => false,
            };
            if held {
                table.remove(task).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Counters ───────────────────────────────────────────────────

    /// Increment a named counter and return the new value.
    pub fn increment_counter(&self, name: &str) -> StoreResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(name, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    /// Read a named counter (0 if never incremented).
    pub fn get_counter(&self, name: &str) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        Ok(table
            .get(name)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    // ── Rate-limit ledger ──────────────────────────────────────────

    /// Record one attempt of a rate-limited action.
    pub fn record_rate_event(&self, action: &str, at_millis: u64) -> StoreResult<()> {
        let seq = self.increment_counter("rate_event_seq")?;
        let key = format!("{action}:{at_millis:020}:{seq}");
        let event = RateEvent {
            action: action.to_string(),
            at_millis,
        };
        let value = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RATE_EVENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Count attempts of an action at or after `since_millis`.
    pub fn count_rate_events(&self, action: &str, since_millis: u64) -> StoreResult<u32> {
        let prefix = format!("{action}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RATE_EVENTS).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let event: RateEvent =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if event.at_millis >= since_millis {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Drop ledger entries older than `before_millis`. Returns number removed.
    pub fn prune_rate_events(&self, before_millis: u64) -> StoreResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(RATE_EVENTS).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let event: RateEvent =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if event.at_millis < before_millis {
                    stale.push(key.value().to_string());
                }
            }
            stale
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(RATE_EVENTS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Alerts / billing ───────────────────────────────────────────

    /// Persist an alert record (database alert driver).
    pub fn put_alert(&self, record: &AlertRecord) -> StoreResult<()> {
        let seq = self.increment_counter("alert_seq")?;
        let key = format!("{:020}:{seq}", record.at_millis);
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ALERTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List all persisted alerts.
    pub fn list_alerts(&self) -> StoreResult<Vec<AlertRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALERTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: AlertRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Persist a billing event.
    pub fn put_billing_event(&self, event: &BillingEvent) -> StoreResult<()> {
        let seq = self.increment_counter("billing_seq")?;
        let key = format!("{:020}:{seq}", event.at_millis);
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BILLING).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List all billing events.
    pub fn list_billing_events(&self) -> StoreResult<Vec<BillingEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BILLING).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: BillingEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_device(id: DeviceId, status: DeviceStatus) -> Device {
        Device {
            id,
            name: format!("lb-device-{id}"),
            floating_ip: None,
            az: "az-1".to_string(),
            kind: "standard".to_string(),
            status,
            ping_count: 0,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_lb(id: LbId, devices: Vec<DeviceId>) -> LoadBalancer {
        LoadBalancer {
            id,
            name: format!("lb-{id}"),
            algorithm: "ROUND_ROBIN".to_string(),
            port: 80,
            protocol: "HTTP".to_string(),
            status: LbStatus::Active,
            errmsg: None,
            tenant_id: "tenant-1".to_string(),
            devices,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_node(lb_id: LbId, id: NodeId) -> LbNode {
        LbNode {
            id,
            lb_id,
            address: "10.0.0.10".to_string(),
            port: 8080,
            weight: 1,
            backup: false,
            enabled: true,
            status: NodeStatus::Online,
        }
    }

    // ── Device CRUD ────────────────────────────────────────────────

    #[test]
    fn device_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let device = test_device(1, DeviceStatus::Offline);

        store.put_device(&device).unwrap();
        assert_eq!(store.get_device(1).unwrap(), Some(device));
    }

    #[test]
    fn device_lookup_by_name() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_device(&test_device(1, DeviceStatus::Online)).unwrap();

        let found = store.get_device_by_name("lb-device-1").unwrap();
        assert_eq!(found.unwrap().id, 1);
        assert!(store.get_device_by_name("nope").unwrap().is_none());
    }

    #[test]
    fn device_count_by_status() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_device(&test_device(1, DeviceStatus::Offline)).unwrap();
        store.put_device(&test_device(2, DeviceStatus::Offline)).unwrap();
        store.put_device(&test_device(3, DeviceStatus::Online)).unwrap();

        assert_eq!(store.count_devices_by_status(DeviceStatus::Offline).unwrap(), 2);
        assert_eq!(store.count_devices_by_status(DeviceStatus::Deleted).unwrap(), 0);
    }

    #[test]
    fn device_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_device(&test_device(1, DeviceStatus::Deleted)).unwrap();

        assert!(store.delete_device(1).unwrap());
        assert!(!store.delete_device(1).unwrap());
        assert!(store.get_device(1).unwrap().is_none());
    }

    // ── Spare pick ─────────────────────────────────────────────────

    #[test]
    fn pick_spare_skips_attached_and_failing_devices() {
        let store = StateStore::open_in_memory().unwrap();
        // Attached to an LB — not spare despite Offline status.
        store.put_device(&test_device(1, DeviceStatus::Offline)).unwrap();
        store.put_load_balancer(&test_lb(10, vec![1])).unwrap();
        // Failed pings — not spare.
        let mut flaky = test_device(2, DeviceStatus::Offline);
        flaky.ping_count = 2;
        store.put_device(&flaky).unwrap();
        // Genuine spare.
        store.put_device(&test_device(3, DeviceStatus::Offline)).unwrap();

        let picked = store.pick_spare_device(2000).unwrap().unwrap();
        assert_eq!(picked.id, 3);
        assert_eq!(picked.status, DeviceStatus::Building);
        // Persisted as Building so a second pick cannot grab it.
        assert!(store.pick_spare_device(2000).unwrap().is_none());
    }

    #[test]
    fn pick_spare_ignores_deleted_lb_attachments() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_device(&test_device(1, DeviceStatus::Offline)).unwrap();
        let mut lb = test_lb(10, vec![1]);
        lb.status = LbStatus::Deleted;
        store.put_load_balancer(&lb).unwrap();

        let picked = store.pick_spare_device(2000).unwrap();
        assert_eq!(picked.unwrap().id, 1);
    }

    // ── Vip CRUD / assignment ──────────────────────────────────────

    #[test]
    fn assign_vip_never_picks_poisoned() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_vip(&Vip { id: 1, ip: 1, binding: VipBinding::Poisoned })
            .unwrap();
        store
            .put_vip(&Vip { id: 2, ip: 2, binding: VipBinding::Assigned { device: 5 } })
            .unwrap();

        assert!(store.assign_vip(9).unwrap().is_none());

        store
            .put_vip(&Vip { id: 3, ip: 3, binding: VipBinding::Unassigned })
            .unwrap();
        let vip = store.assign_vip(9).unwrap().unwrap();
        assert_eq!(vip.id, 3);
        assert_eq!(vip.binding, VipBinding::Assigned { device: 9 });
    }

    #[test]
    fn unassigned_vip_counting() {
        let store = StateStore::open_in_memory().unwrap();
        for id in 1..=3 {
            store
                .put_vip(&Vip { id, ip: id as u32, binding: VipBinding::Unassigned })
                .unwrap();
        }
        store.assign_vip(1).unwrap();

        assert_eq!(store.count_unassigned_vips().unwrap(), 2);
        assert!(store.list_poisoned_vips().unwrap().is_empty());
    }

    // ── LB / node / monitor ────────────────────────────────────────

    #[test]
    fn lbs_for_device_excludes_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_load_balancer(&test_lb(1, vec![7])).unwrap();
        store.put_load_balancer(&test_lb(2, vec![7, 8])).unwrap();
        let mut gone = test_lb(3, vec![7]);
        gone.status = LbStatus::Deleted;
        store.put_load_balancer(&gone).unwrap();

        let on_seven = store.list_load_balancers_for_device(7).unwrap();
        assert_eq!(on_seven.len(), 2);
        let on_eight = store.list_load_balancers_for_device(8).unwrap();
        assert_eq!(on_eight.len(), 1);
    }

    #[test]
    fn nodes_prefix_scan_and_bulk_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node(1, 1)).unwrap();
        store.put_node(&test_node(1, 2)).unwrap();
        store.put_node(&test_node(2, 1)).unwrap();

        assert_eq!(store.list_nodes_for_lb(1).unwrap().len(), 2);
        assert_eq!(store.delete_nodes_for_lb(1).unwrap(), 2);
        assert!(store.list_nodes_for_lb(1).unwrap().is_empty());
        assert_eq!(store.list_nodes_for_lb(2).unwrap().len(), 1);
    }

    #[test]
    fn monitor_single_row_per_lb() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_monitor(&Monitor::default_for(1)).unwrap();
        let mut custom = Monitor::default_for(1);
        custom.kind = "HTTP".to_string();
        custom.path = Some("/health".to_string());
        store.put_monitor(&custom).unwrap();

        let monitor = store.get_monitor(1).unwrap().unwrap();
        assert_eq!(monitor.kind, "HTTP");
        assert!(store.delete_monitor(1).unwrap());
        assert!(store.get_monitor(1).unwrap().is_none());
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[test]
    fn pool_lease_totals() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_pool_lease(&PoolLease { server_id: 0, qty: 2, created_at: 1000 })
            .unwrap();
        store
            .put_pool_lease(&PoolLease { server_id: 1, qty: 3, created_at: 1000 })
            .unwrap();

        assert_eq!(store.total_leased_qty().unwrap(), 5);
        assert!(store.delete_pool_lease(0).unwrap());
        assert_eq!(store.total_leased_qty().unwrap(), 3);
    }

    #[test]
    fn task_lease_conditional_acquire() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.acquire_task_lease("delete_probe", "api-0", 60, 1000).unwrap());
        // Another owner cannot take an unexpired lease.
        assert!(!store.acquire_task_lease("delete_probe", "api-1", 60, 1030).unwrap());
        // The holder can renew.
        assert!(store.acquire_task_lease("delete_probe", "api-0", 60, 1030).unwrap());
        // Expiry frees it.
        assert!(store.acquire_task_lease("delete_probe", "api-1", 60, 1091).unwrap());
    }

    #[test]
    fn task_lease_release_only_by_holder() {
        let store = StateStore::open_in_memory().unwrap();
        store.acquire_task_lease("ping", "api-0", 60, 1000).unwrap();

        store.release_task_lease("ping", "api-1").unwrap();
        assert!(!store.acquire_task_lease("ping", "api-2", 60, 1010).unwrap());

        store.release_task_lease("ping", "api-0").unwrap();
        assert!(store.acquire_task_lease("ping", "api-2", 60, 1010).unwrap());
    }

    // ── Counters / rate events ─────────────────────────────────────

    #[test]
    fn counters_are_monotonic() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.get_counter("rebuilds").unwrap(), 0);
        assert_eq!(store.increment_counter("rebuilds").unwrap(), 1);
        assert_eq!(store.increment_counter("rebuilds").unwrap(), 2);
        assert_eq!(store.get_counter("rebuilds").unwrap(), 2);
    }

    #[test]
    fn allocated_ids_are_unique() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.allocate_id().unwrap();
        let b = store.allocate_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rate_events_window_count_and_prune() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_rate_event("delete_device", 1_000).unwrap();
        store.record_rate_event("delete_device", 2_000).unwrap();
        store.record_rate_event("delete_device", 3_000).unwrap();
        store.record_rate_event("build_device", 3_000).unwrap();

        assert_eq!(store.count_rate_events("delete_device", 2_000).unwrap(), 2);
        assert_eq!(store.count_rate_events("delete_device", 0).unwrap(), 3);

        assert_eq!(store.prune_rate_events(2_500).unwrap(), 3);
        assert_eq!(store.count_rate_events("delete_device", 0).unwrap(), 1);
    }

    // ── Alerts / billing ───────────────────────────────────────────

    #[test]
    fn alerts_persist_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..3u64 {
            store
                .put_alert(&AlertRecord {
                    at_millis: 1000 + i,
                    kind: "fail".to_string(),
                    device: Some(format!("lb-device-{i}")),
                    message: "device unreachable".to_string(),
                })
                .unwrap();
        }
        assert_eq!(store.list_alerts().unwrap().len(), 3);
    }

    #[test]
    fn billing_events_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_billing_event(&BillingEvent {
                at_millis: 1000,
                tenant_id: "tenant-1".to_string(),
                lb_id: 4,
                payload: "{\"usage\":1}".to_string(),
            })
            .unwrap();
        let events = store.list_billing_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].lb_id, 4);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_device(&test_device(1, DeviceStatus::Online)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let device = store.get_device(1).unwrap();
        assert_eq!(device.unwrap().status, DeviceStatus::Online);
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_devices().unwrap().is_empty());
        assert!(store.list_vips().unwrap().is_empty());
        assert!(store.list_load_balancers().unwrap().is_empty());
        assert!(store.list_load_balancers_for_device(1).unwrap().is_empty());
        assert_eq!(store.total_leased_qty().unwrap(), 0);
        assert!(store.pick_spare_device(1000).unwrap().is_none());
        assert!(store.assign_vip(1).unwrap().is_none());
        assert!(!store.delete_device(1).unwrap());
        assert!(!store.delete_vip(1).unwrap());
    }
}
