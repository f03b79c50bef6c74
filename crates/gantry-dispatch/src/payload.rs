//! UPDATE payload assembly.
//!
//! A device's UPDATE job carries every live load balancer attached to it,
//! each with its enabled nodes and health monitor. A load balancer with no
//! stored monitor gets the default created and persisted here, so the row
//! exists before the worker ever sees the configuration.

use gantry_jobs::protocol::{DeviceAction, DeviceJob, LbEntry, MonitorEntry, NodeEntry};
use gantry_store::*;
use tracing::debug;

use crate::error::DispatchResult;

/// Build the full UPDATE payload for a device.
pub fn build_update_payload(store: &StateStore, device: &Device) -> DispatchResult<DeviceJob> {
    build_update_payload_excluding(store, device, None)
}

/// Build an UPDATE payload leaving out one load balancer (the delete-while-
/// others-remain case).
pub fn build_update_payload_excluding(
    store: &StateStore,
    device: &Device,
    skip_lb: Option<LbId>,
) -> DispatchResult<DeviceJob> {
    let mut job = DeviceJob::new(DeviceAction::Update);
    for lb in store.list_load_balancers_for_device(device.id)? {
        if Some(lb.id) == skip_lb {
            continue;
        }
        job.load_balancers.push(lb_entry(store, &lb)?);
    }
    Ok(job)
}

/// One load balancer's slice of a device payload.
pub fn lb_entry(store: &StateStore, lb: &LoadBalancer) -> DispatchResult<LbEntry> {
    let nodes = store
        .list_nodes_for_lb(lb.id)?
        .into_iter()
        // Disabled nodes are left out of the payload entirely.
        .filter(|node| node.enabled)
        .map(|node| NodeEntry {
            id: node.id.to_string(),
            address: node.address,
            port: node.port,
            weight: node.weight,
            condition: "ENABLED".to_string(),
            backup: if node.backup { "TRUE" } else { "FALSE" }.to_string(),
        })
        .collect();

    let monitor = match store.get_monitor(lb.id)? {
        Some(m) => m,
        None => {
            // Lazily create the default monitor the first time it's needed.
            let m = Monitor::default_for(lb.id);
            store.put_monitor(&m)?;
            debug!(lb_id = lb.id, "default monitor created");
            m
        }
    };

    Ok(LbEntry {
        id: lb.id.to_string(),
        name: lb.name.clone(),
        protocol: lb.protocol.clone(),
        algorithm: lb.algorithm.clone(),
        port: lb.port,
        nodes,
        monitor: Some(MonitorEntry {
            kind: monitor.kind,
            delay: monitor.delay,
            timeout: monitor.timeout,
            attempts: monitor.attempts,
            path: monitor.path,
        }),
    })
}
