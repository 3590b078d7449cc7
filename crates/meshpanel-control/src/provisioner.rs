//! Tunnel provisioning
//!
//! A tunnel may route through nodes owned by other panels. Their hops are
//! leased over HTTP before the local transaction opens, so the transaction
//! never waits on the network:
//! 1. validate the hop set and plan local ports (read only)
//! 2. lease remote hops, exit first, so each remote relay is told where its
//!    next hop listens
//! 3. write hops and bindings in one transaction; a local port already handed
//!    to a remote relay must still be free, other local ports are re-picked
//!
//! Leases taken before a failure are released again, newest first. If such a
//! release fails the provider is left to reclaim the reservation.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meshpanel_core::address::select_dial_host;
use meshpanel_core::store::{federation, forwards, nodes, topology};
use meshpanel_core::{
    ChainType, CoreError, CoreResult, FederationTunnelBinding, Forward, ForwardPort, HopSlot, IpPreference,
    LeaseRole, LeaseTarget, NewBinding, NewForward, NewNode, NewTunnel, Node, RemoteNodeConfig, Store,
    TopologySpec, TunnelTopology,
};
use meshpanel_federation::{
    ApplyLeaseRequest, LeaseClient, ReleaseLeaseRequest, RemoteEndpoint, ShareConnector,
};

use crate::error::{ControlError, ControlResult};

/// A tunnel definition with its full hop set
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub tunnel: NewTunnel,
    pub topology: TopologySpec,
}

/// Validated hop set with its planned local ports
struct Plan {
    slots: Vec<HopSlot>,
    nodes: HashMap<i64, Node>,
    /// Per slot: 0 for entry and remote slots, else the planned local port
    ports: Vec<u16>,
}

impl Plan {
    fn node(&self, node_id: i64) -> ControlResult<&Node> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| ControlError::NotFound(format!("node {}", node_id)))
    }

    fn is_remote(&self, slot: usize) -> bool {
        self.nodes
            .get(&self.slots[slot].node_id)
            .map(|n| n.is_remote)
            .unwrap_or(false)
    }

    /// Remote slots in the order they must be leased: reverse chain order
    fn lease_order(&self) -> Vec<usize> {
        (0..self.slots.len()).rev().filter(|&i| self.is_remote(i)).collect()
    }

    /// Local slots whose planned port a remote relay was told to dial
    fn pinned_ports(&self, held: &[HeldLease]) -> HashMap<usize, u16> {
        held.iter()
            .filter(|l| self.slots[l.slot].chain_type.lease_role() == Some(LeaseRole::Middle))
            .flat_map(|l| self.next_group(l.slot))
            .filter(|&next| !self.is_remote(next))
            .map(|next| (next, self.ports[next]))
            .collect()
    }

    /// Slots of the group that follows the group of `slot`
    fn next_group(&self, slot: usize) -> Vec<usize> {
        let group = |i: usize| (self.slots[i].chain_type, self.slots[i].inx);
        let Some(first) = (slot + 1..self.slots.len()).find(|&j| group(j) != group(slot)) else {
            return Vec::new();
        };
        (first..self.slots.len())
            .take_while(|&j| group(j) == group(first))
            .collect()
    }
}

/// A remote lease held for one slot of the operation in progress
struct HeldLease {
    slot: usize,
    endpoint: RemoteEndpoint,
    reservation_id: String,
    binding_id: String,
    port: u16,
}

/// Creates, changes and removes tunnels, forwards and nodes
pub struct TunnelProvisioner {
    store: Store,
    leases: Arc<dyn LeaseClient>,
    connector: Arc<dyn ShareConnector>,
}

impl TunnelProvisioner {
    pub fn new(store: Store, leases: Arc<dyn LeaseClient>, connector: Arc<dyn ShareConnector>) -> Self {
        Self {
            store,
            leases,
            connector,
        }
    }

    /// Create a tunnel with its hop set
    pub async fn create_tunnel(&self, request: &TunnelRequest) -> ControlResult<TunnelTopology> {
        let plan = self.plan(request, None)?;
        let held = self.acquire(&plan, request.tunnel.ip_preference).await?;

        let written = self.store.write(|tx| {
            let tunnel = topology::insert_tunnel(tx, &request.tunnel)?;
            write_hops(tx, tunnel.id, &plan, &held)?;
            topology::list_topology(tx, tunnel.id)
        });

        match written {
            Ok(created) => {
                info!(
                    "Created tunnel {} ({}) with {} hops, {} leased",
                    created.tunnel.id,
                    created.tunnel.name,
                    plan.slots.len(),
                    held.len()
                );
                Ok(created)
            }
            Err(e) => {
                warn!("Tunnel {} not created: {}", request.tunnel.name, e);
                self.release_held(&held).await;
                Err(e.into())
            }
        }
    }

    /// Replace a tunnel's definition and hop set. Leases of the previous hop
    /// set are released once the new one is committed.
    pub async fn update_tunnel(&self, tunnel_id: i64, request: &TunnelRequest) -> ControlResult<TunnelTopology> {
        let previous = self.store.read(|conn| {
            topology::get_tunnel(conn, tunnel_id)?;
            federation::list_active_bindings(conn, tunnel_id)
        })?;

        let plan = self.plan(request, Some(tunnel_id))?;
        let held = self.acquire(&plan, request.tunnel.ip_preference).await?;

        let written = self.store.write(|tx| {
            topology::update_tunnel(tx, tunnel_id, &request.tunnel)?;
            federation::delete_bindings(tx, tunnel_id)?;
            write_hops(tx, tunnel_id, &plan, &held)?;
            topology::list_topology(tx, tunnel_id)
        });

        match written {
            Ok(updated) => {
                self.release_bindings(&previous).await;
                info!(
                    "Updated tunnel {} ({} hops, {} leased, {} previous leases released)",
                    tunnel_id,
                    plan.slots.len(),
                    held.len(),
                    previous.len()
                );
                Ok(updated)
            }
            Err(e) => {
                warn!("Tunnel {} not updated: {}", tunnel_id, e);
                self.release_held(&held).await;
                Err(e.into())
            }
        }
    }

    /// Delete a tunnel, releasing each remote lease it holds exactly once
    pub async fn delete_tunnel(&self, tunnel_id: i64) -> ControlResult<()> {
        let bindings = self.store.read(|conn| {
            topology::get_tunnel(conn, tunnel_id)?;
            federation::list_active_bindings(conn, tunnel_id)
        })?;

        self.release_bindings(&bindings).await;
        self.store
            .write(|tx| topology::delete_tunnel_cascade(tx, tunnel_id))?;
        info!("Deleted tunnel {} ({} leases released)", tunnel_id, bindings.len());
        Ok(())
    }

    /// Create a forward on a tunnel's entry nodes
    pub fn create_forward(&self, new: &NewForward) -> ControlResult<(Forward, Vec<ForwardPort>)> {
        Ok(self.store.write(|tx| forwards::create_forward(tx, new))?)
    }

    pub fn delete_forward(&self, forward_id: i64) -> ControlResult<()> {
        Ok(self
            .store
            .write(|tx| forwards::delete_forward(tx, forward_id))?)
    }

    /// Delete a node; leases held through it are released first
    pub async fn delete_node(&self, node_id: i64) -> ControlResult<()> {
        let bindings = self.store.read(|conn| {
            nodes::get_node(conn, node_id)?;
            federation::list_active_bindings_for_node(conn, node_id)
        })?;

        self.release_bindings(&bindings).await;
        self.store
            .write(|tx| nodes::delete_node_cascade(tx, node_id))?;
        Ok(())
    }

    /// Register a node leased from another panel's share
    pub async fn import_remote_node(&self, remote_url: &str, token: &str, name: Option<&str>) -> ControlResult<Node> {
        let url = remote_url.trim().trim_end_matches('/');
        let token = token.trim();
        if url.is_empty() || token.is_empty() {
            return Err(ControlError::InvalidInput(
                "Remote URL and Token are required".into(),
            ));
        }

        let info = self
            .connector
            .connect(&RemoteEndpoint::new(url, token))
            .await?;

        let port = if info.port_range_start > 0 && info.port_range_end >= info.port_range_start {
            format!("{}-{}", info.port_range_start, info.port_range_end)
        } else {
            "0".to_string()
        };
        let config = RemoteNodeConfig {
            share_id: info.share_id,
            share_name: info.share_name.clone(),
            remote_node_id: info.node_id,
            max_bandwidth: info.max_bandwidth,
            expiry_time: info.expiry_time,
            port_range_start: info.port_range_start,
            port_range_end: info.port_range_end,
        };
        let config = serde_json::to_string(&config)
            .map_err(|e| ControlError::MalformedMessage(e.to_string()))?;

        let new = NewNode {
            name: name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} (Remote)", info.node_name)),
            server_ip: info.server_ip.clone(),
            port,
            is_remote: true,
            remote_url: Some(url.to_string()),
            remote_token: Some(token.to_string()),
            remote_config: Some(config),
            ..Default::default()
        };

        let node = self.store.write(|tx| {
            let duplicate = nodes::list_nodes(tx)?.into_iter().find(|n| {
                n.remote_url.as_deref() == Some(url)
                    && n.remote_node_config().map(|c| c.share_id) == Some(info.share_id)
            });
            if let Some(existing) = duplicate {
                return Err(CoreError::Conflict(format!(
                    "share {} of {} is already imported as node {}",
                    info.share_id, url, existing.id
                )));
            }
            nodes::insert_node(tx, &new)
        })?;

        info!(
            "Imported remote node {} from share {} at {}",
            node.id, info.share_id, url
        );
        Ok(node)
    }

    fn plan(&self, request: &TunnelRequest, tunnel_id: Option<i64>) -> ControlResult<Plan> {
        let slots = request.topology.slots(request.tunnel.tunnel_type)?;
        let ids: Vec<i64> = slots.iter().map(|s| s.node_id).collect();

        Ok(self.store.read(|conn| {
            let nodes = nodes::get_nodes(conn, &ids)?;

            let mut remote = HashMap::new();
            for (i, slot) in slots.iter().enumerate() {
                let Some(node) = nodes.get(&slot.node_id).filter(|n| n.is_remote) else {
                    continue;
                };
                if slot.chain_type == ChainType::Entry {
                    return Err(CoreError::InvalidInput(format!(
                        "remote node {} cannot be an entry hop",
                        node.name
                    )));
                }
                if node.remote_credentials().is_none() {
                    return Err(CoreError::InvalidInput(format!(
                        "remote node {} has no panel URL or token",
                        node.name
                    )));
                }
                remote.insert(i, 0);
            }

            let ports = topology::plan_ports(conn, tunnel_id, &slots, &remote)?;
            Ok(Plan { slots, nodes, ports })
        })?)
    }

    /// Lease every remote slot; on failure release what was taken
    async fn acquire(&self, plan: &Plan, preference: IpPreference) -> ControlResult<Vec<HeldLease>> {
        let mut held = Vec::new();
        for slot in plan.lease_order() {
            match self.lease_slot(plan, slot, preference, &held).await {
                Ok(lease) => held.push(lease),
                Err(e) => {
                    warn!(
                        "Lease for node {} failed: {}",
                        plan.slots[slot].node_id, e
                    );
                    self.release_held(&held).await;
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    async fn lease_slot(
        &self,
        plan: &Plan,
        slot_index: usize,
        preference: IpPreference,
        held: &[HeldLease],
    ) -> ControlResult<HeldLease> {
        let slot = &plan.slots[slot_index];
        let node = plan.node(slot.node_id)?;
        let endpoint = RemoteEndpoint::for_node(node).ok_or_else(|| {
            ControlError::InvalidInput(format!("remote node {} has no panel URL or token", node.name))
        })?;
        let role = slot.chain_type.lease_role().ok_or_else(|| {
            ControlError::InvalidInput(format!("node {} cannot lease an entry hop", node.name))
        })?;

        let targets = match role {
            LeaseRole::Middle => plan
                .next_group(slot_index)
                .into_iter()
                .map(|next| -> ControlResult<LeaseTarget> {
                    let next_slot = &plan.slots[next];
                    let host = select_dial_host(node, plan.node(next_slot.node_id)?, preference)?;
                    let port = held
                        .iter()
                        .find(|l| l.slot == next)
                        .map(|l| l.port)
                        .unwrap_or(plan.ports[next]);
                    Ok(LeaseTarget {
                        host,
                        port,
                        protocol: next_slot.protocol.clone(),
                    })
                })
                .collect::<ControlResult<Vec<_>>>()?,
            LeaseRole::Exit => Vec::new(),
        };

        let request = ApplyLeaseRequest {
            reservation_id: Uuid::new_v4().to_string(),
            binding_id: Uuid::new_v4().to_string(),
            resource_key: slot.node_key(),
            role,
            protocol: slot.protocol.clone(),
            strategy: slot.strategy.clone(),
            requested_port: None,
            targets,
        };
        let response = self.leases.apply_lease(&endpoint, &request).await?;

        debug!(
            "Leased port {} on {} for {} ({})",
            response.allocated_port,
            endpoint.url,
            slot.node_key(),
            role.as_str()
        );
        Ok(HeldLease {
            slot: slot_index,
            endpoint,
            reservation_id: response.reservation_id,
            binding_id: response.binding_id,
            port: response.allocated_port,
        })
    }

    /// Compensate leases of a failed operation, newest first
    async fn release_held(&self, held: &[HeldLease]) {
        for lease in held.iter().rev() {
            let request = ReleaseLeaseRequest {
                binding_id: Some(lease.binding_id.clone()),
                reservation_id: Some(lease.reservation_id.clone()),
                resource_key: None,
            };
            if let Err(e) = self.leases.release_lease(&lease.endpoint, &request).await {
                warn!(
                    "Compensating release of {} at {} failed: {}",
                    lease.reservation_id, lease.endpoint.url, e
                );
            }
        }
    }

    /// Release committed bindings, one call each, best effort
    async fn release_bindings(&self, bindings: &[FederationTunnelBinding]) {
        for binding in bindings {
            let node = match self.store.read(|conn| nodes::find_node(conn, binding.node_id)) {
                Ok(node) => node,
                Err(e) => {
                    warn!("Cannot load node {} for release: {}", binding.node_id, e);
                    continue;
                }
            };
            let Some(endpoint) = node.as_ref().and_then(RemoteEndpoint::for_node) else {
                warn!(
                    "Binding {} has no reachable panel, reservation {} left to the provider",
                    binding.id, binding.remote_reservation_id
                );
                continue;
            };

            let request = ReleaseLeaseRequest {
                binding_id: Some(binding.remote_binding_id.clone()),
                reservation_id: Some(binding.remote_reservation_id.clone()),
                resource_key: None,
            };
            match self.leases.release_lease(&endpoint, &request).await {
                Ok(()) => debug!(
                    "Released {} at {} (tunnel {})",
                    binding.remote_reservation_id, endpoint.url, binding.tunnel_id
                ),
                Err(e) => warn!(
                    "Release of {} at {} failed: {}",
                    binding.remote_reservation_id, endpoint.url, e
                ),
            }
        }
    }
}

/// Write the planned hops and one binding per held lease
fn write_hops(conn: &Connection, tunnel_id: i64, plan: &Plan, held: &[HeldLease]) -> CoreResult<()> {
    let leased: HashMap<usize, u16> = held.iter().map(|l| (l.slot, l.port)).collect();
    topology::replace_topology(conn, tunnel_id, &plan.slots, &leased, &plan.pinned_ports(held))?;

    for lease in held {
        let slot = &plan.slots[lease.slot];
        federation::insert_binding(
            conn,
            &NewBinding {
                tunnel_id,
                node_id: slot.node_id,
                chain_type: slot.chain_type,
                hop_inx: slot.inx,
                remote_url: lease.endpoint.url.clone(),
                resource_key: slot.resource_key(tunnel_id),
                remote_binding_id: lease.binding_id.clone(),
                remote_reservation_id: lease.reservation_id.clone(),
                allocated_port: lease.port,
            },
        )?;
    }
    Ok(())
}
