//! Port allocator
//!
//! Picks a free port on a node from its configured range. The used set is the
//! union of hop ports and forward ports committed for that node, plus ports
//! already claimed earlier in the same operation. Call inside the transaction
//! that writes the rows, so the check and the insert are atomic.

use std::collections::{BTreeSet, HashMap, HashSet};

use rusqlite::{params, Connection};
use tracing::debug;

use crate::address::parse_port_range;
use crate::error::{CoreError, CoreResult};
use crate::store::nodes::get_node;
use crate::store::port_column;

/// Ports claimed per node during one multi-hop operation
#[derive(Debug, Clone, Default)]
pub struct InFlightPorts {
    claimed: HashMap<i64, BTreeSet<u16>>,
}

impl InFlightPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a port; returns `false` if it was already claimed
    pub fn claim(&mut self, node_id: i64, port: u16) -> bool {
        self.claimed.entry(node_id).or_default().insert(port)
    }

    pub fn is_claimed(&self, node_id: i64, port: u16) -> bool {
        self.claimed
            .get(&node_id)
            .map(|ports| ports.contains(&port))
            .unwrap_or(false)
    }

    /// Ports claimed for a node, ascending
    pub fn ports_for(&self, node_id: i64) -> Vec<u16> {
        self.claimed
            .get(&node_id)
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Ports committed to a node by hops (optionally ignoring one tunnel) and forwards
pub fn used_node_ports(
    conn: &Connection,
    node_id: i64,
    exclude_tunnel_id: Option<i64>,
) -> CoreResult<HashSet<u16>> {
    let mut used = HashSet::new();

    let mut stmt = conn.prepare(
        "SELECT port FROM chain_tunnel \
         WHERE node_id = ?1 AND port > 0 AND (?2 IS NULL OR tunnel_id != ?2)",
    )?;
    for port in stmt.query_map(params![node_id, exclude_tunnel_id], |row| port_column(row, 0))? {
        used.insert(port?);
    }

    let mut stmt = conn.prepare("SELECT port FROM forward_port WHERE node_id = ?1 AND port > 0")?;
    for port in stmt.query_map([node_id], |row| port_column(row, 0))? {
        used.insert(port?);
    }

    Ok(used)
}

/// Pick the lowest free port of a node and claim it in `in_flight`
pub fn pick_node_port(
    conn: &Connection,
    node_id: i64,
    in_flight: &mut InFlightPorts,
    exclude_tunnel_id: Option<i64>,
) -> CoreResult<u16> {
    let node = get_node(conn, node_id)?;
    let candidates = parse_port_range(&node.port);
    if candidates.is_empty() {
        return Err(CoreError::PortExhausted { node_id });
    }

    let used = used_node_ports(conn, node_id, exclude_tunnel_id)?;
    let port = candidates
        .into_iter()
        .find(|p| !used.contains(p) && !in_flight.is_claimed(node_id, *p))
        .ok_or(CoreError::PortExhausted { node_id })?;

    in_flight.claim(node_id, port);
    debug!("Picked port {} on node {}", port, node_id);
    Ok(port)
}

/// Claim a specific port on a node; it must be in range and free
pub fn claim_node_port(
    conn: &Connection,
    node_id: i64,
    port: u16,
    in_flight: &mut InFlightPorts,
    exclude_tunnel_id: Option<i64>,
) -> CoreResult<u16> {
    let node = get_node(conn, node_id)?;
    if !parse_port_range(&node.port).contains(&port) {
        return Err(CoreError::InvalidInput(format!(
            "port {} is outside the range of node {}",
            port, node.name
        )));
    }

    let used = used_node_ports(conn, node_id, exclude_tunnel_id)?;
    if used.contains(&port) || in_flight.is_claimed(node_id, port) {
        return Err(CoreError::Conflict(format!(
            "port {} is already in use on node {}",
            port, node.name
        )));
    }

    in_flight.claim(node_id, port);
    Ok(port)
}
