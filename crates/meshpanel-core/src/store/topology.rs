//! Topology store
//!
//! Tunnels and their hop rows. A tunnel's hop set is only ever replaced as a
//! whole: every existing row is deleted and the new set inserted in the same
//! transaction.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::address::build_in_ip;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    ChainHop, ChainType, HopSlot, IpPreference, NewTunnel, Topology, Tunnel, TunnelTopology,
    TunnelType,
};
use crate::now_ms;
use crate::store::nodes::get_nodes;
use crate::store::port_column;
use crate::store::ports::{pick_node_port, InFlightPorts};

fn tunnel_from_row(row: &Row<'_>) -> rusqlite::Result<Tunnel> {
    let tunnel_type: i64 = row.get(2)?;
    let preference: String = row.get(4)?;
    Ok(Tunnel {
        id: row.get(0)?,
        name: row.get(1)?,
        tunnel_type: TunnelType::from_i64(tunnel_type)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, tunnel_type))?,
        traffic_ratio: row.get(3)?,
        ip_preference: IpPreference::parse(&preference),
        in_ip: row.get(5)?,
        status: row.get(6)?,
        created_time: row.get(7)?,
    })
}

fn hop_from_row(row: &Row<'_>) -> rusqlite::Result<ChainHop> {
    let chain_type: i64 = row.get(2)?;
    Ok(ChainHop {
        id: row.get(0)?,
        tunnel_id: row.get(1)?,
        chain_type: ChainType::from_i64(chain_type)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, chain_type))?,
        inx: row.get(3)?,
        node_id: row.get(4)?,
        port: port_column(row, 5)?,
        protocol: row.get(6)?,
        strategy: row.get(7)?,
    })
}

pub fn insert_tunnel(conn: &Connection, new: &NewTunnel) -> CoreResult<Tunnel> {
    if new.name.trim().is_empty() {
        return Err(CoreError::InvalidInput("tunnel name is empty".into()));
    }
    if !(new.traffic_ratio > 0.0) {
        return Err(CoreError::InvalidInput("traffic ratio must be positive".into()));
    }

    conn.execute(
        "INSERT INTO tunnel(name, type, traffic_ratio, ip_preference, in_ip, status, created_time) \
         VALUES(?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![
            new.name.trim(),
            new.tunnel_type.as_i64(),
            new.traffic_ratio,
            new.ip_preference.as_str(),
            new.in_ip.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            now_ms(),
        ],
    )?;
    get_tunnel(conn, conn.last_insert_rowid())
}

pub fn get_tunnel(conn: &Connection, tunnel_id: i64) -> CoreResult<Tunnel> {
    conn.query_row(
        "SELECT id, name, type, traffic_ratio, ip_preference, in_ip, status, created_time \
         FROM tunnel WHERE id = ?1",
        [tunnel_id],
        tunnel_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found(format!("tunnel {}", tunnel_id)))
}

/// Update the descriptive fields of a tunnel (not its hops)
pub fn update_tunnel(conn: &Connection, tunnel_id: i64, new: &NewTunnel) -> CoreResult<Tunnel> {
    let current = get_tunnel(conn, tunnel_id)?;
    if current.tunnel_type != new.tunnel_type {
        return Err(CoreError::InvalidInput("tunnel type cannot change".into()));
    }
    conn.execute(
        "UPDATE tunnel SET name = ?2, traffic_ratio = ?3, ip_preference = ?4, in_ip = ?5 WHERE id = ?1",
        params![
            tunnel_id,
            new.name.trim(),
            new.traffic_ratio,
            new.ip_preference.as_str(),
            new.in_ip.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        ],
    )?;
    get_tunnel(conn, tunnel_id)
}

/// Hop rows of a tunnel ordered by chain type, hop index, insertion
pub fn list_chain_hops(conn: &Connection, tunnel_id: i64) -> CoreResult<Vec<ChainHop>> {
    let mut stmt = conn.prepare(
        "SELECT id, tunnel_id, chain_type, inx, node_id, port, protocol, strategy \
         FROM chain_tunnel WHERE tunnel_id = ?1 ORDER BY chain_type ASC, inx ASC, id ASC",
    )?;
    let rows = stmt.query_map([tunnel_id], hop_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Ports for each slot: entry slots get none, slots listed in `leased` take
/// the leased port, every other slot is picked from its node's range.
///
/// Read-only; used to plan local ports before remote leases are requested.
pub fn plan_ports(
    conn: &Connection,
    exclude_tunnel_id: Option<i64>,
    slots: &[HopSlot],
    leased: &HashMap<usize, u16>,
) -> CoreResult<Vec<u16>> {
    let mut in_flight = InFlightPorts::new();
    slots
        .iter()
        .enumerate()
        .map(|(i, slot)| {
            if slot.chain_type == ChainType::Entry {
                Ok(0)
            } else if let Some(&port) = leased.get(&i) {
                Ok(port)
            } else {
                pick_node_port(conn, slot.node_id, &mut in_flight, exclude_tunnel_id)
            }
        })
        .collect()
}

/// Replace a tunnel's hop rows.
///
/// Local relay and exit slots get a port from the allocator; slots in `leased`
/// use the port leased from the owning panel. Slots in `pinned` already had
/// their port handed to a remote relay, so the allocator must still offer that
/// port, otherwise `Conflict`.
pub fn replace_topology(
    conn: &Connection,
    tunnel_id: i64,
    slots: &[HopSlot],
    leased: &HashMap<usize, u16>,
    pinned: &HashMap<usize, u16>,
) -> CoreResult<Vec<ChainHop>> {
    get_tunnel(conn, tunnel_id)?;
    conn.execute("DELETE FROM chain_tunnel WHERE tunnel_id = ?1", [tunnel_id])?;

    let mut in_flight = InFlightPorts::new();
    let mut hops = Vec::with_capacity(slots.len());

    for (i, slot) in slots.iter().enumerate() {
        let port = if slot.chain_type == ChainType::Entry {
            0
        } else if let Some(&port) = leased.get(&i) {
            port
        } else {
            let port = pick_node_port(conn, slot.node_id, &mut in_flight, Some(tunnel_id))?;
            if let Some(planned) = pinned.get(&i) {
                if *planned != port {
                    return Err(CoreError::Conflict(format!(
                        "port {} planned for node {} was taken, allocator now offers {}",
                        planned, slot.node_id, port
                    )));
                }
            }
            port
        };

        conn.execute(
            "INSERT INTO chain_tunnel(tunnel_id, chain_type, inx, node_id, port, protocol, strategy) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tunnel_id,
                slot.chain_type.as_i64(),
                slot.inx,
                slot.node_id,
                port,
                slot.protocol,
                slot.strategy,
            ],
        )?;
        hops.push(ChainHop {
            id: conn.last_insert_rowid(),
            tunnel_id,
            chain_type: slot.chain_type,
            inx: slot.inx,
            node_id: slot.node_id,
            port,
            protocol: slot.protocol.clone(),
            strategy: slot.strategy.clone(),
        });
    }

    debug!("Tunnel {} topology replaced with {} hops", tunnel_id, hops.len());
    Ok(hops)
}

/// Tunnel with grouped hops and effective ingress addresses
pub fn list_topology(conn: &Connection, tunnel_id: i64) -> CoreResult<TunnelTopology> {
    let tunnel = get_tunnel(conn, tunnel_id)?;
    let topology = Topology::from_hops(list_chain_hops(conn, tunnel_id)?);

    let in_ip = match tunnel.in_ip.as_deref().map(str::trim) {
        Some(explicit) if !explicit.is_empty() => explicit.to_string(),
        _ => {
            let ids: Vec<i64> = topology.entry.iter().map(|h| h.node_id).collect();
            let nodes = get_nodes(conn, &ids)?;
            build_in_ip(ids.iter().filter_map(|id| nodes.get(id)))
        }
    };

    Ok(TunnelTopology {
        tunnel,
        topology,
        in_ip,
    })
}

/// Delete a tunnel and everything hanging off it, children first
pub fn delete_tunnel_cascade(conn: &Connection, tunnel_id: i64) -> CoreResult<()> {
    get_tunnel(conn, tunnel_id)?;

    conn.execute(
        "DELETE FROM forward_port WHERE forward_id IN (SELECT id FROM forward WHERE tunnel_id = ?1)",
        [tunnel_id],
    )?;
    conn.execute("DELETE FROM forward WHERE tunnel_id = ?1", [tunnel_id])?;
    conn.execute(
        "DELETE FROM group_permission_grant \
         WHERE user_tunnel_id IN (SELECT id FROM user_tunnel WHERE tunnel_id = ?1)",
        [tunnel_id],
    )?;
    conn.execute("DELETE FROM user_tunnel WHERE tunnel_id = ?1", [tunnel_id])?;
    conn.execute("DELETE FROM tunnel_group_tunnel WHERE tunnel_id = ?1", [tunnel_id])?;
    conn.execute("DELETE FROM chain_tunnel WHERE tunnel_id = ?1", [tunnel_id])?;
    conn.execute("DELETE FROM federation_tunnel_binding WHERE tunnel_id = ?1", [tunnel_id])?;
    conn.execute("DELETE FROM tunnel WHERE id = ?1", [tunnel_id])?;

    info!("Deleted tunnel {}", tunnel_id);
    Ok(())
}
