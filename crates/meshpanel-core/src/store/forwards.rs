//! Forwards and their entry ports

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::address::parse_target_list;
use crate::error::{CoreError, CoreResult};
use crate::model::{non_empty_or, ChainType, Forward, ForwardPort, NewForward};
use crate::now_ms;
use crate::store::port_column;
use crate::store::ports::{claim_node_port, pick_node_port, InFlightPorts};
use crate::store::topology::{get_tunnel, list_chain_hops};

const FORWARD_COLUMNS: &str =
    "id, user_id, name, tunnel_id, remote_addr, strategy, in_flow, out_flow, status, created_time";

fn forward_from_row(row: &Row<'_>) -> rusqlite::Result<Forward> {
    Ok(Forward {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        tunnel_id: row.get(3)?,
        remote_addr: row.get(4)?,
        strategy: row.get(5)?,
        in_flow: row.get(6)?,
        out_flow: row.get(7)?,
        status: row.get(8)?,
        created_time: row.get(9)?,
    })
}

/// Create a forward with one entry port per entry node of its tunnel
pub fn create_forward(conn: &Connection, new: &NewForward) -> CoreResult<(Forward, Vec<ForwardPort>)> {
    if new.name.trim().is_empty() {
        return Err(CoreError::InvalidInput("forward name is empty".into()));
    }
    if parse_target_list(&new.remote_addr).is_empty() {
        return Err(CoreError::InvalidInput(format!(
            "no valid target in {:?}",
            new.remote_addr
        )));
    }

    get_tunnel(conn, new.tunnel_id)?;
    let entry: Vec<i64> = list_chain_hops(conn, new.tunnel_id)?
        .into_iter()
        .filter(|hop| hop.chain_type == ChainType::Entry)
        .map(|hop| hop.node_id)
        .collect();
    if entry.is_empty() {
        return Err(CoreError::InvalidInput(format!(
            "tunnel {} has no entry nodes",
            new.tunnel_id
        )));
    }

    conn.execute(
        "INSERT INTO forward(user_id, name, tunnel_id, remote_addr, strategy, status, created_time) \
         VALUES(?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![
            new.user_id,
            new.name.trim(),
            new.tunnel_id,
            new.remote_addr.trim(),
            non_empty_or(new.strategy.as_deref(), "fifo"),
            now_ms(),
        ],
    )?;
    let forward_id = conn.last_insert_rowid();

    let mut in_flight = InFlightPorts::new();
    let mut ports = Vec::with_capacity(entry.len());
    for node_id in entry {
        let port = match new.in_port {
            Some(port) => claim_node_port(conn, node_id, port, &mut in_flight, None)?,
            None => pick_node_port(conn, node_id, &mut in_flight, None)?,
        };
        conn.execute(
            "INSERT INTO forward_port(forward_id, node_id, port) VALUES(?1, ?2, ?3)",
            params![forward_id, node_id, port],
        )?;
        ports.push(ForwardPort {
            id: conn.last_insert_rowid(),
            forward_id,
            node_id,
            port,
        });
    }

    info!("Created forward {} on tunnel {}", forward_id, new.tunnel_id);
    Ok((get_forward(conn, forward_id)?, ports))
}

pub fn get_forward(conn: &Connection, forward_id: i64) -> CoreResult<Forward> {
    conn.query_row(
        &format!("SELECT {} FROM forward WHERE id = ?1", FORWARD_COLUMNS),
        [forward_id],
        forward_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found(format!("forward {}", forward_id)))
}

pub fn list_forward_ports(conn: &Connection, forward_id: i64) -> CoreResult<Vec<ForwardPort>> {
    let mut stmt = conn.prepare(
        "SELECT id, forward_id, node_id, port FROM forward_port WHERE forward_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([forward_id], |row| {
        Ok(ForwardPort {
            id: row.get(0)?,
            forward_id: row.get(1)?,
            node_id: row.get(2)?,
            port: port_column(row, 3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_forwards_for_tunnel(conn: &Connection, tunnel_id: i64) -> CoreResult<Vec<Forward>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM forward WHERE tunnel_id = ?1 ORDER BY id",
        FORWARD_COLUMNS
    ))?;
    let rows = stmt.query_map([tunnel_id], forward_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Delete a forward, ports first
pub fn delete_forward(conn: &Connection, forward_id: i64) -> CoreResult<()> {
    get_forward(conn, forward_id)?;
    conn.execute("DELETE FROM forward_port WHERE forward_id = ?1", [forward_id])?;
    conn.execute("DELETE FROM forward WHERE id = ?1", [forward_id])?;
    info!("Deleted forward {}", forward_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HopSpec, TopologySpec, TunnelType};
    use crate::store::testutil::*;
    use crate::store::topology::replace_topology;
    use std::collections::HashMap;

    fn make_forward(tunnel_id: i64, in_port: Option<u16>) -> NewForward {
        NewForward {
            name: "web".into(),
            tunnel_id,
            remote_addr: "10.0.0.5:80, bad".into(),
            in_port,
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_ports_per_entry_node() {
        let store = make_store();
        store
            .write(|tx| {
                let a = make_node(tx, "a", "200-201");
                let b = make_node(tx, "b", "200-201");
                let tunnel = make_tunnel(tx, "pf", TunnelType::PortForward);
                let slots = TopologySpec {
                    entry: vec![HopSpec::node(a.id), HopSpec::node(b.id)],
                    ..Default::default()
                }
                .slots(TunnelType::PortForward)?;
                replace_topology(tx, tunnel.id, &slots, &HashMap::new(), &HashMap::new())?;

                let (forward, ports) = create_forward(tx, &make_forward(tunnel.id, None))?;
                assert_eq!(forward.strategy, "fifo");
                assert_eq!(ports.iter().map(|p| p.port).collect::<Vec<_>>(), vec![200, 200]);

                let (_, second) = create_forward(tx, &make_forward(tunnel.id, None))?;
                assert!(second.iter().all(|p| p.port == 201));

                assert!(matches!(
                    create_forward(tx, &make_forward(tunnel.id, None)),
                    Err(CoreError::PortExhausted { .. })
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_requested_port_and_delete() {
        let store = make_store();
        store
            .write(|tx| {
                let a = make_node(tx, "a", "200-205");
                let tunnel = make_tunnel(tx, "pf", TunnelType::PortForward);
                let slots = TopologySpec {
                    entry: vec![HopSpec::node(a.id)],
                    ..Default::default()
                }
                .slots(TunnelType::PortForward)?;
                replace_topology(tx, tunnel.id, &slots, &HashMap::new(), &HashMap::new())?;

                let (forward, ports) = create_forward(tx, &make_forward(tunnel.id, Some(204)))?;
                assert_eq!(ports[0].port, 204);
                assert!(create_forward(tx, &make_forward(tunnel.id, Some(204))).is_err());

                delete_forward(tx, forward.id)?;
                assert!(list_forward_ports(tx, forward.id)?.is_empty());
                assert!(matches!(get_forward(tx, forward.id), Err(CoreError::NotFound(_))));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_rejects_targetless_forward() {
        let store = make_store();
        let result = store.write(|tx| {
            let tunnel = make_tunnel(tx, "pf", TunnelType::PortForward);
            create_forward(
                tx,
                &NewForward {
                    name: "x".into(),
                    tunnel_id: tunnel.id,
                    remote_addr: "nonsense".into(),
                    ..Default::default()
                },
            )
        });
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }
}
