//! Federation tunnel bindings (consumer side)

use rusqlite::{params, Connection, Row};

use crate::error::CoreResult;
use crate::model::{ChainType, FederationTunnelBinding, NewBinding};
use crate::now_ms;
use crate::store::port_column;

const BINDING_COLUMNS: &str = "id, tunnel_id, node_id, chain_type, hop_inx, remote_url, resource_key, \
    remote_binding_id, remote_reservation_id, allocated_port, status, created_time, updated_time";

fn binding_from_row(row: &Row<'_>) -> rusqlite::Result<FederationTunnelBinding> {
    let chain_type: i64 = row.get(3)?;
    Ok(FederationTunnelBinding {
        id: row.get(0)?,
        tunnel_id: row.get(1)?,
        node_id: row.get(2)?,
        chain_type: ChainType::from_i64(chain_type)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, chain_type))?,
        hop_inx: row.get(4)?,
        remote_url: row.get(5)?,
        resource_key: row.get(6)?,
        remote_binding_id: row.get(7)?,
        remote_reservation_id: row.get(8)?,
        allocated_port: port_column(row, 9)?,
        active: row.get::<_, i64>(10)? == 1,
        created_time: row.get(11)?,
        updated_time: row.get(12)?,
    })
}

pub fn insert_binding(conn: &Connection, new: &NewBinding) -> CoreResult<FederationTunnelBinding> {
    let now = now_ms();
    conn.execute(
        "INSERT INTO federation_tunnel_binding(tunnel_id, node_id, chain_type, hop_inx, remote_url, \
         resource_key, remote_binding_id, remote_reservation_id, allocated_port, status, created_time, updated_time) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
        params![
            new.tunnel_id,
            new.node_id,
            new.chain_type.as_i64(),
            new.hop_inx,
            new.remote_url,
            new.resource_key,
            new.remote_binding_id,
            new.remote_reservation_id,
            new.allocated_port,
            now,
        ],
    )?;

    Ok(conn.query_row(
        &format!("SELECT {} FROM federation_tunnel_binding WHERE id = ?1", BINDING_COLUMNS),
        [conn.last_insert_rowid()],
        binding_from_row,
    )?)
}

/// Active bindings of a tunnel in chain order
pub fn list_active_bindings(conn: &Connection, tunnel_id: i64) -> CoreResult<Vec<FederationTunnelBinding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM federation_tunnel_binding WHERE tunnel_id = ?1 AND status = 1 \
         ORDER BY chain_type ASC, hop_inx ASC, id ASC",
        BINDING_COLUMNS
    ))?;
    let rows = stmt.query_map([tunnel_id], binding_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Active bindings that lease capacity through a node
pub fn list_active_bindings_for_node(conn: &Connection, node_id: i64) -> CoreResult<Vec<FederationTunnelBinding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM federation_tunnel_binding WHERE node_id = ?1 AND status = 1 ORDER BY id ASC",
        BINDING_COLUMNS
    ))?;
    let rows = stmt.query_map([node_id], binding_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Every binding of a tunnel regardless of status
pub fn list_bindings(conn: &Connection, tunnel_id: i64) -> CoreResult<Vec<FederationTunnelBinding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM federation_tunnel_binding WHERE tunnel_id = ?1 ORDER BY id ASC",
        BINDING_COLUMNS
    ))?;
    let rows = stmt.query_map([tunnel_id], binding_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_bindings(conn: &Connection, tunnel_id: i64) -> CoreResult<usize> {
    Ok(conn.execute(
        "DELETE FROM federation_tunnel_binding WHERE tunnel_id = ?1",
        [tunnel_id],
    )?)
}
