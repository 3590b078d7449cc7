//! Node rows

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::model::{NewNode, Node, NodeCapabilities};
use crate::now_ms;

const NODE_COLUMNS: &str = "id, name, secret, server_ip, server_ip_v4, server_ip_v6, port, \
    tcp_listen_addr, udp_listen_addr, interface_name, version, http, tls, socks, status, \
    is_remote, remote_url, remote_token, remote_config, created_time";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        secret: row.get(2)?,
        server_ip: row.get(3)?,
        server_ip_v4: row.get(4)?,
        server_ip_v6: row.get(5)?,
        port: row.get(6)?,
        tcp_listen_addr: row.get(7)?,
        udp_listen_addr: row.get(8)?,
        interface_name: row.get(9)?,
        version: row.get(10)?,
        http: row.get(11)?,
        tls: row.get(12)?,
        socks: row.get(13)?,
        status: row.get(14)?,
        is_remote: row.get(15)?,
        remote_url: row.get(16)?,
        remote_token: row.get(17)?,
        remote_config: row.get(18)?,
        created_time: row.get(19)?,
    })
}

/// Insert a node; an empty secret is replaced by a generated one
pub fn insert_node(conn: &Connection, new: &NewNode) -> CoreResult<Node> {
    if new.name.trim().is_empty() {
        return Err(CoreError::InvalidInput("node name is empty".into()));
    }
    if new.is_remote && (new.remote_url.is_none() || new.remote_token.is_none()) {
        return Err(CoreError::InvalidInput("remote node needs url and token".into()));
    }

    let secret = if new.secret.trim().is_empty() {
        meshpanel_crypto::generate_node_secret()
    } else {
        new.secret.trim().to_string()
    };

    conn.execute(
        "INSERT INTO node(name, secret, server_ip, server_ip_v4, server_ip_v6, port, interface_name, \
         is_remote, remote_url, remote_token, remote_config, created_time) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            new.name.trim(),
            secret,
            new.server_ip.trim(),
            new.server_ip_v4,
            new.server_ip_v6,
            new.port.trim(),
            new.interface_name,
            new.is_remote,
            new.remote_url,
            new.remote_token,
            new.remote_config,
            now_ms(),
        ],
    )?;

    get_node(conn, conn.last_insert_rowid())
}

/// Load a node, `NotFound` when missing
pub fn get_node(conn: &Connection, node_id: i64) -> CoreResult<Node> {
    find_node(conn, node_id)?.ok_or_else(|| CoreError::not_found(format!("node {}", node_id)))
}

pub fn find_node(conn: &Connection, node_id: i64) -> CoreResult<Option<Node>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM node WHERE id = ?1", NODE_COLUMNS),
            [node_id],
            node_from_row,
        )
        .optional()?)
}

/// Resolve the node a control channel secret belongs to
pub fn find_node_by_secret(conn: &Connection, secret: &str) -> CoreResult<Option<Node>> {
    if secret.is_empty() {
        return Ok(None);
    }
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM node WHERE secret = ?1", NODE_COLUMNS),
            [secret],
            node_from_row,
        )
        .optional()?)
}

pub fn list_nodes(conn: &Connection) -> CoreResult<Vec<Node>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM node ORDER BY id", NODE_COLUMNS))?;
    let rows = stmt.query_map([], node_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Load several nodes at once; any missing id is `NotFound`
pub fn get_nodes(conn: &Connection, ids: &[i64]) -> CoreResult<HashMap<i64, Node>> {
    let mut out = HashMap::with_capacity(ids.len());
    for &id in ids {
        if !out.contains_key(&id) {
            out.insert(id, get_node(conn, id)?);
        }
    }
    Ok(out)
}

/// Mark a node online and record what it declared on connect
pub fn mark_node_online(conn: &Connection, node_id: i64, caps: &NodeCapabilities) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE node SET status = 1, version = COALESCE(?2, version), http = ?3, tls = ?4, socks = ?5 \
         WHERE id = ?1",
        params![node_id, caps.version, caps.http, caps.tls, caps.socks],
    )?;
    if changed == 0 {
        return Err(CoreError::not_found(format!("node {}", node_id)));
    }
    info!("Node {} online (version {:?})", node_id, caps.version);
    Ok(())
}

pub fn mark_node_offline(conn: &Connection, node_id: i64) -> CoreResult<()> {
    conn.execute("UPDATE node SET status = 0 WHERE id = ?1", [node_id])?;
    info!("Node {} offline", node_id);
    Ok(())
}

/// Mark every local node offline; returns how many were online
pub fn mark_all_offline(conn: &Connection) -> CoreResult<usize> {
    Ok(conn.execute("UPDATE node SET status = 0 WHERE status = 1 AND is_remote = 0", [])?)
}

/// Delete a node with every hop, port and binding row that references it
pub fn delete_node_cascade(conn: &Connection, node_id: i64) -> CoreResult<()> {
    get_node(conn, node_id)?;

    conn.execute("DELETE FROM forward_port WHERE node_id = ?1", [node_id])?;
    conn.execute("DELETE FROM chain_tunnel WHERE node_id = ?1", [node_id])?;
    conn.execute("DELETE FROM federation_tunnel_binding WHERE node_id = ?1", [node_id])?;
    conn.execute("DELETE FROM node WHERE id = ?1", [node_id])?;

    info!("Deleted node {}", node_id);
    Ok(())
}
