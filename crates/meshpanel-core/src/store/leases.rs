//! Peer shares and their reservation ledger
//!
//! Provider side of federation. A share grants a token holder a port range on
//! one local node; every reservation taken against it is a runtime row. The
//! row moves `applied -> released` exactly once and is never deleted while the
//! share exists. Idempotency checks and inserts must share one transaction.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use meshpanel_crypto::generate_share_token;

use crate::error::{CoreError, CoreResult};
use crate::model::{LeaseApply, LeaseRole, NewPeerShare, PeerShare, PeerShareRuntime};
use crate::now_ms;
use crate::store::nodes::get_node;
use crate::store::port_column;
use crate::store::ports::used_node_ports;

const SHARE_COLUMNS: &str = "id, name, node_id, token, max_bandwidth, expiry_time, port_range_start, \
     port_range_end, current_flow, is_active, allowed_ips, created_time, updated_time";

const RUNTIME_COLUMNS: &str = "id, share_id, node_id, reservation_id, binding_id, resource_key, role, \
     protocol, strategy, port, targets, service_name, chain_name, applied, status, created_time, updated_time";

/// Message providers return when a share has no free port
pub const NO_AVAILABLE_PORT: &str = "No available port";

fn share_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerShare> {
    Ok(PeerShare {
        id: row.get(0)?,
        name: row.get(1)?,
        node_id: row.get(2)?,
        token: row.get(3)?,
        max_bandwidth: row.get(4)?,
        expiry_time: row.get(5)?,
        port_range_start: port_column(row, 6)?,
        port_range_end: port_column(row, 7)?,
        current_flow: row.get(8)?,
        is_active: row.get(9)?,
        allowed_ips: row.get(10)?,
        created_time: row.get(11)?,
        updated_time: row.get(12)?,
    })
}

fn runtime_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(PeerShareRuntime, String, String)> {
    let runtime = PeerShareRuntime {
        id: row.get(0)?,
        share_id: row.get(1)?,
        node_id: row.get(2)?,
        reservation_id: row.get(3)?,
        binding_id: row.get(4)?,
        resource_key: row.get(5)?,
        role: LeaseRole::Exit,
        protocol: row.get(7)?,
        strategy: row.get(8)?,
        port: port_column(row, 9)?,
        targets: Vec::new(),
        service_name: row.get(11)?,
        chain_name: row.get(12)?,
        applied: row.get(13)?,
        active: row.get::<_, i64>(14)? == 1,
        created_time: row.get(15)?,
        updated_time: row.get(16)?,
    };
    Ok((runtime, row.get(6)?, row.get(10)?))
}

/// Decode the text columns a row mapper cannot fail on cleanly
fn finish_runtime((mut runtime, role, targets): (PeerShareRuntime, String, String)) -> CoreResult<PeerShareRuntime> {
    runtime.role = LeaseRole::parse(&role)?;
    runtime.targets = serde_json::from_str(&targets)?;
    Ok(runtime)
}

fn query_runtimes(conn: &Connection, filter: &str, share_id: i64) -> CoreResult<Vec<PeerShareRuntime>> {
    let sql = format!(
        "SELECT {} FROM peer_share_runtime WHERE {} ORDER BY id",
        RUNTIME_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([share_id], runtime_from_row)?;
    rows.map(|row| finish_runtime(row?)).collect()
}

pub fn create_share(conn: &Connection, new: &NewPeerShare) -> CoreResult<PeerShare> {
    if new.name.trim().is_empty() {
        return Err(CoreError::InvalidInput("share name is required".into()));
    }
    if new.port_range_start == 0 || new.port_range_end < new.port_range_start {
        return Err(CoreError::InvalidInput(format!(
            "invalid share port range {}-{}",
            new.port_range_start, new.port_range_end
        )));
    }
    let node = get_node(conn, new.node_id)?;
    if node.is_remote {
        return Err(CoreError::InvalidInput(format!(
            "node {} is itself a remote node and cannot be shared",
            node.id
        )));
    }

    let now = now_ms();
    let token = generate_share_token();
    conn.execute(
        "INSERT INTO peer_share(name, node_id, token, max_bandwidth, expiry_time, port_range_start, \
         port_range_end, current_flow, is_active, allowed_ips, created_time, updated_time) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 1, ?8, ?9, ?9)",
        params![
            new.name.trim(),
            new.node_id,
            token,
            new.max_bandwidth,
            new.expiry_time,
            new.port_range_start,
            new.port_range_end,
            new.allowed_ips.trim(),
            now
        ],
    )?;

    let share = get_share(conn, conn.last_insert_rowid())?;
    info!(
        "Created peer share {} on node {} ports {}-{}",
        share.id, share.node_id, share.port_range_start, share.port_range_end
    );
    Ok(share)
}

pub fn get_share(conn: &Connection, share_id: i64) -> CoreResult<PeerShare> {
    let sql = format!("SELECT {} FROM peer_share WHERE id = ?1", SHARE_COLUMNS);
    conn.query_row(&sql, [share_id], share_from_row)
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("peer share {}", share_id)))
}

pub fn find_share_by_token(conn: &Connection, token: &str) -> CoreResult<Option<PeerShare>> {
    let token = token.trim();
    if token.is_empty() {
        return Ok(None);
    }
    let sql = format!("SELECT {} FROM peer_share WHERE token = ?1", SHARE_COLUMNS);
    Ok(conn.query_row(&sql, [token], share_from_row).optional()?)
}

pub fn list_shares(conn: &Connection) -> CoreResult<Vec<PeerShare>> {
    let sql = format!("SELECT {} FROM peer_share ORDER BY id", SHARE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], share_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_share_active(conn: &Connection, share_id: i64, active: bool) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE peer_share SET is_active = ?2, updated_time = ?3 WHERE id = ?1",
        params![share_id, active, now_ms()],
    )?;
    if changed == 0 {
        return Err(CoreError::not_found(format!("peer share {}", share_id)));
    }
    Ok(())
}

/// Account traffic against a share
pub fn add_share_flow(conn: &Connection, share_id: i64, bytes: i64) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE peer_share SET current_flow = current_flow + ?2, updated_time = ?3 WHERE id = ?1",
        params![share_id, bytes.max(0), now_ms()],
    )?;
    if changed == 0 {
        return Err(CoreError::not_found(format!("peer share {}", share_id)));
    }
    Ok(())
}

pub fn reset_share_flow(conn: &Connection, share_id: i64) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE peer_share SET current_flow = 0, updated_time = ?2 WHERE id = ?1",
        params![share_id, now_ms()],
    )?;
    if changed == 0 {
        return Err(CoreError::not_found(format!("peer share {}", share_id)));
    }
    Ok(())
}

/// Share whose reservation runs under `service_name` on the node. Released
/// reservations still match, a late report counts against the share.
pub fn find_share_by_service(conn: &Connection, node_id: i64, service_name: &str) -> CoreResult<Option<i64>> {
    if service_name.trim().is_empty() {
        return Ok(None);
    }
    Ok(conn
        .query_row(
            "SELECT share_id FROM peer_share_runtime WHERE node_id = ?1 AND service_name = ?2 \
             ORDER BY status DESC, id DESC LIMIT 1",
            params![node_id, service_name],
            |row| row.get(0),
        )
        .optional()?)
}

/// Delete a share and its ledger. Callers release active runtimes first.
pub fn delete_share(conn: &Connection, share_id: i64) -> CoreResult<()> {
    conn.execute("DELETE FROM peer_share_runtime WHERE share_id = ?1", [share_id])?;
    let removed = conn.execute("DELETE FROM peer_share WHERE id = ?1", [share_id])?;
    if removed == 0 {
        return Err(CoreError::not_found(format!("peer share {}", share_id)));
    }
    info!("Deleted peer share {}", share_id);
    Ok(())
}

/// Reject a share that cannot take new work
pub fn ensure_share_usable(share: &PeerShare, now: i64) -> CoreResult<()> {
    if !share.is_active {
        return Err(CoreError::Forbidden("Share is disabled".into()));
    }
    if share.is_expired(now) {
        return Err(CoreError::Forbidden("Share expired".into()));
    }
    if share.is_flow_exceeded() {
        return Err(CoreError::Forbidden("Share traffic exceeded".into()));
    }
    Ok(())
}

/// Resolve a bearer token to a usable share
pub fn authorize_share(
    conn: &Connection,
    token: &str,
    caller_ip: Option<std::net::IpAddr>,
    now: i64,
) -> CoreResult<PeerShare> {
    let share = find_share_by_token(conn, token)?.ok_or(CoreError::Unauthorized)?;
    ensure_share_usable(&share, now)?;
    if !share.allows_ip(caller_ip) {
        return Err(CoreError::Forbidden("IP not allowed".into()));
    }
    Ok(share)
}

/// Pick a port in the share range not used on its node nor held by another
/// active reservation. A requested port must be in range and free.
pub fn pick_share_port(conn: &Connection, share: &PeerShare, requested: Option<u16>) -> CoreResult<u16> {
    let mut used: HashSet<u16> = used_node_ports(conn, share.node_id, None)?;
    let mut stmt = conn.prepare("SELECT port FROM peer_share_runtime WHERE node_id = ?1 AND status = 1")?;
    let rows = stmt.query_map([share.node_id], |row| port_column(row, 0))?;
    for port in rows {
        used.insert(port?);
    }

    let range = share.port_range_start..=share.port_range_end;
    if let Some(port) = requested.filter(|p| *p > 0) {
        if !range.contains(&port) {
            return Err(CoreError::Forbidden("Port out of range".into()));
        }
        if used.contains(&port) {
            return Err(CoreError::CapacityExhausted(NO_AVAILABLE_PORT.into()));
        }
        return Ok(port);
    }

    range
        .into_iter()
        .find(|p| *p > 0 && !used.contains(p))
        .ok_or_else(|| CoreError::CapacityExhausted(NO_AVAILABLE_PORT.into()))
}

pub fn find_active_runtime(conn: &Connection, share_id: i64, reservation_id: &str) -> CoreResult<Option<PeerShareRuntime>> {
    let sql = format!(
        "SELECT {} FROM peer_share_runtime WHERE share_id = ?1 AND reservation_id = ?2 AND status = 1",
        RUNTIME_COLUMNS
    );
    conn.query_row(&sql, params![share_id, reservation_id], runtime_from_row)
        .optional()?
        .map(finish_runtime)
        .transpose()
}

/// Record a reservation, or return the active one already recorded under the
/// same reservation id. The flag is `true` when a row was created.
pub fn apply_reservation(
    conn: &Connection,
    share: &PeerShare,
    request: &LeaseApply,
    now: i64,
) -> CoreResult<(PeerShareRuntime, bool)> {
    let reservation_id = request.reservation_id.trim();
    if reservation_id.is_empty() || request.binding_id.trim().is_empty() {
        return Err(CoreError::InvalidInput("reservationId and bindingId are required".into()));
    }
    if request.role == LeaseRole::Middle && request.targets.is_empty() {
        return Err(CoreError::InvalidInput("middle role requires targets".into()));
    }

    if let Some(existing) = find_active_runtime(conn, share.id, reservation_id)? {
        debug!(
            "Reservation {} already applied on share {} port {}",
            reservation_id, share.id, existing.port
        );
        return Ok((existing, false));
    }

    ensure_share_usable(share, now)?;
    let port = pick_share_port(conn, share, request.requested_port)?;

    conn.execute(
        "INSERT INTO peer_share_runtime(share_id, node_id, reservation_id, binding_id, resource_key, role, \
         protocol, strategy, port, targets, applied, status, created_time, updated_time) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, 1, ?11, ?11)",
        params![
            share.id,
            share.node_id,
            reservation_id,
            request.binding_id.trim(),
            request.resource_key,
            request.role.as_str(),
            request.protocol,
            request.strategy,
            port,
            serde_json::to_string(&request.targets)?,
            now
        ],
    )?;

    let id = conn.last_insert_rowid();
    let sql = format!("SELECT {} FROM peer_share_runtime WHERE id = ?1", RUNTIME_COLUMNS);
    let runtime = finish_runtime(conn.query_row(&sql, [id], runtime_from_row)?)?;
    info!(
        "Applied reservation {} on share {} ({}) port {}",
        reservation_id,
        share.id,
        runtime.role.as_str(),
        port
    );
    Ok((runtime, true))
}

/// Locate a reservation to release: binding id, then reservation id, then
/// resource key. Active rows are preferred over released ones.
pub fn find_runtime_for_release(
    conn: &Connection,
    share_id: i64,
    binding_id: Option<&str>,
    reservation_id: Option<&str>,
    resource_key: Option<&str>,
) -> CoreResult<Option<PeerShareRuntime>> {
    let lookups = [
        ("binding_id", binding_id),
        ("reservation_id", reservation_id),
        ("resource_key", resource_key),
    ];

    for (column, value) in lookups {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        let sql = format!(
            "SELECT {} FROM peer_share_runtime WHERE share_id = ?1 AND {} = ?2 \
             ORDER BY status DESC, id DESC LIMIT 1",
            RUNTIME_COLUMNS, column
        );
        if let Some(row) = conn
            .query_row(&sql, params![share_id, value], runtime_from_row)
            .optional()?
        {
            return finish_runtime(row).map(Some);
        }
    }
    Ok(None)
}

/// Mark a reservation released, freeing its port. Returns `false` if it was
/// already released.
pub fn mark_runtime_released(conn: &Connection, runtime_id: i64) -> CoreResult<bool> {
    let changed = conn.execute(
        "UPDATE peer_share_runtime SET status = 0, applied = 0, updated_time = ?2 WHERE id = ?1 AND status = 1",
        params![runtime_id, now_ms()],
    )?;
    if changed > 0 {
        debug!("Released reservation row {}", runtime_id);
    }
    Ok(changed > 0)
}

/// Record the names the node registered the reservation's service under
pub fn set_runtime_service(conn: &Connection, runtime_id: i64, service_name: &str, chain_name: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE peer_share_runtime SET service_name = ?2, chain_name = ?3, updated_time = ?4 WHERE id = ?1",
        params![runtime_id, service_name, chain_name, now_ms()],
    )?;
    Ok(())
}

pub fn list_active_runtimes(conn: &Connection, share_id: i64) -> CoreResult<Vec<PeerShareRuntime>> {
    query_runtimes(conn, "share_id = ?1 AND status = 1", share_id)
}

pub fn list_runtimes(conn: &Connection, share_id: i64) -> CoreResult<Vec<PeerShareRuntime>> {
    query_runtimes(conn, "share_id = ?1", share_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LeaseTarget, NewNode};
    use crate::store::nodes::insert_node;
    use crate::store::testutil::*;

    fn make_share(conn: &Connection, start: u16, end: u16) -> PeerShare {
        let node = make_node(conn, "provider", "40000-40100");
        create_share(
            conn,
            &NewPeerShare {
                name: "lease".into(),
                node_id: node.id,
                port_range_start: start,
                port_range_end: end,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn make_apply(reservation_id: &str, role: LeaseRole) -> LeaseApply {
        LeaseApply {
            reservation_id: reservation_id.into(),
            binding_id: format!("b-{}", reservation_id),
            resource_key: "node:1:type:3:hop:0".into(),
            role,
            protocol: "tls".into(),
            strategy: "round".into(),
            requested_port: None,
            targets: Vec::new(),
        }
    }

    fn count_runtimes(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM peer_share_runtime", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50010);
                let request = make_apply("r1", LeaseRole::Exit);

                let (first, created) = apply_reservation(tx, &share, &request, now_ms())?;
                assert!(created);
                let (second, created) = apply_reservation(tx, &share, &request, now_ms())?;
                assert!(!created);

                assert_eq!(first.port, 50000);
                assert_eq!(first.port, second.port);
                assert_eq!(first.id, second.id);
                assert_eq!(count_runtimes(tx), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_exhausted_share_creates_no_row() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50000);
                apply_reservation(tx, &share, &make_apply("r1", LeaseRole::Exit), now_ms())?;

                let err = apply_reservation(tx, &share, &make_apply("r2", LeaseRole::Exit), now_ms())
                    .unwrap_err();
                assert!(matches!(err, CoreError::CapacityExhausted(ref msg) if msg == NO_AVAILABLE_PORT));
                assert_eq!(count_runtimes(tx), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_released_reservation_frees_port_and_reapply_creates_new_row() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50000);
                let request = make_apply("r1", LeaseRole::Exit);
                let (first, _) = apply_reservation(tx, &share, &request, now_ms())?;

                assert!(mark_runtime_released(tx, first.id)?);
                assert!(!mark_runtime_released(tx, first.id)?);

                let (second, created) = apply_reservation(tx, &share, &request, now_ms())?;
                assert!(created);
                assert_ne!(first.id, second.id);
                assert_eq!(second.port, 50000);

                let all = list_runtimes(tx, share.id)?;
                assert_eq!(all.len(), 2);
                assert!(!all[0].active);
                assert!(all[1].active);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_share_port_skips_node_hops_and_checks_request() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50005);
                tx.execute(
                    "INSERT INTO chain_tunnel(tunnel_id, chain_type, inx, node_id, port) VALUES(99, 3, 0, ?1, 50000)",
                    [share.node_id],
                )?;
                assert_eq!(pick_share_port(tx, &share, None)?, 50001);
                assert_eq!(pick_share_port(tx, &share, Some(50004))?, 50004);
                assert!(matches!(
                    pick_share_port(tx, &share, Some(50000)),
                    Err(CoreError::CapacityExhausted(ref m)) if m == NO_AVAILABLE_PORT
                ));
                assert!(matches!(
                    pick_share_port(tx, &share, Some(60000)),
                    Err(CoreError::Forbidden(ref m)) if m == "Port out of range"
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_middle_requires_targets_and_keeps_them() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50010);
                let mut request = make_apply("r1", LeaseRole::Middle);
                assert!(matches!(
                    apply_reservation(tx, &share, &request, now_ms()),
                    Err(CoreError::InvalidInput(_))
                ));

                request.targets = vec![LeaseTarget {
                    host: "10.0.0.9".into(),
                    port: 31000,
                    protocol: "tls".into(),
                }];
                let (runtime, _) = apply_reservation(tx, &share, &request, now_ms())?;
                assert_eq!(runtime.role, LeaseRole::Middle);
                assert_eq!(runtime.targets, request.targets);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_authorize_share() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50010);
                let now = now_ms();

                assert!(matches!(authorize_share(tx, "nope", None, now), Err(CoreError::Unauthorized)));
                assert_eq!(authorize_share(tx, &share.token, None, now)?.id, share.id);

                tx.execute(
                    "UPDATE peer_share SET allowed_ips = '10.1.1.1' WHERE id = ?1",
                    [share.id],
                )?;
                assert!(matches!(
                    authorize_share(tx, &share.token, "10.2.2.2".parse().ok(), now),
                    Err(CoreError::Forbidden(_))
                ));
                assert!(authorize_share(tx, &share.token, "10.1.1.1".parse().ok(), now).is_ok());

                tx.execute("UPDATE peer_share SET expiry_time = ?2 WHERE id = ?1", params![share.id, now - 1])?;
                assert!(matches!(
                    authorize_share(tx, &share.token, "10.1.1.1".parse().ok(), now),
                    Err(CoreError::Forbidden(ref m)) if m == "Share expired"
                ));

                tx.execute("UPDATE peer_share SET expiry_time = 0 WHERE id = ?1", [share.id])?;
                set_share_active(tx, share.id, false)?;
                assert!(matches!(
                    authorize_share(tx, &share.token, "10.1.1.1".parse().ok(), now),
                    Err(CoreError::Forbidden(ref m)) if m == "Share is disabled"
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_flow_cap_blocks_until_reset() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50010);
                tx.execute("UPDATE peer_share SET max_bandwidth = 1000 WHERE id = ?1", [share.id])?;
                let now = now_ms();

                add_share_flow(tx, share.id, 600)?;
                assert!(authorize_share(tx, &share.token, None, now).is_ok());

                add_share_flow(tx, share.id, 400)?;
                assert!(matches!(
                    authorize_share(tx, &share.token, None, now),
                    Err(CoreError::Forbidden(ref m)) if m == "Share traffic exceeded"
                ));

                reset_share_flow(tx, share.id)?;
                assert_eq!(authorize_share(tx, &share.token, None, now)?.current_flow, 0);

                assert!(matches!(add_share_flow(tx, 999, 1), Err(CoreError::NotFound(_))));
                assert!(matches!(reset_share_flow(tx, 999), Err(CoreError::NotFound(_))));
                assert_eq!(list_shares(tx)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_share_found_by_service_name() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50010);
                let (runtime, _) = apply_reservation(tx, &share, &make_apply("r1", LeaseRole::Exit), now_ms())?;
                set_runtime_service(tx, runtime.id, "share_1_r1", "")?;

                assert_eq!(find_share_by_service(tx, share.node_id, "share_1_r1")?, Some(share.id));
                assert_eq!(find_share_by_service(tx, share.node_id + 1, "share_1_r1")?, None);
                assert_eq!(find_share_by_service(tx, share.node_id, "")?, None);

                mark_runtime_released(tx, runtime.id)?;
                assert_eq!(find_share_by_service(tx, share.node_id, "share_1_r1")?, Some(share.id));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_release_lookup_order() {
        let store = make_store();
        store
            .write(|tx| {
                let share = make_share(tx, 50000, 50010);
                let mut request = make_apply("r1", LeaseRole::Exit);
                request.resource_key = "node:7:type:3:hop:0".into();
                let (runtime, _) = apply_reservation(tx, &share, &request, now_ms())?;

                let by_binding = find_runtime_for_release(tx, share.id, Some("b-r1"), None, None)?;
                assert_eq!(by_binding.map(|r| r.id), Some(runtime.id));
                let by_key = find_runtime_for_release(tx, share.id, Some("unknown"), None, Some("node:7:type:3:hop:0"))?;
                assert_eq!(by_key.map(|r| r.id), Some(runtime.id));
                assert!(find_runtime_for_release(tx, share.id, None, Some("zzz"), None)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_remote_node_cannot_be_shared() {
        let store = make_store();
        store
            .write(|tx| {
                let remote = insert_node(
                    tx,
                    &NewNode {
                        name: "far".into(),
                        server_ip: "far.example.net".into(),
                        port: "1000-1010".into(),
                        is_remote: true,
                        remote_url: Some("https://far.example.net".into()),
                        remote_token: Some("tok".into()),
                        ..Default::default()
                    },
                )?;
                let result = create_share(
                    tx,
                    &NewPeerShare {
                        name: "x".into(),
                        node_id: remote.id,
                        port_range_start: 1000,
                        port_range_end: 1010,
                        ..Default::default()
                    },
                );
                assert!(matches!(result, Err(CoreError::InvalidInput(_))));
                Ok(())
            })
            .unwrap();
    }
}
