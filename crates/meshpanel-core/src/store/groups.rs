//! Group permissions
//!
//! A permission joins a user group to a tunnel group. Applying it ensures a
//! user tunnel for every (member, tunnel) pair and records a grant row per
//! pair. A user tunnel the grant had to create is marked `created_by_group`;
//! such a row is deleted when its last grant goes away. Rows assigned
//! directly are never removed by revocation.

use std::collections::{BTreeSet, HashSet};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::model::{GroupPermissionGrant, User, UserTunnel};
use crate::now_ms;

pub fn create_user(conn: &Connection, name: &str, flow: i64, num: i64, exp_time: i64) -> CoreResult<User> {
    conn.execute(
        "INSERT INTO user(user, flow, num, exp_time, flow_reset_time, created_time) VALUES(?1, ?2, ?3, ?4, 0, ?5)",
        params![name, flow, num, exp_time, now_ms()],
    )?;
    Ok(User {
        id: conn.last_insert_rowid(),
        user: name.to_string(),
        flow,
        num,
        exp_time,
        flow_reset_time: 0,
    })
}

pub fn create_user_group(conn: &Connection, name: &str) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO user_group(name, created_time) VALUES(?1, ?2)",
        params![name, now_ms()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn create_tunnel_group(conn: &Connection, name: &str) -> CoreResult<i64> {
    conn.execute(
        "INSERT INTO tunnel_group(name, created_time) VALUES(?1, ?2)",
        params![name, now_ms()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn query_ids(conn: &Connection, sql: &str, id: i64) -> CoreResult<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([id], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn user_tunnel_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserTunnel> {
    Ok(UserTunnel {
        id: row.get(0)?,
        user_id: row.get(1)?,
        tunnel_id: row.get(2)?,
        num: row.get(3)?,
        flow: row.get(4)?,
        exp_time: row.get(5)?,
        status: row.get(6)?,
    })
}

pub fn find_user_tunnel(conn: &Connection, user_id: i64, tunnel_id: i64) -> CoreResult<Option<UserTunnel>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, tunnel_id, num, flow, exp_time, status FROM user_tunnel \
             WHERE user_id = ?1 AND tunnel_id = ?2",
            [user_id, tunnel_id],
            user_tunnel_from_row,
        )
        .optional()?)
}

/// Return the user tunnel for a pair, creating it from the user's quotas if
/// absent. The flag tells whether it was created by this call.
fn ensure_user_tunnel(conn: &Connection, user_id: i64, tunnel_id: i64) -> CoreResult<(i64, bool)> {
    if let Some(existing) = find_user_tunnel(conn, user_id, tunnel_id)? {
        return Ok((existing.id, false));
    }

    let (flow, num, exp_time, flow_reset): (i64, i64, i64, i64) = conn
        .query_row(
            "SELECT flow, num, exp_time, flow_reset_time FROM user WHERE id = ?1",
            [user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("user {}", user_id)))?;

    conn.execute(
        "INSERT INTO user_tunnel(user_id, tunnel_id, num, flow, flow_reset_time, exp_time, status) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, 1)",
        params![user_id, tunnel_id, num, flow, flow_reset, exp_time],
    )?;
    Ok((conn.last_insert_rowid(), true))
}

/// Explicitly assign a tunnel to a user
pub fn assign_user_tunnel(conn: &Connection, user_id: i64, tunnel_id: i64) -> CoreResult<UserTunnel> {
    ensure_user_tunnel(conn, user_id, tunnel_id)?;
    find_user_tunnel(conn, user_id, tunnel_id)?
        .ok_or_else(|| CoreError::not_found(format!("user tunnel {}/{}", user_id, tunnel_id)))
}

/// Remove a direct assignment together with any grants pointing at it
pub fn remove_user_tunnel(conn: &Connection, user_tunnel_id: i64) -> CoreResult<()> {
    conn.execute(
        "DELETE FROM group_permission_grant WHERE user_tunnel_id = ?1",
        [user_tunnel_id],
    )?;
    conn.execute("DELETE FROM user_tunnel WHERE id = ?1", [user_tunnel_id])?;
    Ok(())
}

/// Materialize grants for one user group / tunnel group pair
fn apply_permission(conn: &Connection, user_group_id: i64, tunnel_group_id: i64) -> CoreResult<()> {
    let users = query_ids(
        conn,
        "SELECT user_id FROM user_group_user WHERE user_group_id = ?1 ORDER BY user_id",
        user_group_id,
    )?;
    let tunnels = query_ids(
        conn,
        "SELECT tunnel_id FROM tunnel_group_tunnel WHERE tunnel_group_id = ?1 ORDER BY tunnel_id",
        tunnel_group_id,
    )?;

    for &user_id in &users {
        for &tunnel_id in &tunnels {
            let (user_tunnel_id, created) = ensure_user_tunnel(conn, user_id, tunnel_id)?;
            conn.execute(
                "INSERT INTO group_permission_grant(user_group_id, tunnel_group_id, user_tunnel_id, \
                 created_by_group, created_time) VALUES(?1, ?2, ?3, ?4, ?5) ON CONFLICT DO NOTHING",
                params![user_group_id, tunnel_group_id, user_tunnel_id, created, now_ms()],
            )?;
        }
    }

    debug!(
        "Applied permission {}->{} to {} users x {} tunnels",
        user_group_id,
        tunnel_group_id,
        users.len(),
        tunnels.len()
    );
    Ok(())
}

/// Grant a user group access to a tunnel group
pub fn grant_permission(conn: &Connection, user_group_id: i64, tunnel_group_id: i64) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO group_permission(user_group_id, tunnel_group_id, created_time) \
         VALUES(?1, ?2, ?3) ON CONFLICT DO NOTHING",
        params![user_group_id, tunnel_group_id, now_ms()],
    )?;
    apply_permission(conn, user_group_id, tunnel_group_id)?;
    info!("Granted user group {} on tunnel group {}", user_group_id, tunnel_group_id);
    Ok(())
}

/// Delete group-created user tunnels that no grant references any more
fn collect_orphans(conn: &Connection, candidates: &BTreeSet<i64>) -> CoreResult<usize> {
    let mut removed = 0;
    for &user_tunnel_id in candidates {
        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM group_permission_grant WHERE user_tunnel_id = ?1",
            [user_tunnel_id],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            conn.execute("DELETE FROM user_tunnel WHERE id = ?1", [user_tunnel_id])?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Revoke a user group's access to a tunnel group
pub fn revoke_permission(conn: &Connection, user_group_id: i64, tunnel_group_id: i64) -> CoreResult<()> {
    let created: BTreeSet<i64> = {
        let mut stmt = conn.prepare(
            "SELECT user_tunnel_id FROM group_permission_grant \
             WHERE user_group_id = ?1 AND tunnel_group_id = ?2 AND created_by_group = 1",
        )?;
        let rows = stmt.query_map([user_group_id, tunnel_group_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    conn.execute(
        "DELETE FROM group_permission_grant WHERE user_group_id = ?1 AND tunnel_group_id = ?2",
        [user_group_id, tunnel_group_id],
    )?;
    conn.execute(
        "DELETE FROM group_permission WHERE user_group_id = ?1 AND tunnel_group_id = ?2",
        [user_group_id, tunnel_group_id],
    )?;

    let removed = collect_orphans(conn, &created)?;
    info!(
        "Revoked user group {} on tunnel group {} ({} user tunnels removed)",
        user_group_id, tunnel_group_id, removed
    );
    Ok(())
}

/// Replace a user group's members, revoking grants of users that left and
/// applying the group's permissions to users that joined
pub fn set_user_group_members(conn: &Connection, user_group_id: i64, user_ids: &[i64]) -> CoreResult<()> {
    let previous: HashSet<i64> = query_ids(
        conn,
        "SELECT user_id FROM user_group_user WHERE user_group_id = ?1",
        user_group_id,
    )?
    .into_iter()
    .collect();
    let current: HashSet<i64> = user_ids.iter().copied().filter(|id| *id > 0).collect();

    conn.execute("DELETE FROM user_group_user WHERE user_group_id = ?1", [user_group_id])?;
    for user_id in &current {
        conn.execute(
            "INSERT INTO user_group_user(user_group_id, user_id) VALUES(?1, ?2)",
            [user_group_id, *user_id],
        )?;
    }

    let mut removed_users: Vec<i64> = previous.difference(&current).copied().collect();
    removed_users.sort_unstable();
    for user_id in removed_users {
        let created: BTreeSet<i64> = {
            let mut stmt = conn.prepare(
                "SELECT g.user_tunnel_id FROM group_permission_grant g \
                 JOIN user_tunnel ut ON ut.id = g.user_tunnel_id \
                 WHERE g.user_group_id = ?1 AND ut.user_id = ?2 AND g.created_by_group = 1",
            )?;
            let rows = stmt.query_map([user_group_id, user_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        conn.execute(
            "DELETE FROM group_permission_grant WHERE user_group_id = ?1 \
             AND user_tunnel_id IN (SELECT id FROM user_tunnel WHERE user_id = ?2)",
            [user_group_id, user_id],
        )?;
        collect_orphans(conn, &created)?;
    }

    for tunnel_group_id in query_ids(
        conn,
        "SELECT tunnel_group_id FROM group_permission WHERE user_group_id = ?1",
        user_group_id,
    )? {
        apply_permission(conn, user_group_id, tunnel_group_id)?;
    }
    Ok(())
}

/// Replace a tunnel group's members, dropping grants for tunnels that left
/// and re-applying its permissions
pub fn set_tunnel_group_members(conn: &Connection, tunnel_group_id: i64, tunnel_ids: &[i64]) -> CoreResult<()> {
    let current: HashSet<i64> = tunnel_ids.iter().copied().filter(|id| *id > 0).collect();
    let previous = query_ids(
        conn,
        "SELECT tunnel_id FROM tunnel_group_tunnel WHERE tunnel_group_id = ?1",
        tunnel_group_id,
    )?;
    for tunnel_id in previous.into_iter().filter(|id| !current.contains(id)) {
        let created: BTreeSet<i64> = {
            let mut stmt = conn.prepare(
                "SELECT g.user_tunnel_id FROM group_permission_grant g \
                 JOIN user_tunnel ut ON ut.id = g.user_tunnel_id \
                 WHERE g.tunnel_group_id = ?1 AND ut.tunnel_id = ?2 AND g.created_by_group = 1",
            )?;
            let rows = stmt.query_map([tunnel_group_id, tunnel_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        conn.execute(
            "DELETE FROM group_permission_grant WHERE tunnel_group_id = ?1 \
             AND user_tunnel_id IN (SELECT id FROM user_tunnel WHERE tunnel_id = ?2)",
            [tunnel_group_id, tunnel_id],
        )?;
        collect_orphans(conn, &created)?;
    }

    conn.execute(
        "DELETE FROM tunnel_group_tunnel WHERE tunnel_group_id = ?1",
        [tunnel_group_id],
    )?;
    for tunnel_id in &current {
        conn.execute(
            "INSERT INTO tunnel_group_tunnel(tunnel_group_id, tunnel_id) VALUES(?1, ?2)",
            [tunnel_group_id, *tunnel_id],
        )?;
    }

    for user_group_id in query_ids(
        conn,
        "SELECT user_group_id FROM group_permission WHERE tunnel_group_id = ?1",
        tunnel_group_id,
    )? {
        apply_permission(conn, user_group_id, tunnel_group_id)?;
    }
    Ok(())
}

pub fn list_grants(conn: &Connection, user_tunnel_id: i64) -> CoreResult<Vec<GroupPermissionGrant>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_group_id, tunnel_group_id, user_tunnel_id, created_by_group \
         FROM group_permission_grant WHERE user_tunnel_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([user_tunnel_id], |row| {
        Ok(GroupPermissionGrant {
            id: row.get(0)?,
            user_group_id: row.get(1)?,
            tunnel_group_id: row.get(2)?,
            user_tunnel_id: row.get(3)?,
            created_by_group: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
