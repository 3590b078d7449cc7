//! Schema
//!
//! Timestamps are epoch milliseconds. Foreign keys are not declared; deletes
//! cascade through explicit ordered statements so the behavior does not depend
//! on the storage engine.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS node (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    secret TEXT NOT NULL UNIQUE,
    server_ip TEXT NOT NULL DEFAULT '',
    server_ip_v4 TEXT,
    server_ip_v6 TEXT,
    port TEXT NOT NULL DEFAULT '',
    tcp_listen_addr TEXT NOT NULL DEFAULT '[::]',
    udp_listen_addr TEXT NOT NULL DEFAULT '[::]',
    interface_name TEXT,
    version TEXT,
    http INTEGER NOT NULL DEFAULT 0,
    tls INTEGER NOT NULL DEFAULT 0,
    socks INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 0,
    is_remote INTEGER NOT NULL DEFAULT 0,
    remote_url TEXT,
    remote_token TEXT,
    remote_config TEXT,
    created_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tunnel (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    type INTEGER NOT NULL,
    traffic_ratio REAL NOT NULL DEFAULT 1.0,
    ip_preference TEXT NOT NULL DEFAULT '',
    in_ip TEXT,
    status INTEGER NOT NULL DEFAULT 1,
    created_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chain_tunnel (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tunnel_id INTEGER NOT NULL,
    chain_type INTEGER NOT NULL,
    inx INTEGER NOT NULL DEFAULT 0,
    node_id INTEGER NOT NULL,
    port INTEGER NOT NULL DEFAULT 0,
    protocol TEXT NOT NULL DEFAULT 'tls',
    strategy TEXT NOT NULL DEFAULT 'round'
);
CREATE INDEX IF NOT EXISTS idx_chain_tunnel_tunnel ON chain_tunnel(tunnel_id);
CREATE INDEX IF NOT EXISTS idx_chain_tunnel_node ON chain_tunnel(node_id);

CREATE TABLE IF NOT EXISTS forward (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL DEFAULT 0,
    name TEXT NOT NULL,
    tunnel_id INTEGER NOT NULL,
    remote_addr TEXT NOT NULL,
    strategy TEXT NOT NULL DEFAULT 'fifo',
    in_flow INTEGER NOT NULL DEFAULT 0,
    out_flow INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 1,
    created_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_forward_tunnel ON forward(tunnel_id);

CREATE TABLE IF NOT EXISTS forward_port (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    forward_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    port INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_forward_port_node ON forward_port(node_id);

CREATE TABLE IF NOT EXISTS federation_tunnel_binding (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tunnel_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    chain_type INTEGER NOT NULL,
    hop_inx INTEGER NOT NULL DEFAULT 0,
    remote_url TEXT NOT NULL,
    resource_key TEXT NOT NULL,
    remote_binding_id TEXT NOT NULL,
    remote_reservation_id TEXT NOT NULL,
    allocated_port INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 1,
    created_time INTEGER NOT NULL,
    updated_time INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_binding_active
    ON federation_tunnel_binding(tunnel_id, node_id, chain_type, hop_inx) WHERE status = 1;

CREATE TABLE IF NOT EXISTS peer_share (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    node_id INTEGER NOT NULL,
    token TEXT NOT NULL UNIQUE,
    max_bandwidth INTEGER NOT NULL DEFAULT 0,
    expiry_time INTEGER NOT NULL DEFAULT 0,
    port_range_start INTEGER NOT NULL,
    port_range_end INTEGER NOT NULL,
    current_flow INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    allowed_ips TEXT NOT NULL DEFAULT '',
    created_time INTEGER NOT NULL,
    updated_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS peer_share_runtime (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    share_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    reservation_id TEXT NOT NULL,
    binding_id TEXT NOT NULL,
    resource_key TEXT NOT NULL DEFAULT '',
    role TEXT NOT NULL,
    protocol TEXT NOT NULL DEFAULT 'tls',
    strategy TEXT NOT NULL DEFAULT 'round',
    port INTEGER NOT NULL,
    targets TEXT NOT NULL DEFAULT '[]',
    service_name TEXT NOT NULL DEFAULT '',
    chain_name TEXT NOT NULL DEFAULT '',
    applied INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 1,
    created_time INTEGER NOT NULL,
    updated_time INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_runtime_active_reservation
    ON peer_share_runtime(share_id, reservation_id) WHERE status = 1;
CREATE INDEX IF NOT EXISTS idx_runtime_share ON peer_share_runtime(share_id);

CREATE TABLE IF NOT EXISTS user (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user TEXT NOT NULL UNIQUE,
    flow INTEGER NOT NULL DEFAULT 0,
    num INTEGER NOT NULL DEFAULT 0,
    exp_time INTEGER NOT NULL DEFAULT 0,
    flow_reset_time INTEGER NOT NULL DEFAULT 0,
    created_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_tunnel (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    tunnel_id INTEGER NOT NULL,
    num INTEGER NOT NULL DEFAULT 0,
    flow INTEGER NOT NULL DEFAULT 0,
    in_flow INTEGER NOT NULL DEFAULT 0,
    out_flow INTEGER NOT NULL DEFAULT 0,
    flow_reset_time INTEGER NOT NULL DEFAULT 0,
    exp_time INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 1,
    UNIQUE(user_id, tunnel_id)
);

CREATE TABLE IF NOT EXISTS user_group (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_group_user (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_group_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    UNIQUE(user_group_id, user_id)
);

CREATE TABLE IF NOT EXISTS tunnel_group (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tunnel_group_tunnel (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tunnel_group_id INTEGER NOT NULL,
    tunnel_id INTEGER NOT NULL,
    UNIQUE(tunnel_group_id, tunnel_id)
);

CREATE TABLE IF NOT EXISTS group_permission (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_group_id INTEGER NOT NULL,
    tunnel_group_id INTEGER NOT NULL,
    created_time INTEGER NOT NULL,
    UNIQUE(user_group_id, tunnel_group_id)
);

CREATE TABLE IF NOT EXISTS group_permission_grant (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_group_id INTEGER NOT NULL,
    tunnel_group_id INTEGER NOT NULL,
    user_tunnel_id INTEGER NOT NULL,
    created_by_group INTEGER NOT NULL DEFAULT 0,
    created_time INTEGER NOT NULL,
    UNIQUE(user_group_id, tunnel_group_id, user_tunnel_id)
);
CREATE INDEX IF NOT EXISTS idx_grant_user_tunnel ON group_permission_grant(user_tunnel_id);
"#;
