//! SQLite store
//!
//! One connection behind a mutex. Multi-statement operations run inside an
//! immediate transaction via [`Store::write`]; a closure returning `Err` rolls
//! the whole transaction back.

pub mod federation;
pub mod forwards;
pub mod groups;
pub mod leases;
pub mod nodes;
pub mod ports;
pub mod schema;
pub mod topology;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

pub use ports::InFlightPorts;

/// Shared handle to the panel database
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and create if missing) a database file
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CoreError::InvalidInput(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        debug!("Opened database {}", path.display());
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run read-only statements
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run statements in one immediate transaction, committing on `Ok`
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> CoreResult<T>) -> CoreResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Read an INTEGER port column; a value outside the port range is an error
pub(crate) fn port_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u16> {
    let value: i64 = row.get(idx)?;
    u16::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::model::*;

    pub fn make_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    pub fn make_node(conn: &Connection, name: &str, port: &str) -> Node {
        nodes::insert_node(
            conn,
            &NewNode {
                name: name.into(),
                server_ip: format!("{}.example.net", name),
                port: port.into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    pub fn make_tunnel(conn: &Connection, name: &str, tunnel_type: TunnelType) -> Tunnel {
        topology::insert_tunnel(
            conn,
            &NewTunnel {
                name: name.into(),
                tunnel_type,
                traffic_ratio: 1.0,
                ip_preference: IpPreference::Any,
                in_ip: None,
            },
        )
        .unwrap()
    }
}
