//! Read-only view of what the terminal still owes the cloud.
//!
//! Everything here degrades instead of failing: a read error is logged and
//! reported as an empty queue or an unknown sync time, so status screens
//! keep rendering while the store is unhappy.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, UdpSocket};
use tracing::warn;

use crate::db::SYNCABLE_TABLES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Online,
    Offline,
    Hybrid,
}

/// Which transports are set up, and which answered the last probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub cloud_configured: bool,
    pub cloud_reachable: bool,
    pub lan_configured: bool,
    pub lan_reachable: bool,
}

impl Connectivity {
    pub fn mode(&self) -> OperationMode {
        let cloud = self.cloud_configured && self.cloud_reachable;
        let lan = self.lan_configured && self.lan_reachable;
        if !cloud && !lan {
            OperationMode::Offline
        } else if self.cloud_configured && self.lan_configured {
            OperationMode::Hybrid
        } else {
            OperationMode::Online
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    pub mode: OperationMode,
    pub queue_size: i64,
    pub last_sync_at: Option<String>,
    pub unit_name: Option<String>,
    pub local_ip: Option<String>,
}

fn pending_in(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE pending_sync = 1"),
        [],
        |row| row.get(0),
    )
}

/// Pending rows per syncable table, plus `sync_tombstones` for unsent deletes.
pub fn pending_by_table(conn: &Connection) -> BTreeMap<&'static str, i64> {
    let mut counts = BTreeMap::new();
    for table in SYNCABLE_TABLES {
        match pending_in(conn, table) {
            Ok(n) => {
                counts.insert(*table, n);
            }
            Err(e) => warn!(table, error = %e, "Failed to count pending rows"),
        }
    }
    match conn.query_row("SELECT COUNT(*) FROM sync_tombstones", [], |row| row.get(0)) {
        Ok(n) => {
            counts.insert("sync_tombstones", n);
        }
        Err(e) => warn!(error = %e, "Failed to count tombstones"),
    }
    counts
}

/// Total records still owed to the cloud.
pub fn queue_size(conn: &Connection) -> i64 {
    pending_by_table(conn).values().sum()
}

/// Most recent push, pull or metadata write.
pub fn last_sync_at(conn: &Connection) -> Option<String> {
    let result = conn.query_row(
        "SELECT MAX(ts) FROM (
            SELECT last_pulled_at AS ts FROM sync_log
            UNION ALL SELECT last_pushed_at FROM sync_log
            UNION ALL SELECT updated_at FROM sync_meta
         )",
        [],
        |row| row.get::<_, Option<String>>(0),
    );
    match result {
        Ok(ts) => ts,
        Err(e) => {
            warn!(error = %e, "Failed to read last sync time");
            None
        }
    }
}

/// Primary non-loopback IPv4 address. Connecting a UDP socket sends nothing;
/// it only asks the OS which interface would route outward.
pub fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.1.1.1:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip.to_string()),
        _ => None,
    }
}

pub fn operation_info(
    conn: &Connection,
    connectivity: Connectivity,
    unit_name: Option<&str>,
) -> OperationInfo {
    OperationInfo {
        mode: connectivity.mode(),
        queue_size: queue_size(conn),
        last_sync_at: last_sync_at(conn),
        unit_name: unit_name.map(str::to_string),
        local_ip: local_ip(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, open_in_memory, DbState};
    use crate::models::NewOrder;
    use crate::orders;

    fn test_db() -> DbState {
        open_in_memory().expect("open in-memory db")
    }

    #[test]
    fn test_mode_matrix() {
        let offline = Connectivity {
            cloud_configured: true,
            lan_configured: true,
            ..Default::default()
        };
        assert_eq!(offline.mode(), OperationMode::Offline);
        assert_eq!(Connectivity::default().mode(), OperationMode::Offline);

        let hybrid = Connectivity {
            lan_reachable: true,
            ..offline
        };
        assert_eq!(hybrid.mode(), OperationMode::Hybrid);

        let cloud_only = Connectivity {
            cloud_configured: true,
            cloud_reachable: true,
            ..Default::default()
        };
        assert_eq!(cloud_only.mode(), OperationMode::Online);

        let lan_only = Connectivity {
            lan_configured: true,
            lan_reachable: true,
            ..Default::default()
        };
        assert_eq!(lan_only.mode(), OperationMode::Online);
    }

    #[test]
    fn test_queue_counts_pending_rows_and_tombstones() {
        let db = test_db();
        db.with_conn(|c| {
            assert_eq!(queue_size(c), 0);
            orders::insert_order(c, "o1", Some("t1"), &NewOrder::default())?;
            orders::insert_order(c, "o2", Some("t1"), &NewOrder::default())?;
            c.execute("UPDATE orders SET pending_sync = 0 WHERE id = 'o2'", [])?;
            db::add_tombstone(c, "order_items", "i-gone")?;

            let by_table = pending_by_table(c);
            assert_eq!(by_table["orders"], 1);
            assert_eq!(by_table["sync_tombstones"], 1);
            assert_eq!(queue_size(c), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_last_sync_at_takes_latest_of_log_and_meta() {
        let db = test_db();
        db.with_conn(|c| {
            assert_eq!(last_sync_at(c), None);
            db::mark_pushed(c, "orders", "2024-01-01T10:00:00.000Z")?;
            db::mark_pulled(c, "relay", "2024-01-02T10:00:00.000Z", None)?;
            assert_eq!(last_sync_at(c).as_deref(), Some("2024-01-02T10:00:00.000Z"));

            db::set_sync_meta(c, "catalog_version", "7")?;
            let latest = last_sync_at(c).unwrap();
            assert!(latest.as_str() > "2024-01-02T10:00:00.000Z");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_operation_info_serializes_camel_case() {
        let db = test_db();
        let info = db
            .with_conn(|c| Ok(operation_info(c, Connectivity::default(), Some("Centro"))))
            .unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["mode"], "offline");
        assert_eq!(json["queueSize"], 0);
        assert_eq!(json["unitName"], "Centro");
        assert!(json.get("lastSyncAt").is_some());
        assert!(json.get("localIp").is_some());
    }
}
