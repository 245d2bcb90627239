//! Typed row images of local writes.
//!
//! A [`Mutation`] is what the orchestrator pushes to the cloud and relays to
//! other terminals. It serializes as `{ "table": ..., "row": { ... } }`, the
//! relay event shape.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::StoreResult;
use crate::models::{
    CashMovement, CashSession, KitchenTicket, Order, OrderItem, Payment, PhaseTimeline,
    TicketUnitState,
};
use crate::{cash, kds, orders};

/// A local delete the cloud still has to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub table_name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Mutation {
    Orders(Order),
    OrderItems(OrderItem),
    Payments(Payment),
    KdsTickets(KitchenTicket),
    KdsPhaseTimes(PhaseTimeline),
    KdsUnitStates(TicketUnitState),
    CashSessions(CashSession),
    CashMovements(CashMovement),
    Tombstone(Tombstone),
}

impl Mutation {
    pub fn table(&self) -> &'static str {
        match self {
            Mutation::Orders(_) => "orders",
            Mutation::OrderItems(_) => "order_items",
            Mutation::Payments(_) => "payments",
            Mutation::KdsTickets(_) => "kds_tickets",
            Mutation::KdsPhaseTimes(_) => "kds_phase_times",
            Mutation::KdsUnitStates(_) => "kds_unit_states",
            Mutation::CashSessions(_) => "cash_sessions",
            Mutation::CashMovements(_) => "cash_movements",
            Mutation::Tombstone(_) => "tombstone",
        }
    }

    /// Primary key of the row, composite keys joined with `/`.
    pub fn row_key(&self) -> String {
        match self {
            Mutation::Orders(r) => r.id.clone(),
            Mutation::OrderItems(r) => r.id.clone(),
            Mutation::Payments(r) => r.id.clone(),
            Mutation::KdsTickets(r) => r.id.clone(),
            Mutation::KdsPhaseTimes(r) => r.order_id.clone(),
            Mutation::KdsUnitStates(r) => format!(
                "{}/{}/{}",
                r.order_id, r.order_item_id, r.production_unit_id
            ),
            Mutation::CashSessions(r) => r.id.clone(),
            Mutation::CashMovements(r) => r.id.clone(),
            Mutation::Tombstone(t) => t.id.clone(),
        }
    }

    /// Row image as JSON (the `row` half of a relay event).
    pub fn row(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("row").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }

    /// Clear the pending flag after a cloud acknowledgment. Only clears when
    /// the row still has the pushed version, so a write that raced the push
    /// stays pending. Returns whether the row was cleared.
    pub fn mark_synced(&self, conn: &Connection) -> StoreResult<bool> {
        let changed = match self {
            Mutation::Orders(r) => clear_by_id(conn, "orders", &r.id, r.version)?,
            Mutation::OrderItems(r) => clear_by_id(conn, "order_items", &r.id, r.version)?,
            Mutation::Payments(r) => clear_by_id(conn, "payments", &r.id, r.version)?,
            Mutation::KdsTickets(r) => clear_by_id(conn, "kds_tickets", &r.id, r.version)?,
            Mutation::CashSessions(r) => clear_by_id(conn, "cash_sessions", &r.id, r.version)?,
            Mutation::CashMovements(r) => clear_by_id(conn, "cash_movements", &r.id, r.version)?,
            Mutation::KdsPhaseTimes(r) => conn.execute(
                "UPDATE kds_phase_times SET pending_sync = 0 WHERE order_id = ?1 AND version = ?2",
                params![r.order_id, r.version],
            )?,
            Mutation::KdsUnitStates(r) => conn.execute(
                "UPDATE kds_unit_states SET pending_sync = 0
                 WHERE order_id = ?1 AND order_item_id = ?2 AND production_unit_id = ?3
                   AND version = ?4",
                params![r.order_id, r.order_item_id, r.production_unit_id, r.version],
            )?,
            Mutation::Tombstone(t) => {
                db::clear_tombstone(conn, &t.table_name, &t.id)?;
                1
            }
        };
        Ok(changed > 0)
    }
}

fn clear_by_id(conn: &Connection, table: &str, id: &str, version: i64) -> StoreResult<usize> {
    // `table` only ever comes from the fixed names above.
    Ok(conn.execute(
        &format!("UPDATE {table} SET pending_sync = 0 WHERE id = ?1 AND version = ?2"),
        params![id, version],
    )?)
}

fn pending_ids(conn: &Connection, table: &str, key: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {key} FROM {table} WHERE pending_sync = 1 ORDER BY updated_at"
    ))?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Every row still owed to the cloud, parents before children, tombstones
/// last.
pub fn pending_mutations(conn: &Connection) -> StoreResult<Vec<Mutation>> {
    let mut out = Vec::new();

    for id in pending_ids(conn, "orders", "id")? {
        if let Some(r) = orders::get_order(conn, &id)? {
            out.push(Mutation::Orders(r));
        }
    }
    for id in pending_ids(conn, "order_items", "id")? {
        if let Some(r) = orders::get_item(conn, &id)? {
            out.push(Mutation::OrderItems(r));
        }
    }
    for id in pending_ids(conn, "payments", "id")? {
        if let Some(r) = orders::get_payment(conn, &id)? {
            out.push(Mutation::Payments(r));
        }
    }
    for id in pending_ids(conn, "kds_tickets", "id")? {
        if let Some(r) = kds::get_ticket(conn, &id)? {
            out.push(Mutation::KdsTickets(r));
        }
    }
    for order_id in pending_ids(conn, "kds_phase_times", "order_id")? {
        if let Some(r) = kds::get_phase_timeline(conn, &order_id)? {
            out.push(Mutation::KdsPhaseTimes(r));
        }
    }
    {
        let mut stmt = conn.prepare(
            "SELECT order_id, order_item_id, production_unit_id FROM kds_unit_states
             WHERE pending_sync = 1 ORDER BY updated_at",
        )?;
        let keys = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<(String, String, String)>, _>>()?;
        for (order_id, item_id, unit_id) in keys {
            if let Some(r) = kds::get_unit_state(conn, &order_id, &item_id, &unit_id)? {
                out.push(Mutation::KdsUnitStates(r));
            }
        }
    }
    for id in pending_ids(conn, "cash_sessions", "id")? {
        if let Some(r) = cash::get_session(conn, &id)? {
            out.push(Mutation::CashSessions(r));
        }
    }
    for id in pending_ids(conn, "cash_movements", "id")? {
        if let Some(r) = cash::get_movement(conn, &id)? {
            out.push(Mutation::CashMovements(r));
        }
    }
    for (table_name, id) in db::list_tombstones(conn)? {
        out.push(Mutation::Tombstone(Tombstone { table_name, id }));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::models::{NewOrder, NewOrderItem};

    #[test]
    fn test_serializes_as_relay_event() {
        let m = Mutation::Tombstone(Tombstone {
            table_name: "order_items".into(),
            id: "it-1".into(),
        });
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["table"], "tombstone");
        assert_eq!(json["row"]["id"], "it-1");
        assert_eq!(m.row()["table_name"], "order_items");
    }

    #[test]
    fn test_mark_synced_is_version_guarded() {
        let db = open_in_memory().unwrap();
        db.with_transaction(|tx| {
            let order = orders::insert_order(tx, "ord-1", None, &NewOrder::default())?;
            let stale = Mutation::Orders(order);

            // A newer local write bumps the version past the pushed image.
            orders::insert_item(
                tx,
                "it-1",
                "ord-1",
                &NewOrderItem {
                    product_id: "p".into(),
                    category_id: None,
                    quantity: 1,
                    unit_price_cents: 100,
                    notes: None,
                },
            )?;
            assert!(!stale.mark_synced(tx)?);

            let fresh = Mutation::Orders(orders::require_order(tx, "ord-1")?);
            assert!(fresh.mark_synced(tx)?);
            assert!(!orders::require_order(tx, "ord-1")?.pending_sync);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_pending_mutations_lists_parents_first() {
        let db = open_in_memory().unwrap();
        db.with_transaction(|tx| {
            orders::insert_order(tx, "ord-1", None, &NewOrder::default())?;
            orders::insert_item(
                tx,
                "it-1",
                "ord-1",
                &NewOrderItem {
                    product_id: "p".into(),
                    category_id: None,
                    quantity: 2,
                    unit_price_cents: 100,
                    notes: None,
                },
            )?;
            orders::delete_item(tx, "it-1")?;
            let pending = pending_mutations(tx)?;
            let tables: Vec<_> = pending.iter().map(Mutation::table).collect();
            assert_eq!(tables, vec!["orders", "tombstone"]);
            Ok(())
        })
        .unwrap();
    }
}
