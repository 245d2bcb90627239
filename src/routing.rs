//! Ticket routing: decides which kitchens produce an order item and makes
//! sure exactly one ticket exists per (order, kitchen).
//!
//! Routing runs inside the item's transaction but under its own SAVEPOINT, so
//! a routing failure only discards the tickets, never the sale.

use rusqlite::{params, Connection};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::kds;
use crate::models::{KitchenTicket, PhasePatch};

/// A kitchen an item category is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KitchenTarget {
    pub kitchen_id: String,
    pub station: Option<String>,
}

/// What a routing pass did. `error` is set when ticket creation failed and
/// was rolled back; the item write is unaffected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingReport {
    pub created: Vec<KitchenTicket>,
    pub error: Option<String>,
}

/// Kitchens associated with a category. Unknown or missing categories route
/// nowhere.
pub fn kitchens_for_category(
    conn: &Connection,
    category_id: Option<&str>,
) -> StoreResult<Vec<KitchenTarget>> {
    let Some(category_id) = category_id else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(
        "SELECT ck.kitchen_id, k.station
         FROM category_kitchens ck
         LEFT JOIN kitchens k ON k.id = ck.kitchen_id
         WHERE ck.category_id = ?1
         ORDER BY ck.kitchen_id",
    )?;
    let rows = stmt
        .query_map(params![category_id], |row| {
            Ok(KitchenTarget {
                kitchen_id: row.get(0)?,
                station: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ensure the order has a ticket for every kitchen the category routes to,
/// or a single null-kitchen ticket when it routes nowhere. Returns only the
/// tickets created by this call.
pub fn route_item(
    conn: &Connection,
    order_id: &str,
    category_id: Option<&str>,
) -> StoreResult<Vec<KitchenTicket>> {
    let targets = kitchens_for_category(conn, category_id)?;
    let existing = kds::list_tickets(conn, order_id)?;
    let mut created = Vec::new();

    if targets.is_empty() {
        if existing.iter().all(|t| t.kitchen_id.is_some()) {
            let id = Uuid::new_v4().to_string();
            if let Some(ticket) = kds::insert_ticket_if_absent(conn, &id, order_id, None, None)? {
                created.push(ticket);
            }
        }
    } else {
        let ticketed: HashSet<&str> = existing
            .iter()
            .filter_map(|t| t.kitchen_id.as_deref())
            .collect();
        for target in targets
            .iter()
            .filter(|t| !ticketed.contains(t.kitchen_id.as_str()))
        {
            let id = Uuid::new_v4().to_string();
            if let Some(ticket) = kds::insert_ticket_if_absent(
                conn,
                &id,
                order_id,
                Some(&target.kitchen_id),
                target.station.as_deref(),
            )? {
                created.push(ticket);
            }
        }
    }

    if let Some(first) = created.first() {
        kds::stamp_phase_times(
            conn,
            order_id,
            &PhasePatch {
                new_start: Some(first.created_at.clone()),
                ..Default::default()
            },
        )?;
    }

    Ok(created)
}

/// Run [`route_item`] under a savepoint. Failures are logged and rolled back
/// to the savepoint; they never propagate.
pub fn route_item_best_effort(
    conn: &Connection,
    order_id: &str,
    item_id: &str,
    category_id: Option<&str>,
) -> RoutingReport {
    if let Err(e) = conn.execute_batch("SAVEPOINT route_tickets") {
        warn!(order_id = %order_id, item_id = %item_id, error = %e, "Ticket routing skipped: savepoint failed");
        return RoutingReport {
            created: Vec::new(),
            error: Some(e.to_string()),
        };
    }

    match route_item(conn, order_id, category_id) {
        Ok(created) => {
            if let Err(e) = conn.execute_batch("RELEASE route_tickets") {
                warn!(order_id = %order_id, error = %e, "Ticket routing release failed");
                let _ = conn.execute_batch("ROLLBACK TO route_tickets; RELEASE route_tickets");
                return RoutingReport {
                    created: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
            debug!(
                order_id = %order_id,
                item_id = %item_id,
                created = created.len(),
                "Item routed"
            );
            RoutingReport {
                created,
                error: None,
            }
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK TO route_tickets; RELEASE route_tickets");
            warn!(
                order_id = %order_id,
                item_id = %item_id,
                error = %e,
                "Ticket routing failed; item kept without kitchen ticket"
            );
            RoutingReport {
                created: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, open_in_memory, DbState};
    use crate::models::{NewOrder, NewOrderItem};
    use crate::orders;

    fn test_db() -> DbState {
        let db = open_in_memory().expect("open in-memory db");
        db.with_transaction(|tx| {
            db::upsert_kitchen(tx, "K1", "Hot kitchen", Some("grill"))?;
            db::upsert_kitchen(tx, "K2", "Cold kitchen", Some("salads"))?;
            db::set_category_kitchens(tx, "C1", &["K1", "K2"])?;
            db::set_category_kitchens(tx, "C2", &["K1"])?;
            orders::insert_order(tx, "O1", Some("t1"), &NewOrder::default())?;
            Ok(())
        })
        .unwrap();
        db
    }

    fn new_item(category: Option<&str>) -> NewOrderItem {
        NewOrderItem {
            product_id: "p".into(),
            category_id: category.map(String::from),
            quantity: 1,
            unit_price_cents: 500,
            notes: None,
        }
    }

    #[test]
    fn test_two_categories_sharing_a_kitchen_yield_two_tickets() {
        let db = test_db();
        db.with_transaction(|tx| {
            orders::insert_item(tx, "A", "O1", &new_item(Some("C1")))?;
            let first = route_item_best_effort(tx, "O1", "A", Some("C1"));
            assert_eq!(first.created.len(), 2);

            orders::insert_item(tx, "B", "O1", &new_item(Some("C2")))?;
            let second = route_item_best_effort(tx, "O1", "B", Some("C2"));
            assert!(second.created.is_empty());

            let mut kitchens: Vec<_> = kds::list_tickets(tx, "O1")?
                .into_iter()
                .map(|t| t.kitchen_id.unwrap_or_default())
                .collect();
            kitchens.sort();
            assert_eq!(kitchens, vec!["K1".to_string(), "K2".to_string()]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_repeated_routing_is_idempotent() {
        let db = test_db();
        db.with_transaction(|tx| {
            for _ in 0..5 {
                route_item(tx, "O1", Some("C1"))?;
                route_item(tx, "O1", Some("C2"))?;
            }
            assert_eq!(kds::list_tickets(tx, "O1")?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_unrouted_category_gets_single_null_ticket() {
        let db = test_db();
        db.with_transaction(|tx| {
            route_item(tx, "O1", Some("C-unknown"))?;
            route_item(tx, "O1", None)?;
            route_item(tx, "O1", Some("C-other"))?;
            let tickets = kds::list_tickets(tx, "O1")?;
            assert_eq!(tickets.len(), 1);
            assert_eq!(tickets[0].kitchen_id, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_created_tickets_are_queued_and_stamp_new_start() {
        let db = test_db();
        db.with_transaction(|tx| {
            let created = route_item(tx, "O1", Some("C2"))?;
            assert_eq!(created.len(), 1);
            assert_eq!(created[0].status, crate::models::TicketStatus::Queued);
            assert_eq!(created[0].station.as_deref(), Some("grill"));

            let timeline = kds::get_phase_timeline(tx, "O1")?.expect("timeline");
            assert_eq!(timeline.new_start.as_deref(), Some(created[0].created_at.as_str()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_routing_failure_keeps_the_item() {
        let db = test_db();
        let report = db
            .with_transaction(|tx| {
                orders::insert_item(tx, "A", "O1", &new_item(Some("C1")))?;
                tx.execute_batch("DROP TABLE kds_phase_times")?;
                Ok(route_item_best_effort(tx, "O1", "A", Some("C1")))
            })
            .unwrap();

        assert!(report.error.is_some());
        assert!(report.created.is_empty());
        db.with_conn(|conn| {
            assert!(orders::get_item(conn, "A")?.is_some());
            assert!(kds::list_tickets(conn, "O1")?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
