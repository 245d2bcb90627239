//! Local persistence for orders, order items and payments.
//!
//! Every function here takes a plain `&Connection` so that callers can
//! compose several writes inside one [`DbState::with_transaction`]. Writes
//! always bump `version` and set `pending_sync = 1`; clearing the flag is
//! the orchestrator's job once the cloud has acknowledged the row.
//!
//! [`DbState::with_transaction`]: crate::db::DbState::with_transaction

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{self, now_ts};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    NewOrder, NewOrderItem, NewPayment, Order, OrderItem, OrderStatus, Payment, PaymentMethod,
};

const ORDER_COLUMNS: &str = "id, order_number, status, total_cents, opened_at, closed_at,
     unit_id, terminal_id, notes, updated_at, version, pending_sync";

const ITEM_COLUMNS: &str = "id, order_id, product_id, category_id, quantity, unit_price_cents,
     notes, updated_at, version, pending_sync";

const PAYMENT_COLUMNS: &str = "id, order_id, method, amount_cents, change_cents,
     authorization_code, created_at, updated_at, version, pending_sync";

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let status: String = row.get(2)?;
    Ok(Order {
        id: row.get(0)?,
        order_number: row.get(1)?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Open),
        total_cents: row.get(3)?,
        opened_at: row.get(4)?,
        closed_at: row.get(5)?,
        unit_id: row.get(6)?,
        terminal_id: row.get(7)?,
        notes: row.get(8)?,
        updated_at: row.get(9)?,
        version: row.get(10)?,
        pending_sync: row.get(11)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<OrderItem> {
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        product_id: row.get(2)?,
        category_id: row.get(3)?,
        quantity: row.get(4)?,
        unit_price_cents: row.get(5)?,
        notes: row.get(6)?,
        updated_at: row.get(7)?,
        version: row.get(8)?,
        pending_sync: row.get(9)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let method: String = row.get(2)?;
    Ok(Payment {
        id: row.get(0)?,
        order_id: row.get(1)?,
        method: PaymentMethod::parse(&method).unwrap_or(PaymentMethod::Cash),
        amount_cents: row.get(3)?,
        change_cents: row.get(4)?,
        authorization_code: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        version: row.get(8)?,
        pending_sync: row.get(9)?,
    })
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

pub fn get_order(conn: &Connection, id: &str) -> StoreResult<Option<Order>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )
        .optional()?)
}

pub fn require_order(conn: &Connection, id: &str) -> StoreResult<Order> {
    get_order(conn, id)?.ok_or_else(|| StoreError::not_found("order", id))
}

/// Load an order that still accepts items and payments.
pub fn require_open_order(conn: &Connection, id: &str) -> StoreResult<Order> {
    let order = require_order(conn, id)?;
    if order.status.is_terminal() {
        return Err(StoreError::invalid(format!(
            "order {id} is {}",
            order.status.as_str()
        )));
    }
    Ok(order)
}

/// Insert a new open order under a caller-generated id.
pub fn insert_order(
    conn: &Connection,
    id: &str,
    terminal_id: Option<&str>,
    new: &NewOrder,
) -> StoreResult<Order> {
    let order_number = db::next_counter(conn, "order_number")?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO orders (
            id, order_number, status, total_cents, opened_at, unit_id, terminal_id,
            notes, updated_at, version, pending_sync
        ) VALUES (?1, ?2, 'open', 0, ?3, ?4, ?5, ?6, ?3, 1, 1)",
        params![id, order_number, now, new.unit_id, terminal_id, new.notes],
    )?;
    require_order(conn, id)
}

/// Recompute `total_cents` from the order's items. Must run in the same
/// transaction as the item write that changed the total.
pub fn recompute_total(conn: &Connection, order_id: &str) -> StoreResult<Order> {
    let changed = conn.execute(
        "UPDATE orders SET
            total_cents = (
                SELECT COALESCE(SUM(quantity * unit_price_cents), 0)
                FROM order_items WHERE order_id = ?1
            ),
            updated_at = ?2,
            version = version + 1,
            pending_sync = 1
         WHERE id = ?1",
        params![order_id, now_ts()],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("order", order_id));
    }
    require_order(conn, order_id)
}

/// Move an order to `closed` or `cancelled`.
pub fn finish_order(conn: &Connection, id: &str, status: OrderStatus) -> StoreResult<Order> {
    if !status.is_terminal() {
        return Err(StoreError::invalid("orders can only be finished as closed or cancelled"));
    }
    require_open_order(conn, id)?;
    let now = now_ts();
    conn.execute(
        "UPDATE orders SET
            status = ?2,
            closed_at = ?3,
            updated_at = ?3,
            version = version + 1,
            pending_sync = 1
         WHERE id = ?1",
        params![id, status.as_str(), now],
    )?;
    require_order(conn, id)
}

pub fn list_orders(conn: &Connection, status: Option<OrderStatus>) -> StoreResult<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY opened_at"
    ))?;
    let rows = stmt
        .query_map(params![status.map(|s| s.as_str())], order_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Order items
// ---------------------------------------------------------------------------

pub fn get_item(conn: &Connection, id: &str) -> StoreResult<Option<OrderItem>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE id = ?1"),
            params![id],
            item_from_row,
        )
        .optional()?)
}

pub fn list_items(conn: &Connection, order_id: &str) -> StoreResult<Vec<OrderItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = ?1 ORDER BY updated_at, id"
    ))?;
    let rows = stmt
        .query_map(params![order_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Category of a product from the local catalog, if known.
pub fn product_category(conn: &Connection, product_id: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT category_id FROM products WHERE id = ?1",
            params![product_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

/// Append an item to an open order and recompute the order total.
pub fn insert_item(
    conn: &Connection,
    id: &str,
    order_id: &str,
    item: &NewOrderItem,
) -> StoreResult<(OrderItem, Order)> {
    if item.quantity <= 0 {
        return Err(StoreError::invalid("quantity must be positive"));
    }
    if item.unit_price_cents < 0 {
        return Err(StoreError::invalid("unit price cannot be negative"));
    }
    require_open_order(conn, order_id)?;

    let category_id = match &item.category_id {
        Some(c) => Some(c.clone()),
        None => product_category(conn, &item.product_id)?,
    };

    conn.execute(
        "INSERT INTO order_items (
            id, order_id, product_id, category_id, quantity, unit_price_cents,
            notes, updated_at, version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 1)",
        params![
            id,
            order_id,
            item.product_id,
            category_id,
            item.quantity,
            item.unit_price_cents,
            item.notes,
            now_ts(),
        ],
    )?;

    let order = recompute_total(conn, order_id)?;
    let item = get_item(conn, id)?.ok_or_else(|| StoreError::not_found("order item", id))?;
    Ok((item, order))
}

/// Delete an item from an open order, leave a tombstone for the cloud and
/// recompute the order total.
///
/// The item's unit-state rows are removed too. They get no tombstone of their
/// own: whoever applies the item tombstone drops them with it.
pub fn delete_item(conn: &Connection, item_id: &str) -> StoreResult<(OrderItem, Order)> {
    let item = get_item(conn, item_id)?.ok_or_else(|| StoreError::not_found("order item", item_id))?;
    require_open_order(conn, &item.order_id)?;

    conn.execute("DELETE FROM order_items WHERE id = ?1", params![item_id])?;
    conn.execute(
        "DELETE FROM kds_unit_states WHERE order_item_id = ?1",
        params![item_id],
    )?;
    db::add_tombstone(conn, "order_items", item_id)?;

    let order = recompute_total(conn, &item.order_id)?;
    Ok((item, order))
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

pub fn get_payment(conn: &Connection, id: &str) -> StoreResult<Option<Payment>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"),
            params![id],
            payment_from_row,
        )
        .optional()?)
}

pub fn list_payments(conn: &Connection, order_id: &str) -> StoreResult<Vec<Payment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map(params![order_id], payment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Record a payment against an open order.
pub fn insert_payment(
    conn: &Connection,
    id: &str,
    order_id: &str,
    payment: &NewPayment,
) -> StoreResult<Payment> {
    if payment.amount_cents <= 0 {
        return Err(StoreError::invalid("payment amount must be positive"));
    }
    if payment.change_cents < 0 {
        return Err(StoreError::invalid("change cannot be negative"));
    }
    require_open_order(conn, order_id)?;

    let now = now_ts();
    conn.execute(
        "INSERT INTO payments (
            id, order_id, method, amount_cents, change_cents, authorization_code,
            created_at, updated_at, version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1, 1)",
        params![
            id,
            order_id,
            payment.method.as_str(),
            payment.amount_cents,
            payment.change_cents,
            payment.authorization_code,
            now,
        ],
    )?;
    get_payment(conn, id)?.ok_or_else(|| StoreError::not_found("payment", id))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_in_memory, DbState};

    fn test_db() -> DbState {
        open_in_memory().expect("open in-memory db")
    }

    fn item(product: &str, qty: i64, price: i64) -> NewOrderItem {
        NewOrderItem {
            product_id: product.to_string(),
            category_id: None,
            quantity: qty,
            unit_price_cents: price,
            notes: None,
        }
    }

    #[test]
    fn test_insert_order_assigns_sequence_and_pending() {
        let db = test_db();
        db.with_transaction(|tx| {
            let first = insert_order(tx, "ord-1", Some("t1"), &NewOrder::default())?;
            let second = insert_order(tx, "ord-2", Some("t1"), &NewOrder::default())?;
            assert_eq!(first.order_number, Some(1));
            assert_eq!(second.order_number, Some(2));
            assert_eq!(first.status, OrderStatus::Open);
            assert!(first.pending_sync);
            assert_eq!(first.version, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_item_writes_recompute_total() {
        let db = test_db();
        db.with_transaction(|tx| {
            insert_order(tx, "ord-1", None, &NewOrder::default())?;
            insert_item(tx, "it-1", "ord-1", &item("burger", 2, 1500))?;
            let (_, order) = insert_item(tx, "it-2", "ord-1", &item("soda", 1, 600))?;
            assert_eq!(order.total_cents, 3600);
            assert_eq!(order.version, 3);

            let (removed, order) = delete_item(tx, "it-1")?;
            assert_eq!(removed.product_id, "burger");
            assert_eq!(order.total_cents, 600);
            assert_eq!(list_items(tx, "ord-1")?.len(), 1);
            assert_eq!(db::list_tombstones(tx)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_item_category_resolved_from_catalog() {
        let db = test_db();
        db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO products (id, name, category_id, price_cents) VALUES ('p-1', 'Pizza', 'cat-1', 3000)",
                [],
            )?;
            insert_order(tx, "ord-1", None, &NewOrder::default())?;
            let (it, _) = insert_item(tx, "it-1", "ord-1", &item("p-1", 1, 3000))?;
            assert_eq!(it.category_id.as_deref(), Some("cat-1"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_closed_order_rejects_items_and_payments() {
        let db = test_db();
        db.with_transaction(|tx| {
            insert_order(tx, "ord-1", None, &NewOrder::default())?;
            let closed = finish_order(tx, "ord-1", OrderStatus::Closed)?;
            assert!(closed.closed_at.is_some());

            let err = insert_item(tx, "it-1", "ord-1", &item("x", 1, 100)).unwrap_err();
            assert!(matches!(err, StoreError::InvalidState(_)));

            let payment = NewPayment {
                method: PaymentMethod::Cash,
                amount_cents: 100,
                change_cents: 0,
                authorization_code: None,
            };
            let err = insert_payment(tx, "pay-1", "ord-1", &payment).unwrap_err();
            assert!(matches!(err, StoreError::InvalidState(_)));

            let err = finish_order(tx, "ord-1", OrderStatus::Cancelled).unwrap_err();
            assert!(matches!(err, StoreError::InvalidState(_)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_insert_payment_validates_amounts() {
        let db = test_db();
        db.with_transaction(|tx| {
            insert_order(tx, "ord-1", None, &NewOrder::default())?;
            let bad = NewPayment {
                method: PaymentMethod::Pix,
                amount_cents: 0,
                change_cents: 0,
                authorization_code: None,
            };
            assert!(insert_payment(tx, "pay-0", "ord-1", &bad).is_err());

            let good = NewPayment {
                method: PaymentMethod::Credit,
                amount_cents: 2500,
                change_cents: 0,
                authorization_code: Some("AUTH-9".into()),
            };
            let stored = insert_payment(tx, "pay-1", "ord-1", &good)?;
            assert_eq!(stored.method, PaymentMethod::Credit);
            assert_eq!(stored.authorization_code.as_deref(), Some("AUTH-9"));
            assert_eq!(list_payments(tx, "ord-1")?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_missing_order_is_not_found() {
        let db = test_db();
        let err = db
            .with_conn(|conn| require_order(conn, "nope"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
