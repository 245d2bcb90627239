//! Rows received from other terminals over the LAN relay.
//!
//! Events are decoded at the boundary into [`InboundRow`]s (unknown tables and
//! missing keys are rejected there) and then merged into the local store:
//! - a null or blank incoming field never clobbers a stored value;
//! - milestone timestamps (`closed_at`, `acknowledged_at`, ...) are set once;
//! - order status and ticket status only move forward;
//! - a child row whose order is unknown gets a stub parent order.

use rusqlite::{params, Connection, ToSql};
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::{now_ts, DbState};
use crate::error::{DecodeError, StoreError, StoreResult};
use crate::fields::{bool_any, i64_any, snake_case, str_any, string_list_any};
use crate::kds;
use crate::models::{
    MovementKind, OrderStatus, PaymentMethod, PhasePatch, TicketStatus, UnitStateUpdate,
    UnitStatus,
};
use crate::mutation::Tombstone;
use crate::{cash, orders};

// ---------------------------------------------------------------------------
// Decoded rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundOrder {
    pub id: String,
    pub order_number: Option<i64>,
    pub status: Option<OrderStatus>,
    pub total_cents: Option<i64>,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
    pub unit_id: Option<String>,
    pub terminal_id: Option<String>,
    pub notes: Option<String>,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundItem {
    pub id: String,
    pub order_id: String,
    pub product_id: Option<String>,
    pub category_id: Option<String>,
    pub quantity: Option<i64>,
    pub unit_price_cents: Option<i64>,
    pub notes: Option<String>,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayment {
    pub id: String,
    pub order_id: String,
    pub method: Option<PaymentMethod>,
    pub amount_cents: Option<i64>,
    pub change_cents: Option<i64>,
    pub authorization_code: Option<String>,
    pub created_at: Option<String>,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTicket {
    pub id: String,
    pub order_id: String,
    pub kitchen_id: Option<String>,
    pub station: Option<String>,
    pub status: Option<TicketStatus>,
    pub created_at: Option<String>,
    pub acknowledged_at: Option<String>,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCashSession {
    pub id: String,
    pub terminal_id: Option<String>,
    pub opening_operator: Option<String>,
    pub closing_operator: Option<String>,
    pub opening_cents: Option<i64>,
    pub closing_cents: Option<i64>,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCashMovement {
    pub id: String,
    pub session_id: String,
    pub kind: Option<MovementKind>,
    pub reason: Option<String>,
    pub amount_cents: Option<i64>,
    pub created_at: Option<String>,
    pub pending_sync: bool,
}

/// One relay event mapped onto the local schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRow {
    Order(InboundOrder),
    OrderItem(InboundItem),
    Payment(InboundPayment),
    Ticket(InboundTicket),
    PhaseTimes {
        order_id: String,
        patch: PhasePatch,
        pending_sync: bool,
    },
    UnitState {
        update: UnitStateUpdate,
        pending_sync: bool,
    },
    CashSession(InboundCashSession),
    CashMovement(InboundCashMovement),
    Tombstone(Tombstone),
}

/// Counts from one batch of relay events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundReport {
    pub applied: usize,
    /// Events that could not be decoded.
    pub rejected: usize,
    /// Decoded events the store refused (constraint or ordering violations).
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

struct Fields<'a> {
    table: &'a str,
    row: &'a Value,
}

impl Fields<'_> {
    fn required(&self, field: &'static str) -> Result<String, DecodeError> {
        str_any(self.row, &[field]).ok_or_else(|| DecodeError::MissingField {
            table: self.table.to_string(),
            field,
        })
    }

    fn text(&self, keys: &[&str]) -> Option<String> {
        str_any(self.row, keys)
    }

    fn int(&self, keys: &[&str]) -> Option<i64> {
        i64_any(self.row, keys)
    }

    fn pending(&self) -> bool {
        bool_any(self.row, &["pending_sync"]).unwrap_or(false)
    }

    /// Parse an enum-like field; a present but unrecognized value is an error.
    fn parsed<T>(
        &self,
        field: &'static str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, DecodeError> {
        match str_any(self.row, &[field]) {
            None => Ok(None),
            Some(raw) => parse(&raw).map(Some).ok_or(DecodeError::InvalidValue {
                table: self.table.to_string(),
                field,
                value: raw,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a `{ "table": ..., "row": { ... } }` relay event.
pub fn decode_event(event: &Value) -> Result<InboundRow, DecodeError> {
    let table = event
        .get("table")
        .and_then(Value::as_str)
        .ok_or(DecodeError::NotAnObject)?;
    let row = event.get("row").ok_or(DecodeError::NotAnObject)?;
    decode_row(table, row)
}

pub fn decode_row(table: &str, row: &Value) -> Result<InboundRow, DecodeError> {
    if !row.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let table = snake_case(table);
    let f = Fields { table: &table, row };

    let decoded = match table.as_str() {
        "orders" => InboundRow::Order(InboundOrder {
            id: f.required("id")?,
            order_number: f.int(&["order_number"]),
            status: f.parsed("status", OrderStatus::parse)?,
            total_cents: f.int(&["total_cents"]),
            opened_at: f.text(&["opened_at", "created_at"]),
            closed_at: f.text(&["closed_at"]),
            unit_id: f.text(&["unit_id"]),
            terminal_id: f.text(&["terminal_id"]),
            notes: f.text(&["notes"]),
            pending_sync: f.pending(),
        }),
        "order_items" => InboundRow::OrderItem(InboundItem {
            id: f.required("id")?,
            order_id: f.required("order_id")?,
            product_id: f.text(&["product_id"]),
            category_id: f.text(&["category_id"]),
            quantity: f.int(&["quantity", "qty"]),
            unit_price_cents: f.int(&["unit_price_cents", "price_cents"]),
            notes: f.text(&["notes"]),
            pending_sync: f.pending(),
        }),
        "payments" => InboundRow::Payment(InboundPayment {
            id: f.required("id")?,
            order_id: f.required("order_id")?,
            method: f.parsed("method", PaymentMethod::parse)?,
            amount_cents: f.int(&["amount_cents"]),
            change_cents: f.int(&["change_cents"]),
            authorization_code: f.text(&["authorization_code"]),
            created_at: f.text(&["created_at"]),
            pending_sync: f.pending(),
        }),
        "kds_tickets" => InboundRow::Ticket(InboundTicket {
            id: f.required("id")?,
            order_id: f.required("order_id")?,
            kitchen_id: f.text(&["kitchen_id"]),
            station: f.text(&["station"]),
            status: f.parsed("status", TicketStatus::parse)?,
            created_at: f.text(&["created_at"]),
            acknowledged_at: f.text(&["acknowledged_at"]),
            pending_sync: f.pending(),
        }),
        "kds_phase_times" => InboundRow::PhaseTimes {
            order_id: f.required("order_id")?,
            patch: PhasePatch {
                new_start: f.text(&["new_start"]),
                preparing_start: f.text(&["preparing_start"]),
                ready_at: f.text(&["ready_at"]),
                delivered_at: f.text(&["delivered_at"]),
            },
            pending_sync: f.pending(),
        },
        "kds_unit_states" => {
            let status = f
                .parsed("status", UnitStatus::parse)?
                .ok_or(DecodeError::MissingField {
                    table: table.clone(),
                    field: "status",
                })?;
            InboundRow::UnitState {
                update: UnitStateUpdate {
                    order_id: f.required("order_id")?,
                    order_item_id: f.required("order_item_id")?,
                    production_unit_id: f.required("production_unit_id")?,
                    operator_name: f.text(&["operator_name"]),
                    status,
                    completed_checklist: string_list_any(row, &["completed_checklist"]),
                    completed_at: f.text(&["completed_at"]),
                    delivered_at: f.text(&["delivered_at"]),
                },
                pending_sync: f.pending(),
            }
        }
        "cash_sessions" => InboundRow::CashSession(InboundCashSession {
            id: f.required("id")?,
            terminal_id: f.text(&["terminal_id"]),
            opening_operator: f.text(&["opening_operator"]),
            closing_operator: f.text(&["closing_operator"]),
            opening_cents: f.int(&["opening_cents"]),
            closing_cents: f.int(&["closing_cents"]),
            opened_at: f.text(&["opened_at"]),
            closed_at: f.text(&["closed_at"]),
            pending_sync: f.pending(),
        }),
        "cash_movements" => InboundRow::CashMovement(InboundCashMovement {
            id: f.required("id")?,
            session_id: f.required("session_id")?,
            kind: f.parsed("kind", MovementKind::parse)?,
            reason: f.text(&["reason"]),
            amount_cents: f.int(&["amount_cents"]),
            created_at: f.text(&["created_at"]),
            pending_sync: f.pending(),
        }),
        "tombstone" | "tombstones" => InboundRow::Tombstone(Tombstone {
            table_name: snake_case(&f.required("table_name")?),
            id: f.required("id")?,
        }),
        _ => return Err(DecodeError::UnknownTable(table.clone())),
    };
    Ok(decoded)
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// How one relayed column merges into the stored row.
enum Merge<'a> {
    /// A non-null incoming value replaces the stored one.
    Incoming(&'static str, &'a dyn ToSql),
    /// Set once: the stored value wins when present.
    Keep(&'static str, &'a dyn ToSql),
}

/// Merge relayed columns into an existing row keyed by `id`. Bumps the
/// version and can raise `pending_sync`, never clear it.
fn merge_existing(
    conn: &Connection,
    table: &str,
    id: &str,
    columns: &[Merge<'_>],
    pending: bool,
) -> StoreResult<()> {
    let now = now_ts();
    let mut values: Vec<&dyn ToSql> = vec![&id];
    let mut sets = Vec::with_capacity(columns.len() + 3);
    for column in columns {
        let n = values.len() + 1;
        let (sql, value) = match column {
            Merge::Incoming(name, value) => (format!("{name} = COALESCE(?{n}, {name})"), *value),
            Merge::Keep(name, value) => (format!("{name} = COALESCE({name}, ?{n})"), *value),
        };
        sets.push(sql);
        values.push(value);
    }
    sets.push(format!("updated_at = ?{}", values.len() + 1));
    values.push(&now);
    sets.push(format!("pending_sync = MAX(pending_sync, ?{})", values.len() + 1));
    values.push(&pending);
    sets.push("version = version + 1".to_string());

    conn.execute(
        &format!("UPDATE {table} SET {} WHERE id = ?1", sets.join(", ")),
        values.as_slice(),
    )?;
    Ok(())
}

/// Insert a placeholder open order so a child row is never dropped.
fn ensure_parent_order(conn: &Connection, order_id: &str) -> StoreResult<()> {
    let now = now_ts();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO orders (
            id, status, total_cents, opened_at, updated_at, version, pending_sync
        ) VALUES (?1, 'open', 0, ?2, ?2, 1, 0)",
        params![order_id, now],
    )?;
    if inserted > 0 {
        debug!(order_id = %order_id, "Created stub parent order for relayed row");
    }
    Ok(())
}

/// Total from local items, without marking the order as owed to the cloud.
fn refresh_total(conn: &Connection, order_id: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE orders SET
            total_cents = (
                SELECT COALESCE(SUM(quantity * unit_price_cents), 0)
                FROM order_items WHERE order_id = ?1
            ),
            updated_at = ?2,
            version = version + 1
         WHERE id = ?1",
        params![order_id, now_ts()],
    )?;
    Ok(())
}

fn apply_order(conn: &Connection, r: &InboundOrder) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO orders (
            id, order_number, status, total_cents, opened_at, closed_at, unit_id,
            terminal_id, notes, updated_at, version, pending_sync
        ) VALUES (?1, ?2, COALESCE(?3, 'open'), COALESCE(?4, 0), COALESCE(?5, ?10), ?6, ?7,
                  ?8, ?9, ?10, 1, ?11)
        ON CONFLICT(id) DO UPDATE SET
            order_number = COALESCE(orders.order_number, ?2),
            status = CASE
                WHEN orders.status = 'open' AND ?3 IS NOT NULL THEN ?3
                ELSE orders.status
            END,
            total_cents = CASE
                WHEN EXISTS (SELECT 1 FROM order_items WHERE order_id = orders.id)
                    THEN orders.total_cents
                ELSE COALESCE(?4, orders.total_cents)
            END,
            closed_at = COALESCE(orders.closed_at, ?6),
            unit_id = COALESCE(?7, orders.unit_id),
            terminal_id = COALESCE(?8, orders.terminal_id),
            notes = COALESCE(?9, orders.notes),
            updated_at = ?10,
            version = orders.version + 1,
            pending_sync = MAX(orders.pending_sync, ?11)",
        params![
            r.id,
            r.order_number,
            r.status.map(|s| s.as_str()),
            r.total_cents,
            r.opened_at,
            r.closed_at,
            r.unit_id,
            r.terminal_id,
            r.notes,
            now_ts(),
            r.pending_sync,
        ],
    )?;
    Ok(())
}

fn apply_item(conn: &Connection, r: &InboundItem) -> StoreResult<()> {
    ensure_parent_order(conn, &r.order_id)?;
    let now = now_ts();

    if orders::get_item(conn, &r.id)?.is_some() {
        merge_existing(
            conn,
            "order_items",
            &r.id,
            &[
                Merge::Incoming("product_id", &r.product_id),
                Merge::Incoming("category_id", &r.category_id),
                Merge::Incoming("quantity", &r.quantity),
                Merge::Incoming("unit_price_cents", &r.unit_price_cents),
                Merge::Incoming("notes", &r.notes),
            ],
            r.pending_sync,
        )?;
    } else {
        let (Some(product_id), Some(quantity), Some(price)) =
            (&r.product_id, r.quantity, r.unit_price_cents)
        else {
            return Err(StoreError::invalid(format!(
                "relayed item {} lacks product, quantity or price",
                r.id
            )));
        };
        conn.execute(
            "INSERT INTO order_items (
                id, order_id, product_id, category_id, quantity, unit_price_cents,
                notes, updated_at, version, pending_sync
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
            params![
                r.id,
                r.order_id,
                product_id,
                r.category_id,
                quantity,
                price,
                r.notes,
                now,
                r.pending_sync,
            ],
        )?;
    }

    refresh_total(conn, &r.order_id)
}

fn apply_payment(conn: &Connection, r: &InboundPayment) -> StoreResult<()> {
    ensure_parent_order(conn, &r.order_id)?;
    let now = now_ts();

    if orders::get_payment(conn, &r.id)?.is_some() {
        let method = r.method.map(|m| m.as_str());
        return merge_existing(
            conn,
            "payments",
            &r.id,
            &[
                Merge::Incoming("method", &method),
                Merge::Incoming("amount_cents", &r.amount_cents),
                Merge::Incoming("change_cents", &r.change_cents),
                Merge::Incoming("authorization_code", &r.authorization_code),
            ],
            r.pending_sync,
        );
    }

    let (Some(method), Some(amount)) = (r.method, r.amount_cents) else {
        return Err(StoreError::invalid(format!(
            "relayed payment {} lacks method or amount",
            r.id
        )));
    };
    conn.execute(
        "INSERT INTO payments (
            id, order_id, method, amount_cents, change_cents, authorization_code,
            created_at, updated_at, version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, ?8), ?8, 1, ?9)",
        params![
            r.id,
            r.order_id,
            method.as_str(),
            amount,
            r.change_cents.unwrap_or(0),
            r.authorization_code,
            r.created_at,
            now,
            r.pending_sync,
        ],
    )?;
    Ok(())
}

fn apply_ticket(conn: &Connection, r: &InboundTicket) -> StoreResult<()> {
    ensure_parent_order(conn, &r.order_id)?;

    // The same (order, kitchen) may have been ticketed locally under another id.
    let existing = match kds::get_ticket(conn, &r.id)? {
        Some(t) => Some(t),
        None => kds::list_tickets(conn, &r.order_id)?
            .into_iter()
            .find(|t| t.kitchen_id == r.kitchen_id),
    };

    let now = now_ts();
    match existing {
        Some(current) => {
            let status = match r.status {
                Some(incoming) if incoming > current.status => incoming,
                _ => current.status,
            };
            conn.execute(
                "UPDATE kds_tickets SET
                    station = COALESCE(?2, station),
                    status = ?3,
                    acknowledged_at = COALESCE(acknowledged_at, ?4),
                    updated_at = ?5,
                    version = version + 1,
                    pending_sync = MAX(pending_sync, ?6)
                 WHERE id = ?1",
                params![
                    current.id,
                    r.station,
                    status.as_str(),
                    r.acknowledged_at,
                    now,
                    r.pending_sync,
                ],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO kds_tickets (
                    id, order_id, kitchen_id, station, status, created_at, acknowledged_at,
                    updated_at, version, pending_sync
                ) VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, ?8), ?7, ?8, 1, ?9)",
                params![
                    r.id,
                    r.order_id,
                    r.kitchen_id,
                    r.station,
                    r.status.unwrap_or(TicketStatus::Queued).as_str(),
                    r.created_at,
                    r.acknowledged_at,
                    now,
                    r.pending_sync,
                ],
            )?;
        }
    }
    Ok(())
}

fn apply_cash_session(conn: &Connection, r: &InboundCashSession) -> StoreResult<()> {
    let now = now_ts();
    if cash::get_session(conn, &r.id)?.is_some() {
        return merge_existing(
            conn,
            "cash_sessions",
            &r.id,
            &[
                Merge::Incoming("terminal_id", &r.terminal_id),
                Merge::Incoming("opening_operator", &r.opening_operator),
                Merge::Incoming("closing_operator", &r.closing_operator),
                Merge::Incoming("opening_cents", &r.opening_cents),
                Merge::Incoming("closing_cents", &r.closing_cents),
                Merge::Incoming("opened_at", &r.opened_at),
                Merge::Keep("closed_at", &r.closed_at),
            ],
            r.pending_sync,
        );
    }

    let (Some(terminal_id), Some(operator)) = (&r.terminal_id, &r.opening_operator) else {
        return Err(StoreError::invalid(format!(
            "relayed cash session {} lacks terminal or operator",
            r.id
        )));
    };
    conn.execute(
        "INSERT INTO cash_sessions (
            id, terminal_id, opening_operator, closing_operator, opening_cents,
            closing_cents, opened_at, closed_at, updated_at, version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, ?9), ?8, ?9, 1, ?10)",
        params![
            r.id,
            terminal_id,
            operator,
            r.closing_operator,
            r.opening_cents.unwrap_or(0),
            r.closing_cents,
            r.opened_at,
            r.closed_at,
            now,
            r.pending_sync,
        ],
    )?;
    Ok(())
}

fn apply_cash_movement(conn: &Connection, r: &InboundCashMovement) -> StoreResult<()> {
    let now = now_ts();
    if cash::get_movement(conn, &r.id)?.is_some() {
        let kind = r.kind.map(|k| k.as_str());
        return merge_existing(
            conn,
            "cash_movements",
            &r.id,
            &[
                Merge::Incoming("kind", &kind),
                Merge::Incoming("reason", &r.reason),
                Merge::Incoming("amount_cents", &r.amount_cents),
            ],
            r.pending_sync,
        );
    }

    let (Some(kind), Some(amount)) = (r.kind, r.amount_cents) else {
        return Err(StoreError::invalid(format!(
            "relayed cash movement {} lacks kind or amount",
            r.id
        )));
    };

    // Stub sessions get a terminal key of their own so they never collide
    // with a real open session; the real row fills them in later.
    conn.execute(
        "INSERT OR IGNORE INTO cash_sessions (
            id, terminal_id, opening_operator, opening_cents, opened_at, updated_at,
            version, pending_sync
        ) VALUES (?1, 'relay:' || ?1, '', 0, ?2, ?2, 1, 0)",
        params![r.session_id, now],
    )?;

    conn.execute(
        "INSERT INTO cash_movements (
            id, session_id, kind, reason, amount_cents, created_at, updated_at,
            version, pending_sync
        ) VALUES (?1, ?2, ?3, COALESCE(?4, ''), ?5, COALESCE(?6, ?7), ?7, 1, ?8)",
        params![
            r.id,
            r.session_id,
            kind.as_str(),
            r.reason,
            amount,
            r.created_at,
            now,
            r.pending_sync,
        ],
    )?;
    Ok(())
}

fn apply_tombstone(conn: &Connection, t: &Tombstone) -> StoreResult<()> {
    if t.table_name != "order_items" {
        debug!(table = %t.table_name, id = %t.id, "Ignoring relayed delete for unsupported table");
        return Ok(());
    }
    // Unit rows go with their item, even when the item itself never arrived.
    conn.execute(
        "DELETE FROM kds_unit_states WHERE order_item_id = ?1",
        params![t.id],
    )?;
    let Some(item) = orders::get_item(conn, &t.id)? else {
        return Ok(());
    };
    conn.execute("DELETE FROM order_items WHERE id = ?1", params![t.id])?;
    refresh_total(conn, &item.order_id)
}

/// Merge one decoded row. Must run inside a transaction.
pub fn apply_row(conn: &Connection, row: &InboundRow) -> StoreResult<()> {
    match row {
        InboundRow::Order(r) => apply_order(conn, r),
        InboundRow::OrderItem(r) => apply_item(conn, r),
        InboundRow::Payment(r) => apply_payment(conn, r),
        InboundRow::Ticket(r) => apply_ticket(conn, r),
        InboundRow::PhaseTimes {
            order_id,
            patch,
            pending_sync,
        } => {
            ensure_parent_order(conn, order_id)?;
            kds::merge_phase_times(conn, order_id, patch, *pending_sync).map(|_| ())
        }
        InboundRow::UnitState {
            update,
            pending_sync,
        } => {
            ensure_parent_order(conn, &update.order_id)?;
            kds::upsert_unit_state(conn, update, *pending_sync).map(|_| ())
        }
        InboundRow::CashSession(r) => apply_cash_session(conn, r),
        InboundRow::CashMovement(r) => apply_cash_movement(conn, r),
        InboundRow::Tombstone(t) => apply_tombstone(conn, t),
    }
}

/// Decode and merge a batch of relay events, one transaction per event.
///
/// Bad events are counted and skipped. Only a closed or poisoned store
/// aborts the batch.
pub fn apply_events(db: &DbState, events: &[Value]) -> StoreResult<InboundReport> {
    let mut report = InboundReport::default();

    for event in events {
        let row = match decode_event(event) {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "Rejected relay event");
                report.rejected += 1;
                continue;
            }
        };

        match db.with_transaction(|tx| apply_row(tx, &row)) {
            Ok(()) => report.applied += 1,
            Err(e @ (StoreError::Closed | StoreError::LockPoisoned)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "Relay event could not be merged");
                report.failed += 1;
            }
        }
    }

    if report.applied + report.rejected + report.failed > 0 {
        debug!(
            applied = report.applied,
            rejected = report.rejected,
            failed = report.failed,
            "Applied relay batch"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::models::{NewOrder, NewOrderItem};
    use serde_json::json;

    fn test_db() -> DbState {
        open_in_memory().expect("open in-memory db")
    }

    #[test]
    fn test_decode_accepts_camel_case() {
        let row = decode_event(&json!({
            "table": "orderItems",
            "row": {
                "id": "it-1",
                "orderId": "ord-1",
                "productId": "p-1",
                "quantity": "2",
                "unitPriceCents": 450,
                "pendingSync": 1
            }
        }))
        .unwrap();
        let InboundRow::OrderItem(item) = row else {
            panic!("expected an order item");
        };
        assert_eq!(item.order_id, "ord-1");
        assert_eq!(item.quantity, Some(2));
        assert_eq!(item.unit_price_cents, Some(450));
        assert!(item.pending_sync);
    }

    #[test]
    fn test_decode_rejects_at_the_boundary() {
        assert_eq!(
            decode_event(&json!({"table": "loyalty", "row": {"id": "x"}})),
            Err(DecodeError::UnknownTable("loyalty".into()))
        );
        assert_eq!(
            decode_event(&json!({"table": "payments", "row": {"id": "pay-1"}})),
            Err(DecodeError::MissingField {
                table: "payments".into(),
                field: "order_id"
            })
        );
        assert!(matches!(
            decode_event(&json!({"table": "orders", "row": {"id": "o", "status": "lost"}})),
            Err(DecodeError::InvalidValue { field: "status", .. })
        ));
        assert_eq!(
            decode_event(&json!(["not", "an", "event"])),
            Err(DecodeError::NotAnObject)
        );
    }

    #[test]
    fn test_null_and_blank_never_clobber() {
        let db = test_db();
        db.with_transaction(|tx| {
            orders::insert_order(
                tx,
                "ord-1",
                Some("t1"),
                &NewOrder {
                    unit_id: Some("u1".into()),
                    notes: Some("window table".into()),
                },
            )?;
            Ok(())
        })
        .unwrap();

        let report = apply_events(
            &db,
            &[json!({
                "table": "orders",
                "row": { "id": "ord-1", "notes": "   ", "unitId": null, "terminalId": "t2" }
            })],
        )
        .unwrap();
        assert_eq!(report.applied, 1);

        let order = db.with_conn(|c| orders::require_order(c, "ord-1")).unwrap();
        assert_eq!(order.notes.as_deref(), Some("window table"));
        assert_eq!(order.unit_id.as_deref(), Some("u1"));
        assert_eq!(order.terminal_id.as_deref(), Some("t2"));
    }

    #[test]
    fn test_relayed_row_keeps_local_pending_flag() {
        let db = test_db();
        db.with_transaction(|tx| {
            orders::insert_order(tx, "ord-1", Some("t1"), &NewOrder::default())?;
            Ok(())
        })
        .unwrap();

        apply_events(
            &db,
            &[json!({"table": "orders", "row": {"id": "ord-1", "notes": "x"}})],
        )
        .unwrap();

        let order = db.with_conn(|c| orders::require_order(c, "ord-1")).unwrap();
        assert_eq!(order.notes.as_deref(), Some("x"));
        assert!(order.pending_sync);
        assert_eq!(
            db.with_conn(|c| Ok(crate::accounting::queue_size(c))).unwrap(),
            1
        );
    }

    #[test]
    fn test_relayed_total_yields_to_local_items() {
        let db = test_db();
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
                    unit_price_cents: 300,
                    notes: None,
                },
            )?;
            orders::recompute_total(tx, "ord-1")?;
            Ok(())
        })
        .unwrap();

        apply_events(
            &db,
            &[
                json!({"table": "orders", "row": {"id": "ord-1", "totalCents": 99_999}}),
                json!({"table": "orders", "row": {"id": "ord-2", "totalCents": 1_250}}),
            ],
        )
        .unwrap();

        db.with_conn(|c| {
            assert_eq!(orders::require_order(c, "ord-1")?.total_cents, 600);
            assert_eq!(orders::require_order(c, "ord-2")?.total_cents, 1_250);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_order_status_is_forward_only() {
        let db = test_db();
        db.with_transaction(|tx| {
            orders::insert_order(tx, "ord-1", None, &NewOrder::default())?;
            orders::finish_order(tx, "ord-1", OrderStatus::Closed)?;
            Ok(())
        })
        .unwrap();

        apply_events(
            &db,
            &[json!({"table": "orders", "row": {"id": "ord-1", "status": "open"}})],
        )
        .unwrap();
        let order = db.with_conn(|c| orders::require_order(c, "ord-1")).unwrap();
        assert_eq!(order.status, OrderStatus::Closed);
    }

    #[test]
    fn test_ticket_status_is_monotonic() {
        let db = test_db();
        apply_events(
            &db,
            &[
                json!({"table": "kds_tickets", "row": {
                    "id": "tk-1", "order_id": "ord-1", "kitchen_id": "K1", "status": "ready"
                }}),
                json!({"table": "kds_tickets", "row": {
                    "id": "tk-1", "order_id": "ord-1", "kitchen_id": "K1", "status": "queued"
                }}),
            ],
        )
        .unwrap();
        let ticket = db.with_conn(|c| kds::require_ticket(c, "tk-1")).unwrap();
        assert_eq!(ticket.status, TicketStatus::Ready);
    }

    #[test]
    fn test_relayed_ticket_merges_with_local_ticket_for_same_kitchen() {
        let db = test_db();
        db.with_transaction(|tx| {
            orders::insert_order(tx, "ord-1", None, &NewOrder::default())?;
            kds::insert_ticket_if_absent(tx, "local-tk", "ord-1", Some("K1"), None)?;
            Ok(())
        })
        .unwrap();

        apply_events(
            &db,
            &[json!({"table": "kds_tickets", "row": {
                "id": "remote-tk", "orderId": "ord-1", "kitchenId": "K1", "status": "prep"
            }})],
        )
        .unwrap();

        let tickets = db.with_conn(|c| kds::list_tickets(c, "ord-1")).unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].id, "local-tk");
        assert_eq!(tickets[0].status, TicketStatus::Prep);
    }

    #[test]
    fn test_orphan_item_gets_stub_parent_and_total() {
        let db = test_db();
        let report = apply_events(
            &db,
            &[json!({"table": "order_items", "row": {
                "id": "it-1", "order_id": "ord-x", "product_id": "p",
                "quantity": 3, "unit_price_cents": 250
            }})],
        )
        .unwrap();
        assert_eq!(report.applied, 1);

        let order = db.with_conn(|c| orders::require_order(c, "ord-x")).unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.total_cents, 750);
        assert!(!order.pending_sync);
    }

    #[test]
    fn test_tombstone_removes_item() {
        let db = test_db();
        db.with_transaction(|tx| {
            orders::insert_order(tx, "ord-1", None, &NewOrder::default())?;
            orders::insert_item(
                tx,
                "it-1",
                "ord-1",
                &NewOrderItem {
                    product_id: "p".into(),
                    category_id: None,
                    quantity: 1,
                    unit_price_cents: 900,
                    notes: None,
                },
            )?;
            Ok(())
        })
        .unwrap();

        apply_events(
            &db,
            &[json!({"table": "tombstone", "row": {"table_name": "order_items", "id": "it-1"}})],
        )
        .unwrap();

        db.with_conn(|c| {
            assert!(orders::get_item(c, "it-1")?.is_none());
            assert_eq!(orders::require_order(c, "ord-1")?.total_cents, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_item_tombstone_sweeps_unit_states_without_the_item() {
        let db = test_db();
        apply_events(
            &db,
            &[json!({"table": "kds_unit_states", "row": {
                "orderId": "ord-1", "orderItemId": "it-9", "productionUnitId": "u-1",
                "status": "preparing"
            }})],
        )
        .unwrap();
        assert!(db
            .with_conn(|c| kds::get_unit_state(c, "ord-1", "it-9", "u-1"))
            .unwrap()
            .is_some());

        apply_events(
            &db,
            &[json!({"table": "tombstone", "row": {"table_name": "order_items", "id": "it-9"}})],
        )
        .unwrap();
        assert!(db
            .with_conn(|c| kds::get_unit_state(c, "ord-1", "it-9", "u-1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bad_events_are_counted_not_fatal() {
        let db = test_db();
        let report = apply_events(
            &db,
            &[
                json!({"table": "unknown", "row": {}}),
                json!({"table": "payments", "row": {"id": "pay-1", "order_id": "o"}}),
                json!({"table": "orders", "row": {"id": "ord-2"}}),
            ],
        )
        .unwrap();
        assert_eq!(
            report,
            InboundReport {
                applied: 1,
                rejected: 1,
                failed: 1
            }
        );
    }
}
