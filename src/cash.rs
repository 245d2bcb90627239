//! Cash session and cash movement persistence.
//!
//! A terminal has at most one open session at a time (enforced by a partial
//! unique index as well as here). Movements can only be appended while their
//! session is open.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::now_ts;
use crate::error::{StoreError, StoreResult};
use crate::models::{CashMovement, CashSession, MovementKind};

const SESSION_COLUMNS: &str = "id, terminal_id, opening_operator, closing_operator, opening_cents,
     closing_cents, opened_at, closed_at, updated_at, version, pending_sync";

const MOVEMENT_COLUMNS: &str =
    "id, session_id, kind, reason, amount_cents, created_at, updated_at, version, pending_sync";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<CashSession> {
    Ok(CashSession {
        id: row.get(0)?,
        terminal_id: row.get(1)?,
        opening_operator: row.get(2)?,
        closing_operator: row.get(3)?,
        opening_cents: row.get(4)?,
        closing_cents: row.get(5)?,
        opened_at: row.get(6)?,
        closed_at: row.get(7)?,
        updated_at: row.get(8)?,
        version: row.get(9)?,
        pending_sync: row.get(10)?,
    })
}

fn movement_from_row(row: &Row<'_>) -> rusqlite::Result<CashMovement> {
    let kind: String = row.get(2)?;
    Ok(CashMovement {
        id: row.get(0)?,
        session_id: row.get(1)?,
        kind: MovementKind::parse(&kind).unwrap_or(MovementKind::In),
        reason: row.get(3)?,
        amount_cents: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        version: row.get(7)?,
        pending_sync: row.get(8)?,
    })
}

pub fn get_session(conn: &Connection, id: &str) -> StoreResult<Option<CashSession>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM cash_sessions WHERE id = ?1"),
            params![id],
            session_from_row,
        )
        .optional()?)
}

/// The open session of a terminal, if any.
pub fn active_session(conn: &Connection, terminal_id: &str) -> StoreResult<Option<CashSession>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM cash_sessions
                 WHERE terminal_id = ?1 AND closed_at IS NULL"
            ),
            params![terminal_id],
            session_from_row,
        )
        .optional()?)
}

/// Open a session. Fails if the terminal already has one open.
pub fn open_session(
    conn: &Connection,
    id: &str,
    terminal_id: &str,
    operator: &str,
    opening_cents: i64,
) -> StoreResult<CashSession> {
    if opening_cents < 0 {
        return Err(StoreError::invalid("opening amount cannot be negative"));
    }
    if let Some(existing) = active_session(conn, terminal_id)? {
        return Err(StoreError::invalid(format!(
            "terminal {terminal_id} already has an open cash session ({})",
            existing.id
        )));
    }

    let now = now_ts();
    conn.execute(
        "INSERT INTO cash_sessions (
            id, terminal_id, opening_operator, opening_cents, opened_at,
            updated_at, version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1, 1)",
        params![id, terminal_id, operator, opening_cents, now],
    )?;
    get_session(conn, id)?.ok_or_else(|| StoreError::not_found("cash session", id))
}

pub fn close_session(
    conn: &Connection,
    id: &str,
    operator: &str,
    closing_cents: i64,
) -> StoreResult<CashSession> {
    let session = get_session(conn, id)?.ok_or_else(|| StoreError::not_found("cash session", id))?;
    if session.closed_at.is_some() {
        return Err(StoreError::invalid(format!("cash session {id} is already closed")));
    }

    let now = now_ts();
    conn.execute(
        "UPDATE cash_sessions SET
            closing_operator = ?2,
            closing_cents = ?3,
            closed_at = ?4,
            updated_at = ?4,
            version = version + 1,
            pending_sync = 1
         WHERE id = ?1",
        params![id, operator, closing_cents, now],
    )?;
    get_session(conn, id)?.ok_or_else(|| StoreError::not_found("cash session", id))
}

pub fn insert_movement(
    conn: &Connection,
    id: &str,
    session_id: &str,
    kind: MovementKind,
    reason: &str,
    amount_cents: i64,
) -> StoreResult<CashMovement> {
    if amount_cents <= 0 {
        return Err(StoreError::invalid("movement amount must be positive"));
    }
    let session = get_session(conn, session_id)?
        .ok_or_else(|| StoreError::not_found("cash session", session_id))?;
    if session.closed_at.is_some() {
        return Err(StoreError::invalid(format!(
            "cash session {session_id} is closed"
        )));
    }

    let now = now_ts();
    conn.execute(
        "INSERT INTO cash_movements (
            id, session_id, kind, reason, amount_cents, created_at, updated_at,
            version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1, 1)",
        params![id, session_id, kind.as_str(), reason, amount_cents, now],
    )?;
    get_movement(conn, id)?.ok_or_else(|| StoreError::not_found("cash movement", id))
}

pub fn get_movement(conn: &Connection, id: &str) -> StoreResult<Option<CashMovement>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MOVEMENT_COLUMNS} FROM cash_movements WHERE id = ?1"),
            params![id],
            movement_from_row,
        )
        .optional()?)
}

pub fn list_movements(conn: &Connection, session_id: &str) -> StoreResult<Vec<CashMovement>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MOVEMENT_COLUMNS} FROM cash_movements WHERE session_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map(params![session_id], movement_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Expected drawer balance: opening amount plus ins minus outs.
pub fn expected_balance(conn: &Connection, session_id: &str) -> StoreResult<i64> {
    let session = get_session(conn, session_id)?
        .ok_or_else(|| StoreError::not_found("cash session", session_id))?;
    let net: i64 = conn.query_row(
        "SELECT COALESCE(SUM(CASE kind WHEN 'in' THEN amount_cents ELSE -amount_cents END), 0)
         FROM cash_movements WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    Ok(session.opening_cents + net)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_in_memory, DbState};

    fn test_db() -> DbState {
        open_in_memory().expect("open in-memory db")
    }

    #[test]
    fn test_session_lifecycle_and_balance() {
        let db = test_db();
        db.with_transaction(|tx| {
            let session = open_session(tx, "cs-1", "t1", "ana", 10_000)?;
            assert!(session.pending_sync);
            assert!(active_session(tx, "t1")?.is_some());

            insert_movement(tx, "mv-1", "cs-1", MovementKind::In, "change float", 5_000)?;
            insert_movement(tx, "mv-2", "cs-1", MovementKind::Out, "supplier", 2_500)?;
            assert_eq!(expected_balance(tx, "cs-1")?, 12_500);
            assert_eq!(list_movements(tx, "cs-1")?.len(), 2);

            let closed = close_session(tx, "cs-1", "bia", 12_500)?;
            assert_eq!(closed.closing_operator.as_deref(), Some("bia"));
            assert_eq!(closed.version, 2);
            assert!(active_session(tx, "t1")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_second_open_session_rejected() {
        let db = test_db();
        db.with_transaction(|tx| {
            open_session(tx, "cs-1", "t1", "ana", 0)?;
            let err = open_session(tx, "cs-2", "t1", "bia", 0).unwrap_err();
            assert!(matches!(err, StoreError::InvalidState(_)));

            // A different terminal is independent.
            open_session(tx, "cs-3", "t2", "caio", 0)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_movement_requires_open_session() {
        let db = test_db();
        db.with_transaction(|tx| {
            open_session(tx, "cs-1", "t1", "ana", 0)?;
            close_session(tx, "cs-1", "ana", 0)?;
            let err = insert_movement(tx, "mv-1", "cs-1", MovementKind::In, "late", 100).unwrap_err();
            assert!(matches!(err, StoreError::InvalidState(_)));

            let err = close_session(tx, "cs-1", "ana", 0).unwrap_err();
            assert!(matches!(err, StoreError::InvalidState(_)));
            Ok(())
        })
        .unwrap();
    }
}
