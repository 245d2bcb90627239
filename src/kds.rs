//! Kitchen display persistence: tickets, the per-order phase timeline and
//! per-unit production state.
//!
//! Two merge rules live here and are intentionally different:
//! - phase timestamps are first-write-wins (a stored value is never replaced);
//! - unit state fields take any non-null incoming value, while `status`
//!   always takes the latest write.
//!
//! A merge can raise `pending_sync` but never clear it; only a cloud
//! acknowledgment does that.

use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::db::now_ts;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    KitchenTicket, PhasePatch, PhaseTimeline, TicketStatus, TicketUnitState, UnitStateUpdate,
    UnitStatus,
};

const TICKET_COLUMNS: &str = "id, order_id, kitchen_id, station, status, created_at,
     acknowledged_at, updated_at, version, pending_sync";

const PHASE_COLUMNS: &str = "order_id, new_start, preparing_start, ready_at, delivered_at,
     updated_at, version, pending_sync";

const UNIT_COLUMNS: &str = "u.order_id, u.order_item_id, u.production_unit_id, u.operator_name,
     u.status, u.completed_checklist, u.completed_at, u.delivered_at, u.updated_at,
     u.version, u.pending_sync";

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<KitchenTicket> {
    let status: String = row.get(4)?;
    Ok(KitchenTicket {
        id: row.get(0)?,
        order_id: row.get(1)?,
        kitchen_id: row.get(2)?,
        station: row.get(3)?,
        status: TicketStatus::parse(&status).unwrap_or(TicketStatus::Queued),
        created_at: row.get(5)?,
        acknowledged_at: row.get(6)?,
        updated_at: row.get(7)?,
        version: row.get(8)?,
        pending_sync: row.get(9)?,
    })
}

fn phase_from_row(row: &Row<'_>) -> rusqlite::Result<PhaseTimeline> {
    Ok(PhaseTimeline {
        order_id: row.get(0)?,
        new_start: row.get(1)?,
        preparing_start: row.get(2)?,
        ready_at: row.get(3)?,
        delivered_at: row.get(4)?,
        updated_at: row.get(5)?,
        version: row.get(6)?,
        pending_sync: row.get(7)?,
    })
}

fn unit_from_row(row: &Row<'_>) -> rusqlite::Result<TicketUnitState> {
    let status: String = row.get(4)?;
    let checklist: String = row.get(5)?;
    Ok(TicketUnitState {
        order_id: row.get(0)?,
        order_item_id: row.get(1)?,
        production_unit_id: row.get(2)?,
        operator_name: row.get(3)?,
        status: UnitStatus::parse(&status).unwrap_or(UnitStatus::Pending),
        completed_checklist: serde_json::from_str(&checklist).unwrap_or_default(),
        completed_at: row.get(6)?,
        delivered_at: row.get(7)?,
        updated_at: row.get(8)?,
        version: row.get(9)?,
        pending_sync: row.get(10)?,
    })
}

// ---------------------------------------------------------------------------
// Tickets
// ---------------------------------------------------------------------------

pub fn get_ticket(conn: &Connection, id: &str) -> StoreResult<Option<KitchenTicket>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM kds_tickets WHERE id = ?1"),
            params![id],
            ticket_from_row,
        )
        .optional()?)
}

pub fn require_ticket(conn: &Connection, id: &str) -> StoreResult<KitchenTicket> {
    get_ticket(conn, id)?.ok_or_else(|| StoreError::not_found("kitchen ticket", id))
}

pub fn list_tickets(conn: &Connection, order_id: &str) -> StoreResult<Vec<KitchenTicket>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TICKET_COLUMNS} FROM kds_tickets WHERE order_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map(params![order_id], ticket_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert a queued ticket unless one already exists for (order, kitchen).
/// Returns the new ticket, or `None` when the pair was already ticketed.
pub fn insert_ticket_if_absent(
    conn: &Connection,
    id: &str,
    order_id: &str,
    kitchen_id: Option<&str>,
    station: Option<&str>,
) -> StoreResult<Option<KitchenTicket>> {
    let now = now_ts();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO kds_tickets (
            id, order_id, kitchen_id, station, status, created_at, updated_at,
            version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?5, 1, 1)",
        params![id, order_id, kitchen_id, station, now],
    )?;
    if inserted == 0 {
        return Ok(None);
    }
    get_ticket(conn, id)
}

/// Move a ticket exactly one step forward, as driven by a kitchen display.
/// Entering `prep` or `ready` stamps the matching phase timestamp.
pub fn advance_ticket(conn: &Connection, id: &str, to: TicketStatus) -> StoreResult<KitchenTicket> {
    let ticket = require_ticket(conn, id)?;
    if ticket.status.next() != Some(to) {
        return Err(StoreError::invalid(format!(
            "ticket {id} cannot move from {} to {}",
            ticket.status.as_str(),
            to.as_str()
        )));
    }

    let now = now_ts();
    conn.execute(
        "UPDATE kds_tickets SET status = ?2, updated_at = ?3, version = version + 1, pending_sync = 1
         WHERE id = ?1",
        params![id, to.as_str(), now],
    )?;

    let patch = match to {
        TicketStatus::Prep => PhasePatch {
            preparing_start: Some(now.clone()),
            ..Default::default()
        },
        TicketStatus::Ready => PhasePatch {
            ready_at: Some(now.clone()),
            ..Default::default()
        },
        _ => PhasePatch::default(),
    };
    if patch != PhasePatch::default() {
        stamp_phase_times(conn, &ticket.order_id, &patch)?;
    }

    require_ticket(conn, id)
}

/// Terminal override used on order closure: every outstanding ticket of the
/// order jumps straight to `done`. Returns the tickets that changed.
pub fn force_done_for_order(conn: &Connection, order_id: &str) -> StoreResult<Vec<KitchenTicket>> {
    let outstanding: Vec<KitchenTicket> = list_tickets(conn, order_id)?
        .into_iter()
        .filter(|t| t.status != TicketStatus::Done)
        .collect();
    if outstanding.is_empty() {
        return Ok(outstanding);
    }

    let now = now_ts();
    conn.execute(
        "UPDATE kds_tickets SET status = 'done', updated_at = ?2, version = version + 1, pending_sync = 1
         WHERE order_id = ?1 AND status != 'done'",
        params![order_id, now],
    )?;
    debug!(order_id = %order_id, count = outstanding.len(), "Forced outstanding tickets to done");

    outstanding
        .iter()
        .map(|t| require_ticket(conn, &t.id))
        .collect()
}

/// Record the first read-confirmation from a kitchen display.
///
/// Returns the ticket and, only for the first acknowledgment, the hand-off
/// latency in milliseconds since the ticket was created.
pub fn acknowledge_ticket(conn: &Connection, id: &str) -> StoreResult<(KitchenTicket, Option<i64>)> {
    let now = now_ts();
    let changed = conn.execute(
        "UPDATE kds_tickets SET acknowledged_at = ?2, updated_at = ?2, version = version + 1, pending_sync = 1
         WHERE id = ?1 AND acknowledged_at IS NULL",
        params![id, now],
    )?;
    let ticket = require_ticket(conn, id)?;
    if changed == 0 {
        return Ok((ticket, None));
    }
    let latency = millis_between(&ticket.created_at, &now);
    Ok((ticket, latency))
}

fn millis_between(from: &str, to: &str) -> Option<i64> {
    let from = DateTime::parse_from_rfc3339(from).ok()?;
    let to = DateTime::parse_from_rfc3339(to).ok()?;
    Some((to - from).num_milliseconds())
}

// ---------------------------------------------------------------------------
// Phase timeline
// ---------------------------------------------------------------------------

pub fn get_phase_timeline(conn: &Connection, order_id: &str) -> StoreResult<Option<PhaseTimeline>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PHASE_COLUMNS} FROM kds_phase_times WHERE order_id = ?1"),
            params![order_id],
            phase_from_row,
        )
        .optional()?)
}

/// Fill previously-empty phase timestamps from a local write. Populated
/// fields are never overwritten. Returns the stored timeline and whether
/// anything changed.
pub fn set_phase_times(
    conn: &Connection,
    order_id: &str,
    patch: &PhasePatch,
) -> StoreResult<(PhaseTimeline, bool)> {
    merge_phase_times(conn, order_id, patch, true)
}

/// Set-once merge with an explicit pending flag (relayed rows keep the flag
/// of their origin).
pub fn merge_phase_times(
    conn: &Connection,
    order_id: &str,
    patch: &PhasePatch,
    pending: bool,
) -> StoreResult<(PhaseTimeline, bool)> {
    let existing = get_phase_timeline(conn, order_id)?;
    let current = existing.clone().unwrap_or_else(|| PhaseTimeline {
        order_id: order_id.to_string(),
        new_start: None,
        preparing_start: None,
        ready_at: None,
        delivered_at: None,
        updated_at: String::new(),
        version: 0,
        pending_sync: false,
    });

    let merged = [
        current.new_start.clone().or_else(|| non_blank(&patch.new_start)),
        current.preparing_start.clone().or_else(|| non_blank(&patch.preparing_start)),
        current.ready_at.clone().or_else(|| non_blank(&patch.ready_at)),
        current.delivered_at.clone().or_else(|| non_blank(&patch.delivered_at)),
    ];
    let unchanged = merged
        == [
            current.new_start.clone(),
            current.preparing_start.clone(),
            current.ready_at.clone(),
            current.delivered_at.clone(),
        ];
    if unchanged {
        if let Some(timeline) = existing {
            return Ok((timeline, false));
        }
    }

    validate_phase_order(&merged)?;

    let now = now_ts();
    conn.execute(
        "INSERT INTO kds_phase_times (
            order_id, new_start, preparing_start, ready_at, delivered_at,
            updated_at, version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
        ON CONFLICT(order_id) DO UPDATE SET
            new_start = COALESCE(kds_phase_times.new_start, excluded.new_start),
            preparing_start = COALESCE(kds_phase_times.preparing_start, excluded.preparing_start),
            ready_at = COALESCE(kds_phase_times.ready_at, excluded.ready_at),
            delivered_at = COALESCE(kds_phase_times.delivered_at, excluded.delivered_at),
            updated_at = excluded.updated_at,
            version = kds_phase_times.version + 1,
            pending_sync = MAX(kds_phase_times.pending_sync, excluded.pending_sync)",
        params![order_id, merged[0], merged[1], merged[2], merged[3], now, pending],
    )?;

    let timeline = get_phase_timeline(conn, order_id)?
        .ok_or_else(|| StoreError::not_found("phase timeline", order_id))?;
    Ok((timeline, true))
}

/// Stamp phases from the local clock as a side effect of another write.
///
/// Each stamp is raised to the latest populated earlier phase, so a timeline
/// relayed from a terminal whose clock runs ahead never blocks the write. A
/// stamp that would still land after a populated later phase is dropped.
pub fn stamp_phase_times(
    conn: &Connection,
    order_id: &str,
    patch: &PhasePatch,
) -> StoreResult<(PhaseTimeline, bool)> {
    let current = get_phase_timeline(conn, order_id)?;
    let stored: [Option<String>; 4] = match &current {
        Some(t) => [
            t.new_start.clone(),
            t.preparing_start.clone(),
            t.ready_at.clone(),
            t.delivered_at.clone(),
        ],
        None => Default::default(),
    };
    let incoming = [
        non_blank(&patch.new_start),
        non_blank(&patch.preparing_start),
        non_blank(&patch.ready_at),
        non_blank(&patch.delivered_at),
    ];

    let mut fitted: [Option<String>; 4] = Default::default();
    let mut floor: Option<(DateTime<chrono::FixedOffset>, String)> = None;
    for idx in 0..4 {
        if let Some(raw) = &stored[idx] {
            if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
                if floor.as_ref().map_or(true, |(f, _)| at > *f) {
                    floor = Some((at, raw.clone()));
                }
            }
            continue;
        }
        let Some(raw) = &incoming[idx] else { continue };
        let Ok(at) = DateTime::parse_from_rfc3339(raw) else { continue };
        let (at, raw) = match &floor {
            Some((f, f_raw)) if *f > at => (*f, f_raw.clone()),
            _ => (at, raw.clone()),
        };
        let ceiling = stored[idx + 1..]
            .iter()
            .flatten()
            .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .min();
        if ceiling.is_some_and(|c| c < at) {
            warn!(order_id = %order_id, phase = idx, stamp = %raw, "Skipped phase stamp behind a later phase");
            continue;
        }
        floor = Some((at, raw.clone()));
        fitted[idx] = Some(raw);
    }

    let [new_start, preparing_start, ready_at, delivered_at] = fitted;
    merge_phase_times(
        conn,
        order_id,
        &PhasePatch {
            new_start,
            preparing_start,
            ready_at,
            delivered_at,
        },
        true,
    )
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Populated phases must be non-decreasing in production order.
fn validate_phase_order(phases: &[Option<String>; 4]) -> StoreResult<()> {
    const NAMES: [&str; 4] = ["new_start", "preparing_start", "ready_at", "delivered_at"];
    let mut previous: Option<(usize, DateTime<chrono::FixedOffset>)> = None;
    for (idx, value) in phases.iter().enumerate() {
        let Some(raw) = value else { continue };
        let at = DateTime::parse_from_rfc3339(raw).map_err(|_| {
            StoreError::invalid(format!("{} is not an RFC 3339 timestamp: {raw}", NAMES[idx]))
        })?;
        if let Some((prev_idx, prev_at)) = previous {
            if at < prev_at {
                return Err(StoreError::invalid(format!(
                    "{} ({raw}) precedes {}",
                    NAMES[idx], NAMES[prev_idx]
                )));
            }
        }
        previous = Some((idx, at));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit states
// ---------------------------------------------------------------------------

pub fn get_unit_state(
    conn: &Connection,
    order_id: &str,
    order_item_id: &str,
    production_unit_id: &str,
) -> StoreResult<Option<TicketUnitState>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {UNIT_COLUMNS} FROM kds_unit_states u
                 WHERE u.order_id = ?1 AND u.order_item_id = ?2 AND u.production_unit_id = ?3"
            ),
            params![order_id, order_item_id, production_unit_id],
            unit_from_row,
        )
        .optional()?)
}

pub fn list_unit_states(conn: &Connection, order_id: &str) -> StoreResult<Vec<TicketUnitState>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {UNIT_COLUMNS} FROM kds_unit_states u
         WHERE u.order_id = ?1 ORDER BY u.order_item_id, u.production_unit_id"
    ))?;
    let rows = stmt
        .query_map(params![order_id], unit_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Upsert a unit state with field-level COALESCE merge.
///
/// Local writes pass `pending = true`; relayed rows carry the flag of their
/// origin, which never clears a row still owed to the cloud.
pub fn upsert_unit_state(
    conn: &Connection,
    update: &UnitStateUpdate,
    pending: bool,
) -> StoreResult<TicketUnitState> {
    let checklist = match &update.completed_checklist {
        Some(list) => Some(serde_json::to_string(list)?),
        None => None,
    };
    conn.execute(
        "INSERT INTO kds_unit_states (
            order_id, order_item_id, production_unit_id, operator_name, status,
            completed_checklist, completed_at, delivered_at, updated_at, version, pending_sync
        ) VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, '[]'), ?7, ?8, ?9, 1, ?10)
        ON CONFLICT(order_id, order_item_id, production_unit_id) DO UPDATE SET
            operator_name = COALESCE(excluded.operator_name, kds_unit_states.operator_name),
            status = excluded.status,
            completed_checklist = COALESCE(?6, kds_unit_states.completed_checklist),
            completed_at = COALESCE(excluded.completed_at, kds_unit_states.completed_at),
            delivered_at = COALESCE(excluded.delivered_at, kds_unit_states.delivered_at),
            updated_at = excluded.updated_at,
            version = kds_unit_states.version + 1,
            pending_sync = MAX(kds_unit_states.pending_sync, excluded.pending_sync)",
        params![
            update.order_id,
            update.order_item_id,
            update.production_unit_id,
            non_blank(&update.operator_name),
            update.status.as_str(),
            checklist,
            non_blank(&update.completed_at),
            non_blank(&update.delivered_at),
            now_ts(),
            pending,
        ],
    )?;
    get_unit_state(
        conn,
        &update.order_id,
        &update.order_item_id,
        &update.production_unit_id,
    )?
    .ok_or_else(|| StoreError::not_found("unit state", &update.production_unit_id))
}

/// Unit states produced by the kitchen a ticket belongs to. A null-kitchen
/// ticket owns the units of items whose category routes nowhere.
pub fn units_for_ticket(conn: &Connection, ticket: &KitchenTicket) -> StoreResult<Vec<TicketUnitState>> {
    let sql = format!(
        "SELECT {UNIT_COLUMNS} FROM kds_unit_states u
         JOIN order_items i ON i.id = u.order_item_id
         WHERE u.order_id = ?1 AND (
            (?2 IS NOT NULL AND i.category_id IN
                (SELECT category_id FROM category_kitchens WHERE kitchen_id = ?2))
            OR (?2 IS NULL AND (i.category_id IS NULL OR i.category_id NOT IN
                (SELECT category_id FROM category_kitchens)))
         )
         ORDER BY u.order_item_id, u.production_unit_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![ticket.order_id, ticket.kitchen_id], unit_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A ticket is producible-complete when it has units, every unit reports
/// ready (or delivered), and every required checklist entry of each unit is
/// ticked. `required` is keyed by production unit id.
pub fn is_producible_complete(
    units: &[TicketUnitState],
    required: &HashMap<String, Vec<String>>,
) -> bool {
    !units.is_empty()
        && units.iter().all(|unit| {
            unit.status >= UnitStatus::Ready
                && required
                    .get(&unit.production_unit_id)
                    .map(|entries| {
                        entries
                            .iter()
                            .all(|entry| unit.completed_checklist.contains(entry))
                    })
                    .unwrap_or(true)
        })
}

/// Recompute completeness of a ticket from the current unit rows.
pub fn ticket_is_complete(
    conn: &Connection,
    ticket_id: &str,
    required: &HashMap<String, Vec<String>>,
) -> StoreResult<bool> {
    let ticket = require_ticket(conn, ticket_id)?;
    let units = units_for_ticket(conn, &ticket)?;
    Ok(is_producible_complete(&units, required))
}

// ===========================================================================
// Tests
// ===========================================================================
