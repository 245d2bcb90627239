//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the transaction
//! primitive every multi-row write goes through, settings/counter helpers and
//! the sync bookkeeping tables. The store is constructed explicitly and
//! shared as `Arc<DbState>`; there is no global handle.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{StoreError, StoreResult};

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "pos-sync.db";

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Tables whose rows carry `pending_sync` and are mirrored to the cloud.
pub const SYNCABLE_TABLES: &[&str] = &[
    "orders",
    "order_items",
    "payments",
    "kds_tickets",
    "kds_phase_times",
    "kds_unit_states",
    "cash_sessions",
    "cash_movements",
];

/// Owner of the single store connection.
pub struct DbState {
    conn: Mutex<Option<Connection>>,
    pub db_path: PathBuf,
}

/// Canonical timestamp format for every stored date.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Initialize the database at `{data_dir}/pos-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. A file SQLite reports as corrupt or not
/// a database is set aside as `pos-sync.db.corrupt-<ts>` and a fresh store is
/// created once; any other open failure is returned untouched.
pub fn init(data_dir: &Path) -> StoreResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) if is_corruption(&first_err) => {
            warn!(
                "Database unreadable ({}), moving it aside and starting fresh",
                first_err
            );
            quarantine(&db_path);
            open_and_configure(&db_path)?
        }
        Err(e) => return Err(e),
    };

    run_migrations(&conn)?;
    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(Some(conn)),
        db_path,
    })
}

/// Open a migrated in-memory store (ephemeral terminals and tests).
pub fn open_in_memory() -> StoreResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(Some(conn)),
        db_path: PathBuf::from(":memory:"),
    })
}

fn is_corruption(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Rename the store and its WAL/SHM side files with a `.corrupt-<ts>` suffix.
fn quarantine(db_path: &Path) {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%d%H%M%S"));
    for ext in ["db", "db-wal", "db-shm"] {
        let from = db_path.with_extension(ext);
        if !from.exists() {
            continue;
        }
        let to = db_path.with_extension(format!("{ext}.{suffix}"));
        match fs::rename(&from, &to) {
            Ok(()) => warn!("Moved {} to {}", from.display(), to.display()),
            Err(e) => error!("Failed to move {} aside: {}", from.display(), e),
        }
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

impl DbState {
    /// Run `f` against the open connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    /// Run `f` inside an IMMEDIATE transaction. Any error rolls back every
    /// write made by `f`.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Checkpoint the WAL and release the connection. Later calls fail with
    /// [`StoreError::Closed`].
    pub fn close(&self) -> StoreResult<()> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!("WAL checkpoint on close failed: {e}");
            }
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            info!("Database closed ({})", self.db_path.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        apply_migration(conn, 1, "orders, items, payments, cash", MIGRATION_V1)?;
    }
    if current < 2 {
        apply_migration(conn, 2, "kitchen display tables", MIGRATION_V2)?;
    }
    if current < 3 {
        apply_migration(conn, 3, "sync bookkeeping", MIGRATION_V3)?;
    }
    if current < 4 {
        apply_migration(conn, 4, "catalog and legacy import", MIGRATION_V4)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32, label: &str, sql: &str) -> StoreResult<()> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        StoreError::Sqlite(e)
    })?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    info!("Applied migration v{version} ({label})");
    Ok(())
}

const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS orders (
        id TEXT PRIMARY KEY,
        order_number INTEGER,
        status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed', 'cancelled')),
        total_cents INTEGER NOT NULL DEFAULT 0,
        opened_at TEXT NOT NULL,
        closed_at TEXT,
        unit_id TEXT,
        terminal_id TEXT,
        notes TEXT,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        pending_sync INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS order_items (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL,
        product_id TEXT NOT NULL,
        category_id TEXT,
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        unit_price_cents INTEGER NOT NULL,
        notes TEXT,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        pending_sync INTEGER NOT NULL DEFAULT 1,
        FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS payments (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL,
        method TEXT NOT NULL CHECK (method IN ('cash', 'pix', 'debit', 'credit', 'voucher')),
        amount_cents INTEGER NOT NULL,
        change_cents INTEGER NOT NULL DEFAULT 0,
        authorization_code TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        pending_sync INTEGER NOT NULL DEFAULT 1,
        FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS cash_sessions (
        id TEXT PRIMARY KEY,
        terminal_id TEXT NOT NULL,
        opening_operator TEXT NOT NULL,
        closing_operator TEXT,
        opening_cents INTEGER NOT NULL DEFAULT 0,
        closing_cents INTEGER,
        opened_at TEXT NOT NULL,
        closed_at TEXT,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        pending_sync INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS cash_movements (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('in', 'out')),
        reason TEXT NOT NULL DEFAULT '',
        amount_cents INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        pending_sync INTEGER NOT NULL DEFAULT 1,
        FOREIGN KEY(session_id) REFERENCES cash_sessions(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
    CREATE INDEX IF NOT EXISTS idx_orders_pending ON orders(pending_sync);
    CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
    CREATE INDEX IF NOT EXISTS idx_payments_order ON payments(order_id);
    CREATE INDEX IF NOT EXISTS idx_cash_movements_session ON cash_movements(session_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_cash_sessions_one_open
        ON cash_sessions(terminal_id) WHERE closed_at IS NULL;
";

const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS kds_tickets (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL,
        kitchen_id TEXT,
        station TEXT,
        status TEXT NOT NULL DEFAULT 'queued' CHECK (status IN ('queued', 'prep', 'ready', 'done')),
        created_at TEXT NOT NULL,
        acknowledged_at TEXT,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        pending_sync INTEGER NOT NULL DEFAULT 1,
        FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS kds_phase_times (
        order_id TEXT PRIMARY KEY,
        new_start TEXT,
        preparing_start TEXT,
        ready_at TEXT,
        delivered_at TEXT,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        pending_sync INTEGER NOT NULL DEFAULT 1,
        FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS kds_unit_states (
        order_id TEXT NOT NULL,
        order_item_id TEXT NOT NULL,
        production_unit_id TEXT NOT NULL,
        operator_name TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        completed_checklist TEXT NOT NULL DEFAULT '[]',
        completed_at TEXT,
        delivered_at TEXT,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        pending_sync INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (order_id, order_item_id, production_unit_id),
        FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
    );

    -- At most one ticket per (order, kitchen); NULL kitchen counts as one key.
    CREATE UNIQUE INDEX IF NOT EXISTS idx_kds_tickets_order_kitchen
        ON kds_tickets(order_id, COALESCE(kitchen_id, ''));
    CREATE INDEX IF NOT EXISTS idx_kds_tickets_status ON kds_tickets(status);
";

const MIGRATION_V3: &str = "
    CREATE TABLE IF NOT EXISTS local_settings (
        id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
        setting_category TEXT NOT NULL,
        setting_key TEXT NOT NULL,
        setting_value TEXT NOT NULL,
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now')),
        UNIQUE(setting_category, setting_key)
    );

    CREATE TABLE IF NOT EXISTS sync_log (
        table_name TEXT PRIMARY KEY,
        last_pulled_at TEXT,
        last_pushed_at TEXT,
        cursor TEXT
    );

    CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS counters (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS sync_tombstones (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        row_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(table_name, row_id)
    );
";

const MIGRATION_V4: &str = "
    CREATE TABLE IF NOT EXISTS categories (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        normalized_name TEXT NOT NULL UNIQUE,
        updated_at TEXT
    );

    CREATE TABLE IF NOT EXISTS products (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        sku TEXT UNIQUE,
        category_id TEXT,
        price_cents INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT
    );

    CREATE TABLE IF NOT EXISTS units (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS kitchens (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        station TEXT
    );

    CREATE TABLE IF NOT EXISTS category_kitchens (
        category_id TEXT NOT NULL,
        kitchen_id TEXT NOT NULL,
        PRIMARY KEY (category_id, kitchen_id)
    );

    CREATE TABLE IF NOT EXISTS operators (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        role TEXT
    );

    CREATE TABLE IF NOT EXISTS observations (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        category_id TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);
";

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Atomically increment a named counter and return the new value.
pub fn next_counter(conn: &Connection, name: &str) -> StoreResult<i64> {
    let value = conn.query_row(
        "INSERT INTO counters (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1
         RETURNING value",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value)
}

/// Raise a counter to at least `value`. Replaying the same call is a no-op.
pub fn raise_counter(conn: &Connection, name: &str, value: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO counters (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
        params![name, value],
    )?;
    Ok(())
}

pub fn get_counter(conn: &Connection, name: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT value FROM counters WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Sync bookkeeping
// ---------------------------------------------------------------------------

pub fn mark_pushed(conn: &Connection, table: &str, at: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_log (table_name, last_pushed_at) VALUES (?1, ?2)
         ON CONFLICT(table_name) DO UPDATE SET last_pushed_at = excluded.last_pushed_at",
        params![table, at],
    )?;
    Ok(())
}

pub fn mark_pulled(conn: &Connection, table: &str, at: &str, cursor: Option<&str>) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_log (table_name, last_pulled_at, cursor) VALUES (?1, ?2, ?3)
         ON CONFLICT(table_name) DO UPDATE SET
            last_pulled_at = excluded.last_pulled_at,
            cursor = COALESCE(excluded.cursor, sync_log.cursor)",
        params![table, at, cursor],
    )?;
    Ok(())
}

pub fn pull_cursor(conn: &Connection, table: &str) -> Option<String> {
    conn.query_row(
        "SELECT cursor FROM sync_log WHERE table_name = ?1",
        params![table],
        |row| row.get(0),
    )
    .ok()
    .flatten()
}

pub fn set_sync_meta(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now_ts()],
    )?;
    Ok(())
}

/// Record a local delete that the cloud has not seen yet.
pub fn add_tombstone(conn: &Connection, table: &str, row_id: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_tombstones (table_name, row_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![table, row_id, now_ts()],
    )?;
    Ok(())
}

pub fn clear_tombstone(conn: &Connection, table: &str, row_id: &str) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM sync_tombstones WHERE table_name = ?1 AND row_id = ?2",
        params![table, row_id],
    )?;
    Ok(())
}

pub fn list_tombstones(conn: &Connection) -> StoreResult<Vec<(String, String)>> {
    let mut stmt =
        conn.prepare("SELECT table_name, row_id FROM sync_tombstones ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Replace the kitchens a category routes to.
pub fn set_category_kitchens(
    conn: &Connection,
    category_id: &str,
    kitchen_ids: &[&str],
) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM category_kitchens WHERE category_id = ?1",
        params![category_id],
    )?;
    for kitchen_id in kitchen_ids {
        conn.execute(
            "INSERT OR IGNORE INTO category_kitchens (category_id, kitchen_id) VALUES (?1, ?2)",
            params![category_id, kitchen_id],
        )?;
    }
    Ok(())
}

pub fn upsert_kitchen(conn: &Connection, id: &str, name: &str, station: Option<&str>) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO kitchens (id, name, station) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, station = excluded.station",
        params![id, name, station],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
