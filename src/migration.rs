//! One-time import of the legacy flat-file export into the local store.
//!
//! The export is a single JSON document:
//!
//! ```json
//! {
//!   "categories": [...], "products": [...], "operators": [...],
//!   "observations": [...], "orders": [...], "carts": [...],
//!   "cashSessions": [...], "cashMovements": [...],
//!   "counters": { "order_number": 1520 }
//! }
//! ```
//!
//! The whole import runs in one transaction that also sets the
//! `migration/legacy_import_done` flag, so it happens at most once. Every
//! insert is insert-or-skip, which keeps a forced re-run harmless.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, now_ts, DbState};
use crate::error::StoreResult;
use crate::fields::{i64_any, lookup, str_any};
use crate::models::{MovementKind, OrderStatus, PaymentMethod};

pub const FLAG_CATEGORY: &str = "migration";
pub const FLAG_KEY: &str = "legacy_import_done";

/// Per-entity counts of rows actually inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub categories: usize,
    pub products: usize,
    pub operators: usize,
    pub observations: usize,
    pub orders: usize,
    pub carts: usize,
    pub order_items: usize,
    pub payments: usize,
    pub cash_sessions: usize,
    pub cash_movements: usize,
    pub counters: usize,
    /// Records merged into another record with the same natural key.
    pub merged: usize,
    /// Records dropped because they could not be mapped or already existed.
    pub skipped: usize,
}

pub fn is_done(conn: &Connection) -> bool {
    db::get_setting(conn, FLAG_CATEGORY, FLAG_KEY).as_deref() == Some("true")
}

/// Import the export at `path` unless the import already ran. Returns `None`
/// when the flag was already set.
pub fn import_legacy_file(db: &DbState, path: &Path) -> StoreResult<Option<ImportReport>> {
    if db.with_conn(|conn| Ok(is_done(conn)))? {
        debug!("Legacy import already done, skipping");
        return Ok(None);
    }
    info!("Importing legacy data from {}", path.display());
    let raw = fs::read_to_string(path)?;
    let doc: Value = serde_json::from_str(&raw)?;
    import_legacy(db, &doc)
}

pub fn import_legacy(db: &DbState, doc: &Value) -> StoreResult<Option<ImportReport>> {
    let report = db.with_transaction(|tx| {
        if is_done(tx) {
            return Ok(None);
        }
        let mut importer = Importer::new(tx);
        importer.run(doc)?;
        db::set_setting(tx, FLAG_CATEGORY, FLAG_KEY, "true")?;
        Ok(Some(importer.report))
    })?;

    if let Some(report) = &report {
        info!(
            categories = report.categories,
            products = report.products,
            orders = report.orders,
            carts = report.carts,
            cash_sessions = report.cash_sessions,
            merged = report.merged,
            skipped = report.skipped,
            "Legacy import complete"
        );
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cents from a plain decimal string in currency units, rounding half away
/// from zero on the third fractional digit.
fn decimal_cents(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac = frac.bytes().map(|b| i64::from(b - b'0'));
    let tenths = frac.next().unwrap_or(0);
    let hundredths = frac.next().unwrap_or(0);
    let round_up = frac.next().is_some_and(|d| d >= 5);
    let cents = whole
        .checked_mul(100)?
        .checked_add(tenths * 10 + hundredths + i64::from(round_up))?;
    Some(if negative { -cents } else { cents })
}

/// Parse a money string in currency units. `,` is accepted as decimal
/// separator (`"1.234,50"`, `"12,5"`); currency symbols are ignored.
fn parse_money_str(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    decimal_cents(&normalized)
}

/// Amount in cents from the first matching key. `<key>_cents`/`<key>Cents`
/// hold cents already; plain keys hold currency units.
pub(crate) fn money_cents(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        let cents_key = format!("{key}_cents");
        if let Some(cents) = i64_any(v, &[cents_key.as_str()]) {
            return Some(cents);
        }
        let Some(raw) = lookup(v, &[*key]) else {
            continue;
        };
        let cents = match raw {
            Value::Number(n) => {
                let text = n.to_string();
                decimal_cents(&text)
                    .or_else(|| n.as_f64().map(|units| (units * 100.0).round() as i64))
            }
            Value::String(s) => parse_money_str(s),
            _ => None,
        };
        if cents.is_some() {
            return cents;
        }
    }
    None
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    // Anything past ~5138 AD in seconds is really milliseconds.
    if n.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

/// Canonical RFC 3339 UTC timestamp from the accepted legacy forms.
pub(crate) fn normalize_timestamp(value: &Value) -> Option<String> {
    let parsed = match value {
        Value::Number(n) => from_epoch(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                Some(dt.with_timezone(&Utc))
            } else if let Ok(n) = s.parse::<i64>() {
                from_epoch(n)
            } else if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            {
                Some(naive.and_utc())
            } else {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            }
        }
        _ => None,
    }?;
    Some(parsed.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn timestamp_any(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| lookup(v, &[*k]).and_then(normalize_timestamp))
}

fn legacy_order_status(raw: Option<&str>, has_closed_at: bool) -> OrderStatus {
    let parsed = raw.and_then(|r| {
        OrderStatus::parse(r).or(match r.trim().to_ascii_lowercase().as_str() {
            "paid" | "finished" | "finalized" | "finalizado" | "pago" => Some(OrderStatus::Closed),
            "cancelado" => Some(OrderStatus::Cancelled),
            _ => None,
        })
    });
    match parsed {
        Some(status) => status,
        None if has_closed_at => OrderStatus::Closed,
        None => OrderStatus::Open,
    }
}

// ---------------------------------------------------------------------------
// Natural-key dedup
// ---------------------------------------------------------------------------

struct Group<'a> {
    winner: &'a Value,
    winner_updated: Option<String>,
    members: Vec<&'a Value>,
}

/// Group records by natural key, keeping first-seen key order. Within a
/// group the record with the newer `updatedAt` wins; when either side lacks
/// one, the later-seen record wins.
fn dedup_by<'a>(
    records: &'a [Value],
    key_of: impl Fn(&Value) -> Option<String>,
) -> (Vec<Group<'a>>, usize) {
    let mut groups: Vec<Group<'a>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unkeyed = 0;

    for record in records {
        let Some(key) = key_of(record) else {
            unkeyed += 1;
            continue;
        };
        let updated = timestamp_any(record, &["updated_at"]);
        match index.get(&key) {
            Some(&i) => {
                let group = &mut groups[i];
                let incoming_wins = match (&group.winner_updated, &updated) {
                    (Some(current), Some(incoming)) => incoming >= current,
                    _ => true,
                };
                if incoming_wins {
                    group.winner = record;
                    group.winner_updated = updated;
                }
                group.members.push(record);
            }
            None => {
                index.insert(key, groups.len());
                groups.push(Group {
                    winner: record,
                    winner_updated: updated,
                    members: vec![record],
                });
            }
        }
    }
    (groups, unkeyed)
}

fn array<'a>(doc: &'a Value, key: &str) -> &'a [Value] {
    lookup(doc, &[key])
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

// ---------------------------------------------------------------------------
// Importer
// ---------------------------------------------------------------------------

struct Importer<'c> {
    conn: &'c Connection,
    report: ImportReport,
    /// Legacy category id or normalized name -> stored category id.
    categories: HashMap<String, String>,
    /// Legacy product id, SKU or normalized name -> (stored id, category id).
    products: HashMap<String, (String, Option<String>)>,
    imported_at: String,
}

impl<'c> Importer<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            report: ImportReport::default(),
            categories: HashMap::new(),
            products: HashMap::new(),
            imported_at: now_ts(),
        }
    }

    fn run(&mut self, doc: &Value) -> StoreResult<()> {
        self.import_categories(array(doc, "categories"))?;
        self.import_products(array(doc, "products"))?;
        self.import_operators(array(doc, "operators"))?;
        self.import_observations(array(doc, "observations"))?;
        for (i, order) in array(doc, "orders").iter().enumerate() {
            self.import_order(order, i, false)?;
        }
        for (i, cart) in array(doc, "carts").iter().enumerate() {
            self.import_order(cart, i, true)?;
        }
        let sessions = self.import_cash_sessions(array(doc, "cash_sessions"))?;
        self.import_cash_movements(array(doc, "cash_movements"), &sessions)?;
        if let Some(counters) = lookup(doc, &["counters"]).and_then(Value::as_object) {
            self.import_counters(counters)?;
        }
        Ok(())
    }

    /// `wanted` unless another record already holds that id, in which case a
    /// fresh one. Two legacy records sharing an id both survive.
    fn free_id(&self, table: &str, wanted: String) -> StoreResult<String> {
        let taken = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {table} WHERE id = ?1"),
                params![wanted],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !taken {
            return Ok(wanted);
        }
        let fresh = Uuid::new_v4().to_string();
        warn!(table, legacy_id = %wanted, id = %fresh, "Legacy id already taken, importing under a new id");
        Ok(fresh)
    }

    fn category_ref(&self, v: &Value) -> Option<String> {
        str_any(v, &["category_id"])
            .and_then(|id| self.categories.get(&id).cloned())
            .or_else(|| {
                str_any(v, &["category", "category_name"])
                    .and_then(|name| self.categories.get(&normalize_name(&name)).cloned())
            })
    }

    fn import_categories(&mut self, records: &[Value]) -> StoreResult<()> {
        let (groups, unkeyed) =
            dedup_by(records, |r| str_any(r, &["name"]).map(|n| normalize_name(&n)));
        self.report.skipped += unkeyed;

        for group in groups {
            let winner = group.winner;
            let name = str_any(winner, &["name"]).unwrap_or_default();
            let normalized = normalize_name(&name);
            self.report.merged += group.members.len() - 1;

            let existing: Option<String> = self
                .conn
                .query_row(
                    "SELECT id FROM categories WHERE normalized_name = ?1",
                    params![normalized],
                    |row| row.get(0),
                )
                .optional()?;
            let stored = match existing {
                Some(id) => id,
                None => {
                    let wanted = str_any(winner, &["id"])
                        .unwrap_or_else(|| format!("legacy-category-{normalized}"));
                    let id = self.free_id("categories", wanted)?;
                    self.report.categories += self.conn.execute(
                        "INSERT OR IGNORE INTO categories (id, name, normalized_name, updated_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id, name, normalized, timestamp_any(winner, &["updated_at"])],
                    )?;
                    id
                }
            };

            for member in &group.members {
                if let Some(legacy_id) = str_any(member, &["id"]) {
                    self.categories.insert(legacy_id, stored.clone());
                }
            }
            self.categories.insert(normalized, stored.clone());

            self.import_category_kitchens(&stored, winner)?;
        }
        Ok(())
    }

    /// Kitchens a category routes to, as `kitchens: [{id, name, station}]`
    /// or `kitchenIds: ["..."]`.
    fn import_category_kitchens(&mut self, category_id: &str, record: &Value) -> StoreResult<()> {
        let mut kitchen_ids = Vec::new();
        if let Some(kitchens) = lookup(record, &["kitchens"]).and_then(Value::as_array) {
            for kitchen in kitchens {
                let (id, name, station) = match kitchen {
                    Value::String(id) => (id.trim().to_string(), id.trim().to_string(), None),
                    obj => {
                        let Some(id) = str_any(obj, &["id"]) else { continue };
                        let name = str_any(obj, &["name"]).unwrap_or_else(|| id.clone());
                        (id, name, str_any(obj, &["station"]))
                    }
                };
                if id.is_empty() {
                    continue;
                }
                self.conn.execute(
                    "INSERT OR IGNORE INTO kitchens (id, name, station) VALUES (?1, ?2, ?3)",
                    params![id, name, station],
                )?;
                kitchen_ids.push(id);
            }
        }
        if let Some(ids) = lookup(record, &["kitchen_ids"]).and_then(Value::as_array) {
            for id in ids.iter().filter_map(Value::as_str).map(str::trim) {
                if id.is_empty() {
                    continue;
                }
                self.conn.execute(
                    "INSERT OR IGNORE INTO kitchens (id, name) VALUES (?1, ?1)",
                    params![id],
                )?;
                kitchen_ids.push(id.to_string());
            }
        }
        for kitchen_id in kitchen_ids {
            self.conn.execute(
                "INSERT OR IGNORE INTO category_kitchens (category_id, kitchen_id) VALUES (?1, ?2)",
                params![category_id, kitchen_id],
            )?;
        }
        Ok(())
    }

    fn product_key(&self, record: &Value) -> Option<String> {
        if let Some(sku) = str_any(record, &["sku", "code"]) {
            return Some(format!("sku:{sku}"));
        }
        let name = normalize_name(&str_any(record, &["name"])?);
        let category = self.category_ref(record).unwrap_or_default();
        Some(format!("name:{name}|{category}"))
    }

    fn import_products(&mut self, records: &[Value]) -> StoreResult<()> {
        let (groups, unkeyed) = dedup_by(records, |r| self.product_key(r));
        self.report.skipped += unkeyed;

        let mut resolved = Vec::with_capacity(groups.len());
        for group in &groups {
            let winner = group.winner;
            let name = str_any(winner, &["name"]).unwrap_or_default();
            let sku = str_any(winner, &["sku", "code"]);
            let category_id = self.category_ref(winner);
            self.report.merged += group.members.len() - 1;

            let existing: Option<(String, Option<String>)> = match &sku {
                Some(sku) => self
                    .conn
                    .query_row(
                        "SELECT id, category_id FROM products WHERE sku = ?1",
                        params![sku],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?,
                None => None,
            };
            let stored = match existing {
                Some(found) => found,
                None => {
                    let wanted = str_any(winner, &["id"]).unwrap_or_else(|| match &sku {
                        Some(sku) => format!("legacy-product-{sku}"),
                        None => format!(
                            "legacy-product-{}-{}",
                            normalize_name(&name),
                            category_id.as_deref().unwrap_or("none")
                        ),
                    });
                    let id = self.free_id("products", wanted)?;
                    self.report.products += self.conn.execute(
                        "INSERT OR IGNORE INTO products (id, name, sku, category_id, price_cents, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            id,
                            name,
                            sku,
                            category_id,
                            money_cents(winner, &["price"]).unwrap_or(0),
                            timestamp_any(winner, &["updated_at"]),
                        ],
                    )?;
                    (id, category_id.clone())
                }
            };

            let mut aliases: Vec<String> = group
                .members
                .iter()
                .filter_map(|m| str_any(m, &["id"]))
                .collect();
            aliases.push(format!("name:{}", normalize_name(&name)));
            resolved.push((aliases, stored));
        }

        for (aliases, stored) in resolved {
            for alias in aliases {
                self.products.entry(alias).or_insert_with(|| stored.clone());
            }
        }
        Ok(())
    }

    fn import_operators(&mut self, records: &[Value]) -> StoreResult<()> {
        for record in records {
            let Some(name) = str_any(record, &["name", "username"]) else {
                self.report.skipped += 1;
                continue;
            };
            let id = str_any(record, &["id"])
                .unwrap_or_else(|| format!("legacy-operator-{}", normalize_name(&name)));
            let inserted = self.conn.execute(
                "INSERT OR IGNORE INTO operators (id, name, role) VALUES (?1, ?2, ?3)",
                params![id, name, str_any(record, &["role"])],
            )?;
            self.report.operators += inserted;
            self.report.skipped += 1 - inserted;
        }
        Ok(())
    }

    fn import_observations(&mut self, records: &[Value]) -> StoreResult<()> {
        for (i, record) in records.iter().enumerate() {
            let text = match record {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                obj => str_any(obj, &["text", "description", "name"]),
            };
            let Some(text) = text else {
                self.report.skipped += 1;
                continue;
            };
            let id = str_any(record, &["id"]).unwrap_or_else(|| format!("legacy-observation-{i}"));
            let inserted = self.conn.execute(
                "INSERT OR IGNORE INTO observations (id, text, category_id) VALUES (?1, ?2, ?3)",
                params![id, text, self.category_ref(record)],
            )?;
            self.report.observations += inserted;
            self.report.skipped += 1 - inserted;
        }
        Ok(())
    }

    fn resolve_product(&self, item: &Value) -> (String, Option<String>) {
        let by_id = str_any(item, &["product_id"]).and_then(|id| {
            self.products
                .get(&id)
                .cloned()
                .or(Some((id, None)))
        });
        let by_name = || {
            let name = normalize_name(&str_any(item, &["product_name", "name"])?);
            self.products
                .get(&format!("name:{name}"))
                .cloned()
                .or_else(|| Some((format!("legacy-product-{name}"), None)))
        };
        by_id
            .or_else(by_name)
            .unwrap_or_else(|| ("legacy-product-unknown".to_string(), None))
    }

    fn import_order(&mut self, record: &Value, index: usize, is_cart: bool) -> StoreResult<()> {
        let prefix = if is_cart { "legacy-cart" } else { "legacy-order" };
        let id = str_any(record, &["id"]).unwrap_or_else(|| format!("{prefix}-{index}"));

        let opened_at = timestamp_any(record, &["opened_at", "created_at", "date"])
            .unwrap_or_else(|| self.imported_at.clone());
        let closed_at = if is_cart {
            None
        } else {
            timestamp_any(record, &["closed_at", "finished_at", "paid_at"])
        };
        let status = if is_cart {
            OrderStatus::Open
        } else {
            legacy_order_status(str_any(record, &["status"]).as_deref(), closed_at.is_some())
        };
        let closed_at = match (status.is_terminal(), closed_at) {
            (true, None) => Some(opened_at.clone()),
            (true, some) => some,
            (false, _) => None,
        };
        let order_number = i64_any(record, &["order_number", "number"]);

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO orders (
                id, order_number, status, total_cents, opened_at, closed_at, unit_id,
                terminal_id, notes, updated_at, version, pending_sync
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, 1)",
            params![
                id,
                order_number,
                status.as_str(),
                money_cents(record, &["total"]).unwrap_or(0),
                opened_at,
                closed_at,
                str_any(record, &["unit_id", "table"]),
                str_any(record, &["terminal_id"]),
                str_any(record, &["notes", "observation"]),
                self.imported_at,
            ],
        )?;
        if inserted == 0 {
            self.report.skipped += 1;
            return Ok(());
        }
        if is_cart {
            self.report.carts += 1;
        } else {
            self.report.orders += 1;
        }
        if let Some(number) = order_number {
            db::raise_counter(self.conn, "order_number", number)?;
        }

        let items = lookup(record, &["items"]).and_then(Value::as_array);
        let mut item_count = 0;
        for (i, item) in items.map(Vec::as_slice).unwrap_or(&[]).iter().enumerate() {
            let quantity = i64_any(item, &["quantity", "qty"]).unwrap_or(1);
            if quantity <= 0 {
                self.report.skipped += 1;
                continue;
            }
            let (product_id, product_category) = self.resolve_product(item);
            let category_id = self.category_ref(item).or(product_category);
            let item_id = str_any(item, &["id"]).unwrap_or_else(|| format!("{id}-item-{i}"));
            let inserted = self.conn.execute(
                "INSERT OR IGNORE INTO order_items (
                    id, order_id, product_id, category_id, quantity, unit_price_cents,
                    notes, updated_at, version, pending_sync
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 1)",
                params![
                    item_id,
                    id,
                    product_id,
                    category_id,
                    quantity,
                    money_cents(item, &["unit_price", "price"]).unwrap_or(0),
                    str_any(item, &["notes", "observation"]),
                    self.imported_at,
                ],
            )?;
            self.report.order_items += inserted;
            item_count += inserted;
        }

        // The stored total always matches the stored items.
        if item_count > 0 {
            self.conn.execute(
                "UPDATE orders SET total_cents = (
                    SELECT COALESCE(SUM(quantity * unit_price_cents), 0)
                    FROM order_items WHERE order_id = ?1
                 ) WHERE id = ?1",
                params![id],
            )?;
        }

        let payments = lookup(record, &["payments"]).and_then(Value::as_array);
        for (i, payment) in payments.map(Vec::as_slice).unwrap_or(&[]).iter().enumerate() {
            let Some(amount) = money_cents(payment, &["amount", "value"]).filter(|a| *a > 0) else {
                self.report.skipped += 1;
                continue;
            };
            let raw_method = str_any(payment, &["method", "type"]).unwrap_or_default();
            let method = PaymentMethod::parse(&raw_method).unwrap_or_else(|| {
                warn!(order_id = %id, method = %raw_method, "Unknown legacy payment method, importing as cash");
                PaymentMethod::Cash
            });
            let payment_id = str_any(payment, &["id"]).unwrap_or_else(|| format!("{id}-payment-{i}"));
            let created_at = timestamp_any(payment, &["created_at", "date"])
                .unwrap_or_else(|| opened_at.clone());
            let inserted = self.conn.execute(
                "INSERT OR IGNORE INTO payments (
                    id, order_id, method, amount_cents, change_cents, authorization_code,
                    created_at, updated_at, version, pending_sync
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 1)",
                params![
                    payment_id,
                    id,
                    method.as_str(),
                    amount,
                    money_cents(payment, &["change"]).unwrap_or(0).max(0),
                    str_any(payment, &["authorization_code", "nsu"]),
                    created_at,
                    self.imported_at,
                ],
            )?;
            self.report.payments += inserted;
        }
        Ok(())
    }

    /// Returns legacy session id -> stored session id.
    fn import_cash_sessions(&mut self, records: &[Value]) -> StoreResult<HashMap<String, String>> {
        let mut ids = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            let id = str_any(record, &["id"]).unwrap_or_else(|| format!("legacy-cash-session-{i}"));
            let opened_at = timestamp_any(record, &["opened_at", "created_at", "date"])
                .unwrap_or_else(|| self.imported_at.clone());
            let inserted = self.conn.execute(
                "INSERT OR IGNORE INTO cash_sessions (
                    id, terminal_id, opening_operator, closing_operator, opening_cents,
                    closing_cents, opened_at, closed_at, updated_at, version, pending_sync
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, 1)",
                params![
                    id,
                    str_any(record, &["terminal_id"]).unwrap_or_else(|| "legacy".to_string()),
                    str_any(record, &["opening_operator", "operator", "opened_by"])
                        .unwrap_or_default(),
                    str_any(record, &["closing_operator", "closed_by"]),
                    money_cents(record, &["opening", "opening_amount"]).unwrap_or(0),
                    money_cents(record, &["closing", "closing_amount"]),
                    opened_at,
                    timestamp_any(record, &["closed_at"]),
                    self.imported_at,
                ],
            )?;
            self.report.cash_sessions += inserted;

            let exists: bool = self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM cash_sessions WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if exists {
                ids.insert(id.clone(), id);
            } else {
                // Lost to the one-open-session-per-terminal rule.
                self.report.skipped += 1;
            }
        }
        Ok(ids)
    }

    fn import_cash_movements(
        &mut self,
        records: &[Value],
        sessions: &HashMap<String, String>,
    ) -> StoreResult<()> {
        for (i, record) in records.iter().enumerate() {
            let session_id = str_any(record, &["session_id", "cash_session_id"])
                .and_then(|id| sessions.get(&id).cloned());
            let kind = str_any(record, &["kind", "type"]).and_then(|k| MovementKind::parse(&k));
            let amount = money_cents(record, &["amount", "value"]).map(i64::abs);
            let (Some(session_id), Some(kind), Some(amount)) = (session_id, kind, amount) else {
                self.report.skipped += 1;
                continue;
            };
            if amount == 0 {
                self.report.skipped += 1;
                continue;
            }
            let id = str_any(record, &["id"]).unwrap_or_else(|| format!("legacy-cash-movement-{i}"));
            let created_at = timestamp_any(record, &["created_at", "date"])
                .unwrap_or_else(|| self.imported_at.clone());
            let inserted = self.conn.execute(
                "INSERT OR IGNORE INTO cash_movements (
                    id, session_id, kind, reason, amount_cents, created_at, updated_at,
                    version, pending_sync
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 1)",
                params![
                    id,
                    session_id,
                    kind.as_str(),
                    str_any(record, &["reason", "description"]).unwrap_or_default(),
                    amount,
                    created_at,
                    self.imported_at,
                ],
            )?;
            self.report.cash_movements += inserted;
        }
        Ok(())
    }

    fn import_counters(&mut self, counters: &serde_json::Map<String, Value>) -> StoreResult<()> {
        for (name, value) in counters {
            let Some(value) = value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            else {
                self.report.skipped += 1;
                continue;
            };
            db::raise_counter(self.conn, &crate::fields::snake_case(name), value)?;
            self.report.counters += 1;
        }
        Ok(())
    }
}
