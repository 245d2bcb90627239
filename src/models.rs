//! Domain types for the local schema.
//!
//! Row structs serialize with snake_case field names; that JSON shape is the
//! row image sent to the cloud and relayed to other terminals.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Closed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Closed => "closed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" | "pending" => Some(OrderStatus::Open),
            "closed" | "delivered" | "completed" => Some(OrderStatus::Closed),
            "cancelled" | "canceled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Pix,
    Debit,
    Credit,
    Voucher,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Pix => "pix",
            PaymentMethod::Debit => "debit",
            PaymentMethod::Credit => "credit",
            PaymentMethod::Voucher => "voucher",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cash" | "dinheiro" => Some(PaymentMethod::Cash),
            "pix" => Some(PaymentMethod::Pix),
            "debit" | "debito" => Some(PaymentMethod::Debit),
            "credit" | "credito" => Some(PaymentMethod::Credit),
            "voucher" => Some(PaymentMethod::Voucher),
            _ => None,
        }
    }
}

/// Kitchen ticket lifecycle. Ordering follows the production flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Queued,
    Prep,
    Ready,
    Done,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Queued => "queued",
            TicketStatus::Prep => "prep",
            TicketStatus::Ready => "ready",
            TicketStatus::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "new" => Some(TicketStatus::Queued),
            "prep" | "preparing" => Some(TicketStatus::Prep),
            "ready" => Some(TicketStatus::Ready),
            "done" | "delivered" => Some(TicketStatus::Done),
            _ => None,
        }
    }

    /// The only state a kitchen display may move to from `self`.
    pub fn next(&self) -> Option<Self> {
        match self {
            TicketStatus::Queued => Some(TicketStatus::Prep),
            TicketStatus::Prep => Some(TicketStatus::Ready),
            TicketStatus::Ready => Some(TicketStatus::Done),
            TicketStatus::Done => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Preparing,
    Ready,
    Delivered,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Preparing => "preparing",
            UnitStatus::Ready => "ready",
            UnitStatus::Delivered => "delivered",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "new" | "queued" => Some(UnitStatus::Pending),
            "preparing" | "prep" => Some(UnitStatus::Preparing),
            "ready" => Some(UnitStatus::Ready),
            "delivered" | "done" => Some(UnitStatus::Delivered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    In,
    Out,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::In => "in",
            MovementKind::Out => "out",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in" | "entrada" | "supply" => Some(MovementKind::In),
            "out" | "saida" | "withdrawal" | "sangria" => Some(MovementKind::Out),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: Option<i64>,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub unit_id: Option<String>,
    pub terminal_id: Option<String>,
    pub notes: Option<String>,
    pub updated_at: String,
    pub version: i64,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub product_id: String,
    pub category_id: Option<String>,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub notes: Option<String>,
    pub updated_at: String,
    pub version: i64,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub order_id: String,
    pub method: PaymentMethod,
    pub amount_cents: i64,
    pub change_cents: i64,
    pub authorization_code: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitchenTicket {
    pub id: String,
    pub order_id: String,
    pub kitchen_id: Option<String>,
    pub station: Option<String>,
    pub status: TicketStatus,
    pub created_at: String,
    pub acknowledged_at: Option<String>,
    pub updated_at: String,
    pub version: i64,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimeline {
    pub order_id: String,
    pub new_start: Option<String>,
    pub preparing_start: Option<String>,
    pub ready_at: Option<String>,
    pub delivered_at: Option<String>,
    pub updated_at: String,
    pub version: i64,
    pub pending_sync: bool,
}

/// Partial phase write; `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePatch {
    pub new_start: Option<String>,
    pub preparing_start: Option<String>,
    pub ready_at: Option<String>,
    pub delivered_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketUnitState {
    pub order_id: String,
    pub order_item_id: String,
    pub production_unit_id: String,
    pub operator_name: Option<String>,
    pub status: UnitStatus,
    pub completed_checklist: Vec<String>,
    pub completed_at: Option<String>,
    pub delivered_at: Option<String>,
    pub updated_at: String,
    pub version: i64,
    pub pending_sync: bool,
}

/// Incoming unit state write. `None` keeps whatever is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStateUpdate {
    pub order_id: String,
    pub order_item_id: String,
    pub production_unit_id: String,
    pub operator_name: Option<String>,
    pub status: UnitStatus,
    pub completed_checklist: Option<Vec<String>>,
    pub completed_at: Option<String>,
    pub delivered_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashSession {
    pub id: String,
    pub terminal_id: String,
    pub opening_operator: String,
    pub closing_operator: Option<String>,
    pub opening_cents: i64,
    pub closing_cents: Option<i64>,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub updated_at: String,
    pub version: i64,
    pub pending_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashMovement {
    pub id: String,
    pub session_id: String,
    pub kind: MovementKind,
    pub reason: String,
    pub amount_cents: i64,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
    pub pending_sync: bool,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NewOrder {
    pub unit_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: String,
    pub category_id: Option<String>,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub method: PaymentMethod,
    pub amount_cents: i64,
    pub change_cents: i64,
    pub authorization_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_status_only_steps_forward() {
        assert_eq!(TicketStatus::Queued.next(), Some(TicketStatus::Prep));
        assert_eq!(TicketStatus::Prep.next(), Some(TicketStatus::Ready));
        assert_eq!(TicketStatus::Ready.next(), Some(TicketStatus::Done));
        assert_eq!(TicketStatus::Done.next(), None);
        assert!(TicketStatus::Queued < TicketStatus::Done);
    }

    #[test]
    fn test_status_parsing_accepts_relay_aliases() {
        assert_eq!(OrderStatus::parse("Canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(TicketStatus::parse("preparing"), Some(TicketStatus::Prep));
        assert_eq!(UnitStatus::parse(" READY "), Some(UnitStatus::Ready));
        assert_eq!(PaymentMethod::parse("PIX"), Some(PaymentMethod::Pix));
        assert_eq!(MovementKind::parse("sangria"), Some(MovementKind::Out));
        assert_eq!(OrderStatus::parse("bogus"), None);
    }

    #[test]
    fn test_order_row_serializes_snake_case() {
        let order = Order {
            id: "ord-1".into(),
            order_number: Some(7),
            status: OrderStatus::Open,
            total_cents: 1250,
            opened_at: "2026-01-01T10:00:00+00:00".into(),
            closed_at: None,
            unit_id: None,
            terminal_id: Some("t1".into()),
            notes: None,
            updated_at: "2026-01-01T10:00:00+00:00".into(),
            version: 1,
            pending_sync: true,
        };
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["status"], "open");
        assert_eq!(json["total_cents"], 1250);
        assert_eq!(json["pending_sync"], true);
    }
}
