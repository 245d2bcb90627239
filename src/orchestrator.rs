//! Use cases that write locally and mirror the result to the cloud.
//!
//! Every use case follows the same sequence:
//! 1. generate ids, then commit the local write with `pending_sync = 1`;
//! 2. hand the row images to the LAN relay on a detached task;
//! 3. push the row images to the cloud, clearing each acknowledged row.
//!
//! A remote failure never fails the call. It is reported through
//! [`WriteOutcome::LocalOnly`] and the rows wait for [`Orchestrator::replay_pending`].

use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cloud::CloudClient;
use crate::db::{self, now_ts, DbState};
use crate::error::{RemoteError, StoreResult, WriteOutcome};
use crate::models::{
    CashMovement, CashSession, KitchenTicket, MovementKind, NewOrder, NewOrderItem, NewPayment,
    Order, OrderItem, OrderStatus, Payment, PhasePatch, PhaseTimeline, TicketStatus,
    TicketUnitState, UnitStateUpdate,
};
use crate::mutation::{pending_mutations, Mutation, Tombstone};
use crate::relay::LanRelay;
use crate::routing::{self, RoutingReport};
use crate::scheduler::Scheduler;
use crate::{cash, kds, orders};

/// Default cap on a single cloud push.
pub const DEFAULT_CLOUD_TIMEOUT: Duration = Duration::from_secs(8);

/// Default delay before checking that a new ticket was acknowledged.
pub const DEFAULT_ACK_CHECK_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedItem {
    pub item: OrderItem,
    pub order: Order,
    pub routing: RoutingReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedOrder {
    pub order: Order,
    /// Tickets that were still outstanding and got forced to `done`.
    pub forced_tickets: Vec<KitchenTicket>,
}

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub pushed: usize,
    pub remaining: usize,
}

pub struct Orchestrator {
    db: Arc<DbState>,
    cloud: Option<Arc<dyn CloudClient>>,
    relay: Option<Arc<LanRelay>>,
    scheduler: Scheduler,
    terminal_id: String,
    cloud_timeout: Duration,
    ack_check_delay: Duration,
}

impl Orchestrator {
    pub fn new(db: Arc<DbState>, scheduler: Scheduler, terminal_id: impl Into<String>) -> Self {
        Self {
            db,
            cloud: None,
            relay: None,
            scheduler,
            terminal_id: terminal_id.into(),
            cloud_timeout: DEFAULT_CLOUD_TIMEOUT,
            ack_check_delay: DEFAULT_ACK_CHECK_DELAY,
        }
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudClient>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_relay(mut self, relay: Arc<LanRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_cloud_timeout(mut self, timeout: Duration) -> Self {
        self.cloud_timeout = timeout;
        self
    }

    pub fn with_ack_check_delay(mut self, delay: Duration) -> Self {
        self.ack_check_delay = delay;
        self
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn has_cloud(&self) -> bool {
        self.cloud.is_some()
    }

    pub fn cloud(&self) -> Option<&Arc<dyn CloudClient>> {
        self.cloud.as_ref()
    }

    pub fn relay(&self) -> Option<&Arc<LanRelay>> {
        self.relay.as_ref()
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Commit a local write, fan it out to the relay and mirror it to the
    /// cloud. Only the local write can fail the call.
    async fn commit<T>(
        &self,
        op: &'static str,
        write: impl FnOnce(&Connection) -> StoreResult<(T, Vec<Mutation>)>,
    ) -> StoreResult<(T, WriteOutcome)> {
        let (value, mutations) = self.db.with_transaction(|tx| write(tx))?;
        debug!(op, rows = mutations.len(), "Local write committed");

        self.relay_out(&mutations);
        let outcome = self.push_to_cloud(op, &mutations).await;
        Ok((value, outcome))
    }

    fn relay_out(&self, mutations: &[Mutation]) {
        let Some(relay) = &self.relay else {
            return;
        };
        if mutations.is_empty() {
            return;
        }
        let relay = Arc::clone(relay);
        let batch = mutations.to_vec();
        self.scheduler.spawn(async move {
            relay.push(&batch).await;
        });
    }

    async fn push_to_cloud(&self, op: &'static str, mutations: &[Mutation]) -> WriteOutcome {
        let Some(cloud) = &self.cloud else {
            return WriteOutcome::LocalOnly(RemoteError::NotConfigured);
        };

        for mutation in mutations {
            if let Err(err) = self.push_one(cloud.as_ref(), mutation).await {
                info!(
                    op,
                    table = mutation.table(),
                    key = %mutation.row_key(),
                    error = %err,
                    "Cloud unavailable, keeping write local"
                );
                return WriteOutcome::LocalOnly(err);
            }
        }
        WriteOutcome::Synced
    }

    /// Push one row image and clear its pending flag on acknowledgment.
    async fn push_one(&self, cloud: &dyn CloudClient, mutation: &Mutation) -> Result<(), RemoteError> {
        match tokio::time::timeout(self.cloud_timeout, cloud.push(mutation)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RemoteError::Timeout),
        }
        if let Err(e) = self.db.with_conn(|conn| mutation.mark_synced(conn)) {
            warn!(
                table = mutation.table(),
                key = %mutation.row_key(),
                error = %e,
                "Cloud acknowledged but pending flag could not be cleared"
            );
        }
        Ok(())
    }

    fn schedule_ack_checks(&self, tickets: &[KitchenTicket]) {
        for ticket in tickets {
            let db = Arc::clone(&self.db);
            let ticket_id = ticket.id.clone();
            self.scheduler
                .spawn_once("ticket-ack-check", self.ack_check_delay, async move {
                    check_acknowledged(&db, &ticket_id);
                });
        }
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    pub async fn create_order(&self, new: NewOrder) -> StoreResult<(Order, WriteOutcome)> {
        let id = Uuid::new_v4().to_string();
        let terminal_id = self.terminal_id.clone();
        self.commit("create_order", move |conn| {
            let order = orders::insert_order(conn, &id, Some(&terminal_id), &new)?;
            info!(order_id = %order.id, number = ?order.order_number, "Order created");
            Ok((order.clone(), vec![Mutation::Orders(order)]))
        })
        .await
    }

    /// Append an item and route it to the kitchens. A routing failure is
    /// reported in [`AddedItem::routing`] and never undoes the item.
    pub async fn add_item(
        &self,
        order_id: &str,
        item: NewOrderItem,
    ) -> StoreResult<(AddedItem, WriteOutcome)> {
        let item_id = Uuid::new_v4().to_string();
        let (added, outcome) = self
            .commit("add_item", |conn| {
                let (item, order) = orders::insert_item(conn, &item_id, order_id, &item)?;
                let routing = routing::route_item_best_effort(
                    conn,
                    order_id,
                    &item.id,
                    item.category_id.as_deref(),
                );

                let mut mutations = vec![
                    Mutation::Orders(order.clone()),
                    Mutation::OrderItems(item.clone()),
                ];
                mutations.extend(routing.created.iter().cloned().map(Mutation::KdsTickets));
                if !routing.created.is_empty() {
                    if let Some(timeline) = kds::get_phase_timeline(conn, order_id)? {
                        mutations.push(Mutation::KdsPhaseTimes(timeline));
                    }
                }
                Ok((
                    AddedItem {
                        item,
                        order,
                        routing,
                    },
                    mutations,
                ))
            })
            .await?;

        self.schedule_ack_checks(&added.routing.created);
        Ok((added, outcome))
    }

    pub async fn remove_item(&self, item_id: &str) -> StoreResult<(Order, WriteOutcome)> {
        self.commit("remove_item", |conn| {
            let (item, order) = orders::delete_item(conn, item_id)?;
            info!(order_id = %order.id, item_id = %item.id, "Item removed");
            let mutations = vec![
                Mutation::Orders(order.clone()),
                Mutation::Tombstone(Tombstone {
                    table_name: "order_items".to_string(),
                    id: item.id,
                }),
            ];
            Ok((order, mutations))
        })
        .await
    }

    pub async fn add_payment(
        &self,
        order_id: &str,
        payment: NewPayment,
    ) -> StoreResult<(Payment, WriteOutcome)> {
        let id = Uuid::new_v4().to_string();
        self.commit("add_payment", |conn| {
            let payment = orders::insert_payment(conn, &id, order_id, &payment)?;
            info!(
                order_id = %order_id,
                method = payment.method.as_str(),
                amount_cents = payment.amount_cents,
                "Payment recorded"
            );
            Ok((payment.clone(), vec![Mutation::Payments(payment)]))
        })
        .await
    }

    /// Close an order. Outstanding tickets are forced to `done` and the
    /// timeline gets its `delivered_at`.
    pub async fn close_order(&self, order_id: &str) -> StoreResult<(FinishedOrder, WriteOutcome)> {
        self.finish(order_id, OrderStatus::Closed).await
    }

    /// Cancel an order. Outstanding tickets are forced to `done` so kitchens
    /// stop producing it; no delivery is recorded.
    pub async fn cancel_order(&self, order_id: &str) -> StoreResult<(FinishedOrder, WriteOutcome)> {
        self.finish(order_id, OrderStatus::Cancelled).await
    }

    async fn finish(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> StoreResult<(FinishedOrder, WriteOutcome)> {
        let op = if status == OrderStatus::Closed {
            "close_order"
        } else {
            "cancel_order"
        };
        self.commit(op, |conn| {
            let order = orders::finish_order(conn, order_id, status)?;
            let forced = kds::force_done_for_order(conn, order_id)?;

            let mut mutations = vec![Mutation::Orders(order.clone())];
            mutations.extend(forced.iter().cloned().map(Mutation::KdsTickets));

            if status == OrderStatus::Closed && !kds::list_tickets(conn, order_id)?.is_empty() {
                let (timeline, changed) = kds::stamp_phase_times(
                    conn,
                    order_id,
                    &PhasePatch {
                        delivered_at: Some(now_ts()),
                        ..Default::default()
                    },
                )?;
                if changed {
                    mutations.push(Mutation::KdsPhaseTimes(timeline));
                }
            }

            info!(
                order_id = %order_id,
                status = status.as_str(),
                total_cents = order.total_cents,
                forced_tickets = forced.len(),
                "Order finished"
            );
            Ok((
                FinishedOrder {
                    order,
                    forced_tickets: forced,
                },
                mutations,
            ))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Cash
    // -----------------------------------------------------------------------

    pub async fn open_cash_session(
        &self,
        operator: &str,
        opening_cents: i64,
    ) -> StoreResult<(CashSession, WriteOutcome)> {
        let id = Uuid::new_v4().to_string();
        let terminal_id = self.terminal_id.clone();
        self.commit("open_cash_session", |conn| {
            let session = cash::open_session(conn, &id, &terminal_id, operator, opening_cents)?;
            info!(session_id = %session.id, operator = %operator, "Cash session opened");
            Ok((session.clone(), vec![Mutation::CashSessions(session)]))
        })
        .await
    }

    pub async fn close_cash_session(
        &self,
        session_id: &str,
        operator: &str,
        closing_cents: i64,
    ) -> StoreResult<(CashSession, WriteOutcome)> {
        self.commit("close_cash_session", |conn| {
            let expected = cash::expected_balance(conn, session_id)?;
            let session = cash::close_session(conn, session_id, operator, closing_cents)?;
            if expected != closing_cents {
                warn!(
                    session_id = %session_id,
                    expected_cents = expected,
                    counted_cents = closing_cents,
                    "Cash session closed with a difference"
                );
            } else {
                info!(session_id = %session_id, "Cash session closed");
            }
            Ok((session.clone(), vec![Mutation::CashSessions(session)]))
        })
        .await
    }

    pub async fn record_movement(
        &self,
        session_id: &str,
        kind: MovementKind,
        reason: &str,
        amount_cents: i64,
    ) -> StoreResult<(CashMovement, WriteOutcome)> {
        let id = Uuid::new_v4().to_string();
        self.commit("record_movement", |conn| {
            let movement = cash::insert_movement(conn, &id, session_id, kind, reason, amount_cents)?;
            Ok((movement.clone(), vec![Mutation::CashMovements(movement)]))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Kitchen
    // -----------------------------------------------------------------------

    pub async fn advance_ticket(
        &self,
        ticket_id: &str,
        to: TicketStatus,
    ) -> StoreResult<(KitchenTicket, WriteOutcome)> {
        self.commit("advance_ticket", |conn| {
            let ticket = kds::advance_ticket(conn, ticket_id, to)?;
            let mut mutations = vec![Mutation::KdsTickets(ticket.clone())];
            if matches!(to, TicketStatus::Prep | TicketStatus::Ready) {
                if let Some(timeline) = kds::get_phase_timeline(conn, &ticket.order_id)? {
                    if timeline.pending_sync {
                        mutations.push(Mutation::KdsPhaseTimes(timeline));
                    }
                }
            }
            debug!(ticket_id = %ticket_id, status = to.as_str(), "Ticket advanced");
            Ok((ticket, mutations))
        })
        .await
    }

    pub async fn acknowledge_ticket(
        &self,
        ticket_id: &str,
    ) -> StoreResult<(KitchenTicket, WriteOutcome)> {
        self.commit("acknowledge_ticket", |conn| {
            let (ticket, latency_ms) = kds::acknowledge_ticket(conn, ticket_id)?;
            let Some(latency_ms) = latency_ms else {
                return Ok((ticket, Vec::new()));
            };
            info!(
                ticket_id = %ticket_id,
                kitchen_id = ?ticket.kitchen_id,
                latency_ms,
                "Kitchen acknowledged ticket"
            );
            Ok((ticket.clone(), vec![Mutation::KdsTickets(ticket)]))
        })
        .await
    }

    /// Fill empty phase timestamps. Already-set phases are left alone.
    pub async fn set_phase_time(
        &self,
        order_id: &str,
        patch: PhasePatch,
    ) -> StoreResult<(PhaseTimeline, WriteOutcome)> {
        self.commit("set_phase_time", |conn| {
            orders::require_order(conn, order_id)?;
            let (timeline, changed) = kds::set_phase_times(conn, order_id, &patch)?;
            let mutations = if changed {
                vec![Mutation::KdsPhaseTimes(timeline.clone())]
            } else {
                Vec::new()
            };
            Ok((timeline, mutations))
        })
        .await
    }

    pub async fn update_unit_state(
        &self,
        update: UnitStateUpdate,
    ) -> StoreResult<(TicketUnitState, WriteOutcome)> {
        self.commit("update_unit_state", |conn| {
            orders::require_order(conn, &update.order_id)?;
            let state = kds::upsert_unit_state(conn, &update, true)?;
            Ok((state.clone(), vec![Mutation::KdsUnitStates(state)]))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Push every pending row and tombstone, parents first. Stops at the
    /// first remote failure; the rest stays pending for the next pass.
    pub async fn replay_pending(&self) -> StoreResult<ReplayReport> {
        let pending = self.db.with_conn(pending_mutations)?;
        let Some(cloud) = &self.cloud else {
            return Ok(ReplayReport {
                pushed: 0,
                remaining: pending.len(),
            });
        };
        if pending.is_empty() {
            return Ok(ReplayReport::default());
        }

        let mut pushed = 0;
        let mut tables = BTreeSet::new();
        for mutation in &pending {
            if let Err(err) = self.push_one(cloud.as_ref(), mutation).await {
                debug!(error = %err, remaining = pending.len() - pushed, "Replay interrupted");
                break;
            }
            pushed += 1;
            tables.insert(match mutation {
                Mutation::Tombstone(t) => t.table_name.clone(),
                other => other.table().to_string(),
            });
        }

        if !tables.is_empty() {
            let at = now_ts();
            self.db.with_conn(|conn| {
                for table in &tables {
                    db::mark_pushed(conn, table, &at)?;
                }
                Ok(())
            })?;
        }

        let report = ReplayReport {
            pushed,
            remaining: pending.len() - pushed,
        };
        if pushed > 0 {
            info!(pushed, remaining = report.remaining, "Replayed pending writes");
        }
        Ok(report)
    }

    /// Completeness of a ticket from its unit states, computed on demand.
    pub fn is_ticket_complete(
        &self,
        ticket_id: &str,
        required: &HashMap<String, Vec<String>>,
    ) -> StoreResult<bool> {
        self.db
            .with_conn(|conn| kds::ticket_is_complete(conn, ticket_id, required))
    }
}

fn check_acknowledged(db: &DbState, ticket_id: &str) {
    match db.with_conn(|conn| kds::get_ticket(conn, ticket_id)) {
        Ok(Some(ticket)) if ticket.acknowledged_at.is_none() => {
            warn!(
                ticket_id = %ticket_id,
                order_id = %ticket.order_id,
                kitchen_id = ?ticket.kitchen_id,
                "Kitchen ticket not acknowledged in time"
            );
        }
        Ok(_) => {}
        Err(e) => debug!(ticket_id = %ticket_id, error = %e, "Acknowledgment check skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting;
    use crate::cloud::CloudFuture;
    use crate::db::open_in_memory;
    use crate::models::PaymentMethod;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-process cloud that can be switched offline.
    #[derive(Default)]
    struct FakeCloud {
        offline: AtomicBool,
        delay: Option<Duration>,
        received: Mutex<Vec<String>>,
    }

    impl FakeCloud {
        fn offline() -> Self {
            let cloud = Self::default();
            cloud.offline.store(true, Ordering::SeqCst);
            cloud
        }

        fn tables(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }
    }

    impl CloudClient for FakeCloud {
        fn push<'a>(&'a self, mutation: &'a Mutation) -> CloudFuture<'a, Result<(), RemoteError>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.offline.load(Ordering::SeqCst) {
                    return Err(RemoteError::Unavailable("offline".into()));
                }
                self.received
                    .lock()
                    .unwrap()
                    .push(mutation.table().to_string());
                Ok(())
            })
        }

        fn is_reachable(&self) -> CloudFuture<'_, bool> {
            Box::pin(async move { !self.offline.load(Ordering::SeqCst) })
        }
    }

    fn test_db() -> Arc<DbState> {
        let db = open_in_memory().expect("open in-memory db");
        db.with_transaction(|tx| {
            db::upsert_kitchen(tx, "K1", "Hot kitchen", Some("grill"))?;
            db::upsert_kitchen(tx, "K2", "Cold kitchen", None)?;
            db::set_category_kitchens(tx, "C1", &["K1", "K2"])?;
            db::set_category_kitchens(tx, "C2", &["K1"])?;
            Ok(())
        })
        .unwrap();
        Arc::new(db)
    }

    fn item(category: &str, price: i64) -> NewOrderItem {
        NewOrderItem {
            product_id: format!("prod-{category}"),
            category_id: Some(category.to_string()),
            quantity: 1,
            unit_price_cents: price,
            notes: None,
        }
    }

    fn pending_count(db: &DbState) -> usize {
        db.with_conn(pending_mutations).unwrap().len()
    }

    #[tokio::test]
    async fn test_without_cloud_writes_stay_local() {
        let db = test_db();
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1");

        let (order, outcome) = orch.create_order(NewOrder::default()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::LocalOnly(RemoteError::NotConfigured));
        assert!(order.pending_sync);
        assert_eq!(order.terminal_id.as_deref(), Some("t1"));
        assert_eq!(order.order_number, Some(1));
    }

    #[tokio::test]
    async fn test_online_write_is_synced() {
        let db = test_db();
        let cloud = Arc::new(FakeCloud::default());
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1").with_cloud(cloud.clone());

        let (order, outcome) = orch.create_order(NewOrder::default()).await.unwrap();
        assert!(outcome.is_synced());
        let (added, outcome) = orch.add_item(&order.id, item("C1", 1200)).await.unwrap();
        assert!(outcome.is_synced());
        assert_eq!(added.order.total_cents, 1200);
        assert_eq!(added.routing.created.len(), 2);

        assert_eq!(pending_count(&db), 0);
        let tables = cloud.tables();
        assert_eq!(tables[0], "orders");
        assert!(tables.contains(&"kds_tickets".to_string()));
        assert!(tables.contains(&"kds_phase_times".to_string()));
    }

    #[tokio::test]
    async fn test_offline_cloud_falls_back_then_replays() {
        let db = test_db();
        let cloud = Arc::new(FakeCloud::offline());
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1").with_cloud(cloud.clone());

        let (order, outcome) = orch.create_order(NewOrder::default()).await.unwrap();
        assert!(matches!(
            outcome,
            WriteOutcome::LocalOnly(RemoteError::Unavailable(_))
        ));
        orch.add_item(&order.id, item("C2", 800)).await.unwrap();
        orch.add_payment(
            &order.id,
            NewPayment {
                method: PaymentMethod::Pix,
                amount_cents: 800,
                change_cents: 0,
                authorization_code: None,
            },
        )
        .await
        .unwrap();

        // order, item, ticket, timeline and payment
        let owed = pending_count(&db);
        assert_eq!(owed, 5);
        assert_eq!(db.with_conn(|c| Ok(accounting::queue_size(c))).unwrap(), 5);

        let report = orch.replay_pending().await.unwrap();
        assert_eq!(report, ReplayReport { pushed: 0, remaining: owed });

        cloud.offline.store(false, Ordering::SeqCst);
        let report = orch.replay_pending().await.unwrap();
        assert_eq!(report.pushed, owed);
        assert_eq!(report.remaining, 0);
        assert_eq!(pending_count(&db), 0);
        assert_eq!(db.with_conn(|c| Ok(accounting::queue_size(c))).unwrap(), 0);

        let pushed_at = db
            .with_conn(|c| {
                Ok(c.query_row(
                    "SELECT last_pushed_at FROM sync_log WHERE table_name = 'orders'",
                    [],
                    |row| row.get::<_, Option<String>>(0),
                )?)
            })
            .unwrap();
        assert!(pushed_at.is_some());
    }

    #[tokio::test]
    async fn test_slow_cloud_times_out() {
        let db = test_db();
        let cloud = Arc::new(FakeCloud {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1")
            .with_cloud(cloud)
            .with_cloud_timeout(Duration::from_millis(20));

        let (order, outcome) = orch.create_order(NewOrder::default()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::LocalOnly(RemoteError::Timeout));
        let stored = db.with_conn(|c| orders::require_order(c, &order.id)).unwrap();
        assert!(stored.pending_sync);
    }

    #[tokio::test]
    async fn test_remove_item_pushes_tombstone() {
        let db = test_db();
        let cloud = Arc::new(FakeCloud::offline());
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1").with_cloud(cloud.clone());

        let (order, _) = orch.create_order(NewOrder::default()).await.unwrap();
        let (added, _) = orch.add_item(&order.id, item("C2", 500)).await.unwrap();
        let (order, outcome) = orch.remove_item(&added.item.id).await.unwrap();
        assert!(!outcome.is_synced());
        assert_eq!(order.total_cents, 0);
        assert_eq!(db.with_conn(db::list_tombstones).unwrap().len(), 1);

        cloud.offline.store(false, Ordering::SeqCst);
        orch.replay_pending().await.unwrap();
        assert!(db.with_conn(db::list_tombstones).unwrap().is_empty());
        assert_eq!(cloud.tables().last().map(String::as_str), Some("tombstone"));
    }

    #[tokio::test]
    async fn test_close_order_forces_tickets_and_stamps_delivery() {
        let db = test_db();
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1");

        let (order, _) = orch.create_order(NewOrder::default()).await.unwrap();
        let (added, _) = orch.add_item(&order.id, item("C1", 1000)).await.unwrap();
        let first = &added.routing.created[0];
        orch.acknowledge_ticket(&first.id).await.unwrap();
        orch.advance_ticket(&first.id, TicketStatus::Prep).await.unwrap();

        let (finished, _) = orch.close_order(&order.id).await.unwrap();
        assert_eq!(finished.order.status, OrderStatus::Closed);
        assert_eq!(finished.forced_tickets.len(), 2);
        assert!(finished
            .forced_tickets
            .iter()
            .all(|t| t.status == TicketStatus::Done));

        let timeline = db
            .with_conn(|c| kds::get_phase_timeline(c, &order.id))
            .unwrap()
            .expect("timeline");
        assert!(timeline.new_start.is_some());
        assert!(timeline.preparing_start.is_some());
        assert!(timeline.delivered_at.is_some());

        let err = orch.add_item(&order.id, item("C1", 100)).await.unwrap_err();
        assert!(matches!(err, crate::error::StoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_close_order_tolerates_timeline_ahead_of_clock() {
        let db = test_db();
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1");

        let (order, _) = orch.create_order(NewOrder::default()).await.unwrap();
        let (added, _) = orch.add_item(&order.id, item("C1", 1000)).await.unwrap();
        let ahead = (chrono::Utc::now() + chrono::Duration::hours(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        orch.set_phase_time(
            &order.id,
            PhasePatch {
                ready_at: Some(ahead.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let (ticket, _) = orch
            .advance_ticket(&added.routing.created[0].id, TicketStatus::Prep)
            .await
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Prep);

        let (finished, _) = orch.close_order(&order.id).await.unwrap();
        assert_eq!(finished.order.status, OrderStatus::Closed);
        let timeline = db
            .with_conn(|c| kds::get_phase_timeline(c, &order.id))
            .unwrap()
            .expect("timeline");
        assert_eq!(timeline.ready_at.as_deref(), Some(ahead.as_str()));
        assert_eq!(timeline.delivered_at.as_deref(), Some(ahead.as_str()));
        assert!(timeline.preparing_start.is_some());
    }

    #[tokio::test]
    async fn test_second_acknowledgment_is_not_pushed() {
        let db = test_db();
        let cloud = Arc::new(FakeCloud::default());
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1").with_cloud(cloud.clone());

        let (order, _) = orch.create_order(NewOrder::default()).await.unwrap();
        let (added, _) = orch.add_item(&order.id, item("C2", 100)).await.unwrap();
        let ticket_id = added.routing.created[0].id.clone();

        let (ticket, _) = orch.acknowledge_ticket(&ticket_id).await.unwrap();
        let first_ack = ticket.acknowledged_at.clone();
        assert!(first_ack.is_some());
        let before = cloud.tables().len();

        let (ticket, outcome) = orch.acknowledge_ticket(&ticket_id).await.unwrap();
        assert!(outcome.is_synced());
        assert_eq!(ticket.acknowledged_at, first_ack);
        assert_eq!(cloud.tables().len(), before);
    }

    #[tokio::test]
    async fn test_cash_session_flow() {
        let db = test_db();
        let orch = Orchestrator::new(db.clone(), Scheduler::new(), "t1");

        let (session, _) = orch.open_cash_session("ana", 10_000).await.unwrap();
        orch.record_movement(&session.id, MovementKind::Out, "ice", 1_500)
            .await
            .unwrap();
        let (closed, _) = orch
            .close_cash_session(&session.id, "ana", 8_500)
            .await
            .unwrap();
        assert_eq!(closed.closing_cents, Some(8_500));
        assert!(orch.open_cash_session("bia", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_ack_check_runs_on_scheduler() {
        let db = test_db();
        let scheduler = Scheduler::new();
        let orch = Orchestrator::new(db.clone(), scheduler.clone(), "t1")
            .with_ack_check_delay(Duration::from_millis(10));

        let (order, _) = orch.create_order(NewOrder::default()).await.unwrap();
        orch.add_item(&order.id, item("C1", 100)).await.unwrap();
        assert_eq!(scheduler.active_tasks(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.active_tasks(), 0);
        scheduler.shutdown().await;
    }
}
