use std::collections::BTreeMap;

use anyhow::Result;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::info;
use uuid::Uuid;

use shared::{FulfillmentEvent, FulfillmentOutcome, LineItem, OrderMessage};

use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// Why a request could not be fulfilled. Rejections are domain outcomes, not
/// errors: they commit as a `rejected` order and are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidQuantity(i32),
    UnknownTicket(i32),
    InsufficientAvailability(i32),
}

impl RejectReason {
    fn describe(&self) -> String {
        match self {
            RejectReason::InvalidQuantity(ticket_id) => {
                format!("invalid quantity for ticket {}", ticket_id)
            }
            RejectReason::UnknownTicket(ticket_id) => format!("unknown ticket {}", ticket_id),
            RejectReason::InsufficientAvailability(ticket_id) => {
                format!("insufficient availability for ticket {}", ticket_id)
            }
        }
    }
}

/// Per-ticket demand totals, collapsed from the request's line items. A
/// request may name the same ticket twice; availability is checked against
/// the total. Demands iterate in ascending ticket-id order so concurrent
/// requests always take row locks in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationPlan {
    demands: BTreeMap<i32, i32>,
}

impl ReservationPlan {
    pub fn build(lines: &[LineItem]) -> Result<Self, RejectReason> {
        let mut demands = BTreeMap::new();
        for line in lines {
            if line.quantity <= 0 {
                return Err(RejectReason::InvalidQuantity(line.item_id));
            }
            let total = demands
                .get(&line.item_id)
                .copied()
                .unwrap_or(0i32)
                .checked_add(line.quantity)
                .ok_or(RejectReason::InvalidQuantity(line.item_id))?;
            demands.insert(line.item_id, total);
        }
        Ok(Self { demands })
    }

    fn demands(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.demands.iter().map(|(&ticket_id, &quantity)| (ticket_id, quantity))
    }
}

#[derive(Clone)]
pub struct ReservationEngine {
    pool: DbPool,
}

impl ReservationEngine {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Drives one request to its terminal order. Safe to call any number of
    /// times with the same request: inventory is decremented at most once,
    /// and every call converges on the same stored order.
    pub async fn reserve(&self, request: &OrderMessage) -> Result<Order> {
        let mut conn = self.pool.get().await?;

        if let Some(existing) = find_by_request_id(&mut conn, &request.request_id).await? {
            info!(
                "Request {} already processed as order {}",
                request.request_id, existing.id
            );
            return Ok(existing);
        }

        let attempt = match ReservationPlan::build(&request.line_items) {
            Ok(plan) => self.run_reservation(&mut conn, request, plan).await,
            Err(reason) => self.record_rejection(&mut conn, request, reason).await,
        };

        match attempt {
            Err(e) if is_unique_violation(&e) => {
                // Lost the insert race against a concurrent delivery of the
                // same request. The rolled-back transaction released any
                // decrements this attempt took, so the winner's order is the
                // one outcome both callers report.
                match find_by_request_id(&mut conn, &request.request_id).await? {
                    Some(existing) => Ok(existing),
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    async fn run_reservation(
        &self,
        conn: &mut AsyncPgConnection,
        request: &OrderMessage,
        plan: ReservationPlan,
    ) -> Result<Order> {
        let request = request.clone();
        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let mut held: Vec<(i32, i32)> = Vec::new();
                let mut failure = None;

                for (ticket_id, quantity) in plan.demands() {
                    let updated = diesel::update(
                        tickets::table
                            .filter(tickets::id.eq(ticket_id))
                            .filter(tickets::availability.ge(quantity)),
                    )
                    .set(tickets::availability.eq(tickets::availability - quantity))
                    .execute(conn)
                    .await?;

                    if updated == 0 {
                        let known = tickets::table
                            .find(ticket_id)
                            .first::<Ticket>(conn)
                            .await
                            .optional()?
                            .is_some();
                        failure = Some(if known {
                            RejectReason::InsufficientAvailability(ticket_id)
                        } else {
                            RejectReason::UnknownTicket(ticket_id)
                        });
                        break;
                    }
                    held.push((ticket_id, quantity));
                }

                if let Some(reason) = failure {
                    // Release the holds taken earlier in this attempt; the
                    // rejection itself still commits so a redelivery sees the
                    // same outcome instead of re-running the reservation.
                    for (ticket_id, quantity) in held {
                        diesel::update(tickets::table.find(ticket_id))
                            .set(tickets::availability.eq(tickets::availability + quantity))
                            .execute(conn)
                            .await?;
                    }
                    return persist_terminal(conn, &request, Some(reason)).await;
                }

                persist_terminal(conn, &request, None).await
            })
        })
        .await
    }

    async fn record_rejection(
        &self,
        conn: &mut AsyncPgConnection,
        request: &OrderMessage,
        reason: RejectReason,
    ) -> Result<Order> {
        let request = request.clone();
        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move { persist_terminal(conn, &request, Some(reason)).await })
        })
        .await
    }
}

/// Inserts the terminal order, its line snapshot and the fulfillment event in
/// the caller's transaction, so all three commit or roll back together.
async fn persist_terminal(
    conn: &mut AsyncPgConnection,
    request: &OrderMessage,
    reject: Option<RejectReason>,
) -> Result<Order> {
    let outcome = match reject {
        None => FulfillmentOutcome::Fulfilled,
        Some(_) => FulfillmentOutcome::Rejected,
    };
    let reason = reject.map(|r| r.describe());

    let new_order = NewOrder {
        request_id: request.request_id.clone(),
        user_id: request.user_id,
        status: match outcome {
            FulfillmentOutcome::Fulfilled => "committed".to_string(),
            FulfillmentOutcome::Rejected => "rejected".to_string(),
        },
        reject_reason: reason.clone(),
    };

    let order: Order = diesel::insert_into(orders::table)
        .values(&new_order)
        .get_result(conn)
        .await?;

    let details: Vec<NewOrderDetail> = request
        .line_items
        .iter()
        .map(|line| NewOrderDetail {
            order_id: order.id,
            ticket_id: line.item_id,
            quantity: line.quantity,
        })
        .collect();
    if !details.is_empty() {
        diesel::insert_into(order_details::table)
            .values(&details)
            .execute(conn)
            .await?;
    }

    let event = FulfillmentEvent {
        request_id: order.request_id.clone(),
        order_id: order.id,
        outcome,
        reason,
        line_items: request.line_items.clone(),
    };
    let outbox_event = NewOutboxEvent {
        id: Uuid::new_v4(),
        request_id: order.request_id.clone(),
        event_type: outcome.event_type().to_string(),
        event_data: serde_json::to_value(&event)?,
    };
    diesel::insert_into(outbox_events::table)
        .values(&outbox_event)
        .execute(conn)
        .await?;

    Ok(order)
}

async fn find_by_request_id(
    conn: &mut AsyncPgConnection,
    request_id: &str,
) -> Result<Option<Order>> {
    let order = orders::table
        .filter(orders::request_id.eq(request_id))
        .first::<Order>(conn)
        .await
        .optional()?;
    Ok(order)
}

fn is_unique_violation(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<diesel::result::Error>(),
        Some(diesel::result::Error::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            _,
        ))
    )
}


#[cfg(test)]
mod store_tests {
    use super::*;
    use diesel_async::pooled_connection::AsyncDieselConnectionManager;

    async fn test_pool() -> DbPool {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must point at a migrated database");
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
        Pool::builder().build(config).await.unwrap()
    }

    async fn seed_ticket(conn: &mut AsyncPgConnection, id: i32, availability: i32) {
        diesel::insert_into(tickets::table)
            .values(&Ticket { id, concert_id: 1, availability })
            .on_conflict(tickets::id)
            .do_update()
            .set(tickets::availability.eq(availability))
            .execute(conn)
            .await
            .unwrap();
    }

    async fn availability_of(conn: &mut AsyncPgConnection, id: i32) -> i32 {
        tickets::table
            .find(id)
            .first::<Ticket>(conn)
            .await
            .unwrap()
            .availability
    }

    fn request(request_id: &str, lines: Vec<LineItem>) -> OrderMessage {
        OrderMessage {
            request_id: request_id.to_string(),
            user_id: 1,
            line_items: lines,
        }
    }

    fn unique_id(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4())
    }

    #[tokio::test]
    #[ignore = "requires a migrated postgres at DATABASE_URL"]
    async fn replay_decrements_inventory_once() {
        let pool = test_pool().await;
        let engine = ReservationEngine::new(pool.clone());
        let mut conn = pool.get().await.unwrap();

        seed_ticket(&mut conn, 9101, 2).await;
        let req = request(&unique_id("replay"), vec![LineItem { item_id: 9101, quantity: 2 }]);

        let first = engine.reserve(&req).await.unwrap();
        assert_eq!(first.status, "committed");
        assert_eq!(availability_of(&mut conn, 9101).await, 0);

        let second = engine.reserve(&req).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(availability_of(&mut conn, 9101).await, 0);

        let late = request(&unique_id("late"), vec![LineItem { item_id: 9101, quantity: 1 }]);
        let rejected = engine.reserve(&late).await.unwrap();
        assert_eq!(rejected.status, "rejected");
        assert_eq!(
            rejected.reject_reason.as_deref(),
            Some("insufficient availability for ticket 9101")
        );
        assert_eq!(availability_of(&mut conn, 9101).await, 0);
    }

    #[tokio::test]
    #[ignore = "requires a migrated postgres at DATABASE_URL"]
    async fn short_line_restores_earlier_holds() {
        let pool = test_pool().await;
        let engine = ReservationEngine::new(pool.clone());
        let mut conn = pool.get().await.unwrap();

        seed_ticket(&mut conn, 9102, 10).await;
        seed_ticket(&mut conn, 9103, 0).await;
        let req = request(
            &unique_id("short"),
            vec![
                LineItem { item_id: 9102, quantity: 5 },
                LineItem { item_id: 9103, quantity: 5 },
            ],
        );

        let order = engine.reserve(&req).await.unwrap();
        assert_eq!(order.status, "rejected");
        assert_eq!(
            order.reject_reason.as_deref(),
            Some("insufficient availability for ticket 9103")
        );
        assert_eq!(availability_of(&mut conn, 9102).await, 10);

        let details = order_details::table
            .filter(order_details::order_id.eq(order.id))
            .order(order_details::id.asc())
            .load::<OrderDetail>(&mut conn)
            .await
            .unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].ticket_id, 9102);

        let outbox: Vec<DbOutboxEvent> = outbox_events::table
            .filter(outbox_events::request_id.eq(&order.request_id))
            .load(&mut conn)
            .await
            .unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, "OrderRejected");
    }

    #[tokio::test]
    #[ignore = "requires a migrated postgres at DATABASE_URL"]
    async fn unknown_ticket_is_rejected_without_effect() {
        let pool = test_pool().await;
        let engine = ReservationEngine::new(pool.clone());
        let mut conn = pool.get().await.unwrap();

        diesel::delete(tickets::table.find(404404))
            .execute(&mut conn)
            .await
            .unwrap();
        seed_ticket(&mut conn, 9105, 3).await;
        let req = request(
            &unique_id("unknown"),
            vec![
                LineItem { item_id: 9105, quantity: 1 },
                LineItem { item_id: 404404, quantity: 1 },
            ],
        );

        let order = engine.reserve(&req).await.unwrap();
        assert_eq!(order.status, "rejected");
        assert_eq!(order.reject_reason.as_deref(), Some("unknown ticket 404404"));
        assert_eq!(availability_of(&mut conn, 9105).await, 3);
    }

    #[tokio::test]
    #[ignore = "requires a migrated postgres at DATABASE_URL"]
    async fn concurrent_requests_never_oversell() {
        let pool = test_pool().await;
        let engine = ReservationEngine::new(pool.clone());
        let mut conn = pool.get().await.unwrap();

        seed_ticket(&mut conn, 9104, 5).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = engine.clone();
            let req = request(&unique_id("race"), vec![LineItem { item_id: 9104, quantity: 1 }]);
            handles.push(tokio::spawn(async move { engine.reserve(&req).await }));
        }

        let mut committed = 0;
        for handle in handles {
            let order = handle.await.unwrap().unwrap();
            if order.status == "committed" {
                committed += 1;
            }
        }

        assert_eq!(committed, 5);
        assert_eq!(availability_of(&mut conn, 9104).await, 0);
    }

    #[tokio::test]
    #[ignore = "requires a migrated postgres at DATABASE_URL"]
    async fn opposite_line_orders_both_terminate() {
        let pool = test_pool().await;
        let engine = ReservationEngine::new(pool.clone());
        let mut conn = pool.get().await.unwrap();

        seed_ticket(&mut conn, 9106, 10).await;
        seed_ticket(&mut conn, 9107, 10).await;

        let forward = request(
            &unique_id("fwd"),
            vec![
                LineItem { item_id: 9106, quantity: 1 },
                LineItem { item_id: 9107, quantity: 1 },
            ],
        );
        let reverse = request(
            &unique_id("rev"),
            vec![
                LineItem { item_id: 9107, quantity: 1 },
                LineItem { item_id: 9106, quantity: 1 },
            ],
        );

        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reserve(&forward).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reserve(&reverse).await }
        });

        assert_eq!(a.await.unwrap().unwrap().status, "committed");
        assert_eq!(b.await.unwrap().unwrap().status, "committed");
        assert_eq!(availability_of(&mut conn, 9106).await, 8);
        assert_eq!(availability_of(&mut conn, 9107).await, 8);
    }
}
