use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::tickets)]
pub struct Ticket {
    pub id: i32,
    pub concert_id: i32,
    pub availability: i32,
}

/// Terminal record of one fulfillment attempt. `request_id` is unique, so the
/// row doubles as the idempotency ledger entry for the request.
#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: i32,
    pub request_id: String,
    pub user_id: i32,
    pub status: String,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub request_id: String,
    pub user_id: i32,
    pub status: String,
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_details)]
pub struct OrderDetail {
    pub id: i32,
    pub order_id: i32,
    pub ticket_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_details)]
pub struct NewOrderDetail {
    pub order_id: i32,
    pub ticket_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub request_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub request_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
}
