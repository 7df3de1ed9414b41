use serde::{Deserialize, Serialize};

/// Inbound order request as delivered on the ticket-orders topic. The
/// transport may redeliver the same message; `request_id` stays stable
/// across redeliveries and is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMessage {
    pub request_id: String,
    pub user_id: i32,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub item_id: i32,
    pub quantity: i32,
}

/// Outbound notification on the ticket-events topic, one per terminal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentEvent {
    pub request_id: String,
    pub order_id: i32,
    pub outcome: FulfillmentOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FulfillmentOutcome {
    Fulfilled,
    Rejected,
}

impl FulfillmentOutcome {
    pub fn event_type(&self) -> &'static str {
        match self {
            FulfillmentOutcome::Fulfilled => "OrderFulfilled",
            FulfillmentOutcome::Rejected => "OrderRejected",
        }
    }
}
