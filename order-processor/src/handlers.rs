use std::time::Duration;

use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use tokio::time;
use tracing::{error, info, warn};

use shared::OrderMessage;

use crate::reservation::ReservationEngine;

const RESERVE_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub struct OrderListener {
    engine: ReservationEngine,
}

impl OrderListener {
    pub fn new(engine: ReservationEngine) -> Self {
        Self { engine }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    match decode(&m) {
                        Some(request) => self.process(&request).await,
                        // A record that cannot decode will never decode;
                        // advance past it instead of poisoning the partition.
                        None => warn!("Discarding malformed record at offset {}", m.offset()),
                    }
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing offset: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    /// Runs the reservation to a terminal order before the caller commits the
    /// offset. Store trouble is retried in place with capped backoff: the
    /// record is held, never skipped, and a crash mid-retry redelivers it.
    async fn process(&self, request: &OrderMessage) {
        let mut delay = INITIAL_RETRY_DELAY;
        loop {
            match time::timeout(RESERVE_TIMEOUT, self.engine.reserve(request)).await {
                Ok(Ok(order)) => {
                    info!(
                        "Request {} reached order {} ({})",
                        request.request_id, order.id, order.status
                    );
                    return;
                }
                Ok(Err(e)) => {
                    error!("Store unavailable for request {}: {:#}", request.request_id, e)
                }
                Err(_) => error!("Reservation timed out for request {}", request.request_id),
            }
            time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }
}

fn decode(message: &BorrowedMessage<'_>) -> Option<OrderMessage> {
    let payload = match message.payload_view::<str>() {
        Some(Ok(payload)) => payload,
        Some(Err(e)) => {
            warn!("Record payload is not valid utf-8: {:?}", e);
            return None;
        }
        None => {
            warn!("Record has no payload");
            return None;
        }
    };

    match serde_json::from_str::<OrderMessage>(payload) {
        Ok(request) => Some(request),
        Err(e) => {
            warn!("Error parsing order message: {}", e);
            None
        }
    }
}
