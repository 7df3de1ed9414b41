use std::time::Duration;

use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::time;
use tracing::{error, info};

use crate::models::DbOutboxEvent;
use crate::schema::outbox_events;

type DbPool = Pool<AsyncPgConnection>;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes fulfillment events recorded by the reservation transaction.
/// Rows are marked processed only after the broker acknowledges the send, so
/// delivery is at-least-once; consumers deduplicate on requestId.
pub struct OutboxProcessor {
    pool: DbPool,
    producer: FutureProducer,
    events_topic: String,
}

impl OutboxProcessor {
    pub fn new(pool: DbPool, producer: FutureProducer, events_topic: String) -> Self {
        Self { pool, producer, events_topic }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(POLL_INTERVAL);

        loop {
            interval.tick().await;

            if let Err(e) = self.process_pending_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    async fn process_pending_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let pending = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(100)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        for event in pending {
            if let Err(e) = self.publish_event(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                continue;
            }

            diesel::update(outbox_events::table.filter(outbox_events::id.eq(event.id)))
                .set(outbox_events::processed.eq(true))
                .execute(&mut conn)
                .await?;

            info!("Published {} for request {}", event.event_type, event.request_id);
        }

        Ok(())
    }

    async fn publish_event(&self, event: &DbOutboxEvent) -> Result<()> {
        let json = serde_json::to_string(&event.event_data)?;
        let record = FutureRecord::to(&self.events_topic)
            .payload(&json)
            .key(&event.request_id);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}
