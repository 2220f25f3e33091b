//! Webhook emission: the side effect the Email Worker fires off for every
//! status transition. Building the payload and inserting the
//! `webhook_deliveries` row is decoupled from actually POSTing it — that's
//! the Webhook Dispatcher's job (`crate::webhook`).

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::ids::{MessageId, TenantId};
use crate::models::NewWebhookDelivery;
use crate::store::Store;

pub const MESSAGE_SENT: &str = "message.sent";
pub const MESSAGE_BOUNCED: &str = "message.bounced";
pub const MESSAGE_FAILED: &str = "message.failed";

pub struct BounceDetails<'a> {
    pub code: u16,
    pub message: &'a str,
}

pub fn sent_payload(message_id: MessageId, smtp_id: Option<&str>) -> serde_json::Value {
    json!({
        "event": MESSAGE_SENT,
        "timestamp": Utc::now().to_rfc3339(),
        "messageId": message_id.to_string(),
        "smtpMessageId": smtp_id,
    })
}

pub fn bounced_payload(message_id: MessageId, bounce: &BounceDetails<'_>) -> serde_json::Value {
    json!({
        "event": MESSAGE_BOUNCED,
        "timestamp": Utc::now().to_rfc3339(),
        "messageId": message_id.to_string(),
        "bounceType": "hard",
        "bounceCode": bounce.code,
        "bounceMessage": bounce.message,
    })
}

pub fn failed_payload(message_id: MessageId, failure_reason: &str) -> serde_json::Value {
    json!({
        "event": MESSAGE_FAILED,
        "timestamp": Utc::now().to_rfc3339(),
        "messageId": message_id.to_string(),
        "failureReason": failure_reason,
    })
}

/// Inserts one `webhook_deliveries` row per active webhook subscribed to
/// `event`. A lookup or insert failure is logged and dropped: it must never
/// fail the message transition that produced the event.
pub async fn emit(store: &Store, tenant_id: TenantId, message_id: MessageId, event: &str, payload: serde_json::Value) {
    let subscribers = match store.webhooks.active_subscribers(tenant_id, event).await {
        Ok(subs) => subs,
        Err(error) => {
            warn!(%error, event, "failed to look up webhook subscribers, dropping emission");
            return;
        }
    };

    for webhook in subscribers {
        let new = NewWebhookDelivery {
            webhook_id: webhook.id,
            message_id: Some(message_id),
            event: event.to_string(),
            payload: payload.clone(),
        };
        if let Err(error) = store.webhook_deliveries.create(&new).await {
            warn!(%error, webhook_id = %webhook.id, event, "failed to enqueue webhook delivery, dropping");
        }
    }
}
