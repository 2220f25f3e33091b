//! The Email Worker: claims queued messages, checks suppression, resolves
//! DKIM, sends through the SMTP transport, and drives the per-message
//! status machine.

use std::sync::Arc;

use chrono::Utc;
use mail_builder::MessageBuilder;
use mail_parser::MessageParser;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::address::{domain_part, normalize_address};
use crate::config::Config;
use crate::dkim::PrivateKey;
use crate::events::{self, BounceDetails};
use crate::models::{Domain, Message, SuppressionReason};
use crate::smtp::{OutboundMessage, SendError, SmtpTransport};
use crate::store::Store;

#[derive(Clone)]
pub struct EmailWorker {
    store: Store,
    smtp: Arc<dyn SmtpTransport>,
    config: Arc<Config>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl EmailWorker {
    pub fn new(
        store: Store,
        smtp: Arc<dyn SmtpTransport>,
        config: Arc<Config>,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            smtp,
            config,
            wake,
            shutdown,
        }
    }

    /// Runs until shutdown is requested. Each wake-up — a notification
    /// relayed from the Listener, or a poll tick — drains the queue once.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("shutting down email worker");
                        return;
                    }
                    _ = self.wake.notified() => {}
                }
                self.drain_queue().await;
            }
        })
    }

    /// Claims up to `worker_concurrency` messages in parallel. The claim
    /// loop for this batch stops once a claim returns nothing or shutdown
    /// is requested.
    async fn drain_queue(&self) {
        let permits = Arc::new(Semaphore::new(self.config.worker_concurrency));
        let mut tasks = JoinSet::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let claimed = match self.store.messages.claim_next().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    drop(permit);
                    break;
                }
                Err(error) => {
                    error!(%error, "failed to claim next message");
                    drop(permit);
                    break;
                }
            };

            let worker = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.process_message(claimed).await;
            });
        }

        while tasks.join_next().await.is_some() {}
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id))]
    async fn process_message(&self, message: Message) {
        let to_normalized = normalize_address(&message.to_address);

        match self
            .store
            .suppressions
            .is_suppressed(message.tenant_id, &to_normalized)
            .await
        {
            Ok(Some(suppression)) => {
                let reason = format!("Recipient suppressed: {}", suppression.reason);
                if let Err(error) = self.store.messages.mark_rejected(message.id, &reason).await {
                    error!(%error, "failed to mark message rejected");
                }
                return;
            }
            Ok(None) => {}
            Err(error) => {
                error!(%error, "suppression check failed, leaving message in processing");
                return;
            }
        }

        let dkim_domain = self.resolve_dkim(&message).await;

        let message_id_value = format!("{}@{}", message.id, self.config.system_domain);
        let message_id_header = format!("<{message_id_value}>");
        let raw = self.build_raw_message(&message, &message_id_value, dkim_domain.as_ref());

        let outcome = self
            .smtp
            .send(OutboundMessage {
                from: &message.from_address,
                to: &to_normalized,
                raw: &raw,
            })
            .await;

        match outcome {
            Ok(outcome) => {
                self.handle_success(&message, &message_id_header, outcome.smtp_id.as_deref())
                    .await
            }
            Err(error) => self.handle_failure(&message, error).await,
        }
    }

    /// Looks up the sender domain and returns it only if it's verified and
    /// carries a usable key; lookup failures degrade to unsigned sending
    /// rather than stalling the message.
    async fn resolve_dkim(&self, message: &Message) -> Option<Domain> {
        let domain_name = domain_part(&message.from_address)?;
        match self
            .store
            .domains
            .find_by_tenant_and_name(message.tenant_id, domain_name)
            .await
        {
            Ok(Some(domain)) if domain.signable() => Some(domain),
            Ok(_) => None,
            Err(error) => {
                warn!(%error, domain = domain_name, "dkim lookup failed, sending unsigned");
                None
            }
        }
    }

    fn build_raw_message(
        &self,
        message: &Message,
        message_id_value: &str,
        dkim_domain: Option<&Domain>,
    ) -> Vec<u8> {
        let mut builder = MessageBuilder::new()
            .from(message.from_address.as_str())
            .to(message.to_address.as_str())
            .message_id(message_id_value.to_string())
            .date(Utc::now().timestamp());

        if let Some(subject) = &message.subject {
            builder = builder.subject(subject.as_str());
        }
        if let Some(body) = &message.body {
            builder = builder.text_body(body.as_str());
        }
        if let Some(html) = &message.html_body {
            builder = builder.html_body(html.as_str());
        }

        let unsigned = builder
            .write_to_vec()
            .expect("writing an outbound message to an in-memory buffer cannot fail");

        let Some(domain) = dkim_domain else {
            return unsigned;
        };

        match sign(&unsigned, domain) {
            Ok(signed) => signed,
            Err(error) => {
                // Signing is a reputation concern, not a correctness one:
                // the send still goes out, just unsigned.
                warn!(%error, domain = %domain.domain, "dkim signing failed, sending unsigned");
                unsigned
            }
        }
    }

    async fn handle_success(&self, message: &Message, message_id_header: &str, smtp_id: Option<&str>) {
        if let Err(error) = self
            .store
            .messages
            .mark_sent(message.id, Some(message_id_header))
            .await
        {
            error!(%error, "failed to mark message sent");
            return;
        }

        info!("message sent");
        events::emit(
            &self.store,
            message.tenant_id,
            message.id,
            events::MESSAGE_SENT,
            events::sent_payload(message.id, smtp_id),
        )
        .await;
    }

    async fn handle_failure(&self, message: &Message, error: SendError) {
        let should_retry = error.retryable() && message.attempts < self.config.max_retries;

        if should_retry {
            if let Err(store_error) = self
                .store
                .messages
                .mark_requeued(message.id, &error.message)
                .await
            {
                error!(error = %store_error, "failed to requeue message");
            }
            return;
        }

        if let Err(store_error) = self.store.messages.mark_failed(message.id, &error.message).await {
            error!(error = %store_error, "failed to mark message failed");
            return;
        }

        if error.is_hard_bounce() {
            let normalized = normalize_address(&message.to_address);
            if let Err(store_error) = self
                .store
                .suppressions
                .upsert(message.tenant_id, &normalized, SuppressionReason::HardBounce)
                .await
            {
                error!(error = %store_error, "failed to upsert suppression after hard bounce");
            }

            events::emit(
                &self.store,
                message.tenant_id,
                message.id,
                events::MESSAGE_BOUNCED,
                events::bounced_payload(
                    message.id,
                    &BounceDetails {
                        code: error.code.unwrap_or(0),
                        message: &error.message,
                    },
                ),
            )
            .await;
        } else {
            events::emit(
                &self.store,
                message.tenant_id,
                message.id,
                events::MESSAGE_FAILED,
                events::failed_payload(message.id, &error.message),
            )
            .await;
        }
    }
}

/// Parses `raw` back out, signs it with `domain`'s stored key, and returns
/// the raw bytes with the `DKIM-Signature` header prepended.
fn sign(raw: &[u8], domain: &Domain) -> Result<Vec<u8>, String> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| "failed to parse outbound message for signing".to_string())?;
    let signer = PrivateKey::new(domain).map_err(|e| e.to_string())?;
    let header = signer.dkim_header(&parsed).map_err(|e| e.to_string())?;

    let mut signed = format!("{header}\r\n").into_bytes();
    signed.extend_from_slice(raw);
    Ok(signed)
}
