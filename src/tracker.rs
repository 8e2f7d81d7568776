//! Delivery status tracking.
//!
//! Sub-delivery status only moves forward: PENDING -> SENT -> DELIVERED, with FAILED
//! reachable from any non-terminal state. Every change is written as a conditional
//! update on the previous status and appended to the message's history.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TrackerError;
use crate::models::{DeliveryChannel, Message, MessageStatus, StatusEvent, SubDelivery};
use crate::store::{DeliveryUpdate, MessageStore};

#[derive(Clone)]
pub struct DeliveryTracker {
    store: Arc<dyn MessageStore>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn record_created(&self, message: &Message) -> Result<(), TrackerError> {
        self.store.insert_message(message).await?;
        debug!(
            message_id = %message.id,
            deliveries = message.deliveries.len(),
            "Recorded message"
        );
        Ok(())
    }

    pub async fn message(&self, message_id: Uuid) -> Result<Option<Message>, TrackerError> {
        Ok(self.store.get_message(message_id).await?)
    }

    pub async fn history(&self, message_id: Uuid) -> Result<Vec<StatusEvent>, TrackerError> {
        Ok(self.store.status_history(message_id).await?)
    }

    /// Record a failed attempt that will be retried. Status stays PENDING.
    pub async fn record_attempt(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
        attempt: u32,
        error: &str,
    ) -> Result<SubDelivery, TrackerError> {
        let update = DeliveryUpdate {
            attempt_count: Some(attempt),
            last_error: Some(error.to_string()),
            ..DeliveryUpdate::default()
        };
        self.store
            .update_delivery(
                message_id,
                channel,
                MessageStatus::Pending,
                update,
                Utc::now(),
            )
            .await?
            .ok_or(TrackerError::InvalidTransition {
                message_id,
                channel,
                from: MessageStatus::Pending,
                to: MessageStatus::Pending,
            })
    }

    pub async fn mark_sent(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
        attempts: u32,
        provider_message_id: String,
    ) -> Result<SubDelivery, TrackerError> {
        let update = DeliveryUpdate {
            attempt_count: Some(attempts),
            provider_message_id: Some(provider_message_id),
            ..DeliveryUpdate::default()
        };
        self.transition(message_id, channel, MessageStatus::Sent, update, None)
            .await
    }

    pub async fn mark_failed(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
        attempts: u32,
        error: String,
    ) -> Result<SubDelivery, TrackerError> {
        let update = DeliveryUpdate {
            attempt_count: Some(attempts),
            last_error: Some(error.clone()),
            ..DeliveryUpdate::default()
        };
        self.transition(message_id, channel, MessageStatus::Failed, update, Some(error))
            .await
    }

    /// Apply a delivery report from the provider, e.g. a DELIVERED receipt.
    pub async fn apply_provider_callback(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
        detail: Option<String>,
    ) -> Result<SubDelivery, TrackerError> {
        let delivery = self
            .store
            .find_delivery_by_provider_id(provider_message_id)
            .await?
            .ok_or_else(|| TrackerError::UnknownProviderMessage(provider_message_id.to_string()))?;

        let update = DeliveryUpdate {
            last_error: if status == MessageStatus::Failed {
                detail.clone()
            } else {
                None
            },
            ..DeliveryUpdate::default()
        };
        self.transition(delivery.message_id, delivery.channel, status, update, detail)
            .await
    }

    async fn transition(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
        to: MessageStatus,
        mut update: DeliveryUpdate,
        detail: Option<String>,
    ) -> Result<SubDelivery, TrackerError> {
        update.status = Some(to);

        // Status only moves forward, so a lost race can repeat at most twice.
        for _ in 0..3 {
            let from = self.current_status(message_id, channel).await?;
            if !from.can_transition_to(to) {
                warn!(
                    message_id = %message_id,
                    channel = %channel,
                    from = %from,
                    to = %to,
                    "Rejected status transition"
                );
                return Err(TrackerError::InvalidTransition {
                    message_id,
                    channel,
                    from,
                    to,
                });
            }

            let event = StatusEvent {
                message_id,
                channel,
                from,
                to,
                detail: detail.clone(),
                at: Utc::now(),
            };
            if let Some(delivery) = self.store.record_transition(&event, update.clone()).await? {
                debug!(
                    message_id = %message_id,
                    channel = %channel,
                    from = %from,
                    to = %to,
                    "Delivery status changed"
                );
                return Ok(delivery);
            }
        }

        let from = self.current_status(message_id, channel).await?;
        Err(TrackerError::InvalidTransition {
            message_id,
            channel,
            from,
            to,
        })
    }

    async fn current_status(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
    ) -> Result<MessageStatus, TrackerError> {
        self.store
            .get_message(message_id)
            .await?
            .and_then(|m| m.delivery(channel).map(|d| d.status))
            .ok_or(TrackerError::UnknownDelivery {
                message_id,
                channel,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::models::{Channel, Language, Recipient};

    fn message() -> Message {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let delivery = |channel, address: &str| SubDelivery {
            message_id: id,
            channel,
            address: address.to_string(),
            status: MessageStatus::Pending,
            attempt_count: 0,
            last_error: None,
            provider_message_id: None,
            updated_at: now,
        };
        Message {
            id,
            recipient: Recipient {
                name: "Claudine".to_string(),
                phone: Some("+250788000001".to_string()),
                email: Some("claudine@example.com".to_string()),
            },
            channel: Channel::Both,
            template_id: None,
            language: Language::English,
            subject: None,
            body: "Reminder".to_string(),
            language_fallback: false,
            created_at: now,
            deliveries: vec![
                delivery(DeliveryChannel::Sms, "+250788000001"),
                delivery(DeliveryChannel::Email, "claudine@example.com"),
            ],
        }
    }

    #[tokio::test]
    async fn sub_deliveries_reach_their_own_terminal_status() {
        let tracker = DeliveryTracker::new(InMemoryStore::shared());
        let message = message();
        tracker.record_created(&message).await.unwrap();

        tracker
            .mark_sent(message.id, DeliveryChannel::Sms, 1, "sms-1".to_string())
            .await
            .unwrap();
        tracker
            .record_attempt(message.id, DeliveryChannel::Email, 1, "timeout")
            .await
            .unwrap();
        tracker
            .mark_failed(message.id, DeliveryChannel::Email, 2, "mailbox full".to_string())
            .await
            .unwrap();
        tracker
            .apply_provider_callback("sms-1", MessageStatus::Delivered, None)
            .await
            .unwrap();

        let stored = tracker.message(message.id).await.unwrap().unwrap();
        assert_eq!(
            stored.delivery(DeliveryChannel::Sms).unwrap().status,
            MessageStatus::Delivered
        );
        let email = stored.delivery(DeliveryChannel::Email).unwrap();
        assert_eq!(email.status, MessageStatus::Failed);
        assert_eq!(email.last_error.as_deref(), Some("mailbox full"));
        assert_eq!(stored.status(), MessageStatus::Delivered);
        assert_eq!(stored.attempt_count(), 3);

        let history = tracker.history(message.id).await.unwrap();
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn terminal_status_is_immutable() {
        let tracker = DeliveryTracker::new(InMemoryStore::shared());
        let message = message();
        tracker.record_created(&message).await.unwrap();
        tracker
            .mark_sent(message.id, DeliveryChannel::Sms, 1, "sms-9".to_string())
            .await
            .unwrap();
        tracker
            .apply_provider_callback("sms-9", MessageStatus::Failed, Some("handset off".into()))
            .await
            .unwrap();

        let late = tracker
            .apply_provider_callback("sms-9", MessageStatus::Delivered, None)
            .await;
        assert!(matches!(
            late,
            Err(TrackerError::InvalidTransition {
                from: MessageStatus::Failed,
                to: MessageStatus::Delivered,
                ..
            })
        ));

        let backwards = tracker
            .mark_sent(message.id, DeliveryChannel::Sms, 1, "sms-10".to_string())
            .await;
        assert!(backwards.is_err());
    }

    #[tokio::test]
    async fn failed_callback_after_send_keeps_message_sent() {
        let tracker = DeliveryTracker::new(InMemoryStore::shared());
        let message = message();
        tracker.record_created(&message).await.unwrap();
        tracker
            .mark_sent(message.id, DeliveryChannel::Sms, 1, "p1".to_string())
            .await
            .unwrap();
        let before = tracker.message(message.id).await.unwrap().unwrap().status();
        assert_eq!(before, MessageStatus::Sent);

        tracker
            .apply_provider_callback("p1", MessageStatus::Failed, Some("handset off".into()))
            .await
            .unwrap();
        let stored = tracker.message(message.id).await.unwrap().unwrap();
        assert_eq!(
            stored.delivery(DeliveryChannel::Email).unwrap().status,
            MessageStatus::Pending
        );
        assert_eq!(stored.status(), MessageStatus::Sent);

        tracker
            .mark_failed(message.id, DeliveryChannel::Email, 3, "bounced".to_string())
            .await
            .unwrap();
        let stored = tracker.message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Failed);
    }

    #[tokio::test]
    async fn early_failure_leaves_message_pending() {
        let tracker = DeliveryTracker::new(InMemoryStore::shared());
        let message = message();
        tracker.record_created(&message).await.unwrap();
        tracker
            .mark_failed(message.id, DeliveryChannel::Sms, 1, "invalid number".to_string())
            .await
            .unwrap();

        let stored = tracker.message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_provider_id_is_reported() {
        let tracker = DeliveryTracker::new(InMemoryStore::shared());
        let result = tracker
            .apply_provider_callback("missing", MessageStatus::Delivered, None)
            .await;
        assert!(matches!(result, Err(TrackerError::UnknownProviderMessage(_))));
    }
}
