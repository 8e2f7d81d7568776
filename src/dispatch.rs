//! Multi-channel notification dispatch.
//!
//! Every sub-delivery runs on the shared worker pool: a task is only spawned once a
//! pool permit is held, so a full pool blocks submission instead of queueing. Each
//! provider call is wrapped in a timeout, and timeouts share the transient retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{DispatchConfig, RetryPolicy};
use crate::error::{DispatchError, ProviderError, TemplateError, TrackerError};
use crate::models::{
    BulkDispatchResult, Channel, DeliveryChannel, Language, Message, MessageContent,
    MessageStatus, Recipient, SubDelivery,
};
use crate::provider::ChannelProvider;
use crate::store::ReadModel;
use crate::templates::TemplateEngine;
use crate::tracker::DeliveryTracker;

#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub recipient: Recipient,
    pub channel: Channel,
    pub content: MessageContent,
    pub language: Language,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    pub student_ids: Vec<Uuid>,
    pub channel: Channel,
    /// Template variables are completed per recipient with `guardian_name` and `student_name`.
    pub content: MessageContent,
    pub language: Language,
}

/// Cooperative cancellation for a bulk job. Checked before each recipient is submitted.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type DeliveryHandle = JoinHandle<Result<SubDelivery, TrackerError>>;

enum BulkEntry {
    Done(BulkDispatchResult),
    InFlight {
        student_id: Uuid,
        message_id: Uuid,
        handles: Vec<DeliveryHandle>,
    },
}

#[derive(Clone)]
pub struct Dispatcher {
    provider: Arc<dyn ChannelProvider>,
    templates: Arc<TemplateEngine>,
    tracker: DeliveryTracker,
    read_model: Arc<dyn ReadModel>,
    retry: RetryPolicy,
    workers: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        templates: Arc<TemplateEngine>,
        tracker: DeliveryTracker,
        read_model: Arc<dyn ReadModel>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            provider,
            templates,
            tracker,
            read_model,
            retry: config.retry.clone(),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
        }
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn templates(&self) -> &TemplateEngine {
        &self.templates
    }

    /// Send one message and wait until every sub-delivery reached a final status for this run.
    pub async fn send(&self, request: &SendRequest) -> Result<Message, DispatchError> {
        let message = self.prepare(
            &request.recipient,
            request.channel,
            &request.content,
            request.language,
        )?;
        self.tracker.record_created(&message).await?;

        let mut handles = Vec::with_capacity(message.deliveries.len());
        for delivery in &message.deliveries {
            let permit = self.acquire_worker().await?;
            handles.push(self.spawn_delivery(&message, delivery, permit));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| DispatchError::Task(e.to_string()))??;
        }

        self.tracker
            .message(message.id)
            .await?
            .ok_or_else(|| DispatchError::Task(format!("message {} vanished", message.id)))
    }

    /// Send to the primary guardian of each student.
    ///
    /// Missing guardians or contact methods become `skipped` entries and a failed
    /// delivery only marks its own entry. The whole batch fails only on a missing
    /// template or a storage fault.
    pub async fn send_bulk(
        &self,
        request: &BulkRequest,
        cancel: &CancelHandle,
    ) -> Result<Vec<BulkDispatchResult>, DispatchError> {
        if let MessageContent::Template { template_id, .. } = &request.content {
            if !self.templates.contains(template_id) {
                return Err(TemplateError::NotFound {
                    template_id: template_id.clone(),
                }
                .into());
            }
        }

        let mut entries = Vec::with_capacity(request.student_ids.len());
        let mut cancelled_logged = false;

        for &student_id in &request.student_ids {
            if cancel.is_cancelled() {
                if !cancelled_logged {
                    warn!(student_id = %student_id, "Bulk dispatch cancelled, skipping remaining recipients");
                    cancelled_logged = true;
                }
                entries.push(BulkEntry::Done(BulkDispatchResult::skipped(
                    student_id,
                    "cancelled before dispatch",
                )));
                continue;
            }

            let entry = self.submit_recipient(student_id, request, cancel).await?;
            entries.push(entry);
        }

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = match entry {
                BulkEntry::Done(result) => result,
                BulkEntry::InFlight {
                    student_id,
                    message_id,
                    handles,
                } => self.collect(student_id, message_id, handles).await?,
            };
            results.push(result);
        }

        let skipped = results.iter().filter(|r| r.skipped).count();
        info!(
            recipients = results.len(),
            skipped,
            "Bulk dispatch finished"
        );
        Ok(results)
    }

    async fn submit_recipient(
        &self,
        student_id: Uuid,
        request: &BulkRequest,
        cancel: &CancelHandle,
    ) -> Result<BulkEntry, DispatchError> {
        let Some(guardian) = self.read_model.primary_guardian(student_id).await? else {
            info!(student_id = %student_id, "Skipping recipient without a primary guardian");
            return Ok(BulkEntry::Done(BulkDispatchResult::skipped(
                student_id,
                "no primary guardian",
            )));
        };
        let student_name = self
            .read_model
            .student(student_id)
            .await?
            .map(|s| s.full_name)
            .unwrap_or_default();

        let content = match &request.content {
            MessageContent::Template {
                template_id,
                variables,
            } => {
                let mut variables = variables.clone();
                variables
                    .entry("guardian_name".to_string())
                    .or_insert_with(|| guardian.full_name.clone());
                variables
                    .entry("student_name".to_string())
                    .or_insert(student_name);
                MessageContent::Template {
                    template_id: template_id.clone(),
                    variables,
                }
            }
            raw => raw.clone(),
        };

        let message = match self.prepare(
            &guardian.recipient(),
            request.channel,
            &content,
            request.language,
        ) {
            Ok(message) => message,
            Err(DispatchError::NoContactMethod { .. }) => {
                info!(
                    student_id = %student_id,
                    channel = request.channel.as_str(),
                    "Skipping recipient without a matching contact method"
                );
                return Ok(BulkEntry::Done(BulkDispatchResult::skipped(
                    student_id,
                    format!("no contact method for {}", request.channel.as_str()),
                )));
            }
            Err(DispatchError::Template(err @ TemplateError::Render { .. })) => {
                warn!(student_id = %student_id, error = %err, "Template render failed for recipient");
                return Ok(BulkEntry::Done(BulkDispatchResult {
                    student_id,
                    skipped: false,
                    reason: Some(err.to_string()),
                    message_id: None,
                    status: None,
                }));
            }
            Err(other) => return Err(other),
        };

        // The pool may have been full for a while; re-check before anything starts.
        let first_permit = self.acquire_worker().await?;
        if cancel.is_cancelled() {
            return Ok(BulkEntry::Done(BulkDispatchResult::skipped(
                student_id,
                "cancelled before dispatch",
            )));
        }

        self.tracker.record_created(&message).await?;
        let mut handles = Vec::with_capacity(message.deliveries.len());
        let mut permit = Some(first_permit);
        for delivery in &message.deliveries {
            let held = match permit.take() {
                Some(p) => p,
                None => self.acquire_worker().await?,
            };
            handles.push(self.spawn_delivery(&message, delivery, held));
        }

        Ok(BulkEntry::InFlight {
            student_id,
            message_id: message.id,
            handles,
        })
    }

    async fn collect(
        &self,
        student_id: Uuid,
        message_id: Uuid,
        handles: Vec<DeliveryHandle>,
    ) -> Result<BulkDispatchResult, DispatchError> {
        let mut task_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => task_error = Some(err.to_string()),
                Err(err) => task_error = Some(err.to_string()),
            }
        }

        let message = self.tracker.message(message_id).await?;
        let status = message.as_ref().map(Message::status);
        let reason = task_error.or_else(|| {
            message
                .as_ref()
                .filter(|m| m.status() == MessageStatus::Failed)
                .and_then(|m| m.last_error().map(str::to_string))
        });

        Ok(BulkDispatchResult {
            student_id,
            skipped: false,
            reason,
            message_id: Some(message_id),
            status,
        })
    }

    /// Resolve channels against the recipient's contacts and render the content.
    fn prepare(
        &self,
        recipient: &Recipient,
        channel: Channel,
        content: &MessageContent,
        language: Language,
    ) -> Result<Message, DispatchError> {
        let targets: Vec<(DeliveryChannel, String)> = channel
            .expand()
            .iter()
            .filter_map(|&ch| recipient.address_for(ch).map(|a| (ch, a.to_string())))
            .collect();
        if targets.is_empty() {
            return Err(DispatchError::NoContactMethod {
                recipient: recipient.name.clone(),
            });
        }

        let (template_id, used_language, subject, body, fell_back) = match content {
            MessageContent::Template {
                template_id,
                variables,
            } => {
                let rendered = self.templates.render(template_id, language, variables)?;
                (
                    Some(template_id.clone()),
                    rendered.language,
                    rendered.subject,
                    rendered.body,
                    rendered.fell_back,
                )
            }
            MessageContent::Raw { subject, body } => {
                (None, language, subject.clone(), body.clone(), false)
            }
        };

        let id = Uuid::new_v4();
        let now = Utc::now();
        Ok(Message {
            id,
            recipient: recipient.clone(),
            channel,
            template_id,
            language: used_language,
            subject,
            body,
            language_fallback: fell_back,
            created_at: now,
            deliveries: targets
                .into_iter()
                .map(|(channel, address)| SubDelivery {
                    message_id: id,
                    channel,
                    address,
                    status: MessageStatus::Pending,
                    attempt_count: 0,
                    last_error: None,
                    provider_message_id: None,
                    updated_at: now,
                })
                .collect(),
        })
    }

    async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit, DispatchError> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DispatchError::Task(e.to_string()))
    }

    fn spawn_delivery(
        &self,
        message: &Message,
        delivery: &SubDelivery,
        permit: OwnedSemaphorePermit,
    ) -> DeliveryHandle {
        let this = self.clone();
        let message_id = message.id;
        let channel = delivery.channel;
        let address = delivery.address.clone();
        let subject = message.subject.clone();
        let body = message.body.clone();

        tokio::spawn(async move {
            let _permit = permit;
            this.deliver(message_id, channel, &address, subject.as_deref(), &body)
                .await
        })
    }

    /// Drive one sub-delivery to SENT or FAILED.
    async fn deliver(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
        address: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<SubDelivery, TrackerError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(
                self.retry.provider_timeout,
                self.provider.send(channel, address, body, subject),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.retry.provider_timeout)),
            }
            .and_then(|receipt| {
                if receipt.accepted {
                    Ok(receipt)
                } else {
                    Err(ProviderError::Permanent(format!(
                        "provider rejected message {}",
                        receipt.provider_message_id
                    )))
                }
            });

            match outcome {
                Ok(receipt) => {
                    return self
                        .tracker
                        .mark_sent(message_id, channel, attempt, receipt.provider_message_id)
                        .await;
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    warn!(
                        message_id = %message_id,
                        channel = %channel,
                        error = %err,
                        attempt,
                        max_attempts,
                        retry_delay_ms = delay.as_millis() as u64,
                        "Retrying delivery"
                    );
                    self.tracker
                        .record_attempt(message_id, channel, attempt, &err.to_string())
                        .await?;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        message_id = %message_id,
                        channel = %channel,
                        error = %err,
                        attempt,
                        "Delivery failed"
                    );
                    return self
                        .tracker
                        .mark_failed(message_id, channel, attempt, err.to_string())
                        .await;
                }
            }
        }
    }
}

/// Variables for a template send, built from string pairs.
pub fn template_content(template_id: &str, variables: &[(&str, &str)]) -> MessageContent {
    MessageContent::Template {
        template_id: template_id.to_string(),
        variables: variables
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
    }
}
