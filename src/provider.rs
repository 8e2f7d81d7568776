//! Channel provider boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::models::DeliveryChannel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
    pub accepted: bool,
}

/// An external SMS or email gateway.
///
/// Implementations classify failures: `ProviderError::Transient` is retried,
/// `ProviderError::Permanent` (bad address, rejected content) is not.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        content: &str,
        subject: Option<&str>,
    ) -> Result<ProviderReceipt, ProviderError>;
}

/// Logs each delivery instead of contacting a gateway.
#[derive(Debug, Default, Clone)]
pub struct DryRunProvider;

#[async_trait]
impl ChannelProvider for DryRunProvider {
    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        content: &str,
        subject: Option<&str>,
    ) -> Result<ProviderReceipt, ProviderError> {
        if address.trim().is_empty() {
            return Err(ProviderError::Permanent("empty address".to_string()));
        }
        if channel == DeliveryChannel::Email && !address.contains('@') {
            return Err(ProviderError::Permanent(format!(
                "malformed email address: {address}"
            )));
        }

        let provider_message_id = format!("dry-{}", Uuid::new_v4());
        info!(
            channel = %channel,
            address,
            subject = subject.unwrap_or(""),
            chars = content.chars().count(),
            provider_message_id = %provider_message_id,
            "Dry-run delivery"
        );
        Ok(ProviderReceipt {
            provider_message_id,
            accepted: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_accepts_well_formed_addresses() {
        let receipt = DryRunProvider
            .send(DeliveryChannel::Sms, "+250788123456", "hello", None)
            .await
            .unwrap();
        assert!(receipt.accepted);
        assert!(receipt.provider_message_id.starts_with("dry-"));
    }

    #[tokio::test]
    async fn dry_run_rejects_malformed_email_permanently() {
        let err = DryRunProvider
            .send(DeliveryChannel::Email, "not-an-address", "hello", Some("hi"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
