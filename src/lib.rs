//! Student early-warning engine: risk detection per school rules, flag
//! reconciliation, and guardian notifications over SMS and email.

pub mod alerts;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod provider;
pub mod reconcile;
pub mod risk;
pub mod rules;
pub mod store;
pub mod templates;
pub mod tracker;

pub use alerts::{EarlyWarning, StudentReport, SweepEntry};
pub use config::{AppConfig, DispatchConfig, RetryPolicy};
pub use db::PgStore;
pub use dispatch::{BulkRequest, CancelHandle, Dispatcher, SendRequest};
pub use error::{
    ConfigError, DetectionError, DispatchError, ProviderError, RulesError, StoreError, TemplateError,
    TrackerError,
};
pub use memory::InMemoryStore;
pub use provider::{ChannelProvider, DryRunProvider, ProviderReceipt};
pub use reconcile::{DomainOutcome, FlagAction, FlagReconciler};
pub use risk::RiskDetector;
pub use rules::{RiskRuleConfig, RuleConfigService, RulePatch};
pub use templates::TemplateEngine;
pub use tracker::DeliveryTracker;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` overrides `filter`.
pub fn init_tracing(filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
