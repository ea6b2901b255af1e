//! Admission control: entitlement, lifetime caps and sliding rate windows.
//!
//! Every pipeline entry point asks [`AdmissionController::check_access`]
//! before doing work and calls [`AdmissionController::record_usage`] once the
//! guarded operation finishes, so the ledger reflects actual usage.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::formats::UsageRecord;
use crate::ledger::UsageLedger;

pub mod endpoints {
    pub const DRAFTING_RUN: &str = "drafting-run";
    pub const FACT_EXTRACTION: &str = "fact-extraction";
    pub const TRANSCRIPTION: &str = "transcription";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    /// Ascending, so the tightest window is evaluated first.
    pub const ASCENDING: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

    pub fn duration(self) -> Duration {
        match self {
            Window::Minute => Duration::minutes(1),
            Window::Hour => Duration::hours(1),
            Window::Day => Duration::days(1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    BillingInactive,
    LifetimeCap { max: u32 },
    RateWindow { window: Window, max: u32 },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::BillingInactive => f.write_str("billing is not active"),
            DenyReason::LifetimeCap { max } => write!(f, "lifetime limit of {max} reached"),
            DenyReason::RateWindow { window, max } => {
                write!(f, "at most {max} per {} allowed", window.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub max_per_day: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_max: Option<u32>,
}

impl QuotaPolicy {
    pub fn max_for(&self, window: Window) -> u32 {
        match window {
            Window::Minute => self.max_per_minute,
            Window::Hour => self.max_per_hour,
            Window::Day => self.max_per_day,
        }
    }
}

/// Per-endpoint policies with a default fallback entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaTable {
    pub default: QuotaPolicy,
    #[serde(default)]
    pub endpoints: BTreeMap<String, QuotaPolicy>,
}

impl Default for QuotaTable {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(
            endpoints::DRAFTING_RUN.to_owned(),
            QuotaPolicy {
                max_per_minute: 1,
                max_per_hour: 3,
                max_per_day: 5,
                lifetime_max: Some(3),
            },
        );
        policies.insert(
            endpoints::FACT_EXTRACTION.to_owned(),
            QuotaPolicy {
                max_per_minute: 20,
                max_per_hour: 200,
                max_per_day: 1000,
                lifetime_max: None,
            },
        );
        policies.insert(
            endpoints::TRANSCRIPTION.to_owned(),
            QuotaPolicy {
                max_per_minute: 10,
                max_per_hour: 100,
                max_per_day: 500,
                lifetime_max: None,
            },
        );
        Self {
            default: QuotaPolicy {
                max_per_minute: 10,
                max_per_hour: 100,
                max_per_day: 500,
                lifetime_max: None,
            },
            endpoints: policies,
        }
    }
}

impl QuotaTable {
    pub fn policy_for(&self, endpoint: &str) -> &QuotaPolicy {
        self.endpoints.get(endpoint).unwrap_or(&self.default)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("parse quota table yaml")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read quota file: {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    /// Attempts still permitted by the tightest limit after this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    /// Set when the ledger could not be consulted and the request was let through.
    pub degraded: bool,
}

impl Decision {
    fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining: Some(remaining),
            degraded: false,
        }
    }

    fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            remaining: Some(0),
            degraded: false,
        }
    }

    fn fail_open() -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining: None,
            degraded: true,
        }
    }

    pub fn status_code(&self) -> u16 {
        match &self.reason {
            None => 200,
            Some(DenyReason::BillingInactive) => 402,
            Some(_) => 429,
        }
    }

    pub fn into_result(self, user_id: &str, endpoint: &str) -> Result<Decision, PipelineError> {
        match self.reason {
            None => Ok(self),
            Some(DenyReason::BillingInactive) => Err(PipelineError::Entitlement {
                user_id: user_id.to_owned(),
            }),
            Some(reason) => Err(PipelineError::QuotaExceeded {
                endpoint: endpoint.to_owned(),
                reason,
            }),
        }
    }
}

/// Source of billing entitlement. Owned by the payment side of the product.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn is_paid(&self, user_id: &str) -> anyhow::Result<bool>;
}

pub struct AdmissionController {
    ledger: Arc<dyn UsageLedger>,
    entitlements: Arc<dyn EntitlementSource>,
    quotas: QuotaTable,
}

impl AdmissionController {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        entitlements: Arc<dyn EntitlementSource>,
        quotas: QuotaTable,
    ) -> Self {
        Self {
            ledger,
            entitlements,
            quotas,
        }
    }

    pub fn quotas(&self) -> &QuotaTable {
        &self.quotas
    }

    pub async fn check_access(&self, user_id: &str, endpoint: &str) -> Decision {
        self.check_access_at(user_id, endpoint, Utc::now()).await
    }

    /// Like [`check_access`](Self::check_access), denials turned into errors.
    pub async fn gate(&self, user_id: &str, endpoint: &str) -> Result<Decision, PipelineError> {
        self.check_access(user_id, endpoint)
            .await
            .into_result(user_id, endpoint)
    }

    pub async fn check_access_at(
        &self,
        user_id: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Decision {
        let paid = match self.entitlements.is_paid(user_id).await {
            Ok(paid) => paid,
            Err(err) => {
                tracing::error!(user_id, endpoint, ?err, "entitlement lookup failed; denying");
                false
            }
        };
        if !paid {
            tracing::warn!(user_id, endpoint, "access denied: billing inactive");
            return Decision::deny(DenyReason::BillingInactive);
        }

        match self.evaluate_limits(user_id, endpoint, now).await {
            Ok(decision) => {
                if let Some(reason) = &decision.reason {
                    tracing::warn!(user_id, endpoint, %reason, "access denied: quota exceeded");
                }
                decision
            }
            Err(err) => {
                tracing::warn!(
                    user_id,
                    endpoint,
                    ?err,
                    degraded = true,
                    "usage ledger unavailable; admitting request"
                );
                Decision::fail_open()
            }
        }
    }

    async fn evaluate_limits(
        &self,
        user_id: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Decision> {
        let policy = self.quotas.policy_for(endpoint);
        let mut headroom = u32::MAX;

        if let Some(max) = policy.lifetime_max {
            let used = self
                .ledger
                .count_successes(user_id, endpoint)
                .await
                .context("count lifetime successes")?;
            if used >= u64::from(max) {
                return Ok(Decision::deny(DenyReason::LifetimeCap { max }));
            }
            headroom = headroom.min(max - used as u32);
        }

        for window in Window::ASCENDING {
            let max = policy.max_for(window);
            let used = self
                .ledger
                .count_since(user_id, endpoint, now - window.duration())
                .await
                .with_context(|| format!("count {} window", window.as_str()))?;
            if used >= u64::from(max) {
                return Ok(Decision::deny(DenyReason::RateWindow { window, max }));
            }
            headroom = headroom.min(max - used as u32);
        }

        Ok(Decision::allow(headroom.saturating_sub(1)))
    }

    /// Appends the outcome of a guarded operation. Failures are logged and swallowed.
    pub async fn record_usage(
        &self,
        user_id: &str,
        endpoint: &str,
        success: bool,
        meta: Option<serde_json::Value>,
    ) {
        self.record_usage_at(user_id, endpoint, success, meta, Utc::now())
            .await
    }

    pub async fn record_usage_at(
        &self,
        user_id: &str,
        endpoint: &str,
        success: bool,
        meta: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) {
        let record = UsageRecord {
            user_id: user_id.to_owned(),
            endpoint: endpoint.to_owned(),
            success,
            timestamp,
            meta,
        };
        if let Err(err) = self.ledger.append(&record).await {
            tracing::warn!(user_id, endpoint, success, ?err, "failed to record usage");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ledger::LocalFsUsageLedger;

    struct Paid(bool);

    #[async_trait]
    impl EntitlementSource for Paid {
        async fn is_paid(&self, _user_id: &str) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    struct BrokenLedger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UsageLedger for BrokenLedger {
        async fn append(&self, _record: &UsageRecord) -> anyhow::Result<()> {
            anyhow::bail!("ledger offline")
        }

        async fn count_since(
            &self,
            _user_id: &str,
            _endpoint: &str,
            _since: DateTime<Utc>,
        ) -> anyhow::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("ledger offline")
        }

        async fn count_successes(&self, _user_id: &str, _endpoint: &str) -> anyhow::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("ledger offline")
        }
    }

    fn controller(temp: &tempfile::TempDir, paid: bool) -> AdmissionController {
        AdmissionController::new(
            Arc::new(LocalFsUsageLedger::new(temp.path())),
            Arc::new(Paid(paid)),
            QuotaTable::default(),
        )
    }

    #[tokio::test]
    async fn unpaid_user_is_denied_with_billing_reason() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let decision = controller(&temp, false)
            .check_access("u1", endpoints::FACT_EXTRACTION)
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::BillingInactive));
        assert_eq!(decision.status_code(), 402);
        Ok(())
    }

    #[tokio::test]
    async fn second_request_within_a_minute_is_denied() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let controller = controller(&temp, true);
        let now = Utc::now();

        let first = controller
            .check_access_at("u1", endpoints::DRAFTING_RUN, now)
            .await;
        assert!(first.allowed);
        controller
            .record_usage_at("u1", endpoints::DRAFTING_RUN, false, None, now)
            .await;

        let second = controller
            .check_access_at("u1", endpoints::DRAFTING_RUN, now + Duration::seconds(30))
            .await;
        assert!(!second.allowed);
        assert_eq!(
            second.reason,
            Some(DenyReason::RateWindow {
                window: Window::Minute,
                max: 1
            })
        );

        let later = controller
            .check_access_at("u1", endpoints::DRAFTING_RUN, now + Duration::seconds(61))
            .await;
        assert!(later.allowed);
        Ok(())
    }

    #[tokio::test]
    async fn lifetime_cap_counts_only_successes() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let controller = controller(&temp, true);
        let start = Utc::now() - Duration::days(30);

        for day in 0..3 {
            controller
                .record_usage_at(
                    "u1",
                    endpoints::DRAFTING_RUN,
                    true,
                    None,
                    start + Duration::days(day),
                )
                .await;
        }
        controller
            .record_usage_at(
                "u1",
                endpoints::DRAFTING_RUN,
                false,
                None,
                start + Duration::days(4),
            )
            .await;

        let decision = controller.check_access("u1", endpoints::DRAFTING_RUN).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::LifetimeCap { max: 3 }));
        Ok(())
    }

    #[tokio::test]
    async fn torn_ledger_line_keeps_lifetime_cap_enforced() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let controller = controller(&temp, true);
        let start = Utc::now() - Duration::days(30);
        for day in 0..3 {
            controller
                .record_usage_at(
                    "u1",
                    endpoints::DRAFTING_RUN,
                    true,
                    None,
                    start + Duration::days(day),
                )
                .await;
        }
        let path = temp.path().join("usage").join("u1.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        std::io::Write::write_all(&mut file, br#"{"user_id":"u1","endp"#)?;
        drop(file);

        let decision = controller.check_access("u1", endpoints::DRAFTING_RUN).await;
        assert!(!decision.allowed);
        assert!(!decision.degraded);
        assert_eq!(decision.reason, Some(DenyReason::LifetimeCap { max: 3 }));
        Ok(())
    }

    #[tokio::test]
    async fn remaining_reflects_tightest_limit() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let controller = controller(&temp, true);
        let decision = controller
            .check_access("u1", endpoints::FACT_EXTRACTION)
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(19));
        Ok(())
    }

    #[tokio::test]
    async fn unlisted_endpoint_uses_default_policy() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let controller = controller(&temp, true);
        let now = Utc::now();
        for _ in 0..10 {
            controller
                .record_usage_at("u1", "export", true, None, now)
                .await;
        }
        let decision = controller.check_access_at("u1", "export", now).await;
        assert_eq!(
            decision.reason,
            Some(DenyReason::RateWindow {
                window: Window::Minute,
                max: 10
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn ledger_outage_fails_open() {
        let ledger = Arc::new(BrokenLedger {
            calls: AtomicUsize::new(0),
        });
        let controller = AdmissionController::new(
            Arc::clone(&ledger) as Arc<dyn UsageLedger>,
            Arc::new(Paid(true)),
            QuotaTable::default(),
        );
        let decision = controller.check_access("u1", endpoints::DRAFTING_RUN).await;
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert!(ledger.calls.load(Ordering::SeqCst) > 0);

        // Recording against a broken ledger is not an error for the caller.
        controller
            .record_usage("u1", endpoints::DRAFTING_RUN, true, None)
            .await;
    }

    #[test]
    fn quota_table_loads_from_yaml_with_fallback() -> anyhow::Result<()> {
        let table = QuotaTable::from_yaml_str(
            "default:\n  max_per_minute: 2\n  max_per_hour: 4\n  max_per_day: 8\n\
endpoints:\n  drafting-run:\n    max_per_minute: 1\n    max_per_hour: 1\n    max_per_day: 1\n    lifetime_max: 2\n",
        )?;
        assert_eq!(table.policy_for("drafting-run").lifetime_max, Some(2));
        assert_eq!(table.policy_for("other").max_per_minute, 2);
        Ok(())
    }
}
