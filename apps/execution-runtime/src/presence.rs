//! Whether a quorum wallet is currently "in range" for a rule.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use crate::execution::store::ExecutionStore;
use crate::execution::types::{AttemptFilter, ExecutionRule};

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PresenceOracle: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn is_wallet_in_range(
        &self,
        wallet: &str,
        rule: &ExecutionRule,
    ) -> Result<bool, PresenceError>;
}

/// Explicit snapshot of present wallets, replaced wholesale by the caller.
#[derive(Default)]
pub struct StaticPresence {
    present: RwLock<HashSet<String>>,
}

impl StaticPresence {
    pub fn new<I, S>(wallets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            present: RwLock::new(wallets.into_iter().map(Into::into).collect()),
        }
    }

    pub async fn replace<I, S>(&self, wallets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.present.write().await = wallets.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl PresenceOracle for StaticPresence {
    fn backend(&self) -> &'static str {
        "static"
    }

    async fn is_wallet_in_range(
        &self,
        wallet: &str,
        _rule: &ExecutionRule,
    ) -> Result<bool, PresenceError> {
        Ok(self.present.read().await.contains(wallet))
    }
}

/// A wallet counts as present when the geo-matcher matched it against the same
/// rule within the last `window`.
pub struct RecentMatchPresence {
    store: Arc<dyn ExecutionStore>,
    window: Duration,
}

impl RecentMatchPresence {
    pub fn new(store: Arc<dyn ExecutionStore>, window_seconds: i64) -> Self {
        Self {
            store,
            window: Duration::seconds(window_seconds.max(1)),
        }
    }
}

#[async_trait]
impl PresenceOracle for RecentMatchPresence {
    fn backend(&self) -> &'static str {
        "recent_match"
    }

    async fn is_wallet_in_range(
        &self,
        wallet: &str,
        rule: &ExecutionRule,
    ) -> Result<bool, PresenceError> {
        let cutoff = Utc::now() - self.window;
        let filter = AttemptFilter {
            rule_id: Some(rule.rule_id),
            ..AttemptFilter::for_wallet(wallet)
        };
        let attempts = self
            .store
            .list_attempts(&filter)
            .await
            .map_err(|error| PresenceError::Unavailable(error.to_string()))?;
        Ok(attempts.iter().any(|attempt| attempt.matched_at >= cutoff))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::execution::store;
    use crate::execution::types::{
        ExecutionAttempt, NewLocationEvent, PendingReason, RuleType, TargetContract, TriggerOn,
    };

    fn rule() -> ExecutionRule {
        ExecutionRule {
            rule_id: 9,
            user_id: "user-1".to_string(),
            rule_type: RuleType::Proximity,
            geometry_ref: "proximity:9".to_string(),
            contract: TargetContract {
                contract_address: "CCONTRACT".to_string(),
                function_name: "release".to_string(),
                parameters: json!({}),
            },
            trigger_on: TriggerOn::Enter,
            auto_execute: true,
            requires_confirmation: false,
            quorum: None,
            rate_limit: None,
            target_wallet: None,
            active: true,
        }
    }

    #[tokio::test]
    async fn static_snapshot_can_be_replaced() {
        let presence = StaticPresence::new(["A"]);
        assert!(presence.is_wallet_in_range("A", &rule()).await.expect("presence"));
        presence.replace(["B"]).await;
        assert!(!presence.is_wallet_in_range("A", &rule()).await.expect("presence"));
        assert!(presence.is_wallet_in_range("B", &rule()).await.expect("presence"));
    }

    #[tokio::test]
    async fn recent_match_uses_the_store_window() {
        let store = store::memory();
        let now = Utc::now();
        for (event_id, wallet, age) in [("evt-a", "A", 30), ("evt-b", "B", 3_600)] {
            store
                .append_event(NewLocationEvent {
                    event_id: event_id.to_string(),
                    wallet: wallet.to_string(),
                    user_id: None,
                    latitude: 0.0,
                    longitude: 0.0,
                    received_at: now - Duration::seconds(age),
                })
                .await
                .expect("append event");
            store
                .append_attempt(ExecutionAttempt::new(
                    event_id,
                    9,
                    wallet,
                    None,
                    PendingReason::RequiresWebauthn,
                    now - Duration::seconds(age),
                ))
                .await
                .expect("append attempt");
        }

        let presence = RecentMatchPresence::new(store, 300);
        assert!(presence.is_wallet_in_range("A", &rule()).await.expect("presence"));
        assert!(!presence.is_wallet_in_range("B", &rule()).await.expect("presence"));
        assert!(!presence.is_wallet_in_range("C", &rule()).await.expect("presence"));
    }
}
