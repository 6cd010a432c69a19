use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::quorum::QuorumStatus;

pub const RECONCILIATION_REPORT_SCHEMA_V1: &str = "geotrigger.execution.reconciliation_report.v1";

pub type RuleId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventProcessingStatus {
    Received,
    Matched,
    Executed,
}

impl EventProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Matched => "matched",
            Self::Executed => "executed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "received" => Some(Self::Received),
            "matched" => Some(Self::Matched),
            "executed" => Some(Self::Executed),
            _ => None,
        }
    }
}

/// One received location ping and everything that was matched against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEvent {
    pub event_id: String,
    pub wallet: String,
    pub user_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub received_at: DateTime<Utc>,
    pub processing_status: EventProcessingStatus,
    pub attempts: Vec<ExecutionAttempt>,
}

impl LocationEvent {
    /// An event may be deleted once it holds no completion and nothing live.
    ///
    /// Events that never matched are kept until `unmatched_before` so the
    /// geo-matcher still has a chance to attach attempts.
    pub fn is_collectable(&self, unmatched_before: DateTime<Utc>) -> bool {
        if self.attempts.is_empty() || self.processing_status == EventProcessingStatus::Received {
            return self.attempts.is_empty() && self.received_at < unmatched_before;
        }
        !self
            .attempts
            .iter()
            .any(|attempt| attempt.status.is_completed() || attempt.status.is_live())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLocationEvent {
    pub event_id: String,
    pub wallet: String,
    pub user_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Location,
    Proximity,
    Geofence,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Proximity => "proximity",
            Self::Geofence => "geofence",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "location" => Some(Self::Location),
            "proximity" => Some(Self::Proximity),
            "geofence" => Some(Self::Geofence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOn {
    Enter,
    Exit,
}

impl TriggerOn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "enter" => Some(Self::Enter),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumType {
    #[default]
    Any,
    All,
}

impl QuorumType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::All => "all",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "any" => Some(Self::Any),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumRequirement {
    pub required_wallets: Vec<String>,
    pub minimum_count: u32,
    pub quorum_type: QuorumType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_executions_per_key: Option<u32>,
    pub window_seconds: Option<i64>,
}

impl RateLimit {
    /// `(max, window)` when both are set and positive.
    pub fn bounds(&self) -> Option<(u32, i64)> {
        match (self.max_executions_per_key, self.window_seconds) {
            (Some(max), Some(window)) if max > 0 && window > 0 => Some((max, window)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetContract {
    pub contract_address: String,
    pub function_name: String,
    /// Call parameters with `{{placeholder}}` markers.
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRule {
    pub rule_id: RuleId,
    pub user_id: String,
    pub rule_type: RuleType,
    pub geometry_ref: String,
    pub contract: TargetContract,
    pub trigger_on: TriggerOn,
    pub auto_execute: bool,
    pub requires_confirmation: bool,
    pub quorum: Option<QuorumRequirement>,
    pub rate_limit: Option<RateLimit>,
    pub target_wallet: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    RequiresWebauthn,
    RateLimitExceeded,
    RequiresConfirmation,
    AutoExecuteDisabled,
    TargetWalletMismatch,
}

impl PendingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequiresWebauthn => "requires_webauthn",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::AutoExecuteDisabled => "auto_execute_disabled",
            Self::TargetWalletMismatch => "target_wallet_mismatch",
        }
    }

    /// Reasons shown to a user as "needs your authorization".
    pub fn is_listable(self) -> bool {
        matches!(
            self,
            Self::RequiresWebauthn | Self::RequiresConfirmation | Self::AutoExecuteDisabled
        )
    }

    fn status_code(self) -> &'static str {
        match self {
            Self::RequiresWebauthn => "pending:requires_webauthn",
            Self::RateLimitExceeded => "pending:rate_limit_exceeded",
            Self::RequiresConfirmation => "pending:requires_confirmation",
            Self::AutoExecuteDisabled => "pending:auto_execute_disabled",
            Self::TargetWalletMismatch => "pending:target_wallet_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UserDeclined,
    Expired,
    InsufficientBalance,
    Other,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserDeclined => "user_declined",
            Self::Expired => "expired",
            Self::InsufficientBalance => "insufficient_balance",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersedeReason {
    SupersededByNewerExecution,
    RetentionExpired,
}

/// Status codes used as transition guards by both store backends.
pub mod status_code {
    pub const PENDING_REQUIRES_WEBAUTHN: &str = "pending:requires_webauthn";
    pub const PENDING_RATE_LIMIT_EXCEEDED: &str = "pending:rate_limit_exceeded";
    pub const PENDING_REQUIRES_CONFIRMATION: &str = "pending:requires_confirmation";
    pub const PENDING_AUTO_EXECUTE_DISABLED: &str = "pending:auto_execute_disabled";
    pub const PENDING_TARGET_WALLET_MISMATCH: &str = "pending:target_wallet_mismatch";
    pub const IN_FLIGHT: &str = "in_flight";
    pub const COMPLETED: &str = "completed";
    pub const REJECTED: &str = "rejected";
    pub const FAILED_RETRYABLE: &str = "failed:retryable";
    pub const FAILED_CONTRACT_REJECTED: &str = "failed:contract_rejected";
    pub const SUPERSEDED: &str = "superseded";

    pub const PENDING: &[&str] = &[
        PENDING_REQUIRES_WEBAUTHN,
        PENDING_RATE_LIMIT_EXCEEDED,
        PENDING_REQUIRES_CONFIRMATION,
        PENDING_AUTO_EXECUTE_DISABLED,
        PENDING_TARGET_WALLET_MISMATCH,
    ];

    /// Non-terminal codes; at most one per (event, rule, wallet).
    pub const LIVE: &[&str] = &[
        PENDING_REQUIRES_WEBAUTHN,
        PENDING_RATE_LIMIT_EXCEEDED,
        PENDING_REQUIRES_CONFIRMATION,
        PENDING_AUTO_EXECUTE_DISABLED,
        PENDING_TARGET_WALLET_MISMATCH,
        IN_FLIGHT,
        FAILED_RETRYABLE,
    ];

    /// States a confirmation may claim for submission.
    pub const CLAIMABLE: &[&str] = &[
        PENDING_REQUIRES_WEBAUTHN,
        PENDING_RATE_LIMIT_EXCEEDED,
        PENDING_REQUIRES_CONFIRMATION,
        PENDING_AUTO_EXECUTE_DISABLED,
        FAILED_RETRYABLE,
    ];

    pub const REJECTABLE: &[&str] = &[
        PENDING_REQUIRES_WEBAUTHN,
        PENDING_RATE_LIMIT_EXCEEDED,
        PENDING_REQUIRES_CONFIRMATION,
        PENDING_AUTO_EXECUTE_DISABLED,
        PENDING_TARGET_WALLET_MISMATCH,
        FAILED_RETRYABLE,
    ];

    pub const RECOVERABLE: &[&str] = &[
        PENDING_REQUIRES_WEBAUTHN,
        PENDING_RATE_LIMIT_EXCEEDED,
        PENDING_REQUIRES_CONFIRMATION,
        PENDING_AUTO_EXECUTE_DISABLED,
        PENDING_TARGET_WALLET_MISMATCH,
        IN_FLIGHT,
        FAILED_RETRYABLE,
        FAILED_CONTRACT_REJECTED,
        SUPERSEDED,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending {
        reason: PendingReason,
    },
    InFlight {
        started_at: DateTime<Utc>,
    },
    Completed {
        transaction_hash: String,
        completed_at: DateTime<Utc>,
    },
    Rejected {
        reason: RejectReason,
        rejected_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        failed_at: DateTime<Utc>,
        contract_rejected: bool,
    },
    Superseded {
        reason: SupersedeReason,
        superseded_at: DateTime<Utc>,
    },
}

impl AttemptStatus {
    pub fn pending(reason: PendingReason) -> Self {
        Self::Pending { reason }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Pending { reason } => reason.status_code(),
            Self::InFlight { .. } => status_code::IN_FLIGHT,
            Self::Completed { .. } => status_code::COMPLETED,
            Self::Rejected { .. } => status_code::REJECTED,
            Self::Failed {
                contract_rejected: false,
                ..
            } => status_code::FAILED_RETRYABLE,
            Self::Failed {
                contract_rejected: true,
                ..
            } => status_code::FAILED_CONTRACT_REJECTED,
            Self::Superseded { .. } => status_code::SUPERSEDED,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed { .. } | Self::Rejected { .. } | Self::Superseded { .. } => true,
            Self::Failed {
                contract_rejected, ..
            } => *contract_rejected,
            Self::Pending { .. } | Self::InFlight { .. } => false,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn pending_reason(&self) -> Option<PendingReason> {
        match self {
            Self::Pending { reason } => Some(*reason),
            _ => None,
        }
    }

    pub fn transaction_hash(&self) -> Option<&str> {
        match self {
            Self::Completed {
                transaction_hash, ..
            } => Some(transaction_hash.as_str()),
            _ => None,
        }
    }

    pub fn matches_any(&self, codes: &[&str]) -> bool {
        codes.contains(&self.code())
    }
}

/// One (rule, wallet) execution record inside a location event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub attempt_id: String,
    pub event_id: String,
    pub rule_id: RuleId,
    pub wallet: String,
    /// Owner of the rule at match time; used for identity filtering.
    pub user_id: Option<String>,
    pub status: AttemptStatus,
    pub matched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionAttempt {
    pub fn new(
        event_id: &str,
        rule_id: RuleId,
        wallet: &str,
        user_id: Option<String>,
        reason: PendingReason,
        matched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt_id: uuid::Uuid::now_v7().to_string(),
            event_id: event_id.to_string(),
            rule_id,
            wallet: wallet.to_string(),
            user_id,
            status: AttemptStatus::pending(reason),
            matched_at,
            updated_at: matched_at,
        }
    }

    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            event_id: self.event_id.clone(),
            rule_id: self.rule_id,
            wallet: self.wallet.clone(),
        }
    }
}

/// Addresses attempts by event, rule and wallet; a rule id alone is ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub event_id: String,
    pub rule_id: RuleId,
    pub wallet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleExecutionHistory {
    pub rule_id: RuleId,
    pub wallet: String,
    pub window_started_at: DateTime<Utc>,
    pub window_count: i64,
    pub last_execution_at: DateTime<Utc>,
    pub execution_count: i64,
}

/// Identity and scope filter for attempt queries.
///
/// `user_id` and `wallets` are OR-ed: a caller may own rules and also hold the
/// matched wallet key. When both are empty no identity constraint applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFilter {
    pub user_id: Option<String>,
    pub wallets: Vec<String>,
    pub rule_id: Option<RuleId>,
    pub event_id: Option<String>,
}

impl AttemptFilter {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    pub fn for_wallet(wallet: &str) -> Self {
        Self {
            wallets: vec![wallet.to_string()],
            ..Self::default()
        }
    }

    pub fn matches(&self, attempt: &ExecutionAttempt) -> bool {
        let identity_constrained = self.user_id.is_some() || !self.wallets.is_empty();
        if identity_constrained {
            let by_user = self
                .user_id
                .as_deref()
                .is_some_and(|user_id| attempt.user_id.as_deref() == Some(user_id));
            let by_wallet = self.wallets.iter().any(|wallet| wallet == &attempt.wallet);
            if !by_user && !by_wallet {
                return false;
            }
        }
        if self.rule_id.is_some_and(|rule_id| rule_id != attempt.rule_id) {
            return false;
        }
        if self
            .event_id
            .as_deref()
            .is_some_and(|event_id| event_id != attempt.event_id)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrder {
    OldestFirst,
    NewestFirst,
}

/// Keyset position in a walk over the whole attempt log, ordered by
/// `(matched_at, attempt_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptCursor {
    pub matched_at: DateTime<Utc>,
    pub attempt_id: String,
}

impl AttemptCursor {
    pub fn at(attempt: &ExecutionAttempt) -> Self {
        Self {
            matched_at: attempt.matched_at,
            attempt_id: attempt.attempt_id.clone(),
        }
    }

    /// True when `attempt` comes strictly after this position in `order`.
    pub fn precedes(&self, attempt: &ExecutionAttempt, order: PageOrder) -> bool {
        let position = (attempt.matched_at, attempt.attempt_id.as_str());
        let cursor = (self.matched_at, self.attempt_id.as_str());
        match order {
            PageOrder::OldestFirst => position > cursor,
            PageOrder::NewestFirst => position < cursor,
        }
    }
}

/// Keyset position in an oldest-first walk over events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor {
    pub received_at: DateTime<Utc>,
    pub event_id: String,
}

impl EventCursor {
    pub fn at(event: &LocationEvent) -> Self {
        Self {
            received_at: event.received_at,
            event_id: event.event_id.clone(),
        }
    }

    pub fn precedes(&self, event: &LocationEvent) -> bool {
        (event.received_at, event.event_id.as_str()) > (self.received_at, self.event_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(ExecutionAttempt),
    /// A live attempt for the same key already existed and was returned instead.
    Existing(ExecutionAttempt),
}

impl AppendOutcome {
    pub fn attempt(&self) -> &ExecutionAttempt {
        match self {
            Self::Appended(attempt) | Self::Existing(attempt) => attempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(ExecutionAttempt),
    /// The guard no longer held; nothing was written.
    Skipped { current: ExecutionAttempt },
}

/// Geo-matcher output: a rule matched a wallet for a received event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub event_id: String,
    pub rule_id: RuleId,
    pub wallet: String,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordMatchResponse {
    pub attempt: ExecutionAttempt,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingExecution {
    pub attempt_id: String,
    pub event_id: String,
    pub rule_id: RuleId,
    pub function_name: String,
    pub contract_address: String,
    pub matched_wallet: String,
    pub parameters: Value,
    pub reason: PendingReason,
    pub matched_at: DateTime<Utc>,
    pub quorum: Option<QuorumStatus>,
    pub eligible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedExecution {
    pub attempt_id: String,
    pub event_id: String,
    pub rule_id: RuleId,
    pub function_name: String,
    pub contract_address: String,
    pub matched_wallet: String,
    pub parameters: Value,
    pub transaction_hash: String,
    pub matched_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedExecution {
    pub attempt_id: String,
    pub event_id: String,
    pub rule_id: RuleId,
    pub function_name: String,
    pub contract_address: String,
    pub matched_wallet: String,
    pub parameters: Value,
    pub reason: RejectReason,
    pub matched_at: DateTime<Utc>,
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub rule_id: RuleId,
    pub wallet: String,
    #[serde(default)]
    pub event_id: Option<String>,
    pub signature: String,
    pub authenticator_data: String,
    pub client_data: String,
    pub signature_payload: String,
    #[serde(default)]
    pub signing_key: Option<String>,
    #[serde(default)]
    pub confirmed_by_user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Submitted,
    /// Completed earlier; the stored transaction hash is returned and nothing is resubmitted.
    AlreadyCompleted,
    AlreadyTerminal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmResponse {
    pub outcome: ConfirmOutcome,
    pub attempt_id: String,
    pub event_id: String,
    pub rule_id: RuleId,
    pub wallet: String,
    pub transaction_hash: Option<String>,
    pub status: AttemptStatus,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectRequest {
    pub rule_id: RuleId,
    pub wallet: String,
    #[serde(default)]
    pub event_id: Option<String>,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRequest {
    pub key: AttemptKey,
    pub transaction_hash: String,
}

/// Result of a user or operator transition; `changed` is false for no-ops on terminal attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionResponse {
    pub attempt: ExecutionAttempt,
    pub changed: bool,
}
