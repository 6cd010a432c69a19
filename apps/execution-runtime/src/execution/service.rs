use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use passkey_auth::{AuthorizationInput, VerificationError, VerifierPolicy, verify_authorization};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::{ChainClient, ReturnValue, SubmitRequest};
use crate::execution::store::{ExecutionStore, StoreError};
use crate::execution::types::{
    AppendOutcome, AttemptFilter, AttemptKey, AttemptStatus, CompletedExecution, ConfirmOutcome, ConfirmRequest,
    ConfirmResponse, ExecutionAttempt, ExecutionRule, LocationEvent, MatchEvent, NewLocationEvent,
    PendingExecution, PendingReason, RecordMatchResponse, RecoverRequest, RejectRequest,
    RejectedExecution, RuleId, SupersedeReason, TransitionOutcome, TransitionResponse,
    status_code,
};
use crate::presence::{PresenceError, PresenceOracle};
use crate::quorum::{self, QuorumStatus};
use crate::rate_limit;
use crate::reconcile::{self, ReconciliationReport};
use crate::rules::{RuleSource, RuleSourceError, TemplateContext, populate_parameters};

const LIST_LIMIT_MAX: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionDenied {
    #[error("quorum not met: {} of {minimum_count} required wallets present", .present.len())]
    QuorumNotMet {
        present: Vec<String>,
        missing: Vec<String>,
        minimum_count: u32,
    },
    #[error("rate limit exceeded for this rule and wallet")]
    RateLimitExceeded {
        window_resets_at: Option<DateTime<Utc>>,
    },
    #[error("rule requires explicit user confirmation")]
    ConfirmationRequired,
}

impl AdmissionDenied {
    fn from_quorum(status: QuorumStatus) -> Self {
        Self::QuorumNotMet {
            present: status.present,
            missing: status.missing,
            minimum_count: status.minimum_count,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("admission denied: {0}")]
    AdmissionDenied(AdmissionDenied),
    #[error("verification failed: {0}")]
    VerificationFailed(#[from] VerificationError),
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    #[error("contract rejected the call in transaction {transaction_hash}")]
    ContractRejected { transaction_hash: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdmissionDenied(AdmissionDenied::QuorumNotMet { .. }) => "quorum_not_met",
            Self::AdmissionDenied(AdmissionDenied::RateLimitExceeded { .. }) => {
                "rate_limit_exceeded"
            }
            Self::AdmissionDenied(AdmissionDenied::ConfirmationRequired) => {
                "confirmation_required"
            }
            Self::VerificationFailed(error) => error.code(),
            Self::SubmissionFailed(_) => "submission_failed",
            Self::ContractRejected { .. } => "contract_rejected",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound => "not_found",
            Self::Conflict(_) => "conflict",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::AdmissionDenied(denied) => denied.to_string(),
            Self::VerificationFailed(error) => error.to_string(),
            Self::SubmissionFailed(message)
            | Self::InvalidRequest(message)
            | Self::Conflict(message)
            | Self::DependencyUnavailable(message)
            | Self::Internal(message) => message.clone(),
            Self::ContractRejected { transaction_hash } => {
                format!("contract returned false in transaction {transaction_hash}")
            }
            Self::NotFound => "not found".to_string(),
        }
    }

    /// Whether the same request may succeed later without new parameters.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionDenied(_) | Self::SubmissionFailed(_) | Self::DependencyUnavailable(_)
        )
    }
}

/// What to do when the relay cannot decode a contract's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguousReturnPolicy {
    /// Complete the attempt and log a warning.
    #[default]
    TreatAsSuccess,
    /// Fail the attempt as if the contract returned false.
    TreatAsRejected,
}

impl AmbiguousReturnPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "treat_as_success" | "success" => Some(Self::TreatAsSuccess),
            "treat_as_rejected" | "rejected" | "reject" => Some(Self::TreatAsRejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub verifier: VerifierPolicy,
    pub ambiguous_return: AmbiguousReturnPolicy,
    pub chain_submit_timeout_ms: u64,
    /// Pending attempts older than this are expired by reconciliation.
    pub retention_seconds: i64,
    pub sweep_batch_limit: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            verifier: VerifierPolicy::default(),
            ambiguous_return: AmbiguousReturnPolicy::default(),
            chain_submit_timeout_ms: 30_000,
            retention_seconds: 7 * 24 * 60 * 60,
            sweep_batch_limit: 5_000,
        }
    }
}

/// Drives execution attempts from match to completion.
#[derive(Clone)]
pub struct ExecutionService {
    store: Arc<dyn ExecutionStore>,
    rules: Arc<dyn RuleSource>,
    presence: Arc<dyn PresenceOracle>,
    chain: Arc<dyn ChainClient>,
    policy: ExecutionPolicy,
}

impl ExecutionService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        rules: Arc<dyn RuleSource>,
        presence: Arc<dyn PresenceOracle>,
        chain: Arc<dyn ChainClient>,
        policy: ExecutionPolicy,
    ) -> Self {
        Self {
            store,
            rules,
            presence,
            chain,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn rules(&self) -> &Arc<dyn RuleSource> {
        &self.rules
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub async fn ingest_location(
        &self,
        event: NewLocationEvent,
    ) -> Result<LocationEvent, ExecutionError> {
        if event.event_id.trim().is_empty() || event.wallet.trim().is_empty() {
            return Err(ExecutionError::InvalidRequest(
                "event_id and wallet are required".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&event.latitude) || !(-180.0..=180.0).contains(&event.longitude)
        {
            return Err(ExecutionError::InvalidRequest(format!(
                "coordinates out of range: {}, {}",
                event.latitude, event.longitude
            )));
        }
        self.store
            .append_event(event)
            .await
            .map_err(map_store_error)
    }

    /// Record a geo-matcher hit as a new pending attempt.
    pub async fn record_match(
        &self,
        event: MatchEvent,
    ) -> Result<RecordMatchResponse, ExecutionError> {
        if event.wallet.trim().is_empty() {
            return Err(ExecutionError::InvalidRequest("wallet is required".to_string()));
        }
        let rule = self.active_rule(event.rule_id).await?;
        if self
            .store
            .get_event(&event.event_id)
            .await
            .map_err(map_store_error)?
            .is_none()
        {
            return Err(ExecutionError::NotFound);
        }

        let reason = self
            .initial_reason(&rule, &event.wallet, event.matched_at)
            .await?;
        let attempt = ExecutionAttempt::new(
            &event.event_id,
            event.rule_id,
            &event.wallet,
            Some(rule.user_id.clone()),
            reason,
            event.matched_at,
        );
        let outcome = self
            .store
            .append_attempt(attempt)
            .await
            .map_err(map_store_error)?;
        let created = matches!(outcome, AppendOutcome::Appended(_));
        let attempt = outcome.attempt().clone();
        tracing::info!(
            rule_id = attempt.rule_id,
            wallet = %attempt.wallet,
            event_id = %attempt.event_id,
            status = attempt.status.code(),
            created,
            "execution match recorded"
        );
        Ok(RecordMatchResponse { attempt, created })
    }

    async fn initial_reason(
        &self,
        rule: &ExecutionRule,
        wallet: &str,
        at: DateTime<Utc>,
    ) -> Result<PendingReason, ExecutionError> {
        if rule
            .target_wallet
            .as_deref()
            .is_some_and(|target| target != wallet)
        {
            return Ok(PendingReason::TargetWalletMismatch);
        }
        let history = self
            .store
            .get_history(rule.rule_id, wallet)
            .await
            .map_err(map_store_error)?;
        if !rate_limit::is_within_limit(rule, history.as_ref(), at) {
            return Ok(PendingReason::RateLimitExceeded);
        }
        if rule.requires_confirmation {
            return Ok(PendingReason::RequiresConfirmation);
        }
        if !rule.auto_execute {
            return Ok(PendingReason::AutoExecuteDisabled);
        }
        Ok(PendingReason::RequiresWebauthn)
    }

    /// Attempts awaiting the caller's authorization, newest per (rule, wallet).
    ///
    /// Rate-limited attempts are relabeled and left out; attempts failing quorum
    /// stay listed with `eligible = false`.
    pub async fn list_pending(
        &self,
        identity: &AttemptFilter,
    ) -> Result<Vec<PendingExecution>, ExecutionError> {
        let now = Utc::now();
        let attempts = self
            .store
            .list_attempts(identity)
            .await
            .map_err(map_store_error)?;

        let mut cache = ListingCache::default();
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for attempt in attempts {
            let listable = attempt
                .status
                .pending_reason()
                .filter(|reason| reason.is_listable());
            if listable.is_none() && !attempt.status.is_completed() {
                continue;
            }
            if !seen.insert((attempt.rule_id, attempt.wallet.clone())) {
                continue;
            }
            let Some(reason) = listable else {
                continue;
            };
            let Some(rule) = self.cached_rule(&mut cache, attempt.rule_id).await? else {
                continue;
            };
            if !rule.active {
                continue;
            }

            let history = self
                .store
                .get_history(rule.rule_id, &attempt.wallet)
                .await
                .map_err(map_store_error)?;
            if !rate_limit::is_within_limit(&rule, history.as_ref(), now) {
                self.mark_rate_limited(&attempt, now).await;
                continue;
            }

            let quorum = match rule.quorum {
                Some(_) => Some(
                    quorum::check_quorum(&rule, self.presence.as_ref())
                        .await
                        .map_err(map_presence_error)?,
                ),
                None => None,
            };
            let eligible = quorum.as_ref().is_none_or(|status| status.met);
            let parameters = self.parameters_for(&mut cache, &rule, &attempt).await?;
            pending.push(PendingExecution {
                attempt_id: attempt.attempt_id,
                event_id: attempt.event_id,
                rule_id: rule.rule_id,
                function_name: rule.contract.function_name.clone(),
                contract_address: rule.contract.contract_address.clone(),
                matched_wallet: attempt.wallet,
                parameters,
                reason,
                matched_at: attempt.matched_at,
                quorum,
                eligible,
            });
        }
        Ok(pending)
    }

    pub async fn list_completed(
        &self,
        identity: &AttemptFilter,
        limit: usize,
    ) -> Result<Vec<CompletedExecution>, ExecutionError> {
        let mut completed = self
            .store
            .list_attempts(identity)
            .await
            .map_err(map_store_error)?
            .into_iter()
            .filter_map(|attempt| match &attempt.status {
                AttemptStatus::Completed {
                    transaction_hash,
                    completed_at,
                } => Some((transaction_hash.clone(), *completed_at, attempt)),
                _ => None,
            })
            .collect::<Vec<_>>();
        completed.sort_by(|left, right| right.1.cmp(&left.1));
        completed.truncate(limit.clamp(1, LIST_LIMIT_MAX));

        let mut cache = ListingCache::default();
        let mut items = Vec::with_capacity(completed.len());
        for (transaction_hash, completed_at, attempt) in completed {
            let (function_name, contract_address, parameters) =
                self.describe(&mut cache, &attempt).await?;
            items.push(CompletedExecution {
                attempt_id: attempt.attempt_id,
                event_id: attempt.event_id,
                rule_id: attempt.rule_id,
                function_name,
                contract_address,
                matched_wallet: attempt.wallet,
                parameters,
                transaction_hash,
                matched_at: attempt.matched_at,
                completed_at,
            });
        }
        Ok(items)
    }

    pub async fn list_rejected(
        &self,
        identity: &AttemptFilter,
        limit: usize,
    ) -> Result<Vec<RejectedExecution>, ExecutionError> {
        let mut rejected = self
            .store
            .list_attempts(identity)
            .await
            .map_err(map_store_error)?
            .into_iter()
            .filter_map(|attempt| match &attempt.status {
                AttemptStatus::Rejected {
                    reason,
                    rejected_at,
                } => Some((*reason, *rejected_at, attempt)),
                _ => None,
            })
            .collect::<Vec<_>>();
        rejected.sort_by(|left, right| right.1.cmp(&left.1));
        rejected.truncate(limit.clamp(1, LIST_LIMIT_MAX));

        let mut cache = ListingCache::default();
        let mut items = Vec::with_capacity(rejected.len());
        for (reason, rejected_at, attempt) in rejected {
            let (function_name, contract_address, parameters) =
                self.describe(&mut cache, &attempt).await?;
            items.push(RejectedExecution {
                attempt_id: attempt.attempt_id,
                event_id: attempt.event_id,
                rule_id: attempt.rule_id,
                function_name,
                contract_address,
                matched_wallet: attempt.wallet,
                parameters,
                reason,
                matched_at: attempt.matched_at,
                rejected_at,
            });
        }
        Ok(items)
    }

    /// Verify a passkey authorization and submit the rule's contract call.
    ///
    /// Confirming an attempt that already completed returns the stored
    /// transaction hash without submitting again.
    pub async fn confirm(&self, request: ConfirmRequest) -> Result<ConfirmResponse, ExecutionError> {
        if request.wallet.trim().is_empty() {
            return Err(ExecutionError::InvalidRequest("wallet is required".to_string()));
        }
        let attempt = self
            .locate_attempt(request.rule_id, &request.wallet, request.event_id.as_deref())
            .await?;
        let settled = if attempt.status.is_completed() {
            Some(ConfirmOutcome::AlreadyCompleted)
        } else if attempt.status.is_terminal() {
            Some(ConfirmOutcome::AlreadyTerminal)
        } else {
            None
        };
        if let Some(outcome) = settled {
            return Ok(confirm_response(outcome, attempt, Vec::new()));
        }
        match &attempt.status {
            AttemptStatus::InFlight { .. } => {
                return Err(ExecutionError::Conflict(
                    "submission already in flight".to_string(),
                ));
            }
            AttemptStatus::Pending {
                reason: PendingReason::TargetWalletMismatch,
            } => {
                return Err(ExecutionError::InvalidRequest(
                    "matched wallet is not the rule's target wallet".to_string(),
                ));
            }
            _ => {}
        }

        let rule = self.active_rule(request.rule_id).await?;
        if rule.requires_confirmation && !request.confirmed_by_user {
            return Err(ExecutionError::AdmissionDenied(
                AdmissionDenied::ConfirmationRequired,
            ));
        }
        let quorum = quorum::check_quorum(&rule, self.presence.as_ref())
            .await
            .map_err(map_presence_error)?;
        if !quorum.met {
            return Err(ExecutionError::AdmissionDenied(AdmissionDenied::from_quorum(quorum)));
        }

        let now = Utc::now();
        let history = self
            .store
            .get_history(rule.rule_id, &request.wallet)
            .await
            .map_err(map_store_error)?;
        if !rate_limit::is_within_limit(&rule, history.as_ref(), now) {
            self.mark_rate_limited(&attempt, now).await;
            return Err(ExecutionError::AdmissionDenied(
                AdmissionDenied::RateLimitExceeded {
                    window_resets_at: rate_limit::window_resets_at(&rule, history.as_ref(), now),
                },
            ));
        }

        let registered_key = self
            .store
            .registered_signing_key(&request.wallet, &rule.contract.contract_address)
            .await
            .map_err(map_store_error)?;
        let verified = verify_authorization(
            &AuthorizationInput {
                signature: &request.signature,
                authenticator_data: &request.authenticator_data,
                client_data: &request.client_data,
                signature_payload: &request.signature_payload,
                signing_key: request.signing_key.as_deref(),
                registered_key: registered_key.as_deref(),
                expected_source: Some(&request.wallet),
            },
            &self.policy.verifier,
            now.timestamp(),
        )
        .inspect_err(|error| {
            tracing::warn!(
                rule_id = rule.rule_id,
                wallet = %request.wallet,
                reason = %error,
                "passkey authorization rejected"
            );
        })?;

        let nonce = verified
            .payload
            .as_ref()
            .and_then(|payload| payload.nonce.clone())
            .unwrap_or_else(|| verified.payload_digest.clone());
        if !self
            .store
            .consume_nonce(&request.wallet, &nonce, now)
            .await
            .map_err(map_store_error)?
        {
            return Err(ExecutionError::VerificationFailed(
                VerificationError::PayloadReplayed,
            ));
        }

        let key = attempt.key();
        let claimed = match self
            .store
            .transition(
                &key,
                status_code::CLAIMABLE,
                AttemptStatus::InFlight { started_at: now },
                now,
            )
            .await
            .map_err(map_store_error)?
        {
            TransitionOutcome::Applied(claimed) => claimed,
            TransitionOutcome::Skipped { current } if current.status.is_completed() => {
                return Ok(confirm_response(ConfirmOutcome::AlreadyCompleted, current, Vec::new()));
            }
            TransitionOutcome::Skipped { current } => {
                return Err(ExecutionError::Conflict(format!(
                    "attempt moved to {} before submission",
                    current.status.code()
                )));
            }
        };

        let quorum = match quorum::check_quorum(&rule, self.presence.as_ref()).await {
            Ok(quorum) => quorum,
            Err(error) => {
                self.release_claim(&key, attempt.status.clone()).await;
                return Err(map_presence_error(error));
            }
        };
        if !quorum.met {
            self.release_claim(&key, attempt.status.clone()).await;
            return Err(ExecutionError::AdmissionDenied(AdmissionDenied::from_quorum(quorum)));
        }

        let mut cache = ListingCache::default();
        let args = self.parameters_for(&mut cache, &rule, &claimed).await?;
        let submission = SubmitRequest {
            contract_address: rule.contract.contract_address.clone(),
            function_name: rule.contract.function_name.clone(),
            args,
            signer: request.wallet.clone(),
            signature: hex::encode(verified.signature),
            authenticator_data: request.authenticator_data.clone(),
            client_data: request.client_data.clone(),
            signature_payload: request.signature_payload.clone(),
        };
        let timeout = Duration::from_millis(self.policy.chain_submit_timeout_ms);
        let submitted = tokio::time::timeout(timeout, self.chain.submit(submission)).await;

        let mut warnings = verified.warnings.clone();
        let receipt = match submitted {
            Err(_) => {
                let message = format!(
                    "chain submission timed out after {}ms",
                    self.policy.chain_submit_timeout_ms
                );
                self.fail_claim(&key, message.clone(), false).await;
                return Err(ExecutionError::SubmissionFailed(message));
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    rule_id = rule.rule_id,
                    wallet = %request.wallet,
                    backend = self.chain.backend(),
                    code = error.code(),
                    reason = %error,
                    "chain submission failed"
                );
                self.fail_claim(&key, error.message(), false).await;
                return Err(ExecutionError::SubmissionFailed(error.message()));
            }
            Ok(Ok(receipt)) if !receipt.success => {
                let message = format!("transaction {} was not successful", receipt.tx_hash);
                self.fail_claim(&key, message.clone(), false).await;
                return Err(ExecutionError::SubmissionFailed(message));
            }
            Ok(Ok(receipt)) => receipt,
        };

        let rejected_by_contract = match ReturnValue::from_receipt(&receipt) {
            ReturnValue::Bool(false) => true,
            ReturnValue::Undecodable => match self.policy.ambiguous_return {
                AmbiguousReturnPolicy::TreatAsSuccess => {
                    tracing::warn!(
                        rule_id = rule.rule_id,
                        wallet = %request.wallet,
                        tx_hash = %receipt.tx_hash,
                        "contract return value could not be decoded; treating as success"
                    );
                    warnings.push("ambiguous_return_value_treated_as_success".to_string());
                    false
                }
                AmbiguousReturnPolicy::TreatAsRejected => true,
            },
            ReturnValue::Void | ReturnValue::Bool(true) | ReturnValue::Other(_) => false,
        };
        if rejected_by_contract {
            self.fail_claim(
                &key,
                format!("contract rejected call in transaction {}", receipt.tx_hash),
                true,
            )
            .await;
            return Err(ExecutionError::ContractRejected {
                transaction_hash: receipt.tx_hash,
            });
        }

        let completed_at = Utc::now();
        let completed = match self
            .store
            .transition(
                &key,
                &[status_code::IN_FLIGHT],
                AttemptStatus::Completed {
                    transaction_hash: receipt.tx_hash.clone(),
                    completed_at,
                },
                completed_at,
            )
            .await
            .map_err(map_store_error)?
        {
            TransitionOutcome::Applied(completed) => completed,
            TransitionOutcome::Skipped { current } if current.status.is_completed() => {
                return Ok(confirm_response(ConfirmOutcome::AlreadyCompleted, current, warnings));
            }
            TransitionOutcome::Skipped { current } => {
                tracing::error!(
                    rule_id = rule.rule_id,
                    wallet = %request.wallet,
                    tx_hash = %receipt.tx_hash,
                    status = current.status.code(),
                    "submitted transaction could not be recorded; recover the attempt"
                );
                return Err(ExecutionError::Internal(format!(
                    "transaction {} submitted but attempt is {}",
                    receipt.tx_hash,
                    current.status.code()
                )));
            }
        };

        self.record_completion(&rule, &completed, completed_at).await;
        if registered_key.is_none() {
            if let Some(signing_key) = request.signing_key.as_deref() {
                if let Err(error) = self
                    .store
                    .register_signing_key(
                        &request.wallet,
                        &rule.contract.contract_address,
                        signing_key,
                        completed_at,
                    )
                    .await
                {
                    tracing::warn!(wallet = %request.wallet, reason = %error, "failed to register signing key");
                }
            }
        }
        tracing::info!(
            rule_id = rule.rule_id,
            wallet = %request.wallet,
            event_id = %completed.event_id,
            tx_hash = %receipt.tx_hash,
            "execution completed"
        );
        Ok(confirm_response(ConfirmOutcome::Submitted, completed, warnings))
    }

    pub async fn reject(&self, request: RejectRequest) -> Result<TransitionResponse, ExecutionError> {
        let attempt = self
            .locate_attempt(request.rule_id, &request.wallet, request.event_id.as_deref())
            .await?;
        if attempt.status.is_terminal() {
            return Ok(TransitionResponse {
                attempt,
                changed: false,
            });
        }
        if matches!(attempt.status, AttemptStatus::InFlight { .. }) {
            return Err(ExecutionError::Conflict(
                "submission already in flight".to_string(),
            ));
        }

        let now = Utc::now();
        match self
            .store
            .transition(
                &attempt.key(),
                status_code::REJECTABLE,
                AttemptStatus::Rejected {
                    reason: request.reason,
                    rejected_at: now,
                },
                now,
            )
            .await
            .map_err(map_store_error)?
        {
            TransitionOutcome::Applied(attempt) => {
                tracing::info!(
                    rule_id = attempt.rule_id,
                    wallet = %attempt.wallet,
                    event_id = %attempt.event_id,
                    reason = request.reason.as_str(),
                    "execution rejected"
                );
                Ok(TransitionResponse {
                    attempt,
                    changed: true,
                })
            }
            TransitionOutcome::Skipped { current } if current.status.is_terminal() => {
                Ok(TransitionResponse {
                    attempt: current,
                    changed: false,
                })
            }
            TransitionOutcome::Skipped { current } => Err(ExecutionError::Conflict(format!(
                "attempt is {}",
                current.status.code()
            ))),
        }
    }

    /// Force an attempt to completed with a transaction hash observed out of band.
    pub async fn recover(&self, request: RecoverRequest) -> Result<TransitionResponse, ExecutionError> {
        let transaction_hash = request.transaction_hash.trim();
        if transaction_hash.is_empty() {
            return Err(ExecutionError::InvalidRequest(
                "transaction_hash is required".to_string(),
            ));
        }

        let now = Utc::now();
        match self
            .store
            .transition(
                &request.key,
                status_code::RECOVERABLE,
                AttemptStatus::Completed {
                    transaction_hash: transaction_hash.to_string(),
                    completed_at: now,
                },
                now,
            )
            .await
            .map_err(map_store_error)?
        {
            TransitionOutcome::Applied(attempt) => {
                match self.rules.get_rule(attempt.rule_id).await {
                    Ok(Some(rule)) => self.record_completion(&rule, &attempt, now).await,
                    Ok(None) => self.record_history(attempt.rule_id, &attempt.wallet, None, now).await,
                    Err(error) => {
                        tracing::warn!(rule_id = attempt.rule_id, reason = %error, "rule lookup failed during recovery");
                        self.record_history(attempt.rule_id, &attempt.wallet, None, now).await;
                    }
                }
                tracing::info!(
                    rule_id = attempt.rule_id,
                    wallet = %attempt.wallet,
                    event_id = %attempt.event_id,
                    tx_hash = %transaction_hash,
                    "execution recovered"
                );
                Ok(TransitionResponse {
                    attempt,
                    changed: true,
                })
            }
            TransitionOutcome::Skipped { current } if current.status.is_completed() => {
                if current.status.transaction_hash() != Some(transaction_hash) {
                    tracing::warn!(
                        event_id = %current.event_id,
                        stored = ?current.status.transaction_hash(),
                        presented = %transaction_hash,
                        "recover called with a different transaction hash; keeping the stored one"
                    );
                }
                Ok(TransitionResponse {
                    attempt: current,
                    changed: false,
                })
            }
            TransitionOutcome::Skipped { current } => Err(ExecutionError::Conflict(format!(
                "attempt is {}",
                current.status.code()
            ))),
        }
    }

    /// Re-admit a retryable failure as pending.
    pub async fn retry(&self, key: &AttemptKey) -> Result<TransitionResponse, ExecutionError> {
        let now = Utc::now();
        match self
            .store
            .transition(
                key,
                &[status_code::FAILED_RETRYABLE],
                AttemptStatus::pending(PendingReason::RequiresWebauthn),
                now,
            )
            .await
            .map_err(map_store_error)?
        {
            TransitionOutcome::Applied(attempt) => Ok(TransitionResponse {
                attempt,
                changed: true,
            }),
            TransitionOutcome::Skipped { current } if current.status.pending_reason().is_some() => {
                Ok(TransitionResponse {
                    attempt: current,
                    changed: false,
                })
            }
            TransitionOutcome::Skipped { current } => Err(ExecutionError::Conflict(format!(
                "attempt is {}",
                current.status.code()
            ))),
        }
    }

    pub async fn check_quorum(&self, rule_id: RuleId) -> Result<QuorumStatus, ExecutionError> {
        let rule = self
            .rules
            .get_rule(rule_id)
            .await
            .map_err(map_rule_error)?
            .ok_or(ExecutionError::NotFound)?;
        quorum::check_quorum(&rule, self.presence.as_ref())
            .await
            .map_err(map_presence_error)
    }

    pub async fn run_reconciliation(&self) -> ReconciliationReport {
        reconcile::run_pass(self, Utc::now()).await
    }

    async fn active_rule(&self, rule_id: RuleId) -> Result<ExecutionRule, ExecutionError> {
        let rule = self
            .rules
            .get_rule(rule_id)
            .await
            .map_err(map_rule_error)?
            .ok_or(ExecutionError::NotFound)?;
        if !rule.active {
            return Err(ExecutionError::InvalidRequest(format!(
                "rule {rule_id} is inactive"
            )));
        }
        Ok(rule)
    }

    /// The live attempt for (rule, wallet[, event]) if any, else the newest one.
    ///
    /// Pending attempts matched before the newest completion for the same
    /// (rule, wallet) are superseded on the way and never returned as live.
    async fn locate_attempt(
        &self,
        rule_id: RuleId,
        wallet: &str,
        event_id: Option<&str>,
    ) -> Result<ExecutionAttempt, ExecutionError> {
        let filter = AttemptFilter {
            rule_id: Some(rule_id),
            ..AttemptFilter::for_wallet(wallet)
        };
        let attempts = self
            .store
            .list_attempts(&filter)
            .await
            .map_err(map_store_error)?;
        let newest_completion = attempts
            .iter()
            .filter(|attempt| attempt.status.is_completed())
            .map(|attempt| attempt.matched_at)
            .max();
        let scoped = attempts
            .into_iter()
            .filter(|attempt| event_id.is_none_or(|event_id| attempt.event_id == event_id))
            .collect::<Vec<_>>();

        for attempt in scoped.iter().filter(|attempt| attempt.status.is_live()) {
            if !reconcile::superseded_by_completion(attempt, newest_completion) {
                return Ok(attempt.clone());
            }
            let settled = self.supersede_stale(attempt).await?;
            if event_id.is_some() {
                return Ok(settled);
            }
        }
        scoped
            .into_iter()
            .find(|attempt| !reconcile::superseded_by_completion(attempt, newest_completion))
            .ok_or(ExecutionError::NotFound)
    }

    async fn supersede_stale(
        &self,
        attempt: &ExecutionAttempt,
    ) -> Result<ExecutionAttempt, ExecutionError> {
        let now = Utc::now();
        let outcome = self
            .store
            .transition(
                &attempt.key(),
                status_code::PENDING,
                AttemptStatus::Superseded {
                    reason: SupersedeReason::SupersededByNewerExecution,
                    superseded_at: now,
                },
                now,
            )
            .await
            .map_err(map_store_error)?;
        match outcome {
            TransitionOutcome::Applied(updated) => {
                tracing::info!(
                    rule_id = updated.rule_id,
                    wallet = %updated.wallet,
                    event_id = %updated.event_id,
                    "superseded pending attempt behind a newer completion"
                );
                Ok(updated)
            }
            TransitionOutcome::Skipped { current } => Ok(current),
        }
    }

    async fn mark_rate_limited(&self, attempt: &ExecutionAttempt, now: DateTime<Utc>) {
        if attempt.status.pending_reason() == Some(PendingReason::RateLimitExceeded) {
            return;
        }
        let result = self
            .store
            .transition(
                &attempt.key(),
                &[attempt.status.code()],
                AttemptStatus::pending(PendingReason::RateLimitExceeded),
                now,
            )
            .await;
        if let Err(error) = result {
            tracing::warn!(
                rule_id = attempt.rule_id,
                wallet = %attempt.wallet,
                reason = %error,
                "failed to mark attempt rate limited"
            );
        }
    }

    async fn release_claim(&self, key: &AttemptKey, previous: AttemptStatus) {
        let result = self
            .store
            .transition(key, &[status_code::IN_FLIGHT], previous, Utc::now())
            .await;
        if let Err(error) = result {
            tracing::error!(
                rule_id = key.rule_id,
                wallet = %key.wallet,
                reason = %error,
                "failed to release submission claim"
            );
        }
    }

    async fn fail_claim(&self, key: &AttemptKey, error: String, contract_rejected: bool) {
        let now = Utc::now();
        let result = self
            .store
            .transition(
                key,
                &[status_code::IN_FLIGHT],
                AttemptStatus::Failed {
                    error,
                    failed_at: now,
                    contract_rejected,
                },
                now,
            )
            .await;
        if let Err(error) = result {
            tracing::error!(
                rule_id = key.rule_id,
                wallet = %key.wallet,
                reason = %error,
                "failed to record submission failure"
            );
        }
    }

    async fn record_completion(
        &self,
        rule: &ExecutionRule,
        attempt: &ExecutionAttempt,
        at: DateTime<Utc>,
    ) {
        let window_seconds = rule.rate_limit.and_then(|limit| limit.window_seconds);
        self.record_history(rule.rule_id, &attempt.wallet, window_seconds, at)
            .await;
    }

    async fn record_history(
        &self,
        rule_id: RuleId,
        wallet: &str,
        window_seconds: Option<i64>,
        at: DateTime<Utc>,
    ) {
        if let Err(error) = self
            .store
            .record_execution(rule_id, wallet, at, window_seconds)
            .await
        {
            tracing::error!(
                rule_id,
                wallet = %wallet,
                reason = %error,
                "failed to update rule execution history"
            );
        }
    }

    async fn cached_rule(
        &self,
        cache: &mut ListingCache,
        rule_id: RuleId,
    ) -> Result<Option<ExecutionRule>, ExecutionError> {
        if let Some(rule) = cache.rules.get(&rule_id) {
            return Ok(rule.clone());
        }
        let rule = self.rules.get_rule(rule_id).await.map_err(map_rule_error)?;
        cache.rules.insert(rule_id, rule.clone());
        Ok(rule)
    }

    async fn parameters_for(
        &self,
        cache: &mut ListingCache,
        rule: &ExecutionRule,
        attempt: &ExecutionAttempt,
    ) -> Result<Value, ExecutionError> {
        if !cache.events.contains_key(&attempt.event_id) {
            let event = self
                .store
                .get_event(&attempt.event_id)
                .await
                .map_err(map_store_error)?;
            cache.events.insert(
                attempt.event_id.clone(),
                event.map(|event| (event.latitude, event.longitude)),
            );
        }
        let coordinates = cache.events.get(&attempt.event_id).copied().flatten();
        Ok(populate_parameters(
            &rule.contract.parameters,
            &TemplateContext {
                rule_id: rule.rule_id,
                matched_wallet: &attempt.wallet,
                latitude: coordinates.map(|(latitude, _)| latitude),
                longitude: coordinates.map(|(_, longitude)| longitude),
                matched_at: attempt.matched_at,
            },
        ))
    }

    async fn describe(
        &self,
        cache: &mut ListingCache,
        attempt: &ExecutionAttempt,
    ) -> Result<(String, String, Value), ExecutionError> {
        match self.cached_rule(cache, attempt.rule_id).await? {
            Some(rule) => {
                let parameters = self.parameters_for(cache, &rule, attempt).await?;
                Ok((
                    rule.contract.function_name,
                    rule.contract.contract_address,
                    parameters,
                ))
            }
            None => Ok((String::new(), String::new(), Value::Null)),
        }
    }
}

#[derive(Default)]
struct ListingCache {
    rules: HashMap<RuleId, Option<ExecutionRule>>,
    events: HashMap<String, Option<(f64, f64)>>,
}

fn confirm_response(
    outcome: ConfirmOutcome,
    attempt: ExecutionAttempt,
    warnings: Vec<String>,
) -> ConfirmResponse {
    ConfirmResponse {
        outcome,
        transaction_hash: attempt.status.transaction_hash().map(str::to_string),
        attempt_id: attempt.attempt_id,
        event_id: attempt.event_id,
        rule_id: attempt.rule_id,
        wallet: attempt.wallet,
        status: attempt.status,
        warnings,
    }
}

fn map_store_error(error: StoreError) -> ExecutionError {
    match error {
        StoreError::Conflict(message) => ExecutionError::Conflict(message),
        StoreError::NotFound(_) => ExecutionError::NotFound,
        StoreError::Db(message) => ExecutionError::Internal(message),
    }
}

fn map_rule_error(error: RuleSourceError) -> ExecutionError {
    ExecutionError::Internal(error.to_string())
}

fn map_presence_error(error: PresenceError) -> ExecutionError {
    ExecutionError::DependencyUnavailable(error.to_string())
}
