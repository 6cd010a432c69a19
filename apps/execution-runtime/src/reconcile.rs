//! Periodic sweep over the execution log.
//!
//! Each phase walks the whole log in keyset pages of `sweep_batch_limit`, then
//! applies guarded transitions so a concurrent confirmation always wins over the
//! sweeper.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::execution::ExecutionService;
use crate::execution::store::StoreError;
use crate::execution::types::{
    AttemptCursor, AttemptKey, AttemptStatus, EventCursor, ExecutionAttempt, ExecutionRule,
    LocationEvent, PageOrder, PendingReason, RECONCILIATION_REPORT_SCHEMA_V1,
    RuleExecutionHistory, RuleId, SupersedeReason, TransitionOutcome, status_code,
};
use crate::rate_limit;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub planned: u64,
    pub applied: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl PhaseReport {
    fn record<T>(&mut self, result: Result<Option<T>, StoreError>, phase: &'static str) {
        match result {
            Ok(Some(_)) => self.applied = self.applied.saturating_add(1),
            Ok(None) => self.skipped = self.skipped.saturating_add(1),
            Err(error) => {
                self.errors = self.errors.saturating_add(1);
                tracing::warn!(phase, reason = %error, "reconciliation step failed");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub schema: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub superseded: PhaseReport,
    pub readmitted: PhaseReport,
    pub expired: PhaseReport,
    pub collected: PhaseReport,
}

impl ReconciliationReport {
    pub fn total_errors(&self) -> u64 {
        [
            &self.superseded,
            &self.readmitted,
            &self.expired,
            &self.collected,
        ]
        .iter()
        .map(|phase| phase.errors)
        .sum()
    }
}

/// A planned guarded transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTransition {
    pub key: AttemptKey,
    pub guard: &'static [&'static str],
    pub to: AttemptStatus,
}

/// A pending attempt matched before the newest completion for its (rule, wallet).
pub fn superseded_by_completion(
    attempt: &ExecutionAttempt,
    newest_completion: Option<DateTime<Utc>>,
) -> bool {
    attempt.status.pending_reason().is_some()
        && newest_completion.is_some_and(|completed| attempt.matched_at < completed)
}

/// Supersession planning over a newest-first walk of the log.
///
/// Completions seen on earlier pages carry over, so every completion newer
/// than a pending attempt is known by the time that attempt is planned.
#[derive(Debug, Default)]
pub struct SupersessionScan {
    newest_completion: HashMap<(RuleId, String), DateTime<Utc>>,
}

impl SupersessionScan {
    pub fn plan_page(
        &mut self,
        page: &[ExecutionAttempt],
        now: DateTime<Utc>,
    ) -> Vec<PlannedTransition> {
        for attempt in page.iter().filter(|attempt| attempt.status.is_completed()) {
            let entry = self
                .newest_completion
                .entry((attempt.rule_id, attempt.wallet.clone()))
                .or_insert(attempt.matched_at);
            if attempt.matched_at > *entry {
                *entry = attempt.matched_at;
            }
        }

        page.iter()
            .filter(|attempt| {
                let newest = self
                    .newest_completion
                    .get(&(attempt.rule_id, attempt.wallet.clone()))
                    .copied();
                superseded_by_completion(attempt, newest)
            })
            .map(|attempt| PlannedTransition {
                key: attempt.key(),
                guard: status_code::PENDING,
                to: AttemptStatus::Superseded {
                    reason: SupersedeReason::SupersededByNewerExecution,
                    superseded_at: now,
                },
            })
            .collect()
    }
}

/// Pending attempts matched before the newest completion for the same (rule, wallet).
pub fn plan_supersessions(
    attempts: &[ExecutionAttempt],
    now: DateTime<Utc>,
) -> Vec<PlannedTransition> {
    SupersessionScan::default().plan_page(attempts, now)
}

/// Rate-limited attempts whose (rule, wallet) window has elapsed.
///
/// Attempts whose rule is gone or inactive are left for expiry.
pub fn plan_readmissions(
    attempts: &[ExecutionAttempt],
    rules: &HashMap<RuleId, ExecutionRule>,
    histories: &HashMap<(RuleId, String), RuleExecutionHistory>,
    now: DateTime<Utc>,
) -> Vec<PlannedTransition> {
    attempts
        .iter()
        .filter(|attempt| {
            attempt.status.pending_reason() == Some(PendingReason::RateLimitExceeded)
        })
        .filter_map(|attempt| {
            let rule = rules.get(&attempt.rule_id).filter(|rule| rule.active)?;
            let history = histories.get(&(attempt.rule_id, attempt.wallet.clone()));
            if !rate_limit::is_within_limit(rule, history, now) {
                return None;
            }
            Some(PlannedTransition {
                key: attempt.key(),
                guard: &[status_code::PENDING_RATE_LIMIT_EXCEEDED],
                to: AttemptStatus::pending(readmitted_reason(rule)),
            })
        })
        .collect()
}

fn readmitted_reason(rule: &ExecutionRule) -> PendingReason {
    if rule.requires_confirmation {
        PendingReason::RequiresConfirmation
    } else if !rule.auto_execute {
        PendingReason::AutoExecuteDisabled
    } else {
        PendingReason::RequiresWebauthn
    }
}

const EXPIRABLE: &[&str] = &[
    status_code::PENDING_REQUIRES_WEBAUTHN,
    status_code::PENDING_RATE_LIMIT_EXCEEDED,
    status_code::PENDING_REQUIRES_CONFIRMATION,
    status_code::PENDING_AUTO_EXECUTE_DISABLED,
    status_code::PENDING_TARGET_WALLET_MISMATCH,
    status_code::FAILED_RETRYABLE,
];

/// Pending and retryable-failed attempts matched before `expire_before`.
pub fn plan_expirations(
    attempts: &[ExecutionAttempt],
    expire_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<PlannedTransition> {
    attempts
        .iter()
        .filter(|attempt| attempt.status.matches_any(EXPIRABLE))
        .filter(|attempt| attempt.matched_at < expire_before)
        .map(|attempt| PlannedTransition {
            key: attempt.key(),
            guard: EXPIRABLE,
            to: AttemptStatus::Superseded {
                reason: SupersedeReason::RetentionExpired,
                superseded_at: now,
            },
        })
        .collect()
}

pub fn plan_collection(events: &[LocationEvent], unmatched_before: DateTime<Utc>) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.is_collectable(unmatched_before))
        .map(|event| event.event_id.clone())
        .collect()
}

/// One full pass at `now`. Never fails; problems are counted in the report.
pub async fn run_pass(service: &ExecutionService, now: DateTime<Utc>) -> ReconciliationReport {
    let retention = Duration::seconds(service.policy().retention_seconds.max(0));
    let expire_before = now - retention;
    let limit = service.policy().sweep_batch_limit.clamp(1, 100_000);

    let mut report = ReconciliationReport {
        schema: RECONCILIATION_REPORT_SCHEMA_V1.to_string(),
        started_at: now,
        finished_at: now,
        superseded: PhaseReport::default(),
        readmitted: PhaseReport::default(),
        expired: PhaseReport::default(),
        collected: PhaseReport::default(),
    };

    let mut scan = SupersessionScan::default();
    let mut cursor: Option<AttemptCursor> = None;
    while let Some(page) = next_page(
        service,
        PageOrder::NewestFirst,
        cursor.as_ref(),
        limit,
        &mut report.superseded,
    )
    .await
    {
        let plan = scan.plan_page(&page, now);
        apply(service, plan, now, &mut report.superseded, "supersede").await;
        if page.len() < limit {
            break;
        }
        cursor = page.last().map(AttemptCursor::at);
    }

    let mut cursor: Option<AttemptCursor> = None;
    while let Some(page) = next_page(
        service,
        PageOrder::OldestFirst,
        cursor.as_ref(),
        limit,
        &mut report.readmitted,
    )
    .await
    {
        let (rules, histories) = readmission_inputs(service, &page, &mut report.readmitted).await;
        let plan = plan_readmissions(&page, &rules, &histories, now);
        apply(service, plan, now, &mut report.readmitted, "readmit").await;
        if page.len() < limit {
            break;
        }
        cursor = page.last().map(AttemptCursor::at);
    }

    let mut cursor: Option<AttemptCursor> = None;
    while let Some(page) = next_page(
        service,
        PageOrder::OldestFirst,
        cursor.as_ref(),
        limit,
        &mut report.expired,
    )
    .await
    {
        let plan = plan_expirations(&page, expire_before, now);
        apply(service, plan, now, &mut report.expired, "expire").await;
        let past_cutoff = page
            .last()
            .is_none_or(|attempt| attempt.matched_at >= expire_before);
        if page.len() < limit || past_cutoff {
            break;
        }
        cursor = page.last().map(AttemptCursor::at);
    }

    let mut cursor: Option<EventCursor> = None;
    loop {
        let events = match service.store().list_events(cursor.as_ref(), limit).await {
            Ok(events) => events,
            Err(error) => {
                report.collected.errors = report.collected.errors.saturating_add(1);
                tracing::warn!(phase = "collect", reason = %error, "reconciliation page failed");
                break;
            }
        };
        let plan = plan_collection(&events, expire_before);
        report.collected.planned = report.collected.planned.saturating_add(plan.len() as u64);
        for event_id in plan {
            let result = service
                .store()
                .delete_event_if_collectable(&event_id, expire_before)
                .await
                .map(|deleted| deleted.then_some(()));
            report.collected.record(result, "collect");
        }
        if events.len() < limit {
            break;
        }
        cursor = events.last().map(EventCursor::at);
    }

    report.finished_at = Utc::now().max(now);
    tracing::info!(
        superseded = report.superseded.applied,
        readmitted = report.readmitted.applied,
        expired = report.expired.applied,
        collected = report.collected.applied,
        errors = report.total_errors(),
        "reconciliation pass finished"
    );
    report
}

async fn next_page(
    service: &ExecutionService,
    order: PageOrder,
    after: Option<&AttemptCursor>,
    limit: usize,
    phase: &mut PhaseReport,
) -> Option<Vec<ExecutionAttempt>> {
    match service.store().page_attempts(order, after, limit).await {
        Ok(page) => Some(page),
        Err(error) => {
            phase.errors = phase.errors.saturating_add(1);
            tracing::warn!(reason = %error, "reconciliation page failed");
            None
        }
    }
}

async fn readmission_inputs(
    service: &ExecutionService,
    attempts: &[ExecutionAttempt],
    phase: &mut PhaseReport,
) -> (
    HashMap<RuleId, ExecutionRule>,
    HashMap<(RuleId, String), RuleExecutionHistory>,
) {
    let mut rules = HashMap::new();
    let mut histories = HashMap::new();
    for attempt in attempts.iter().filter(|attempt| {
        attempt.status.pending_reason() == Some(PendingReason::RateLimitExceeded)
    }) {
        if !rules.contains_key(&attempt.rule_id) {
            match service.rules().get_rule(attempt.rule_id).await {
                Ok(Some(rule)) => {
                    rules.insert(attempt.rule_id, rule);
                }
                Ok(None) => {}
                Err(error) => {
                    phase.errors = phase.errors.saturating_add(1);
                    tracing::warn!(rule_id = attempt.rule_id, reason = %error, "rule lookup failed during reconciliation");
                }
            }
        }
        let key = (attempt.rule_id, attempt.wallet.clone());
        if histories.contains_key(&key) {
            continue;
        }
        match service
            .store()
            .get_history(attempt.rule_id, &attempt.wallet)
            .await
        {
            Ok(Some(history)) => {
                histories.insert(key, history);
            }
            Ok(None) => {}
            Err(error) => {
                phase.errors = phase.errors.saturating_add(1);
                tracing::warn!(rule_id = attempt.rule_id, reason = %error, "history lookup failed during reconciliation");
            }
        }
    }
    (rules, histories)
}

async fn apply(
    service: &ExecutionService,
    plan: Vec<PlannedTransition>,
    now: DateTime<Utc>,
    phase: &mut PhaseReport,
    name: &'static str,
) {
    phase.planned = phase.planned.saturating_add(plan.len() as u64);
    for step in plan {
        let result = service
            .store()
            .transition(&step.key, step.guard, step.to, now)
            .await
            .map(|outcome| match outcome {
                TransitionOutcome::Applied(attempt) => Some(attempt),
                TransitionOutcome::Skipped { .. } => None,
            });
        phase.record(result, name);
    }
}

/// Run a pass every `interval` until `shutdown` flips to true.
pub fn spawn_worker(
    service: ExecutionService,
    interval: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    service.run_reconciliation().await;
                }
            }
        }
        tracing::info!("reconciliation worker stopped");
    })
}
