//! Per (rule, wallet) execution rate limiting over an anchored window.
//!
//! A window opens at the first execution after the previous window elapsed and
//! admits `max_executions_per_key` executions until `window_seconds` have passed.

use chrono::{DateTime, Duration, Utc};

use crate::execution::types::{ExecutionRule, RuleExecutionHistory, RuleId};

pub fn is_within_limit(
    rule: &ExecutionRule,
    history: Option<&RuleExecutionHistory>,
    now: DateTime<Utc>,
) -> bool {
    let Some((max, window_seconds)) = rule.rate_limit.and_then(|limit| limit.bounds()) else {
        return true;
    };
    let Some(history) = history else {
        return true;
    };
    if window_elapsed(history, window_seconds, now) {
        return true;
    }
    history.window_count < i64::from(max)
}

/// When the current window ends, if the key is limited right now.
pub fn window_resets_at(
    rule: &ExecutionRule,
    history: Option<&RuleExecutionHistory>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if is_within_limit(rule, history, now) {
        return None;
    }
    let (_, window_seconds) = rule.rate_limit.and_then(|limit| limit.bounds())?;
    history.map(|history| history.window_started_at + Duration::seconds(window_seconds))
}

/// History row after one more completed execution at `at`.
pub fn advance_history(
    previous: Option<&RuleExecutionHistory>,
    rule_id: RuleId,
    wallet: &str,
    at: DateTime<Utc>,
    window_seconds: Option<i64>,
) -> RuleExecutionHistory {
    let Some(previous) = previous else {
        return RuleExecutionHistory {
            rule_id,
            wallet: wallet.to_string(),
            window_started_at: at,
            window_count: 1,
            last_execution_at: at,
            execution_count: 1,
        };
    };

    let rollover = match window_seconds.filter(|seconds| *seconds > 0) {
        Some(seconds) => window_elapsed(previous, seconds, at),
        None => true,
    };
    let (window_started_at, window_count) = if rollover {
        (at, 1)
    } else {
        (previous.window_started_at, previous.window_count.saturating_add(1))
    };

    RuleExecutionHistory {
        rule_id,
        wallet: wallet.to_string(),
        window_started_at,
        window_count,
        last_execution_at: previous.last_execution_at.max(at),
        execution_count: previous.execution_count.saturating_add(1),
    }
}

fn window_elapsed(history: &RuleExecutionHistory, window_seconds: i64, now: DateTime<Utc>) -> bool {
    (now - history.window_started_at).num_seconds() >= window_seconds
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::execution::types::{RateLimit, RuleType, TargetContract, TriggerOn};

    fn rule(max: Option<u32>, window: Option<i64>) -> ExecutionRule {
        ExecutionRule {
            rule_id: 5,
            user_id: "user-1".to_string(),
            rule_type: RuleType::Geofence,
            geometry_ref: "geofence:1".to_string(),
            contract: TargetContract {
                contract_address: "CCONTRACT".to_string(),
                function_name: "deposit".to_string(),
                parameters: json!({}),
            },
            trigger_on: TriggerOn::Enter,
            auto_execute: true,
            requires_confirmation: false,
            quorum: None,
            rate_limit: Some(RateLimit {
                max_executions_per_key: max,
                window_seconds: window,
            }),
            target_wallet: None,
            active: true,
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    fn history_after(completions: &[i64], window: Option<i64>) -> Option<RuleExecutionHistory> {
        completions.iter().fold(None, |previous, second| {
            Some(advance_history(previous.as_ref(), 5, "W", at(*second), window))
        })
    }

    #[test]
    fn two_per_minute_denies_at_30_and_admits_at_61() {
        let rule = rule(Some(2), Some(60));
        let history = history_after(&[0, 10, 20], Some(60));

        assert!(!is_within_limit(&rule, history.as_ref(), at(30)));
        assert_eq!(window_resets_at(&rule, history.as_ref(), at(30)), Some(at(60)));
        assert!(is_within_limit(&rule, history.as_ref(), at(61)));
    }

    #[test]
    fn missing_or_zero_bounds_mean_unlimited() {
        let history = history_after(&[0, 1, 2, 3], None);
        for rule in [rule(None, Some(60)), rule(Some(2), None), rule(Some(0), Some(60)), rule(Some(2), Some(0))] {
            assert!(is_within_limit(&rule, history.as_ref(), at(4)));
        }
        let mut unlimited = rule(Some(1), Some(60));
        unlimited.rate_limit = None;
        assert!(is_within_limit(&unlimited, history.as_ref(), at(4)));
    }

    #[test]
    fn history_rolls_the_window_and_keeps_the_total() {
        let history = history_after(&[0, 10, 70], Some(60)).expect("history");
        assert_eq!(history.window_started_at, at(70));
        assert_eq!(history.window_count, 1);
        assert_eq!(history.execution_count, 3);
        assert_eq!(history.last_execution_at, at(70));
    }

    #[test]
    fn first_execution_is_always_admitted() {
        assert!(is_within_limit(&rule(Some(1), Some(60)), None, at(0)));
    }
}
