use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::execution::types::{ExecutionRule, QuorumRequirement, QuorumType};
use crate::presence::{PresenceError, PresenceOracle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumStatus {
    pub met: bool,
    pub quorum_type: QuorumType,
    pub required: Vec<String>,
    pub present: Vec<String>,
    pub missing: Vec<String>,
    pub minimum_count: u32,
}

impl QuorumStatus {
    fn trivially_met() -> Self {
        Self {
            met: true,
            quorum_type: QuorumType::Any,
            required: Vec::new(),
            present: Vec::new(),
            missing: Vec::new(),
            minimum_count: 0,
        }
    }
}

/// Required wallets in declaration order with duplicates removed.
pub fn required_wallets(requirement: &QuorumRequirement) -> Vec<String> {
    let mut seen = HashSet::new();
    requirement
        .required_wallets
        .iter()
        .map(|wallet| wallet.trim())
        .filter(|wallet| !wallet.is_empty())
        .filter(|wallet| seen.insert(wallet.to_string()))
        .map(str::to_string)
        .collect()
}

/// Evaluate a requirement against the set of wallets currently in range.
///
/// `any` needs `minimum_count` (at least one) of the required wallets; `all` needs every one.
/// `missing` always lists every required wallet that is not present.
pub fn evaluate_quorum(
    requirement: Option<&QuorumRequirement>,
    present_wallets: &HashSet<String>,
) -> QuorumStatus {
    let Some(requirement) = requirement else {
        return QuorumStatus::trivially_met();
    };
    let required = required_wallets(requirement);
    if required.is_empty() {
        return QuorumStatus::trivially_met();
    }

    let (present, missing): (Vec<String>, Vec<String>) = required
        .iter()
        .cloned()
        .partition(|wallet| present_wallets.contains(wallet));

    let minimum_count = match requirement.quorum_type {
        QuorumType::Any => requirement.minimum_count.max(1),
        QuorumType::All => u32::try_from(required.len()).unwrap_or(u32::MAX),
    };
    let met = match requirement.quorum_type {
        QuorumType::Any => present.len() >= minimum_count as usize,
        QuorumType::All => missing.is_empty(),
    };

    QuorumStatus {
        met,
        quorum_type: requirement.quorum_type,
        required,
        present,
        missing,
        minimum_count,
    }
}

/// Ask the oracle about every required wallet of `rule` and evaluate the quorum.
pub async fn check_quorum(
    rule: &ExecutionRule,
    oracle: &dyn PresenceOracle,
) -> Result<QuorumStatus, PresenceError> {
    let Some(requirement) = rule.quorum.as_ref() else {
        return Ok(QuorumStatus::trivially_met());
    };
    let mut present = HashSet::new();
    for wallet in required_wallets(requirement) {
        if oracle.is_wallet_in_range(&wallet, rule).await? {
            present.insert(wallet);
        }
    }
    Ok(evaluate_quorum(Some(requirement), &present))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirement(kind: QuorumType, minimum_count: u32) -> QuorumRequirement {
        QuorumRequirement {
            required_wallets: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            minimum_count,
            quorum_type: kind,
        }
    }

    fn present(wallets: &[&str]) -> HashSet<String> {
        wallets.iter().map(|wallet| wallet.to_string()).collect()
    }

    #[test]
    fn two_of_three_is_met_with_a_and_b() {
        let status = evaluate_quorum(Some(&requirement(QuorumType::Any, 2)), &present(&["A", "B"]));
        assert!(status.met);
        assert_eq!(status.present, vec!["A", "B"]);
        assert_eq!(status.missing, vec!["C"]);
    }

    #[test]
    fn two_of_three_is_not_met_with_only_a() {
        let status = evaluate_quorum(Some(&requirement(QuorumType::Any, 2)), &present(&["A"]));
        assert!(!status.met);
        assert_eq!(status.present, vec!["A"]);
        assert_eq!(status.missing, vec!["B", "C"]);
        assert_eq!(status.minimum_count, 2);
    }

    #[test]
    fn all_requires_every_wallet() {
        let status = evaluate_quorum(Some(&requirement(QuorumType::All, 1)), &present(&["A", "B"]));
        assert!(!status.met);
        assert_eq!(status.minimum_count, 3);
        let status = evaluate_quorum(
            Some(&requirement(QuorumType::All, 1)),
            &present(&["A", "B", "C"]),
        );
        assert!(status.met);
    }

    #[test]
    fn no_required_wallets_is_trivially_met() {
        assert!(evaluate_quorum(None, &present(&[])).met);
        let empty = QuorumRequirement {
            required_wallets: vec![" ".to_string()],
            minimum_count: 3,
            quorum_type: QuorumType::Any,
        };
        assert!(evaluate_quorum(Some(&empty), &present(&[])).met);
    }

    #[test]
    fn duplicates_do_not_count_twice() {
        let requirement = QuorumRequirement {
            required_wallets: vec!["A".to_string(), "A".to_string(), "B".to_string()],
            minimum_count: 2,
            quorum_type: QuorumType::Any,
        };
        let status = evaluate_quorum(Some(&requirement), &present(&["A"]));
        assert!(!status.met);
        assert_eq!(status.required, vec!["A", "B"]);
    }
}
