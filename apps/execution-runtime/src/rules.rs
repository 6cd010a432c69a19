//! Read-only access to execution rules owned by rule management.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::ExecutionDb;
use crate::execution::types::{
    ExecutionRule, QuorumRequirement, QuorumType, RateLimit, RuleId, RuleType, TargetContract,
    TriggerOn,
};

#[derive(Debug, thiserror::Error)]
pub enum RuleSourceError {
    #[error("db error: {0}")]
    Db(String),
    #[error("invalid rule {rule_id}: {message}")]
    InvalidRule { rule_id: RuleId, message: String },
}

#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn get_rule(&self, rule_id: RuleId) -> Result<Option<ExecutionRule>, RuleSourceError>;
}

pub fn memory(rules: Vec<ExecutionRule>) -> Arc<dyn RuleSource> {
    Arc::new(MemoryRuleSource {
        rules: rules.into_iter().map(|rule| (rule.rule_id, rule)).collect(),
    })
}

pub fn postgres(db: Arc<ExecutionDb>) -> Arc<dyn RuleSource> {
    Arc::new(PostgresRuleSource { db })
}

struct MemoryRuleSource {
    rules: HashMap<RuleId, ExecutionRule>,
}

#[async_trait]
impl RuleSource for MemoryRuleSource {
    async fn get_rule(&self, rule_id: RuleId) -> Result<Option<ExecutionRule>, RuleSourceError> {
        Ok(self.rules.get(&rule_id).cloned())
    }
}

struct PostgresRuleSource {
    db: Arc<ExecutionDb>,
}

#[async_trait]
impl RuleSource for PostgresRuleSource {
    async fn get_rule(&self, rule_id: RuleId) -> Result<Option<ExecutionRule>, RuleSourceError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT rule_id, user_id, rule_type, geometry_ref, contract_address, function_name,
                       parameters, trigger_on, auto_execute, requires_confirmation,
                       required_wallets, minimum_count, quorum_type, max_executions_per_key,
                       window_seconds, target_wallet, active
                  FROM geotrigger.execution_rules
                 WHERE rule_id = $1
                "#,
                &[&rule_id],
            )
            .await
            .map_err(|error| RuleSourceError::Db(error.to_string()))?;
        row.as_ref()
            .map(|row| {
                map_rule_row(row).map_err(|message| RuleSourceError::InvalidRule { rule_id, message })
            })
            .transpose()
    }
}

fn map_rule_row(row: &tokio_postgres::Row) -> Result<ExecutionRule, String> {
    let rule_type: String = row.try_get("rule_type").map_err(|e| e.to_string())?;
    let trigger_on: String = row.try_get("trigger_on").map_err(|e| e.to_string())?;
    let required_wallets: Option<Vec<String>> =
        row.try_get("required_wallets").map_err(|e| e.to_string())?;
    let minimum_count: Option<i32> = row.try_get("minimum_count").map_err(|e| e.to_string())?;
    let quorum_type: Option<String> = row.try_get("quorum_type").map_err(|e| e.to_string())?;
    let max_executions_per_key: Option<i32> = row
        .try_get("max_executions_per_key")
        .map_err(|e| e.to_string())?;
    let window_seconds: Option<i64> = row.try_get("window_seconds").map_err(|e| e.to_string())?;

    let quorum = match required_wallets {
        Some(required_wallets) if !required_wallets.is_empty() => {
            let quorum_type = match quorum_type.as_deref() {
                None => QuorumType::Any,
                Some(raw) => {
                    QuorumType::parse(raw).ok_or_else(|| format!("unknown quorum_type {raw}"))?
                }
            };
            Some(QuorumRequirement {
                required_wallets,
                minimum_count: minimum_count
                    .map(|count| u32::try_from(count.max(0)).unwrap_or(0))
                    .unwrap_or(1),
                quorum_type,
            })
        }
        _ => None,
    };
    let rate_limit = if max_executions_per_key.is_some() || window_seconds.is_some() {
        Some(RateLimit {
            max_executions_per_key: max_executions_per_key
                .map(|max| u32::try_from(max.max(0)).unwrap_or(0)),
            window_seconds,
        })
    } else {
        None
    };

    Ok(ExecutionRule {
        rule_id: row.try_get("rule_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        rule_type: RuleType::parse(&rule_type)
            .ok_or_else(|| format!("unknown rule_type {rule_type}"))?,
        geometry_ref: row.try_get("geometry_ref").map_err(|e| e.to_string())?,
        contract: TargetContract {
            contract_address: row
                .try_get("contract_address")
                .map_err(|e| e.to_string())?,
            function_name: row.try_get("function_name").map_err(|e| e.to_string())?,
            parameters: row.try_get("parameters").map_err(|e| e.to_string())?,
        },
        trigger_on: TriggerOn::parse(&trigger_on)
            .ok_or_else(|| format!("unknown trigger_on {trigger_on}"))?,
        auto_execute: row.try_get("auto_execute").map_err(|e| e.to_string())?,
        requires_confirmation: row
            .try_get("requires_confirmation")
            .map_err(|e| e.to_string())?,
        quorum,
        rate_limit,
        target_wallet: row.try_get("target_wallet").map_err(|e| e.to_string())?,
        active: row.try_get("active").map_err(|e| e.to_string())?,
    })
}

/// Values substituted into a rule's parameter template.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub rule_id: RuleId,
    pub matched_wallet: &'a str,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub matched_at: DateTime<Utc>,
}

impl TemplateContext<'_> {
    fn value_for(&self, placeholder: &str) -> Option<Value> {
        match placeholder {
            "matched_wallet" | "wallet" => Some(Value::String(self.matched_wallet.to_string())),
            "latitude" => Some(self.latitude.map_or(Value::Null, Value::from)),
            "longitude" => Some(self.longitude.map_or(Value::Null, Value::from)),
            "timestamp" => Some(Value::from(self.matched_at.timestamp())),
            "rule_id" => Some(Value::from(self.rule_id)),
            _ => None,
        }
    }
}

/// Replace `{{placeholder}}` markers in a parameter template.
///
/// A string that is exactly one placeholder takes the typed value; placeholders
/// embedded in longer strings are substituted textually. Unknown placeholders are
/// left as written.
pub fn populate_parameters(template: &Value, context: &TemplateContext<'_>) -> Value {
    match template {
        Value::String(text) => populate_string(text, context),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| populate_parameters(item, context))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), populate_parameters(value, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn populate_string(text: &str, context: &TemplateContext<'_>) -> Value {
    let trimmed = text.trim();
    if let Some(name) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .filter(|name| !name.contains("{{"))
    {
        if let Some(value) = context.value_for(name.trim()) {
            return value;
        }
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            break;
        };
        let name = rest[start + 2..start + end].trim();
        output.push_str(&rest[..start]);
        match context.value_for(name) {
            Some(Value::String(value)) => output.push_str(&value),
            Some(Value::Null) | None => output.push_str(&rest[start..start + end + 2]),
            Some(value) => output.push_str(&value.to_string()),
        }
        rest = &rest[start + end + 2..];
    }
    output.push_str(rest);
    Value::String(output)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn context() -> TemplateContext<'static> {
        TemplateContext {
            rule_id: 5,
            matched_wallet: "GWALLET",
            latitude: Some(40.5),
            longitude: Some(-73.25),
            matched_at: Utc
                .timestamp_opt(1_700_000_000, 0)
                .single()
                .expect("timestamp"),
        }
    }

    #[test]
    fn whole_value_placeholders_keep_their_type() {
        let template = json!({
            "to": "{{matched_wallet}}",
            "lat": "{{latitude}}",
            "at": "{{ timestamp }}",
            "rule": "{{rule_id}}",
            "amount": 100,
        });
        assert_eq!(
            populate_parameters(&template, &context()),
            json!({
                "to": "GWALLET",
                "lat": 40.5,
                "at": 1_700_000_000,
                "rule": 5,
                "amount": 100,
            })
        );
    }

    #[test]
    fn embedded_and_unknown_placeholders() {
        let template = json!(["memo {{matched_wallet}} @ {{longitude}}", "{{unknown}}", "{{open"]);
        assert_eq!(
            populate_parameters(&template, &context()),
            json!(["memo GWALLET @ -73.25", "{{unknown}}", "{{open"])
        );
    }

    #[tokio::test]
    async fn memory_source_returns_seeded_rules() {
        let rule = ExecutionRule {
            rule_id: 5,
            user_id: "user-1".to_string(),
            rule_type: RuleType::Location,
            geometry_ref: "point:1".to_string(),
            contract: TargetContract {
                contract_address: "CCONTRACT".to_string(),
                function_name: "deposit".to_string(),
                parameters: json!({}),
            },
            trigger_on: TriggerOn::Enter,
            auto_execute: true,
            requires_confirmation: false,
            quorum: None,
            rate_limit: None,
            target_wallet: None,
            active: true,
        };
        let source = memory(vec![rule.clone()]);
        assert_eq!(source.get_rule(5).await.expect("get"), Some(rule));
        assert_eq!(source.get_rule(6).await.expect("get"), None);
    }
}
