use std::env;

use passkey_auth::{ByteFormat, ChallengePolicy, VerifierPolicy};
use thiserror::Error;

use crate::chain::ChainClientConfig;
use crate::execution::{AmbiguousReturnPolicy, ExecutionPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub db_url: Option<String>,
    pub log_format: LogFormat,
    pub reconciliation_enabled: bool,
    pub reconciliation_interval_seconds: u64,
    pub retention_seconds: i64,
    pub sweep_batch_limit: usize,
    pub chain_rpc_base_url: Option<String>,
    pub chain_rpc_token: Option<String>,
    pub chain_rpc_timeout_ms: u64,
    pub challenge_policy: ChallengePolicy,
    pub signature_format: ByteFormat,
    pub ambiguous_return_policy: AmbiguousReturnPolicy,
    /// `0` disables the freshness check.
    pub payload_max_age_seconds: i64,
    pub presence_window_seconds: i64,
    pub rp_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid GEOTRIGGER_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
    #[error("invalid GEOTRIGGER_RECONCILIATION_ENABLED: {0}")]
    InvalidReconciliationEnabled(String),
    #[error("invalid reconciliation config: {0}")]
    InvalidReconciliationConfig(String),
    #[error("invalid chain rpc config: {0}")]
    InvalidChainRpcConfig(String),
    #[error("invalid GEOTRIGGER_CHALLENGE_POLICY: {0}")]
    InvalidChallengePolicy(String),
    #[error("invalid GEOTRIGGER_SIGNATURE_ENCODING: {0}")]
    InvalidSignatureEncoding(String),
    #[error("invalid GEOTRIGGER_AMBIGUOUS_RETURN_POLICY: {0}")]
    InvalidAmbiguousReturnPolicy(String),
    #[error("invalid verifier config: {0}")]
    InvalidVerifierConfig(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let service_name = non_empty(&lookup, "GEOTRIGGER_SERVICE_NAME")
            .unwrap_or_else(|| "geotrigger-runtime".to_string());
        let db_url = non_empty(&lookup, "DB_URL").or_else(|| non_empty(&lookup, "DATABASE_URL"));
        let log_format = parse_with_lookup(&lookup, "GEOTRIGGER_LOG_FORMAT", LogFormat::Text, |raw| {
            match raw.trim().to_ascii_lowercase().as_str() {
                "text" | "pretty" | "" => Ok(LogFormat::Text),
                "json" => Ok(LogFormat::Json),
                other => Err(ConfigError::InvalidLogFormat(other.to_string())),
            }
        })?;

        let reconciliation_enabled =
            parse_bool_lookup(&lookup, "GEOTRIGGER_RECONCILIATION_ENABLED", true)
                .map_err(ConfigError::InvalidReconciliationEnabled)?;
        let reconciliation_interval_seconds = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_RECONCILIATION_INTERVAL_SECONDS",
            60,
            |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(|value| value.clamp(1, 86_400))
                    .map_err(|error| {
                        ConfigError::InvalidReconciliationConfig(format!(
                            "GEOTRIGGER_RECONCILIATION_INTERVAL_SECONDS: {error}"
                        ))
                    })
            },
        )?;
        let retention_seconds = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_RECONCILIATION_RETENTION_SECONDS",
            7 * 24 * 60 * 60,
            |raw| {
                raw.trim()
                    .parse::<i64>()
                    .map(|value| value.clamp(60, 365 * 24 * 60 * 60))
                    .map_err(|error| {
                        ConfigError::InvalidReconciliationConfig(format!(
                            "GEOTRIGGER_RECONCILIATION_RETENTION_SECONDS: {error}"
                        ))
                    })
            },
        )?;
        let sweep_batch_limit = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_RECONCILIATION_BATCH_LIMIT",
            5_000,
            |raw| {
                raw.trim()
                    .parse::<usize>()
                    .map(|value| value.clamp(1, 100_000))
                    .map_err(|error| {
                        ConfigError::InvalidReconciliationConfig(format!(
                            "GEOTRIGGER_RECONCILIATION_BATCH_LIMIT: {error}"
                        ))
                    })
            },
        )?;

        let chain_rpc_base_url = non_empty(&lookup, "GEOTRIGGER_CHAIN_RPC_BASE_URL");
        if let Some(url) = chain_rpc_base_url.as_deref() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidChainRpcConfig(format!(
                    "GEOTRIGGER_CHAIN_RPC_BASE_URL must be http(s): {url}"
                )));
            }
        }
        let chain_rpc_token = non_empty(&lookup, "GEOTRIGGER_CHAIN_RPC_TOKEN");
        let chain_rpc_timeout_ms = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_CHAIN_RPC_TIMEOUT_MS",
            30_000,
            |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(|value| value.clamp(250, 120_000))
                    .map_err(|error| {
                        ConfigError::InvalidChainRpcConfig(format!(
                            "GEOTRIGGER_CHAIN_RPC_TIMEOUT_MS: {error}"
                        ))
                    })
            },
        )?;

        let challenge_policy = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_CHALLENGE_POLICY",
            ChallengePolicy::Enforce,
            |raw| ChallengePolicy::parse(&raw).ok_or(ConfigError::InvalidChallengePolicy(raw)),
        )?;
        let signature_format = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_SIGNATURE_ENCODING",
            ByteFormat::Auto,
            |raw| ByteFormat::parse(&raw).ok_or(ConfigError::InvalidSignatureEncoding(raw)),
        )?;
        let ambiguous_return_policy = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_AMBIGUOUS_RETURN_POLICY",
            AmbiguousReturnPolicy::TreatAsSuccess,
            |raw| {
                AmbiguousReturnPolicy::parse(&raw)
                    .ok_or(ConfigError::InvalidAmbiguousReturnPolicy(raw))
            },
        )?;
        let payload_max_age_seconds = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_PAYLOAD_MAX_AGE_SECONDS",
            300,
            |raw| {
                raw.trim()
                    .parse::<i64>()
                    .map(|value| value.clamp(0, 86_400))
                    .map_err(|error| {
                        ConfigError::InvalidVerifierConfig(format!(
                            "GEOTRIGGER_PAYLOAD_MAX_AGE_SECONDS: {error}"
                        ))
                    })
            },
        )?;
        let presence_window_seconds = parse_with_lookup(
            &lookup,
            "GEOTRIGGER_PRESENCE_WINDOW_SECONDS",
            300,
            |raw| {
                raw.trim()
                    .parse::<i64>()
                    .map(|value| value.clamp(1, 86_400))
                    .map_err(|error| {
                        ConfigError::InvalidVerifierConfig(format!(
                            "GEOTRIGGER_PRESENCE_WINDOW_SECONDS: {error}"
                        ))
                    })
            },
        )?;
        let rp_id = non_empty(&lookup, "GEOTRIGGER_RP_ID");

        Ok(Self {
            service_name,
            db_url,
            log_format,
            reconciliation_enabled,
            reconciliation_interval_seconds,
            retention_seconds,
            sweep_batch_limit,
            chain_rpc_base_url,
            chain_rpc_token,
            chain_rpc_timeout_ms,
            challenge_policy,
            signature_format,
            ambiguous_return_policy,
            payload_max_age_seconds,
            presence_window_seconds,
            rp_id,
        })
    }

    pub fn chain_client_config(&self) -> ChainClientConfig {
        ChainClientConfig {
            base_url: self.chain_rpc_base_url.clone(),
            auth_token: self.chain_rpc_token.clone(),
            timeout_ms: self.chain_rpc_timeout_ms,
        }
    }

    pub fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            verifier: VerifierPolicy {
                challenge: self.challenge_policy,
                signature_format: self.signature_format,
                expected_rp_id: self.rp_id.clone(),
                payload_max_age_seconds: (self.payload_max_age_seconds > 0)
                    .then_some(self.payload_max_age_seconds),
                ..VerifierPolicy::default()
            },
            ambiguous_return: self.ambiguous_return_policy,
            chain_submit_timeout_ms: self.chain_rpc_timeout_ms,
            retention_seconds: self.retention_seconds,
            sweep_batch_limit: self.sweep_batch_limit,
        }
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_bool_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, String> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError, LogFormat};
    use crate::execution::AmbiguousReturnPolicy;
    use passkey_auth::{ByteFormat, ChallengePolicy};

    #[test]
    fn defaults_apply_without_env() {
        let config = Config::from_lookup(|_| None).expect("defaults");
        assert_eq!(config.service_name, "geotrigger-runtime");
        assert_eq!(config.db_url, None);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.reconciliation_enabled);
        assert_eq!(config.retention_seconds, 604_800);
        assert_eq!(config.chain_rpc_timeout_ms, 30_000);
        assert_eq!(config.challenge_policy, ChallengePolicy::Enforce);
        assert_eq!(
            config.ambiguous_return_policy,
            AmbiguousReturnPolicy::TreatAsSuccess
        );
        assert_eq!(
            config.execution_policy().verifier.payload_max_age_seconds,
            Some(300)
        );
    }

    #[test]
    fn overrides_are_parsed_and_clamped() {
        let values = HashMap::from([
            ("DATABASE_URL", " postgres://localhost/geotrigger "),
            ("GEOTRIGGER_LOG_FORMAT", "JSON"),
            ("GEOTRIGGER_RECONCILIATION_ENABLED", "off"),
            ("GEOTRIGGER_RECONCILIATION_INTERVAL_SECONDS", "0"),
            ("GEOTRIGGER_CHAIN_RPC_BASE_URL", "https://relay.example"),
            ("GEOTRIGGER_CHAIN_RPC_TIMEOUT_MS", "5"),
            ("GEOTRIGGER_CHALLENGE_POLICY", "warn-only"),
            ("GEOTRIGGER_SIGNATURE_ENCODING", "base64url"),
            ("GEOTRIGGER_AMBIGUOUS_RETURN_POLICY", "treat_as_rejected"),
            ("GEOTRIGGER_PAYLOAD_MAX_AGE_SECONDS", "0"),
        ]);
        let config = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect("config");
        assert_eq!(
            config.db_url.as_deref(),
            Some("postgres://localhost/geotrigger")
        );
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(!config.reconciliation_enabled);
        assert_eq!(config.reconciliation_interval_seconds, 1);
        assert_eq!(config.chain_rpc_timeout_ms, 250);
        assert_eq!(config.challenge_policy, ChallengePolicy::WarnOnly);
        assert_eq!(
            config.ambiguous_return_policy,
            AmbiguousReturnPolicy::TreatAsRejected
        );
        let policy = config.execution_policy();
        assert_eq!(policy.verifier.payload_max_age_seconds, None);
        assert_eq!(policy.verifier.signature_format, ByteFormat::Base64);
        assert_eq!(policy.chain_submit_timeout_ms, 250);
        assert_eq!(
            config.chain_client_config().base_url.as_deref(),
            Some("https://relay.example")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let values = HashMap::from([("GEOTRIGGER_CHALLENGE_POLICY", "sometimes")]);
        let error = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect_err("invalid policy");
        assert!(matches!(error, ConfigError::InvalidChallengePolicy(_)));

        let values = HashMap::from([("GEOTRIGGER_CHAIN_RPC_BASE_URL", "ftp://relay")]);
        let error = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect_err("invalid url");
        assert!(matches!(error, ConfigError::InvalidChainRpcConfig(_)));

        let values = HashMap::from([("GEOTRIGGER_RECONCILIATION_ENABLED", "maybe")]);
        let error = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect_err("invalid bool");
        assert!(matches!(
            error,
            ConfigError::InvalidReconciliationEnabled(_)
        ));
    }
}
