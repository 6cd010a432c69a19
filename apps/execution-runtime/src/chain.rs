//! Submission of already-authorized contract calls to the chain relay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("relay rejected submission ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ChainClientError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
            Self::Http { .. } => "relay_http_error",
            Self::Unsupported(_) => "unsupported",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidConfig(message)
            | Self::DependencyUnavailable(message)
            | Self::Unsupported(message) => message.clone(),
            Self::Http { status, body } => format!("relay http {status}: {body}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub contract_address: String,
    pub function_name: String,
    pub args: Value,
    pub signer: String,
    /// Low-S `r || s`, hex.
    pub signature: String,
    pub authenticator_data: String,
    pub client_data: String,
    pub signature_payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    #[serde(alias = "txHash")]
    pub tx_hash: String,
    pub success: bool,
    #[serde(default, alias = "returnValue")]
    pub return_value: Option<Value>,
    /// False when the relay could not decode the contract's return value.
    #[serde(default = "decoded_default", alias = "returnValueDecoded")]
    pub return_value_decoded: bool,
}

fn decoded_default() -> bool {
    true
}

/// Business meaning of a contract's return value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    Void,
    Bool(bool),
    Other(Value),
    Undecodable,
}

impl ReturnValue {
    pub fn from_receipt(receipt: &SubmitReceipt) -> Self {
        if !receipt.return_value_decoded {
            return Self::Undecodable;
        }
        match receipt.return_value.as_ref() {
            None | Some(Value::Null) => Self::Void,
            Some(Value::Bool(value)) => Self::Bool(*value),
            Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Self::Bool(true),
                "false" => Self::Bool(false),
                _ => Self::Other(Value::String(text.clone())),
            },
            Some(Value::Object(fields))
                if fields.get("type").and_then(Value::as_str) == Some("bool") =>
            {
                match fields.get("value") {
                    Some(Value::Bool(value)) => Self::Bool(*value),
                    _ => Self::Undecodable,
                }
            }
            Some(other) => Self::Other(other.clone()),
        }
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, ChainClientError>;
}

#[derive(Debug, Clone)]
pub struct ChainClientConfig {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub timeout_ms: u64,
}

pub fn from_config(config: &ChainClientConfig) -> Arc<dyn ChainClient> {
    match config.base_url.as_deref() {
        Some(base_url) => Arc::new(HttpChainClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            timeout_ms: config.timeout_ms,
        }),
        None => Arc::new(NoopChainClient),
    }
}

pub struct NoopChainClient;

#[async_trait]
impl ChainClient for NoopChainClient {
    fn backend(&self) -> &'static str {
        "noop"
    }

    async fn submit(&self, _request: SubmitRequest) -> Result<SubmitReceipt, ChainClientError> {
        Err(ChainClientError::Unsupported(
            "no chain relay configured (GEOTRIGGER_CHAIN_RPC_BASE_URL)".to_string(),
        ))
    }
}

/// JSON relay that builds, signs and submits the contract invocation.
pub struct HttpChainClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    timeout_ms: u64,
}

#[async_trait]
impl ChainClient for HttpChainClient {
    fn backend(&self) -> &'static str {
        "http"
    }

    async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, ChainClientError> {
        let url = format!("{}/v1/contracts/invoke", self.base_url);
        let mut builder = self
            .http
            .post(url.as_str())
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(&json!({
                "contractAddress": request.contract_address,
                "functionName": request.function_name,
                "args": request.args,
                "signer": request.signer,
                "webauthn": {
                    "signature": request.signature,
                    "authenticatorData": request.authenticator_data,
                    "clientData": request.client_data,
                    "signaturePayload": request.signature_payload,
                },
            }));
        if let Some(token) = self.auth_token.as_deref() {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|error| ChainClientError::DependencyUnavailable(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|error| ChainClientError::DependencyUnavailable(error.to_string()))?;
        let receipt = body.get("result").cloned().unwrap_or(body);
        serde_json::from_value(receipt).map_err(|error| {
            ChainClientError::DependencyUnavailable(format!("malformed relay receipt: {error}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(value: Option<Value>, decoded: bool) -> SubmitReceipt {
        SubmitReceipt {
            tx_hash: "tx".to_string(),
            success: true,
            return_value: value,
            return_value_decoded: decoded,
        }
    }

    #[test]
    fn return_values_are_classified() {
        assert_eq!(ReturnValue::from_receipt(&receipt(None, true)), ReturnValue::Void);
        assert_eq!(
            ReturnValue::from_receipt(&receipt(Some(json!(false)), true)),
            ReturnValue::Bool(false)
        );
        assert_eq!(
            ReturnValue::from_receipt(&receipt(Some(json!("TRUE")), true)),
            ReturnValue::Bool(true)
        );
        assert_eq!(
            ReturnValue::from_receipt(&receipt(Some(json!({"type": "bool", "value": false})), true)),
            ReturnValue::Bool(false)
        );
        assert_eq!(
            ReturnValue::from_receipt(&receipt(Some(json!(42)), true)),
            ReturnValue::Other(json!(42))
        );
        assert_eq!(
            ReturnValue::from_receipt(&receipt(Some(json!("AAAAAQ==")), false)),
            ReturnValue::Undecodable
        );
    }

    #[test]
    fn relay_receipts_accept_camel_case() {
        let parsed: SubmitReceipt = serde_json::from_value(json!({
            "txHash": "abc",
            "success": true,
            "returnValue": true,
        }))
        .expect("receipt");
        assert_eq!(parsed.tx_hash, "abc");
        assert!(parsed.return_value_decoded);
        assert_eq!(ReturnValue::from_receipt(&parsed), ReturnValue::Bool(true));
    }

    #[tokio::test]
    async fn missing_relay_config_falls_back_to_noop() {
        let client = from_config(&ChainClientConfig {
            base_url: None,
            auth_token: None,
            timeout_ms: 1_000,
        });
        assert_eq!(client.backend(), "noop");
        let result = client
            .submit(SubmitRequest {
                contract_address: "C".to_string(),
                function_name: "f".to_string(),
                args: json!({}),
                signer: "W".to_string(),
                signature: String::new(),
                authenticator_data: String::new(),
                client_data: String::new(),
                signature_payload: String::new(),
            })
            .await;
        assert!(matches!(result, Err(ChainClientError::Unsupported(_))));
    }
}
