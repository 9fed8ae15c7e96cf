//! Chain JSON-RPC client.
//!
//! Fetches deploys from a Casper-style node via `info_get_deploy`. The
//! client holds a primary and an optional fallback endpoint: a transport
//! failure on the primary triggers exactly one retry against the
//! fallback, then the error is surfaced. This is a network-level retry -
//! application-level retry (e.g., waiting for finalization) is the
//! caller's decision.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::AppError;

/// Per-call timeout for RPC requests.
const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Deploy header as returned by the node: the submitting account and
/// the deploy timestamp.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployHeader {
    /// Hex public key of the account that submitted the deploy
    pub account: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deploy {
    pub hash: String,
    pub header: DeployHeader,
}

/// A single native transfer extracted from a deploy's execution.
#[derive(Debug, Clone, Deserialize)]
pub struct Transfer {
    /// Transferred amount in motes, as a decimal string (amounts can
    /// exceed u64)
    pub amount: String,
    /// Sender account hash
    pub from: String,
    /// Recipient account hash (absent for some system transfers)
    pub to: Option<String>,
}

/// Execution result of a deploy: either success with its transfers, or
/// failure with the node's error message.
#[derive(Debug, Clone, Deserialize)]
pub enum ExecutionResult {
    Success {
        #[serde(default)]
        transfers: Vec<Transfer>,
    },
    Failure {
        error_message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionResultEntry {
    pub result: ExecutionResult,
}

/// Result payload of `info_get_deploy`.
///
/// `execution_results` is empty until the deploy has been executed in a
/// block - callers treat that the same as the deploy not being found
/// yet, and may retry later.
#[derive(Debug, Clone, Deserialize)]
pub struct GetDeployResult {
    pub deploy: Deploy,
    #[serde(default)]
    pub execution_results: Vec<ExecutionResultEntry>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// JSON-RPC client with primary/fallback endpoint selection.
#[derive(Debug, Clone)]
pub struct ChainRpcClient {
    http: reqwest::Client,
    primary_url: String,
    fallback_url: Option<String>,
}

impl ChainRpcClient {
    pub fn new(primary_url: String, fallback_url: Option<String>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| AppError::Rpc(format!("failed to build RPC client: {e}")))?;

        Ok(Self {
            http,
            primary_url,
            fallback_url,
        })
    }

    /// Fetch a deploy by hash.
    ///
    /// Returns `Ok(None)` when the node reports the deploy as unknown
    /// (it may simply not have been seen yet). Transport failures on the
    /// primary endpoint are retried once against the fallback.
    pub async fn get_deploy(&self, deploy_hash: &str) -> Result<Option<GetDeployResult>, AppError> {
        match self.get_deploy_from(&self.primary_url, deploy_hash).await {
            Ok(result) => Ok(result),
            Err(primary_err) => {
                let Some(fallback) = &self.fallback_url else {
                    return Err(primary_err);
                };
                tracing::warn!(
                    deploy_hash,
                    error = %primary_err,
                    "Primary RPC failed, retrying against fallback"
                );
                self.get_deploy_from(fallback, deploy_hash).await
            }
        }
    }

    async fn get_deploy_from(
        &self,
        url: &str,
        deploy_hash: &str,
    ) -> Result<Option<GetDeployResult>, AppError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "info_get_deploy",
            "params": { "deploy_hash": deploy_hash }
        });

        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Rpc(format!("request to {url} failed: {e}")))?;

        let body: RpcResponse<GetDeployResult> = response
            .json()
            .await
            .map_err(|e| AppError::Rpc(format!("invalid RPC response from {url}: {e}")))?;

        if let Some(err) = body.error {
            // -32602/-32000-class "no such deploy" errors mean not found,
            // not a transport problem
            if err.message.to_lowercase().contains("deploy") {
                return Ok(None);
            }
            return Err(AppError::Rpc(format!(
                "RPC error {} from {url}: {}",
                err.code, err.message
            )));
        }

        Ok(body.result)
    }
}
