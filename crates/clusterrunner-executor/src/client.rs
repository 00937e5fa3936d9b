//! reqwest-based client for the worker-to-manager direction of the wire
//! protocol: registration, heartbeats, state updates, and subjob-result
//! reporting. Mirrors `clusterrunner-manager`'s `ReqwestWorkerTransport` in
//! structure, signing every outbound request the same way.

use std::time::Duration;

use clusterrunner_wire::auth::{self, DIGEST_HEADER};
use clusterrunner_wire::dto::{ConnectWorkerDto, ConnectWorkerResponseDto, SubjobResultDto, WorkerStateDto, WorkerStateUpdateDto};
use serde::Serialize;

use crate::error::{ExecutorError, Result};

const TRACING_TARGET: &str = "clusterrunner_executor::client";

pub struct ManagerClient {
    client: reqwest::Client,
    manager_url: String,
    hmac_secret: String,
}

impl ManagerClient {
    pub fn new(manager_url: impl Into<String>, hmac_secret: impl Into<String>, rpc_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self {
            client,
            manager_url: manager_url.into(),
            hmac_secret: hmac_secret.into(),
        }
    }

    async fn signed_post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.manager_url);
        let payload = serde_json::to_vec(body)
            .map_err(|e| ExecutorError::manager(format!("failed to serialize request body: {e}")))?;
        let signature = auth::digest(&payload, &self.hmac_secret);

        self.client
            .post(&url)
            .header(DIGEST_HEADER, signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| ExecutorError::manager(format!("request to {url} failed: {e}")))
    }

    /// Registers this worker with the manager and returns the worker id
    /// the manager assigned (the manager, not the worker, is the
    /// authority on worker ids).
    pub async fn register(&self, worker_url: &str, num_executors: u32, session_id: &str) -> Result<u32> {
        let body = ConnectWorkerDto {
            worker_url: worker_url.to_string(),
            num_executors,
            session_id: session_id.to_string(),
        };
        let response = self.signed_post("/worker", &body).await?;
        if !response.status().is_success() {
            return Err(ExecutorError::manager(format!(
                "manager rejected registration with status {}",
                response.status()
            )));
        }
        let body: ConnectWorkerResponseDto = response
            .json()
            .await
            .map_err(|e| ExecutorError::manager(format!("malformed registration response: {e}")))?;
        tracing::info!(target: TRACING_TARGET, worker_id = body.worker_id, "Registered with manager");
        Ok(body.worker_id)
    }

    pub async fn heartbeat(&self, worker_id: u32) -> Result<()> {
        let path = format!("/worker/{worker_id}/heartbeat");
        let response = self.signed_post(&path, &serde_json::json!({})).await?;
        if !response.status().is_success() {
            return Err(ExecutorError::manager(format!(
                "manager rejected heartbeat with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn report_state(&self, worker_id: u32, state: WorkerStateDto, build_id: Option<u32>) -> Result<()> {
        let path = format!("/worker/{worker_id}/state");
        let body = WorkerStateUpdateDto { state, build_id };
        let response = self.signed_post(&path, &body).await?;
        if !response.status().is_success() {
            return Err(ExecutorError::manager(format!(
                "manager rejected state update with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn report_subjob_result(&self, build_id: u32, result: &SubjobResultDto) -> Result<()> {
        let path = format!("/build/{build_id}/subjob/{}/result", result.subjob_id);
        let response = self.signed_post(&path, result).await?;
        if !response.status().is_success() {
            return Err(ExecutorError::manager(format!(
                "manager rejected subjob {} result with status {}",
                result.subjob_id,
                response.status()
            )));
        }
        Ok(())
    }
}
