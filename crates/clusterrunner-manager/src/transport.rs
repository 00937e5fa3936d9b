//! reqwest-based `WorkerTransport`: the manager's HTTP client for the
//! manager<->worker wire protocol, with every request HMAC-signed.

use std::sync::Arc;
use std::time::Duration;

use clusterrunner_core::error::{Error, Result};
use clusterrunner_core::subjob::Subjob;
use clusterrunner_core::worker::{BuildId, WorkerTransport};
use clusterrunner_wire::auth::{self, DIGEST_HEADER};
use clusterrunner_wire::dto::{IsAliveDto, SetupBuildDto, StartSubjobDto, TeardownBuildDto};
use serde::Serialize;

const TRACING_TARGET: &str = "clusterrunner_manager::transport";

/// The manager's HTTP client for talking to worker processes, implementing
/// [`WorkerTransport`] over the endpoints a `clusterrunner-executor` process
/// exposes.
pub struct ReqwestWorkerTransport {
    client: reqwest::Client,
    hmac_secret: Arc<str>,
}

impl ReqwestWorkerTransport {
    pub fn new(hmac_secret: impl Into<Arc<str>>, rpc_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self {
            client,
            hmac_secret: hmac_secret.into(),
        }
    }

    async fn signed_post<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response> {
        let payload = serde_json::to_vec(body).map_err(|e| {
            Error::internal("failed to serialize request body").with_source(Box::new(e))
        })?;
        let signature = auth::digest(&payload, &self.hmac_secret);

        self.client
            .post(url)
            .header(DIGEST_HEADER, signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                Error::worker_communication(format!("request to {url} failed"))
                    .with_source(Box::new(e))
            })
    }
}

impl WorkerTransport for ReqwestWorkerTransport {
    async fn setup(
        &self,
        url: &str,
        build_id: BuildId,
        project_directory: &str,
        setup_build: Option<&str>,
        executor_start_index: u32,
    ) -> Result<bool> {
        let endpoint = format!("{url}/v1/build/{build_id}/setup");
        let body = SetupBuildDto {
            build_id,
            project_directory: project_directory.to_string(),
            setup_build: setup_build.map(str::to_string),
            executor_start_index,
        };
        let response = self.signed_post(&endpoint, &body).await?;
        Ok(response.status().is_success())
    }

    async fn teardown(&self, url: &str, build_id: BuildId, teardown_build: Option<&str>) -> Result<()> {
        let endpoint = format!("{url}/v1/build/{build_id}/teardown");
        let body = TeardownBuildDto {
            build_id,
            teardown_build: teardown_build.map(str::to_string),
        };
        let response = self.signed_post(&endpoint, &body).await?;
        if !response.status().is_success() {
            return Err(Error::worker_communication(format!(
                "worker at {url} rejected teardown for build {build_id} with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn start_subjob(&self, url: &str, subjob: &Subjob, job_command: &str, base_executor_index: u32) -> Result<()> {
        let endpoint = format!(
            "{url}/v1/build/{}/subjob/{}",
            subjob.build_id, subjob.subjob_id
        );
        let body = StartSubjobDto {
            build_id: subjob.build_id,
            subjob_id: subjob.subjob_id,
            atomic_commands: subjob.atomic_commands(job_command),
            base_executor_index,
        };
        let response = self.signed_post(&endpoint, &body).await?;
        if !response.status().is_success() {
            return Err(Error::worker_communication(format!(
                "worker at {url} rejected subjob {} with status {}",
                subjob.subjob_id,
                response.status()
            )));
        }
        Ok(())
    }

    async fn is_alive(&self, url: &str, expected_session_id: &str) -> Result<bool> {
        let endpoint = format!("{url}/v1");
        let response = self.client.get(&endpoint).send().await.map_err(|e| {
            Error::worker_communication(format!("liveness probe of {url} failed"))
                .with_source(Box::new(e))
        })?;

        if !response.status().is_success() {
            return Ok(false);
        }
        let body: IsAliveDto = response.json().await.map_err(|e| {
            Error::worker_communication("malformed liveness response").with_source(Box::new(e))
        })?;
        Ok(body.session_id == expected_session_id)
    }

    async fn kill(&self, url: &str) {
        let endpoint = format!("{url}/v1/kill");
        if let Err(err) = self.signed_post(&endpoint, &serde_json::json!({})).await {
            tracing::warn!(
                target: TRACING_TARGET,
                url = %url,
                error = %err,
                "Best-effort kill RPC failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::State;
    use axum::routing::get;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::TcpListener;

    async fn is_alive_handler(State(session_id): State<Arc<str>>) -> Json<IsAliveDto> {
        Json(IsAliveDto {
            session_id: session_id.to_string(),
        })
    }

    async fn spawn_fake_worker(session_id: &str) -> String {
        let session_id: Arc<str> = session_id.into();
        let app = axum::Router::new()
            .route("/v1", get(is_alive_handler))
            .with_state(session_id);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn is_alive_matches_expected_session_id() {
        let url = spawn_fake_worker("session-a").await;
        let transport = ReqwestWorkerTransport::new("secret", Duration::from_secs(5));

        assert!(transport.is_alive(&url, "session-a").await.unwrap());
        assert!(!transport.is_alive(&url, "session-b").await.unwrap());
    }

    #[tokio::test]
    async fn kill_never_panics_against_an_unreachable_worker() {
        let transport = ReqwestWorkerTransport::new("secret", Duration::from_millis(50));
        transport.kill("http://127.0.0.1:1").await;
    }

    #[tokio::test]
    async fn setup_signs_the_request_body() {
        let received_digest = Arc::new(AtomicBool::new(false));
        let flag = received_digest.clone();

        let app = axum::Router::new().route(
            "/v1/build/1/setup",
            axum::routing::post(move |headers: axum::http::HeaderMap| {
                let flag = flag.clone();
                async move {
                    if headers.get(DIGEST_HEADER).is_some() {
                        flag.store(true, Ordering::SeqCst);
                    }
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = ReqwestWorkerTransport::new("secret", Duration::from_secs(5));
        let accepted = transport
            .setup(&format!("http://{addr}"), 1, "/repo", None, 0)
            .await
            .unwrap();

        assert!(accepted);
        assert!(received_digest.load(Ordering::SeqCst));
    }
}
