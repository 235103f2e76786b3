//! Client for a tracking server's REST API (`/api/2.0/mlflow/...`).

use std::path::Path;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{artifact_dir, local_path, now_millis, TrackingClient};
use crate::error::{Result, WinetrackError};
use crate::models::{Experiment, Run, RunInfo, RunStatus};
use crate::storage;

const NOT_FOUND_CODE: &str = "RESOURCE_DOES_NOT_EXIST";
const ARTIFACT_SCHEME: &str = "mlflow-artifacts:";

#[derive(Debug, Deserialize, Default)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ExperimentResponse {
    experiment: Experiment,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunResponse {
    run: Run,
}

/// Where a run's artifacts are stored.
#[derive(Debug, PartialEq)]
enum ArtifactTarget {
    /// Proxied through the server, relative to `/api/2.0/mlflow-artifacts/artifacts/`.
    Proxied(String),
    Local(std::path::PathBuf),
}

impl ArtifactTarget {
    fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix(ARTIFACT_SCHEME) {
            // `mlflow-artifacts://host:port/path` carries an authority; the path follows it.
            let path = match rest.strip_prefix("//") {
                Some(with_host) => with_host.split_once('/').map_or("", |(_, p)| p),
                None => rest,
            };
            return Ok(ArtifactTarget::Proxied(path.trim_matches('/').to_string()));
        }
        local_path(uri)
            .map(ArtifactTarget::Local)
            .ok_or_else(|| WinetrackError::UnsupportedUri(uri.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct RestTrackingClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RestTrackingClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("winetrack/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        debug!(path, "GET");
        let response = self
            .authorized(self.client.get(self.endpoint(path)).query(query))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        debug!(path, "POST");
        let response = self
            .authorized(self.client.post(self.endpoint(path)).json(body))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn artifact_target(&self, run_id: &str) -> Result<ArtifactTarget> {
        let run = self.get_run(run_id).await?;
        let uri = run.info.artifact_uri.ok_or_else(|| {
            WinetrackError::Other(format!("Run {run_id} has no artifact URI"))
        })?;
        ArtifactTarget::parse(&uri)
    }

    async fn upload(&self, repo_path: &str, relative: &str, local_file: &Path) -> Result<()> {
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}",
            self.base_url,
            [repo_path, relative]
                .iter()
                .filter(|s| !s.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join("/")
        );
        let body = tokio::fs::read(local_file).await?;
        debug!(url = %url, bytes = body.len(), "PUT artifact");
        let response = self.authorized(self.client.put(&url).body(body)).send().await?;
        check(response).await?;
        Ok(())
    }
}

/// Turn a non-2xx response into [`WinetrackError::Tracking`].
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let err: ApiError = serde_json::from_str(&body).unwrap_or_default();
    Err(WinetrackError::Tracking {
        status: status.as_u16(),
        code: err.error_code,
        message: if err.message.is_empty() { body } else { err.message },
    })
}

/// JSON has no NaN or infinity; the tracking server accepts these spellings instead.
fn metric_value(value: f64) -> Value {
    if value.is_nan() {
        Value::from("NaN")
    } else if value.is_infinite() {
        Value::from(if value > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        Value::from(value)
    }
}

fn join_artifact_path(prefix: Option<&str>, name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}/{name}"),
        None => name.to_string(),
    }
}

#[async_trait]
impl TrackingClient for RestTrackingClient {
    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        match self
            .get::<ExperimentResponse>("experiments/get-by-name", &[("experiment_name", name)])
            .await
        {
            Ok(resp) => Ok(Some(resp.experiment)),
            Err(WinetrackError::Tracking { status: 404, .. }) => Ok(None),
            Err(WinetrackError::Tracking { code, .. }) if code == NOT_FOUND_CODE => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_experiment(&self, name: &str) -> Result<String> {
        let resp: CreateExperimentResponse = self.post("experiments/create", &json!({ "name": name })).await?;
        Ok(resp.experiment_id)
    }

    async fn create_run(&self, experiment_id: &str) -> Result<RunInfo> {
        let resp: RunResponse = self
            .post(
                "runs/create",
                &json!({ "experiment_id": experiment_id, "start_time": now_millis() }),
            )
            .await?;
        Ok(resp.run.info)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        let resp: RunResponse = self.get("runs/get", &[("run_id", run_id)]).await?;
        Ok(resp.run)
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: IgnoredAny = self
            .post("runs/set-tag", &json!({ "run_id": run_id, "key": key, "value": value }))
            .await?;
        Ok(())
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: IgnoredAny = self
            .post(
                "runs/log-parameter",
                &json!({ "run_id": run_id, "key": key, "value": value }),
            )
            .await?;
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let _: IgnoredAny = self
            .post(
                "runs/log-metric",
                &json!({
                    "run_id": run_id,
                    "key": key,
                    "value": metric_value(value),
                    "timestamp": now_millis(),
                    "step": 0,
                }),
            )
            .await?;
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, local_file: &Path, artifact_path: Option<&str>) -> Result<()> {
        let name = local_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WinetrackError::Other(format!("Not a file path: {}", local_file.display())))?;

        match self.artifact_target(run_id).await? {
            ArtifactTarget::Proxied(repo) => {
                self.upload(&repo, &join_artifact_path(artifact_path, name), local_file)
                    .await?
            }
            ArtifactTarget::Local(root) => {
                storage::copy_file_into(local_file, &artifact_dir(&root, artifact_path))?;
            }
        }
        info!(run_id, artifact = %join_artifact_path(artifact_path, name), "Logged artifact");
        Ok(())
    }

    async fn log_artifacts(&self, run_id: &str, local_dir: &Path, artifact_path: Option<&str>) -> Result<()> {
        let count = match self.artifact_target(run_id).await? {
            ArtifactTarget::Proxied(repo) => {
                let files = storage::list_files(local_dir)?;
                for file in &files {
                    let local = local_dir.join(&file.path);
                    self.upload(&repo, &join_artifact_path(artifact_path, &file.path), &local)
                        .await?;
                }
                files.len()
            }
            ArtifactTarget::Local(root) => {
                storage::copy_dir_contents(local_dir, &artifact_dir(&root, artifact_path))?
            }
        };
        info!(run_id, files = count, path = artifact_path.unwrap_or(""), "Logged artifacts");
        Ok(())
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus, end_time: i64) -> Result<()> {
        let _: IgnoredAny = self
            .post(
                "runs/update",
                &json!({ "run_id": run_id, "status": status, "end_time": end_time }),
            )
            .await?;
        Ok(())
    }
}
