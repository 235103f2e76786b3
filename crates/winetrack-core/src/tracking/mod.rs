//! Tracking backends: where runs, their params, metrics and artifacts go.

mod file;
mod rest;

pub use file::FileTrackingStore;
pub use rest::RestTrackingClient;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Result, WinetrackError};
use crate::models::{Experiment, Run, RunInfo, RunStatus};

/// Directory used when no tracking URI is configured.
pub const DEFAULT_TRACKING_DIR: &str = "mlruns";

/// Operations a training job needs from a tracking backend.
#[async_trait]
pub trait TrackingClient: Send + Sync {
    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>>;

    /// Returns the new experiment id.
    async fn create_experiment(&self, name: &str) -> Result<String>;

    /// Id of the experiment called `name`, creating it if needed.
    async fn create_or_get_experiment(&self, name: &str) -> Result<String> {
        match self.get_experiment_by_name(name).await? {
            Some(exp) => {
                if exp.lifecycle_stage == "deleted" {
                    warn!(experiment = %name, id = %exp.experiment_id, "Experiment is deleted; logging to it anyway");
                }
                Ok(exp.experiment_id)
            }
            None => {
                let id = self.create_experiment(name).await?;
                info!(experiment = %name, id = %id, "Created experiment");
                Ok(id)
            }
        }
    }

    async fn create_run(&self, experiment_id: &str) -> Result<RunInfo>;

    async fn get_run(&self, run_id: &str) -> Result<Run>;

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Logged at the current time, step 0.
    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()>;

    /// Store one file under `artifact_path` (or the artifact root).
    async fn log_artifact(&self, run_id: &str, local_file: &Path, artifact_path: Option<&str>) -> Result<()>;

    /// Store the contents of `local_dir`, recursively, under `artifact_path`.
    async fn log_artifacts(&self, run_id: &str, local_dir: &Path, artifact_path: Option<&str>) -> Result<()>;

    async fn set_terminated(&self, run_id: &str, status: RunStatus, end_time: i64) -> Result<()>;
}

/// Pick a backend for `tracking_uri`.
///
/// `http(s)://` goes to a tracking server, `file:` URIs and bare paths to a
/// local store, and no URI at all to `./mlruns`. A token only means something
/// to a tracking server; with a local store it is dropped with a warning.
pub fn connect(tracking_uri: Option<&str>, token: Option<&str>) -> Result<Box<dyn TrackingClient>> {
    let Some(uri) = tracking_uri.map(str::trim).filter(|u| !u.is_empty()) else {
        return local_store(PathBuf::from(DEFAULT_TRACKING_DIR), token);
    };

    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Box::new(RestTrackingClient::new(uri, token.map(str::to_string))?));
    }
    match local_path(uri) {
        Some(path) => local_store(path, token),
        None => Err(WinetrackError::UnsupportedUri(uri.to_string())),
    }
}

fn local_store(path: PathBuf, token: Option<&str>) -> Result<Box<dyn TrackingClient>> {
    if token_ignored(token) {
        warn!(store = %path.display(), "Tracking token ignored: local stores take no authentication");
    }
    Ok(Box::new(FileTrackingStore::new(path)?))
}

fn token_ignored(token: Option<&str>) -> bool {
    token.is_some_and(|t| !t.trim().is_empty())
}

/// Filesystem path for a `file:` URI or a plain path; `None` for other schemes.
pub(crate) fn local_path(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if let Some(rest) = uri.strip_prefix("file:") {
        return Some(PathBuf::from(rest));
    }
    match uri.split_once(':') {
        // A single letter before ':' is a Windows drive, not a scheme.
        Some((scheme, _)) if scheme.len() > 1 && is_scheme(scheme) => None,
        _ => Some(PathBuf::from(uri)),
    }
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// `root/<artifact_path>` with `/`-separated segments mapped onto the platform.
pub(crate) fn artifact_dir(root: &Path, artifact_path: Option<&str>) -> PathBuf {
    let mut dir = root.to_path_buf();
    if let Some(path) = artifact_path {
        dir.extend(path.split('/').filter(|s| !s.is_empty()));
    }
    dir
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
