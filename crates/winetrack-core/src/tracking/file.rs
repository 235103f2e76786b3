//! Local directory-per-run tracking store.
//!
//! ```text
//! <root>/<experiment id>/experiment.yaml
//! <root>/<experiment id>/<run id>/run.yaml
//! <root>/<experiment id>/<run id>/params.yaml
//! <root>/<experiment id>/<run id>/tags.yaml
//! <root>/<experiment id>/<run id>/metrics.parquet
//! <root>/<experiment id>/<run id>/artifacts/
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{artifact_dir, now_millis, TrackingClient};
use crate::error::{Result, WinetrackError};
use crate::models::{Experiment, Param, Run, RunData, RunInfo, RunStatus, RunTag};
use crate::storage::{self, ArtifactInfo};

const EXPERIMENT_FILE: &str = "experiment.yaml";
const RUN_FILE: &str = "run.yaml";
const PARAMS_FILE: &str = "params.yaml";
const TAGS_FILE: &str = "tags.yaml";
const METRICS_FILE: &str = "metrics.parquet";
const ARTIFACTS_DIR: &str = "artifacts";

type KeyValues = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct FileTrackingStore {
    root: PathBuf,
}

impl FileTrackingStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        storage::ensure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments = vec![];
        for id in storage::list_subdirs(&self.root)? {
            let path = self.root.join(&id).join(EXPERIMENT_FILE);
            if path.exists() {
                experiments.push(storage::read_yaml::<Experiment>(&path)?);
            }
        }
        Ok(experiments)
    }

    pub fn list_runs(&self, experiment_id: &str) -> Result<Vec<RunInfo>> {
        let exp_dir = self.experiment_dir(experiment_id)?;
        let mut runs = vec![];
        for name in storage::list_subdirs(&exp_dir)? {
            let path = exp_dir.join(&name).join(RUN_FILE);
            if path.exists() {
                runs.push(storage::read_yaml::<RunInfo>(&path)?);
            }
        }
        runs.sort_by_key(|r| r.start_time);
        Ok(runs)
    }

    /// Every artifact file of a run, with paths relative to its artifact root.
    pub fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactInfo>> {
        storage::list_files(&self.run_dir(run_id)?.join(ARTIFACTS_DIR))
    }

    fn experiment_dir(&self, experiment_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(experiment_id);
        if !dir.join(EXPERIMENT_FILE).exists() {
            return Err(WinetrackError::ExperimentNotFound(experiment_id.to_string()));
        }
        Ok(dir)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        for exp_id in storage::list_subdirs(&self.root)? {
            let dir = self.root.join(exp_id).join(run_id);
            if dir.join(RUN_FILE).exists() {
                return Ok(dir);
            }
        }
        Err(WinetrackError::RunNotFound(run_id.to_string()))
    }

    fn next_experiment_id(&self) -> Result<String> {
        let max = storage::list_subdirs(&self.root)?
            .iter()
            .filter_map(|name| name.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok((max + 1).to_string())
    }

    fn update_key_values(&self, run_id: &str, file: &str, key: &str, value: &str, write_once: bool) -> Result<()> {
        let path = self.run_dir(run_id)?.join(file);
        let mut values: KeyValues = storage::load_yaml(&path)?;
        if write_once {
            if let Some(existing) = values.get(key).filter(|v| v.as_str() != value) {
                return Err(WinetrackError::InvalidParam(format!(
                    "Param '{key}' already logged as '{existing}', refusing '{value}'"
                )));
            }
        }
        values.insert(key.to_string(), value.to_string());
        storage::save_yaml(&path, &values)
    }
}

#[async_trait]
impl TrackingClient for FileTrackingStore {
    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        Ok(self.list_experiments()?.into_iter().find(|e| e.name == name))
    }

    async fn create_experiment(&self, name: &str) -> Result<String> {
        if self.get_experiment_by_name(name).await?.is_some() {
            return Err(WinetrackError::InvalidParam(format!(
                "Experiment '{name}' already exists"
            )));
        }
        let id = self.next_experiment_id()?;
        let dir = self.root.join(&id);
        storage::ensure_dir(&dir)?;
        let experiment = Experiment {
            experiment_id: id.clone(),
            name: name.to_string(),
            artifact_location: Some(dir.display().to_string()),
            lifecycle_stage: "active".to_string(),
            creation_time: Some(now_millis()),
        };
        storage::save_yaml(&dir.join(EXPERIMENT_FILE), &experiment)?;
        Ok(id)
    }

    async fn create_run(&self, experiment_id: &str) -> Result<RunInfo> {
        let exp_dir = self.experiment_dir(experiment_id)?;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_dir = exp_dir.join(&run_id);
        let artifacts = run_dir.join(ARTIFACTS_DIR);
        storage::ensure_dir(&artifacts)?;

        let info = RunInfo {
            run_id,
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            start_time: Some(now_millis()),
            end_time: None,
            artifact_uri: Some(artifacts.display().to_string()),
            lifecycle_stage: "active".to_string(),
        };
        storage::save_yaml(&run_dir.join(RUN_FILE), &info)?;
        debug!(run_id = %info.run_id, dir = %run_dir.display(), "Created run");
        Ok(info)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        let dir = self.run_dir(run_id)?;
        let info: RunInfo = storage::read_yaml(&dir.join(RUN_FILE))?;
        let params: KeyValues = storage::load_yaml(&dir.join(PARAMS_FILE))?;
        let tags: KeyValues = storage::load_yaml(&dir.join(TAGS_FILE))?;

        Ok(Run {
            info,
            data: RunData {
                metrics: storage::read_metrics(&dir.join(METRICS_FILE))?,
                params: params.into_iter().map(|(key, value)| Param { key, value }).collect(),
                tags: tags.into_iter().map(|(key, value)| RunTag { key, value }).collect(),
            },
        })
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.update_key_values(run_id, TAGS_FILE, key, value, false)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.update_key_values(run_id, PARAMS_FILE, key, value, true)
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let metric = crate::models::Metric {
            key: key.to_string(),
            value,
            timestamp: now_millis(),
            step: 0,
        };
        storage::append_metrics(&self.run_dir(run_id)?.join(METRICS_FILE), &[metric])
    }

    async fn log_artifact(&self, run_id: &str, local_file: &Path, artifact_path: Option<&str>) -> Result<()> {
        let dest = artifact_dir(&self.run_dir(run_id)?.join(ARTIFACTS_DIR), artifact_path);
        storage::copy_file_into(local_file, &dest)?;
        Ok(())
    }

    async fn log_artifacts(&self, run_id: &str, local_dir: &Path, artifact_path: Option<&str>) -> Result<()> {
        let dest = artifact_dir(&self.run_dir(run_id)?.join(ARTIFACTS_DIR), artifact_path);
        let copied = storage::copy_dir_contents(local_dir, &dest)?;
        debug!(run_id, files = copied, dest = %dest.display(), "Copied artifacts");
        Ok(())
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus, end_time: i64) -> Result<()> {
        let path = self.run_dir(run_id)?.join(RUN_FILE);
        let mut info: RunInfo = storage::read_yaml(&path)?;
        info.status = status;
        info.end_time = Some(end_time);
        storage::save_yaml(&path, &info)
    }
}
