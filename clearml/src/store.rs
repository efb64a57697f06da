//! Narrow interfaces over the experiment-tracking platform.
//!
//! Only the lookups and mutations the transfer workflow actually performs are exposed, so
//! the exporter and importer can run against the [REST backend](crate::rest::RestPlatform)
//! or the [in-memory backend](crate::memory::InMemoryPlatform) interchangeably.

use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque identifier assigned by the platform to a task, model or dataset.
pub type EntityId = String;

/// A model declared on a task, either consumed or produced by it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    /// Name of the model slot on the task, e.g. `best_model`.
    pub name: String,
    /// Id of the model registered in that slot.
    pub model: EntityId,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskModels {
    #[serde(default)]
    pub input: Vec<ModelRef>,
    #[serde(default)]
    pub output: Vec<ModelRef>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub version_num: String,
    #[serde(default)]
    pub entry_point: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub requirements: Option<serde_json::Value>,
}

/// A named configuration object attached to a task. The value is kept as the raw text the
/// platform stores; interpreting it is up to the caller.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationItem {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamItem {
    pub section: String,
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub description: String,
}

/// Portable description of a task. This is what gets persisted under `tasks/<task_id>` on
/// export and re-submitted on import, so it carries project *names* rather than ids.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDescription {
    pub id: EntityId,
    pub name: String,
    pub project: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub script: Option<Script>,
    #[serde(default)]
    pub hyperparams: BTreeMap<String, BTreeMap<String, ParamItem>>,
    #[serde(default)]
    pub configuration: BTreeMap<String, ConfigurationItem>,
    #[serde(default)]
    pub models: TaskModels,
    /// Ids of the datasets the task consumed.
    #[serde(default)]
    pub datasets: Vec<EntityId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelRecord {
    pub id: EntityId,
    pub name: String,
    /// Download location of the model weights.
    pub url: String,
    /// Task that produced the model, if the platform knows it.
    pub task: Option<EntityId>,
    pub project: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatasetRecord {
    pub id: EntityId,
    pub name: String,
    /// Top-level project the dataset lives in.
    pub project: String,
    pub is_final: bool,
}

/// Result of attaching weights to a task as an output model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadedModel {
    pub id: EntityId,
    pub url: String,
}

/// Task statuses after which a dataset's contents are immutable.
pub const FINAL_STATUSES: [&str; 3] = ["completed", "published", "closed"];

pub fn is_final_status(status: &str) -> bool {
    FINAL_STATUSES.contains(&status)
}

/// Dataset projects are stored as `<project>/.datasets/<name>`; the transfer only keeps the
/// top-level segment.
pub fn top_level_project(project: &str) -> String {
    project.split('/').next().unwrap_or_default().trim().to_owned()
}

#[async_trait]
pub trait TaskStore {
    async fn get_task(&self, id: &str) -> anyhow::Result<TaskDescription>;

    /// Raw text of the task's configuration object `name`, if present.
    async fn get_configuration(&self, id: &str, name: &str) -> anyhow::Result<Option<String>>;

    /// Submit a task description as a brand-new task. The `id` of the description is ignored;
    /// the freshly assigned id is returned. Never deduplicates.
    async fn import_task(&self, task: &TaskDescription) -> anyhow::Result<EntityId>;

    /// Write back the editable parts of an existing task, including its dataset references.
    async fn update_task(&self, task: &TaskDescription) -> anyhow::Result<()>;

    /// Register a run of this tool as an application task.
    async fn create_run_task(&self, project: &str, name: &str) -> anyhow::Result<EntityId>;
}

#[async_trait]
pub trait ModelStore {
    async fn get_model(&self, id: &str) -> anyhow::Result<ModelRecord>;

    async fn download_model(&self, url: &str) -> anyhow::Result<Bytes>;

    /// Upload `weights` under `target_filename` below `upload_uri`, register the result as a
    /// model and attach it to `task_id` as an output model.
    async fn upload_output_model(
        &self,
        task_id: &str,
        weights: &Path,
        target_filename: &str,
        upload_uri: &str,
    ) -> anyhow::Result<UploadedModel>;
}

#[async_trait]
pub trait DatasetStore {
    async fn get_dataset(&self, id: &str) -> anyhow::Result<DatasetRecord>;

    async fn finalize_dataset(&self, id: &str) -> anyhow::Result<()>;

    /// Materialize the full contents of a finalized dataset under `target`.
    async fn download_dataset(&self, id: &str, target: &Path) -> anyhow::Result<()>;

    async fn create_dataset(&self, project: &str, name: &str) -> anyhow::Result<EntityId>;

    /// Register every file below `path` as content of the dataset. Returns the number of
    /// files registered.
    async fn add_files(&self, id: &str, path: &Path) -> anyhow::Result<usize>;

    /// Upload all content registered through [DatasetStore::add_files].
    async fn upload_dataset(&self, id: &str) -> anyhow::Result<()>;
}

/// Everything the transfer workflow needs from the platform.
pub trait Platform: TaskStore + ModelStore + DatasetStore + Send + Sync {}

impl<T> Platform for T where T: TaskStore + ModelStore + DatasetStore + Send + Sync {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn task_description_serde() {
        let task = serde_json::from_str::<TaskDescription>(
            r#"
            {
                "id": "aa11",
                "name": "train mnist",
                "project": "vision",
                "type": "training",
                "models": {"output": [{"name": "best", "model": "m1"}]},
                "datasets": ["d1", "d2"]
            }
        "#,
        )
        .unwrap();

        assert_eq!(task.task_type, "training");
        assert!(task.models.input.is_empty());
        assert_eq!(
            task.models.output,
            vec![ModelRef {
                name: "best".to_owned(),
                model: "m1".to_owned()
            }]
        );
        assert_eq!(task.datasets, vec!["d1", "d2"]);
        assert!(task.configuration.is_empty());
    }

    #[test]
    pub fn project_segment() {
        assert_eq!(top_level_project("mnist /.datasets/digits"), "mnist");
        assert_eq!(top_level_project("plain"), "plain");
        assert_eq!(top_level_project(""), "");
    }

    #[test]
    pub fn final_statuses() {
        assert!(is_final_status("completed"));
        assert!(is_final_status("published"));
        assert!(!is_final_status("in_progress"));
        assert!(!is_final_status("created"));
    }
}
