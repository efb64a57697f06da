//! Development side: serving endpoints → models → training tasks → datasets.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context, Result};
use clearml::{DatasetStore, EntityId, ModelStore, TaskStore};
use log::info;
use serde::Deserialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{
    error::ManifestError,
    layout::{Layout, DEPLOY_MANIFEST},
    manifest::{self, add_to_manifest, DatasetDetails, DeployManifest, ModelEntry, TaskSummary},
};

/// Serving service exported when none is given on the command line.
pub const DEFAULT_SERVING_ID: &str = "cd423197c94344c4b1d41a5cd2408770";

/// Name of the serving service's configuration object listing its endpoints.
pub const ENDPOINTS_CONFIGURATION: &str = "endpoints";

/// Which tasks get their datasets exported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DatasetScope {
    /// Only the datasets of the first exported task.
    #[default]
    FirstTask,
    /// The datasets of every exported task.
    AllTasks,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub serving_id: EntityId,
    pub developer: String,
    pub scope: DatasetScope,
    /// Folder receiving `deploy.json`, `models/`, `tasks/` and `datasets/`.
    pub root: PathBuf,
}

#[derive(Deserialize, Debug)]
struct EndpointConfig {
    #[serde(default)]
    model_id: Option<String>,
}

/// Distinct model ids referenced by the endpoints configuration, in the order the endpoints
/// are listed.
fn endpoint_model_ids(serving_id: &str, raw: &str) -> Result<Vec<EntityId>, ManifestError> {
    let malformed = |e: serde_json::Error| ManifestError::MalformedEndpoints {
        serving_id: serving_id.to_owned(),
        reason: e.to_string(),
    };
    let endpoints: Map<String, Value> = serde_json::from_str(raw).map_err(malformed)?;

    let mut ids = Vec::new();
    for (endpoint, config) in endpoints {
        let config: EndpointConfig = serde_json::from_value(config).map_err(malformed)?;
        let id = config
            .model_id
            .filter(|id| !id.is_empty())
            .ok_or(ManifestError::MissingEndpointModel { endpoint })?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Download the weights of every model served by `serving_id` to `models/<model_id>.pt`.
pub async fn export_models<P>(
    platform: &P,
    layout: &Layout,
    serving_id: &str,
) -> Result<Vec<ModelEntry>>
where
    P: TaskStore + ModelStore + ?Sized,
{
    let endpoints = platform
        .get_configuration(serving_id, ENDPOINTS_CONFIGURATION)
        .await
        .with_context(|| format!("failed to look up serving service {}", serving_id))?
        .ok_or_else(|| ManifestError::NoEndpoints {
            serving_id: serving_id.to_owned(),
        })?;
    let model_ids = endpoint_model_ids(serving_id, &endpoints)?;
    info!("Serving service {} deploys models {:?}", serving_id, &model_ids);

    tokio::fs::create_dir_all(&layout.models)
        .await
        .with_context(|| format!("failed to create {}", layout.models.display()))?;

    let mut models = Vec::with_capacity(model_ids.len());
    for model_id in model_ids {
        let record = platform.get_model(&model_id).await?;
        let weights = platform
            .download_model(&record.url)
            .await
            .with_context(|| format!("failed to download model {}", &model_id))?;

        let path = layout.model_path(&model_id);
        tokio::fs::write(&path, &weights)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(
            "Saved model {} ({} bytes) to {}",
            &model_id,
            weights.len(),
            path.display()
        );

        models.push(ModelEntry {
            id: model_id,
            url: record.url,
        });
    }

    Ok(models)
}

/// Persist the task that produced each model under `tasks/<task_id>` and summarize its
/// declared outputs and dataset inputs.
pub async fn export_experiment_tasks<P>(
    platform: &P,
    layout: &Layout,
    models: &[ModelEntry],
) -> Result<Vec<TaskSummary>>
where
    P: TaskStore + ModelStore + ?Sized,
{
    tokio::fs::create_dir_all(&layout.tasks)
        .await
        .with_context(|| format!("failed to create {}", layout.tasks.display()))?;

    let mut summaries: Vec<TaskSummary> = Vec::new();
    for model in models {
        let record = platform.get_model(&model.id).await?;
        let task_id = record
            .task
            .with_context(|| format!("model {} has no originating task", &model.id))?;
        if summaries.iter().any(|s| s.id == task_id) {
            continue;
        }

        let task = platform.get_task(&task_id).await?;
        let path = layout.task_path(&task_id);
        let raw = serde_json::to_vec_pretty(&task)?;
        tokio::fs::write(&path, raw)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(
            "Exported task {} ({} output models, datasets {:?})",
            &task_id,
            task.models.output.len(),
            &task.datasets
        );

        summaries.push(TaskSummary {
            id: task_id,
            models: task.models.output,
            datasets: task.datasets,
        });
    }

    Ok(summaries)
}

/// Copy the contents of the datasets used by the tasks to `datasets/<dataset_id>/`,
/// finalizing any dataset that is still mutable.
pub async fn export_datasets<P>(
    platform: &P,
    layout: &Layout,
    task_ids: &[EntityId],
    scope: DatasetScope,
) -> Result<BTreeMap<EntityId, DatasetDetails>>
where
    P: TaskStore + DatasetStore + ?Sized,
{
    let task_ids = match scope {
        DatasetScope::FirstTask => &task_ids[..task_ids.len().min(1)],
        DatasetScope::AllTasks => task_ids,
    };

    let mut datasets = BTreeMap::new();
    for task_id in task_ids {
        let task = platform.get_task(task_id).await?;
        info!("Datasets {:?} used in task {}", &task.datasets, task_id);

        for dataset_id in &task.datasets {
            if datasets.contains_key(dataset_id) {
                continue;
            }

            let dataset = platform.get_dataset(dataset_id).await?;
            info!(
                "Dataset project {}, name {}, id {}",
                &dataset.project, &dataset.name, dataset_id
            );
            if !dataset.is_final {
                platform.finalize_dataset(dataset_id).await?;
            }

            let dest = layout.dataset_dir(dataset_id);
            platform
                .download_dataset(dataset_id, &dest)
                .await
                .with_context(|| format!("failed to copy dataset {}", dataset_id))?;

            add_to_manifest(
                &mut datasets,
                dataset_id.clone(),
                DatasetDetails {
                    name: dataset.name,
                    project: dataset.project,
                },
            );
        }
    }

    Ok(datasets)
}

/// Run the whole export and write `deploy.json` into `options.root`.
pub async fn export_from_development<P>(
    platform: &P,
    options: &ExportOptions,
) -> Result<DeployManifest>
where
    P: TaskStore + ModelStore + DatasetStore + ?Sized,
{
    let layout = Layout::under(&options.root);
    let exported_on = OffsetDateTime::now_utc();

    let models = export_models(platform, &layout, &options.serving_id).await?;
    let tasks = export_experiment_tasks(platform, &layout, &models).await?;
    let task_ids: Vec<EntityId> = tasks.iter().map(|t| t.id.clone()).collect();
    let datasets = export_datasets(platform, &layout, &task_ids, options.scope).await?;

    let deploy = DeployManifest {
        developer: options.developer.clone(),
        exported_on,
        serving_id: options.serving_id.clone(),
        models,
        tasks,
        datasets,
    };
    manifest::save(&options.root.join(DEPLOY_MANIFEST), &deploy).await?;

    Ok(deploy)
}

#[cfg(test)]
mod test {
    use std::fs;

    use clearml::{InMemoryPlatform, ModelRef, TaskDescription};

    use super::*;
    use crate::fixtures;

    #[test]
    pub fn endpoint_ids_are_distinct() {
        let raw = r#"{
            "mnist_a": {"engine_type": "triton", "serving_url": "mnist_a", "model_id": "m1"},
            "mnist_b": {"engine_type": "triton", "serving_url": "mnist_b", "model_id": "m2"},
            "mnist_c": {"engine_type": "triton", "serving_url": "mnist_c", "model_id": "m1"}
        }"#;
        assert_eq!(endpoint_model_ids("s", raw).unwrap(), vec!["m1", "m2"]);
    }

    #[test]
    pub fn endpoint_ids_follow_configuration_order() {
        let raw = r#"{"zeta": {"model_id": "mz"}, "alpha": {"model_id": "ma"}}"#;
        assert_eq!(endpoint_model_ids("s", raw).unwrap(), vec!["mz", "ma"]);
    }

    #[test]
    pub fn endpoint_without_model_is_rejected() {
        let raw = r#"{"broken": {"engine_type": "custom"}}"#;
        assert_eq!(
            endpoint_model_ids("s", raw).unwrap_err(),
            ManifestError::MissingEndpointModel {
                endpoint: "broken".to_owned()
            }
        );
        assert!(matches!(
            endpoint_model_ids("s", "[1, 2]").unwrap_err(),
            ManifestError::MalformedEndpoints { .. }
        ));
        assert!(matches!(
            endpoint_model_ids("s", r#"{"broken": "m1"}"#).unwrap_err(),
            ManifestError::MalformedEndpoints { .. }
        ));
    }

    #[tokio::test]
    async fn export_models_writes_one_file_per_distinct_model() {
        let platform = InMemoryPlatform::new();
        fixtures::serving(
            &platform,
            "serving",
            &[("a", "m1"), ("b", "m2"), ("c", "m1")],
        );
        fixtures::model(&platform, "m1", "t1", b"weights-1");
        fixtures::model(&platform, "m2", "t1", b"weights-2");
        let dir = tempdir::TempDir::new("export_models").unwrap();
        let layout = Layout::under(dir.path());

        let models = export_models(&platform, &layout, "serving").await.unwrap();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "m1");
        assert_eq!(models[0].url, fixtures::model_url("m1"));
        assert_eq!(fs::read_dir(&layout.models).unwrap().count(), 2);
        assert_eq!(fs::read(layout.model_path("m1")).unwrap(), b"weights-1");
        assert_eq!(fs::read(layout.model_path("m2")).unwrap(), b"weights-2");
    }

    #[tokio::test]
    async fn export_models_fails_for_unknown_serving_service() {
        let platform = InMemoryPlatform::new();
        let dir = tempdir::TempDir::new("export_unknown").unwrap();

        let err = export_models(&platform, &Layout::under(dir.path()), "nope")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("serving service nope"));
    }

    #[tokio::test]
    async fn export_models_fails_when_download_fails() {
        let platform = InMemoryPlatform::new();
        fixtures::serving(&platform, "serving", &[("a", "m1")]);
        fixtures::model(&platform, "m1", "t1", b"w");
        platform.remove_blob(&fixtures::model_url("m1"));
        let dir = tempdir::TempDir::new("export_404").unwrap();

        let err = export_models(&platform, &Layout::under(dir.path()), "serving")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to download model m1"));
    }

    #[tokio::test]
    async fn export_models_fails_for_unknown_model() {
        let platform = InMemoryPlatform::new();
        fixtures::serving(&platform, "serving", &[("a", "m404")]);
        let dir = tempdir::TempDir::new("export_unknown_model").unwrap();

        let err = export_models(&platform, &Layout::under(dir.path()), "serving")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model m404 not found"));
    }

    #[tokio::test]
    async fn export_tasks_records_all_outputs_and_datasets() {
        let platform = InMemoryPlatform::new();
        fixtures::model(&platform, "m1", "t1", b"w");
        fixtures::model(&platform, "m2", "t1", b"w");
        platform.add_task(TaskDescription {
            models: clearml::store::TaskModels {
                input: vec![],
                output: vec![
                    ModelRef {
                        name: "best".to_owned(),
                        model: "m1".to_owned(),
                    },
                    ModelRef {
                        name: "last".to_owned(),
                        model: "m2".to_owned(),
                    },
                    ModelRef {
                        name: "onnx".to_owned(),
                        model: "m3".to_owned(),
                    },
                ],
            },
            datasets: vec!["d1".to_owned(), "d2".to_owned()],
            ..fixtures::training_task("t1", &[], &[])
        });
        let dir = tempdir::TempDir::new("export_tasks").unwrap();
        let layout = Layout::under(dir.path());
        let models = vec![
            ModelEntry {
                id: "m1".to_owned(),
                url: fixtures::model_url("m1"),
            },
            ModelEntry {
                id: "m2".to_owned(),
                url: fixtures::model_url("m2"),
            },
        ];

        let summaries = export_experiment_tasks(&platform, &layout, &models)
            .await
            .unwrap();

        // Both models come from t1, which is exported once.
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, "t1");
        assert_eq!(summaries[0].models.len(), 3);
        assert_eq!(summaries[0].datasets, vec!["d1", "d2"]);
        assert_eq!(fs::read_dir(&layout.tasks).unwrap().count(), 1);

        let stored: TaskDescription =
            serde_json::from_slice(&fs::read(layout.task_path("t1")).unwrap()).unwrap();
        assert_eq!(stored, platform.task("t1").unwrap());
    }

    #[tokio::test]
    async fn export_tasks_fails_for_model_without_task() {
        let platform = InMemoryPlatform::new();
        let mut record = fixtures::model_record("m1", "t1");
        record.task = None;
        platform.add_model(record, &b"w"[..]);
        let dir = tempdir::TempDir::new("export_orphan").unwrap();
        let models = vec![ModelEntry {
            id: "m1".to_owned(),
            url: fixtures::model_url("m1"),
        }];

        let err = export_experiment_tasks(&platform, &Layout::under(dir.path()), &models)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no originating task"));
    }

    #[tokio::test]
    async fn export_datasets_first_task_only_by_default() {
        let platform = InMemoryPlatform::new();
        platform.add_task(fixtures::training_task("t1", &[], &["d1", "d2"]));
        platform.add_task(fixtures::training_task("t2", &[], &["d3"]));
        fixtures::dataset(&platform, "d1", "digits-train", true);
        fixtures::dataset(&platform, "d2", "digits-test", false);
        fixtures::dataset(&platform, "d3", "letters", true);
        let dir = tempdir::TempDir::new("export_datasets").unwrap();
        let layout = Layout::under(dir.path());
        let tasks = vec!["t1".to_owned(), "t2".to_owned()];

        let datasets = export_datasets(&platform, &layout, &tasks, DatasetScope::FirstTask)
            .await
            .unwrap();

        assert_eq!(datasets.keys().collect::<Vec<_>>(), vec!["d1", "d2"]);
        assert_eq!(
            datasets["d2"],
            DatasetDetails {
                name: "digits-test".to_owned(),
                project: "mnist".to_owned()
            }
        );
        // d2 had to be finalized before it could be copied.
        assert!(platform.dataset("d2").unwrap().is_final);
        assert_eq!(
            fs::read(layout.dataset_dir("d1").join("train/0.png")).unwrap(),
            b"d1-0"
        );
        assert!(layout.dataset_dir("d2").join("labels.csv").is_file());
        assert!(!layout.dataset_dir("d3").exists());
    }

    #[tokio::test]
    async fn export_datasets_all_tasks() {
        let platform = InMemoryPlatform::new();
        platform.add_task(fixtures::training_task("t1", &[], &["d1"]));
        platform.add_task(fixtures::training_task("t2", &[], &["d1", "d3"]));
        fixtures::dataset(&platform, "d1", "digits", true);
        fixtures::dataset(&platform, "d3", "letters", true);
        let dir = tempdir::TempDir::new("export_all").unwrap();
        let layout = Layout::under(dir.path());
        let tasks = vec!["t1".to_owned(), "t2".to_owned()];

        let datasets = export_datasets(&platform, &layout, &tasks, DatasetScope::AllTasks)
            .await
            .unwrap();

        assert_eq!(datasets.keys().collect::<Vec<_>>(), vec!["d1", "d3"]);
        assert!(layout.dataset_dir("d3").join("train/0.png").is_file());
    }

    #[tokio::test]
    async fn export_writes_deploy_manifest() {
        let platform = InMemoryPlatform::new();
        fixtures::development(&platform);
        let dir = tempdir::TempDir::new("export_all_steps").unwrap();

        let deploy = export_from_development(
            &platform,
            &ExportOptions {
                serving_id: fixtures::SERVING_ID.to_owned(),
                developer: "ops".to_owned(),
                scope: DatasetScope::FirstTask,
                root: dir.path().to_path_buf(),
            },
        )
        .await
        .unwrap();

        let written: DeployManifest =
            manifest::load(&dir.path().join(DEPLOY_MANIFEST))
                .await
                .unwrap();
        assert_eq!(written, deploy);
        assert_eq!(written.developer, "ops");
        assert_eq!(written.serving_id, fixtures::SERVING_ID);
        assert_eq!(written.models.len(), 1);
        assert_eq!(written.tasks.len(), 1);
        assert_eq!(written.tasks[0].datasets.len(), 2);
        assert_eq!(written.datasets.len(), 2);
    }

    #[tokio::test]
    async fn export_first_task_follows_first_endpoint() {
        let platform = InMemoryPlatform::new();
        fixtures::serving(&platform, "serving", &[("zeta", "mz"), ("alpha", "ma")]);
        fixtures::model(&platform, "mz", "tz", b"zeta");
        fixtures::model(&platform, "ma", "ta", b"alpha");
        platform.add_task(fixtures::training_task("tz", &[("best", "mz")], &["dz"]));
        platform.add_task(fixtures::training_task("ta", &[("best", "ma")], &["da"]));
        fixtures::dataset(&platform, "dz", "zeta-set", true);
        fixtures::dataset(&platform, "da", "alpha-set", true);
        let dir = tempdir::TempDir::new("export_endpoint_order").unwrap();

        let deploy = export_from_development(
            &platform,
            &ExportOptions {
                serving_id: "serving".to_owned(),
                developer: String::new(),
                scope: DatasetScope::FirstTask,
                root: dir.path().to_path_buf(),
            },
        )
        .await
        .unwrap();

        let models: Vec<_> = deploy.models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(models, vec!["mz", "ma"]);
        assert_eq!(deploy.tasks[0].id, "tz");
        assert_eq!(deploy.datasets.keys().collect::<Vec<_>>(), vec!["dz"]);
    }
}
