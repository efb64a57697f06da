//! Standalone side: re-create tasks, attach model weights, re-create datasets and point the
//! tasks at them, recording every old → new id pair.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context, Result};
use clearml::{DatasetStore, EntityId, ModelRef, ModelStore, TaskDescription, TaskStore};
use log::info;
use time::OffsetDateTime;

use crate::{
    error::ManifestError,
    helpers::add_dataset,
    layout::Layout,
    manifest::{
        self, add_to_manifest, DatasetDetails, DatasetMapping, DeployManifest, ImportManifest,
        ModelMapping, TaskMapping,
    },
};

/// Which dataset pairs of a task end up in the import manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DatasetRecording {
    /// Only the pair created last for each task.
    #[default]
    LastOnly,
    /// One entry per dataset.
    All,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// The deploy manifest written by the exporter.
    pub deploy_info: PathBuf,
    /// Where the exported task, model and dataset files are.
    pub layout: Layout,
    /// Base location model weights are uploaded to.
    pub output_uri: String,
    pub importer: String,
    pub recording: DatasetRecording,
    /// Where to write the import manifest.
    pub import_info: PathBuf,
}

/// Models attached to one imported task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportedModels {
    pub mappings: Vec<ModelMapping>,
    /// Upload location of the last model attached.
    pub last_url: Option<String>,
}

/// Datasets re-created for one imported task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportedDatasets {
    /// New dataset ids, in the order the task referenced the exported ones.
    pub new_ids: Vec<EntityId>,
    /// Pairs to record in the import manifest, keyed by the new id.
    pub recorded: BTreeMap<EntityId, DatasetMapping>,
}

/// Submit the stored description of development task `task_id` as a new task.
pub async fn import_experiment_task<P>(
    platform: &P,
    layout: &Layout,
    task_id: &str,
) -> Result<TaskMapping>
where
    P: TaskStore + ?Sized,
{
    let path = layout.task_path(task_id);
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read exported task {}", path.display()))?;
    let task: TaskDescription = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not an exported task", path.display()))?;

    let new_id = platform
        .import_task(&task)
        .await
        .with_context(|| format!("failed to import task {}", task_id))?;
    info!("Imported task {} as {}", task_id, &new_id);

    Ok(TaskMapping {
        development_task_id: task_id.to_owned(),
        standalone_task_id: new_id,
    })
}

/// Upload the weights of every declared model as an output model of `new_task_id`.
pub async fn import_models_for_task<P>(
    platform: &P,
    layout: &Layout,
    new_task_id: &str,
    models: &[ModelRef],
    output_uri: &str,
) -> Result<ImportedModels>
where
    P: ModelStore + ?Sized,
{
    let mut imported = ImportedModels::default();
    for model in models {
        let weights = layout.model_path(&model.model);
        if !weights.is_file() {
            anyhow::bail!(
                "weights of model {} not found at {}",
                &model.model,
                weights.display()
            );
        }

        let uploaded = platform
            .upload_output_model(new_task_id, &weights, &model.name, output_uri)
            .await
            .with_context(|| format!("failed to upload model {}", &model.model))?;
        info!(
            "Uploaded model {} as {} to {}",
            &model.model, &uploaded.id, &uploaded.url
        );

        imported.mappings.push(ModelMapping {
            development_model_id: model.model.clone(),
            standalone_model_id: uploaded.id,
        });
        imported.last_url = Some(uploaded.url);
    }

    Ok(imported)
}

/// Re-create the task's datasets from their local copies and rewrite the task's dataset
/// references to the new ids.
pub async fn import_datasets_for_task<P>(
    platform: &P,
    layout: &Layout,
    new_task_id: &str,
    dataset_ids: &[EntityId],
    details: &BTreeMap<EntityId, DatasetDetails>,
    recording: DatasetRecording,
) -> Result<ImportedDatasets>
where
    P: TaskStore + DatasetStore + ?Sized,
{
    info!(
        "Importing datasets {:?} for task {}",
        dataset_ids, new_task_id
    );

    let mut created = Vec::with_capacity(dataset_ids.len());
    for dataset_id in dataset_ids {
        let detail = details
            .get(dataset_id)
            .ok_or_else(|| ManifestError::UnknownDataset {
                task: new_task_id.to_owned(),
                dataset: dataset_id.clone(),
            })?;

        let files = layout.dataset_dir(dataset_id);
        let new_id = add_dataset(platform, &detail.project, &detail.name, &files).await?;
        created.push((dataset_id.clone(), new_id));
    }

    let mut task = platform.get_task(new_task_id).await?;
    task.datasets = created.iter().map(|(_, new_id)| new_id.clone()).collect();
    platform
        .update_task(&task)
        .await
        .with_context(|| format!("failed to relink datasets of task {}", new_task_id))?;

    let pairs = match recording {
        DatasetRecording::LastOnly => &created[created.len().saturating_sub(1)..],
        DatasetRecording::All => &created[..],
    };
    let mut recorded = BTreeMap::new();
    for (old_id, new_id) in pairs {
        add_to_manifest(
            &mut recorded,
            new_id.clone(),
            DatasetMapping {
                development_dataset_id: old_id.clone(),
                standalone_dataset_id: new_id.clone(),
            },
        );
    }

    Ok(ImportedDatasets {
        new_ids: task.datasets,
        recorded,
    })
}

/// Import every task of the deploy manifest with its models and datasets, then write the
/// import manifest.
///
/// Nothing checks for earlier runs: importing the same manifest twice creates everything
/// twice.
pub async fn import_to_standalone<P>(platform: &P, options: &ImportOptions) -> Result<ImportManifest>
where
    P: TaskStore + ModelStore + DatasetStore + ?Sized,
{
    let mut import_info = ImportManifest::new(options.importer.clone(), OffsetDateTime::now_utc());
    let deploy: DeployManifest = manifest::load(&options.deploy_info).await?;

    for task in &deploy.tasks {
        info!("Importing task {}", &task.id);

        let mapping = import_experiment_task(platform, &options.layout, &task.id).await?;
        let new_task_id = mapping.standalone_task_id.clone();
        add_to_manifest(&mut import_info.imported_task, new_task_id.clone(), mapping);

        let models = import_models_for_task(
            platform,
            &options.layout,
            &new_task_id,
            &task.models,
            &options.output_uri,
        )
        .await?;
        if let Some(url) = &models.last_url {
            info!("Models of task {} uploaded to {}", &new_task_id, url);
        }
        for mapping in models.mappings {
            add_to_manifest(
                &mut import_info.imported_model,
                mapping.standalone_model_id.clone(),
                mapping,
            );
        }

        let datasets = import_datasets_for_task(
            platform,
            &options.layout,
            &new_task_id,
            &task.datasets,
            &deploy.datasets,
            options.recording,
        )
        .await?;
        for (new_id, mapping) in datasets.recorded {
            add_to_manifest(&mut import_info.imported_dataset, new_id, mapping);
        }
    }

    manifest::save(&options.import_info, &import_info).await?;
    info!("Importing completed on {}", OffsetDateTime::now_utc());
    Ok(import_info)
}
