//! The two JSON documents that carry a transfer across the air gap: the deploy manifest
//! written on export, and the import manifest mapping development ids to standalone ids.

use std::{collections::BTreeMap, fmt::Debug, path::Path};

use anyhow::{Context, Result};
use clearml::{EntityId, ModelRef};
use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: EntityId,
    pub url: String,
}

/// What the importer needs to know about one exported task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub id: EntityId,
    /// Output models declared by the task.
    pub models: Vec<ModelRef>,
    /// Ids of the datasets the task consumed.
    pub datasets: Vec<EntityId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatasetDetails {
    pub name: String,
    pub project: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeployManifest {
    pub developer: String,
    #[serde(with = "time::serde::rfc3339")]
    pub exported_on: OffsetDateTime,
    pub serving_id: EntityId,
    #[serde(rename = "model")]
    pub models: Vec<ModelEntry>,
    pub tasks: Vec<TaskSummary>,
    pub datasets: BTreeMap<EntityId, DatasetDetails>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskMapping {
    pub development_task_id: EntityId,
    pub standalone_task_id: EntityId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelMapping {
    pub development_model_id: EntityId,
    pub standalone_model_id: EntityId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatasetMapping {
    pub development_dataset_id: EntityId,
    pub standalone_dataset_id: EntityId,
}

/// Mapping sections are keyed by the id newly assigned in the standalone environment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportManifest {
    pub importer: String,
    #[serde(with = "time::serde::rfc3339")]
    pub imported_on: OffsetDateTime,
    pub imported_task: BTreeMap<EntityId, TaskMapping>,
    pub imported_model: BTreeMap<EntityId, ModelMapping>,
    pub imported_dataset: BTreeMap<EntityId, DatasetMapping>,
}

impl ImportManifest {
    pub fn new(importer: String, imported_on: OffsetDateTime) -> Self {
        ImportManifest {
            importer,
            imported_on,
            imported_task: BTreeMap::new(),
            imported_model: BTreeMap::new(),
            imported_dataset: BTreeMap::new(),
        }
    }
}

/// Insert `value` under `key`, replacing and returning whatever was there before.
///
/// This is the only way entries get into a manifest section, so a repeated key always
/// overwrites rather than appends.
pub fn add_to_manifest<V: Debug>(
    section: &mut BTreeMap<String, V>,
    key: impl Into<String>,
    value: V,
) -> Option<V> {
    let key = key.into();
    debug!("manifest[{}] = {:?}", &key, &value);
    section.insert(key, value)
}

pub async fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("{} is not a valid manifest", path.display()))
}

pub async fn save<T: Serialize>(path: &Path, manifest: &T) -> Result<()> {
    let raw = serde_json::to_vec_pretty(manifest).context("failed to serialize manifest")?;
    tokio::fs::write(path, raw)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}
