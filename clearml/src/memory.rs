//! In-process [Platform](crate::Platform) used to exercise the transfer workflow without a
//! server. It keeps the behaviours the workflow relies on: fresh ids on every import, and
//! datasets that must be finalized before they can be copied.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use walkdir::WalkDir;

use crate::store::{
    top_level_project, ConfigurationItem, DatasetRecord, DatasetStore, EntityId, ModelRecord,
    ModelRef, ModelStore, TaskDescription, TaskStore, UploadedModel,
};

#[derive(Debug, Clone)]
struct DatasetEntry {
    id: EntityId,
    name: String,
    /// Full project path, e.g. `mnist/.datasets/digits`.
    project: String,
    is_final: bool,
    files: BTreeMap<String, Vec<u8>>,
    pending: BTreeMap<String, Vec<u8>>,
}

impl DatasetEntry {
    fn record(&self) -> DatasetRecord {
        DatasetRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            project: top_level_project(&self.project),
            is_final: self.is_final,
        }
    }
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<EntityId, TaskDescription>,
    models: BTreeMap<EntityId, ModelRecord>,
    blobs: HashMap<String, Bytes>,
    datasets: BTreeMap<EntityId, DatasetEntry>,
}

#[derive(Default)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
}

fn new_id() -> EntityId {
    uuid::Uuid::new_v4().simple().to_string()
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory platform lock poisoned"))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_task(&self, task: TaskDescription) {
        self.state().tasks.insert(task.id.clone(), task);
    }

    /// Attach a configuration object to an already registered task.
    pub fn set_configuration(&self, task_id: &str, name: &str, value: &str) {
        if let Some(task) = self.state().tasks.get_mut(task_id) {
            task.configuration.insert(
                name.to_owned(),
                ConfigurationItem {
                    name: name.to_owned(),
                    value: value.to_owned(),
                    item_type: "dictionary".to_owned(),
                    description: String::new(),
                },
            );
        }
    }

    /// Register a model whose weights can be downloaded from `record.url`.
    pub fn add_model(&self, record: ModelRecord, weights: impl Into<Bytes>) {
        let mut state = self.state();
        state.blobs.insert(record.url.clone(), weights.into());
        state.models.insert(record.id.clone(), record);
    }

    pub fn add_dataset(
        &self,
        id: &str,
        name: &str,
        project: &str,
        is_final: bool,
        files: &[(&str, &[u8])],
    ) {
        let entry = DatasetEntry {
            id: id.to_owned(),
            name: name.to_owned(),
            project: project.to_owned(),
            is_final,
            files: files
                .iter()
                .map(|(path, data)| ((*path).to_owned(), data.to_vec()))
                .collect(),
            pending: BTreeMap::new(),
        };
        self.state().datasets.insert(id.to_owned(), entry);
    }

    pub fn task(&self, id: &str) -> Option<TaskDescription> {
        self.state().tasks.get(id).cloned()
    }

    pub fn tasks(&self) -> Vec<TaskDescription> {
        self.state().tasks.values().cloned().collect()
    }

    pub fn model(&self, id: &str) -> Option<ModelRecord> {
        self.state().models.get(id).cloned()
    }

    pub fn models(&self) -> Vec<ModelRecord> {
        self.state().models.values().cloned().collect()
    }

    pub fn blob(&self, url: &str) -> Option<Bytes> {
        self.state().blobs.get(url).cloned()
    }

    /// Make `url` unavailable for download, as if the file server lost it.
    pub fn remove_blob(&self, url: &str) -> Option<Bytes> {
        self.state().blobs.remove(url)
    }

    pub fn dataset(&self, id: &str) -> Option<DatasetRecord> {
        self.state().datasets.get(id).map(DatasetEntry::record)
    }

    pub fn datasets(&self) -> Vec<DatasetRecord> {
        self.state()
            .datasets
            .values()
            .map(DatasetEntry::record)
            .collect()
    }

    /// Finalized contents of a dataset, keyed by `/`-separated relative path.
    pub fn dataset_files(&self, id: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.state().datasets.get(id).map(|d| d.files.clone())
    }
}

#[async_trait]
impl TaskStore for InMemoryPlatform {
    async fn get_task(&self, id: &str) -> Result<TaskDescription> {
        self.lock()?
            .tasks
            .get(id)
            .cloned()
            .with_context(|| format!("task {} not found", id))
    }

    async fn get_configuration(&self, id: &str, name: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        let task = state
            .tasks
            .get(id)
            .with_context(|| format!("task {} not found", id))?;
        Ok(task.configuration.get(name).map(|item| item.value.clone()))
    }

    async fn import_task(&self, task: &TaskDescription) -> Result<EntityId> {
        let id = new_id();
        let mut imported = task.clone();
        imported.id = id.clone();
        imported.status = "created".to_owned();
        // Output models belong to the source environment; they get re-attached by upload.
        imported.models.output.clear();

        self.lock()?.tasks.insert(id.clone(), imported);
        Ok(id)
    }

    async fn update_task(&self, task: &TaskDescription) -> Result<()> {
        let mut state = self.lock()?;
        let existing = state
            .tasks
            .get_mut(&task.id)
            .with_context(|| format!("task {} not found", &task.id))?;

        existing.name = task.name.clone();
        existing.comment = task.comment.clone();
        existing.hyperparams = task.hyperparams.clone();
        existing.configuration = task.configuration.clone();
        existing.datasets = task.datasets.clone();
        Ok(())
    }

    async fn create_run_task(&self, project: &str, name: &str) -> Result<EntityId> {
        let id = new_id();
        let task = TaskDescription {
            id: id.clone(),
            name: name.to_owned(),
            project: project.to_owned(),
            task_type: "application".to_owned(),
            status: "in_progress".to_owned(),
            ..Default::default()
        };
        self.lock()?.tasks.insert(id.clone(), task);
        Ok(id)
    }
}

#[async_trait]
impl ModelStore for InMemoryPlatform {
    async fn get_model(&self, id: &str) -> Result<ModelRecord> {
        self.lock()?
            .models
            .get(id)
            .cloned()
            .with_context(|| format!("model {} not found", id))
    }

    async fn download_model(&self, url: &str) -> Result<Bytes> {
        self.lock()?
            .blobs
            .get(url)
            .cloned()
            .with_context(|| format!("download of {} failed: 404 Not Found", url))
    }

    async fn upload_output_model(
        &self,
        task_id: &str,
        weights: &Path,
        target_filename: &str,
        upload_uri: &str,
    ) -> Result<UploadedModel> {
        let data = tokio::fs::read(weights)
            .await
            .with_context(|| format!("failed to read weights {}", weights.display()))?;

        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(task_id)
            .with_context(|| format!("task {} not found", task_id))?;

        let id = new_id();
        let url = format!(
            "{}/{}/{}.{}/models/{}",
            upload_uri.trim_end_matches('/'),
            &task.project,
            &task.name,
            task_id,
            target_filename
        );

        task.models.output.retain(|m| m.name != target_filename);
        task.models.output.push(ModelRef {
            name: target_filename.to_owned(),
            model: id.clone(),
        });
        let record = ModelRecord {
            id: id.clone(),
            name: task.name.clone(),
            url: url.clone(),
            task: Some(task_id.to_owned()),
            project: task.project.clone(),
        };

        state.blobs.insert(url.clone(), Bytes::from(data));
        state.models.insert(id.clone(), record);
        Ok(UploadedModel { id, url })
    }
}

#[async_trait]
impl DatasetStore for InMemoryPlatform {
    async fn get_dataset(&self, id: &str) -> Result<DatasetRecord> {
        self.lock()?
            .datasets
            .get(id)
            .map(DatasetEntry::record)
            .with_context(|| format!("dataset {} not found", id))
    }

    async fn finalize_dataset(&self, id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let dataset = state
            .datasets
            .get_mut(id)
            .with_context(|| format!("dataset {} not found", id))?;
        dataset.is_final = true;
        Ok(())
    }

    async fn download_dataset(&self, id: &str, target: &Path) -> Result<()> {
        let files = {
            let state = self.lock()?;
            let dataset = state
                .datasets
                .get(id)
                .with_context(|| format!("dataset {} not found", id))?;
            if !dataset.is_final {
                anyhow::bail!("dataset {} is not finalized and cannot be copied", id);
            }
            dataset.files.clone()
        };

        tokio::fs::create_dir_all(target)
            .await
            .with_context(|| format!("failed to create {}", target.display()))?;
        for (relative, data) in files {
            let path = target.join(&relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, data)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        Ok(())
    }

    async fn create_dataset(&self, project: &str, name: &str) -> Result<EntityId> {
        let id = new_id();
        let entry = DatasetEntry {
            id: id.clone(),
            name: name.to_owned(),
            project: format!("{}/.datasets/{}", project, name),
            is_final: false,
            files: BTreeMap::new(),
            pending: BTreeMap::new(),
        };
        self.lock()?.datasets.insert(id.clone(), entry);
        Ok(id)
    }

    async fn add_files(&self, id: &str, path: &Path) -> Result<usize> {
        if !path.is_dir() {
            anyhow::bail!("{} is not a folder", path.display());
        }

        let mut collected = BTreeMap::new();
        for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(path)
                .context("walked outside of the dataset folder")?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let data = tokio::fs::read(entry.path())
                .await
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            collected.insert(relative, data);
        }

        let mut state = self.lock()?;
        let dataset = state
            .datasets
            .get_mut(id)
            .with_context(|| format!("dataset {} not found", id))?;
        if dataset.is_final {
            anyhow::bail!("dataset {} is finalized and cannot take more files", id);
        }

        let count = collected.len();
        dataset.pending.extend(collected);
        Ok(count)
    }

    async fn upload_dataset(&self, id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let dataset = state
            .datasets
            .get_mut(id)
            .with_context(|| format!("dataset {} not found", id))?;
        if dataset.pending.is_empty() {
            anyhow::bail!("dataset {} has no files to upload", id);
        }

        let pending = std::mem::take(&mut dataset.pending);
        dataset.files.extend(pending);
        Ok(())
    }
}
