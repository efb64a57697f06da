//! [Platform](crate::Platform) implementation speaking the platform's JSON API and file server
//! protocol over HTTP.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use reqwest::{multipart, Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::{
    archive,
    error::ApiError,
    store::{
        is_final_status, top_level_project, DatasetRecord, DatasetStore, EntityId, ModelRecord,
        ModelStore, TaskDescription, TaskStore, UploadedModel,
    },
    wire::{
        AddOrUpdateArtifactsRequest, AddOrUpdateModelRequest, ApiTask, Artifact,
        CompletedRequest, CreateModelRequest, CreateProjectRequest, CreateTaskRequest,
        CreatedResponse, EditTaskRequest, Envelope, GetAllProjectsRequest,
        GetAllProjectsResponse, GetModelResponse, GetProjectResponse, GetTaskResponse,
        LoginResponse, ModelRequest, ProjectRequest, TaskRequest,
    },
};

/// Connection parameters for a platform deployment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_host: String,
    pub files_host: String,
    pub access_key: String,
    pub secret_key: String,
}

pub struct RestPlatform {
    client: Client,
    api_host: String,
    files_host: String,
    token: String,
    /// Folders registered through `add_files`, keyed by dataset id, until they are uploaded.
    pending: Mutex<HashMap<EntityId, Vec<PathBuf>>>,
}

impl RestPlatform {
    /// Log in with the configured credentials and keep the issued token for later calls.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        let api_host = settings.api_host.trim_end_matches('/').to_owned();

        let response = client
            .post(format!("{}/auth.login", &api_host))
            .basic_auth(&settings.access_key, Some(&settings.secret_key))
            .json(&json!({}))
            .send()
            .await
            .with_context(|| format!("failed to reach {}", &api_host))?;
        let login: LoginResponse = decode("auth.login", response).await?;
        info!("Authenticated against {}", &api_host);

        Ok(Self {
            client,
            api_host,
            files_host: settings.files_host.trim_end_matches('/').to_owned(),
            token: login.token,
            pending: Mutex::new(HashMap::new()),
        })
    }

    async fn call<Req, Resp>(&self, endpoint: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        debug!("POST {}/{}", &self.api_host, endpoint);
        let response = self
            .client
            .post(format!("{}/{}", &self.api_host, endpoint))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to call {}", endpoint))?;

        decode(endpoint, response).await
    }

    async fn fetch_task(&self, id: &str) -> Result<ApiTask> {
        let response: GetTaskResponse = self
            .call("tasks.get_by_id", &TaskRequest { task: id })
            .await
            .with_context(|| format!("task {} not found", id))?;
        Ok(response.task)
    }

    async fn project_name(&self, id: Option<&str>) -> Result<String> {
        match id {
            None => Ok(String::new()),
            Some(id) => {
                let response: GetProjectResponse = self
                    .call("projects.get_by_id", &ProjectRequest { project: id })
                    .await?;
                Ok(response.project.name)
            }
        }
    }

    /// Resolve a project by exact name, creating it when it does not exist yet.
    async fn project_id(&self, name: &str) -> Result<Option<String>> {
        if name.is_empty() {
            return Ok(None);
        }

        let pattern = exact_name_pattern(name);
        let found: GetAllProjectsResponse = self
            .call(
                "projects.get_all",
                &GetAllProjectsRequest {
                    name: &pattern,
                    only_fields: ["id", "name"],
                },
            )
            .await?;
        if let Some(project) = found.projects.into_iter().find(|p| p.name == name) {
            return Ok(Some(project.id));
        }

        let created: CreatedResponse = self
            .call(
                "projects.create",
                &CreateProjectRequest {
                    name,
                    description: "",
                },
            )
            .await
            .with_context(|| format!("failed to create project {}", name))?;
        info!("Created project {} ({})", name, &created.id);
        Ok(Some(created.id))
    }

    async fn create_task(
        &self,
        name: &str,
        project: &str,
        task_type: &str,
        system_tags: Vec<&str>,
        task: Option<&TaskDescription>,
    ) -> Result<EntityId> {
        let project = self.project_id(project).await?;
        let created: CreatedResponse = self
            .call(
                "tasks.create",
                &CreateTaskRequest {
                    name,
                    project: project.as_deref(),
                    task_type,
                    comment: task.map(|t| t.comment.as_str()).unwrap_or_default(),
                    system_tags,
                    script: task.and_then(|t| t.script.as_ref()),
                    hyperparams: task.map(|t| &t.hyperparams),
                    configuration: task.map(|t| &t.configuration),
                },
            )
            .await
            .with_context(|| format!("failed to create task {}", name))?;
        Ok(created.id)
    }

    /// Store `data` on the file server below `base` and return its download URL.
    async fn upload_file(&self, base: &str, key: &str, data: Vec<u8>) -> Result<String> {
        let base = base.trim_end_matches('/');
        ensure_http(base)?;

        let part = multipart::Part::bytes(data).file_name(key.to_owned());
        let form = multipart::Form::new().part(key.to_owned(), part);
        let mut request = self.client.post(base).multipart(form);
        if base.starts_with(&self.files_host) {
            request = request.bearer_auth(&self.token);
        }

        request
            .send()
            .await
            .with_context(|| format!("failed to upload {} to {}", key, base))?
            .error_for_status()
            .with_context(|| format!("file server rejected {}", key))?;

        let url = format!("{}/{}", base, key);
        debug!("Uploaded {}", &url);
        Ok(url)
    }

    async fn fetch_file(&self, url: &str) -> Result<Bytes> {
        ensure_http(url)?;
        let mut request = self.client.get(url);
        if url.starts_with(&self.files_host) {
            request = request.bearer_auth(&self.token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to download {}", url))?
            .error_for_status()
            .with_context(|| format!("download of {} was refused", url))?;
        response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {}", url))
    }
}

#[async_trait]
impl TaskStore for RestPlatform {
    async fn get_task(&self, id: &str) -> Result<TaskDescription> {
        let raw = self.fetch_task(id).await?;
        let project = self.project_name(raw.project.as_deref()).await?;
        let datasets = raw.datasets()?;

        Ok(TaskDescription {
            id: raw.id,
            name: raw.name,
            project,
            task_type: raw.task_type,
            comment: raw.comment,
            status: raw.status,
            script: raw.script,
            hyperparams: raw.hyperparams,
            configuration: raw.configuration,
            models: raw.models.unwrap_or_default(),
            datasets,
        })
    }

    async fn get_configuration(&self, id: &str, name: &str) -> Result<Option<String>> {
        let raw = self.fetch_task(id).await?;
        Ok(raw.configuration.get(name).map(|item| item.value.clone()))
    }

    async fn import_task(&self, task: &TaskDescription) -> Result<EntityId> {
        let id = self
            .create_task(&task.name, &task.project, &task.task_type, vec![], Some(task))
            .await?;

        if !task.datasets.is_empty() {
            let mut runtime = serde_json::Map::new();
            runtime.insert("datasets".to_owned(), json!(task.datasets));
            let _: Value = self
                .call(
                    "tasks.edit",
                    &EditTaskRequest {
                        task: &id,
                        force: true,
                        name: None,
                        comment: None,
                        hyperparams: None,
                        configuration: None,
                        runtime: Some(&runtime),
                    },
                )
                .await?;
        }

        Ok(id)
    }

    async fn update_task(&self, task: &TaskDescription) -> Result<()> {
        // Only `runtime.datasets` is owned by us; keep whatever else the runtime holds.
        let raw = self.fetch_task(&task.id).await?;
        let mut runtime = raw.runtime;
        runtime.insert("datasets".to_owned(), json!(task.datasets));

        let _: Value = self
            .call(
                "tasks.edit",
                &EditTaskRequest {
                    task: &task.id,
                    force: true,
                    name: Some(&task.name),
                    comment: Some(&task.comment),
                    hyperparams: Some(&task.hyperparams),
                    configuration: Some(&task.configuration),
                    runtime: Some(&runtime),
                },
            )
            .await
            .with_context(|| format!("failed to update task {}", &task.id))?;
        Ok(())
    }

    async fn create_run_task(&self, project: &str, name: &str) -> Result<EntityId> {
        self.create_task(name, project, "application", vec![], None)
            .await
    }
}

#[async_trait]
impl ModelStore for RestPlatform {
    async fn get_model(&self, id: &str) -> Result<ModelRecord> {
        let response: GetModelResponse = self
            .call("models.get_by_id", &ModelRequest { model: id })
            .await
            .with_context(|| format!("model {} not found", id))?;
        let model = response.model;
        let url = model
            .uri
            .with_context(|| format!("model {} has no weights uri", id))?;
        let project = self.project_name(model.project.as_deref()).await?;

        Ok(ModelRecord {
            id: model.id,
            name: model.name,
            url,
            task: model.task,
            project,
        })
    }

    async fn download_model(&self, url: &str) -> Result<Bytes> {
        self.fetch_file(url).await
    }

    async fn upload_output_model(
        &self,
        task_id: &str,
        weights: &Path,
        target_filename: &str,
        upload_uri: &str,
    ) -> Result<UploadedModel> {
        let task = self.fetch_task(task_id).await?;
        let project = self.project_name(task.project.as_deref()).await?;
        let data = tokio::fs::read(weights)
            .await
            .with_context(|| format!("failed to read weights {}", weights.display()))?;

        let key = format!(
            "{}/{}.{}/models/{}",
            &project, &task.name, task_id, target_filename
        );
        let url = self.upload_file(upload_uri, &key, data).await?;

        let created: CreatedResponse = self
            .call(
                "models.create",
                &CreateModelRequest {
                    uri: &url,
                    name: &task.name,
                    task: task_id,
                    project: task.project.as_deref(),
                    ready: true,
                },
            )
            .await?;
        let _: Value = self
            .call(
                "tasks.add_or_update_model",
                &AddOrUpdateModelRequest {
                    task: task_id,
                    name: target_filename,
                    model: &created.id,
                    model_type: "output",
                },
            )
            .await?;

        Ok(UploadedModel {
            id: created.id,
            url,
        })
    }
}

#[async_trait]
impl DatasetStore for RestPlatform {
    async fn get_dataset(&self, id: &str) -> Result<DatasetRecord> {
        let raw = self
            .fetch_task(id)
            .await
            .with_context(|| format!("dataset {} not found", id))?;
        let project = self.project_name(raw.project.as_deref()).await?;

        Ok(DatasetRecord {
            id: raw.id,
            name: raw.name,
            project: top_level_project(&project),
            is_final: is_final_status(&raw.status),
        })
    }

    async fn finalize_dataset(&self, id: &str) -> Result<()> {
        let raw = self.fetch_task(id).await?;
        if is_final_status(&raw.status) {
            return Ok(());
        }

        let _: Value = self
            .call(
                "tasks.completed",
                &CompletedRequest {
                    task: id,
                    force: true,
                    status_reason: "dataset finalized",
                },
            )
            .await
            .with_context(|| format!("failed to finalize dataset {}", id))?;
        Ok(())
    }

    async fn download_dataset(&self, id: &str, target: &Path) -> Result<()> {
        let raw = self.fetch_task(id).await?;
        if !is_final_status(&raw.status) {
            anyhow::bail!("dataset {} is not finalized and cannot be copied", id);
        }

        tokio::fs::create_dir_all(target)
            .await
            .with_context(|| format!("failed to create {}", target.display()))?;

        let artifacts = raw.execution.map(|e| e.artifacts).unwrap_or_default();
        for artifact in artifacts.iter().filter(|a| a.key.starts_with("data")) {
            let Some(uri) = &artifact.uri else {
                continue;
            };
            let bytes = self.fetch_file(uri).await?;
            let files = archive::unpack(&bytes, target)
                .with_context(|| format!("failed to extract {} of dataset {}", &artifact.key, id))?;
            debug!("Extracted {} files from {}", files, uri);
        }

        Ok(())
    }

    async fn create_dataset(&self, project: &str, name: &str) -> Result<EntityId> {
        let dataset_project = format!("{}/.datasets/{}", project, name);
        self.create_task(name, &dataset_project, "data_processing", vec!["dataset"], None)
            .await
    }

    async fn add_files(&self, id: &str, path: &Path) -> Result<usize> {
        if !path.is_dir() {
            anyhow::bail!("{} is not a folder", path.display());
        }

        let files = WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();

        self.pending
            .lock()
            .map_err(|_| anyhow::anyhow!("pending uploads lock poisoned"))?
            .entry(id.to_owned())
            .or_default()
            .push(path.to_path_buf());

        Ok(files)
    }

    async fn upload_dataset(&self, id: &str) -> Result<()> {
        let folders = self
            .pending
            .lock()
            .map_err(|_| anyhow::anyhow!("pending uploads lock poisoned"))?
            .remove(id)
            .unwrap_or_default();
        if folders.is_empty() {
            anyhow::bail!("dataset {} has no files to upload", id);
        }

        let raw = self.fetch_task(id).await?;
        let project = self.project_name(raw.project.as_deref()).await?;

        let mut artifacts = Vec::with_capacity(folders.len());
        for (i, folder) in folders.iter().enumerate() {
            let key = artifact_key(i);
            let data = archive::pack_dir(folder)?;
            let object = format!(
                "{}/{}.{}/artifacts/{}/dataset.{}.tar.gz",
                &project, &raw.name, id, &key, id
            );
            let uri = self.upload_file(&self.files_host, &object, data).await?;
            artifacts.push(Artifact {
                key,
                artifact_type: "archive".to_owned(),
                mode: "output".to_owned(),
                uri: Some(uri),
            });
        }

        let _: Value = self
            .call(
                "tasks.add_or_update_artifacts",
                &AddOrUpdateArtifactsRequest { task: id, artifacts },
            )
            .await
            .with_context(|| format!("failed to register contents of dataset {}", id))?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T> {
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .with_context(|| format!("failed to read {} response", endpoint))?;
    parse_envelope(endpoint, status, &body)
}

/// Unwrap the `data` of an API response, turning failure result codes into [ApiError]s.
fn parse_envelope<T: DeserializeOwned>(endpoint: &str, status: u16, body: &[u8]) -> Result<T> {
    let envelope: Envelope<Value> = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(_) if !(200..300).contains(&status) => {
            return Err(ApiError {
                endpoint: endpoint.to_owned(),
                code: status,
                subcode: 0,
                message: String::from_utf8_lossy(body).into_owned(),
            }
            .into());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("malformed {} response", endpoint));
        }
    };

    if !(200..300).contains(&envelope.meta.result_code) {
        return Err(ApiError {
            endpoint: endpoint.to_owned(),
            code: envelope.meta.result_code,
            subcode: envelope.meta.result_subcode,
            message: envelope.meta.result_msg,
        }
        .into());
    }

    let data = envelope
        .data
        .with_context(|| format!("{} returned no data", endpoint))?;
    serde_json::from_value(data).with_context(|| format!("unexpected {} payload", endpoint))
}

fn exact_name_pattern(name: &str) -> String {
    format!("^{}$", regex::escape(name))
}

fn artifact_key(index: usize) -> String {
    match index {
        0 => "data".to_owned(),
        i => format!("data_{:03}", i),
    }
}

fn ensure_http(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        anyhow::bail!("unsupported storage location {}", url)
    }
}
