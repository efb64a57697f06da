//! Request and response bodies of the platform's JSON API, exactly as they go over the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::{ConfigurationItem, ParamItem, Script, TaskModels};

/// Every API response is wrapped in this envelope, successful or not.
#[derive(Deserialize, Debug)]
pub struct Envelope<T> {
    pub meta: Meta,
    pub data: Option<T>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Meta {
    pub result_code: u16,
    #[serde(default)]
    pub result_subcode: u32,
    #[serde(default)]
    pub result_msg: String,
}

#[derive(Deserialize, Debug)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Deserialize, Debug)]
pub struct CreatedResponse {
    pub id: String,
}

#[derive(Serialize, Debug)]
pub struct TaskRequest<'a> {
    pub task: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct GetTaskResponse {
    pub task: ApiTask,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ApiTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub script: Option<Script>,
    #[serde(default)]
    pub hyperparams: BTreeMap<String, BTreeMap<String, ParamItem>>,
    #[serde(default)]
    pub configuration: BTreeMap<String, ConfigurationItem>,
    #[serde(default)]
    pub models: Option<TaskModels>,
    #[serde(default)]
    pub runtime: Map<String, Value>,
    #[serde(default)]
    pub execution: Option<Execution>,
}

impl ApiTask {
    /// Dataset ids recorded under `runtime.datasets`. Anything but a list of strings there is
    /// an error rather than an empty or shortened list.
    pub fn datasets(&self) -> anyhow::Result<Vec<String>> {
        let ids = match self.runtime.get("datasets") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(ids)) => ids,
            Some(other) => anyhow::bail!(
                "task {} has malformed runtime.datasets: {}",
                &self.id,
                other
            ),
        };

        ids.iter()
            .map(|id| {
                id.as_str().map(str::to_owned).ok_or_else(|| {
                    anyhow::anyhow!("task {} has non-string dataset id {}", &self.id, id)
                })
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Execution {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub mode: String,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct CreateTaskRequest<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<&'a str>,
    #[serde(rename = "type")]
    pub task_type: &'a str,
    pub comment: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub system_tags: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<&'a Script>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hyperparams: Option<&'a BTreeMap<String, BTreeMap<String, ParamItem>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<&'a BTreeMap<String, ConfigurationItem>>,
}

#[derive(Serialize, Debug)]
pub struct EditTaskRequest<'a> {
    pub task: &'a str,
    pub force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hyperparams: Option<&'a BTreeMap<String, BTreeMap<String, ParamItem>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<&'a BTreeMap<String, ConfigurationItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<&'a Map<String, Value>>,
}

#[derive(Serialize, Debug)]
pub struct CompletedRequest<'a> {
    pub task: &'a str,
    pub force: bool,
    pub status_reason: &'a str,
}

#[derive(Serialize, Debug)]
pub struct AddOrUpdateModelRequest<'a> {
    pub task: &'a str,
    pub name: &'a str,
    pub model: &'a str,
    #[serde(rename = "type")]
    pub model_type: &'a str,
}

#[derive(Serialize, Debug)]
pub struct AddOrUpdateArtifactsRequest<'a> {
    pub task: &'a str,
    pub artifacts: Vec<Artifact>,
}

#[derive(Serialize, Debug)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct GetModelResponse {
    pub model: ApiModel,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct CreateModelRequest<'a> {
    pub uri: &'a str,
    pub name: &'a str,
    pub task: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<&'a str>,
    pub ready: bool,
}

#[derive(Serialize, Debug)]
pub struct ProjectRequest<'a> {
    pub project: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct GetProjectResponse {
    pub project: ApiProject,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiProject {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Debug)]
pub struct GetAllProjectsRequest<'a> {
    /// Regular expression matched against project names.
    pub name: &'a str,
    pub only_fields: [&'a str; 2],
}

#[derive(Deserialize, Debug)]
pub struct GetAllProjectsResponse {
    #[serde(default)]
    pub projects: Vec<ApiProject>,
}

#[derive(Serialize, Debug)]
pub struct CreateProjectRequest<'a> {
    pub name: &'a str,
    pub description: &'a str,
}
