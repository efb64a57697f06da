//! A small development environment seeded into an [InMemoryPlatform] for tests.

use clearml::{InMemoryPlatform, ModelRecord, ModelRef, TaskDescription};
use serde_json::{json, Map, Value};

pub const SERVING_ID: &str = "5e7d0a3f2b8c4d1e9f6a7b8c9d0e1f2a";

pub fn model_url(model_id: &str) -> String {
    format!("http://files.dev:8081/vision/train.t1/models/{}.pt", model_id)
}

/// A serving service whose endpoints map endpoint names to model ids.
pub fn serving(platform: &InMemoryPlatform, id: &str, endpoints: &[(&str, &str)]) {
    platform.add_task(TaskDescription {
        id: id.to_owned(),
        name: "serving".to_owned(),
        project: "DevOps".to_owned(),
        task_type: "service".to_owned(),
        status: "in_progress".to_owned(),
        ..Default::default()
    });

    let config: Map<String, Value> = endpoints
        .iter()
        .map(|(endpoint, model_id)| {
            (
                (*endpoint).to_owned(),
                json!({
                    "engine_type": "triton",
                    "serving_url": endpoint,
                    "model_id": model_id,
                    "version": "",
                }),
            )
        })
        .collect();
    platform.set_configuration(id, "endpoints", &Value::Object(config).to_string());
}

pub fn model_record(model_id: &str, task_id: &str) -> ModelRecord {
    ModelRecord {
        id: model_id.to_owned(),
        name: "train".to_owned(),
        url: model_url(model_id),
        task: Some(task_id.to_owned()),
        project: "vision".to_owned(),
    }
}

pub fn model(platform: &InMemoryPlatform, model_id: &str, task_id: &str, weights: &[u8]) {
    platform.add_model(model_record(model_id, task_id), weights.to_vec());
}

pub fn training_task(id: &str, outputs: &[(&str, &str)], datasets: &[&str]) -> TaskDescription {
    TaskDescription {
        id: id.to_owned(),
        name: "train".to_owned(),
        project: "vision".to_owned(),
        task_type: "training".to_owned(),
        comment: "trains the digit classifier".to_owned(),
        status: "completed".to_owned(),
        models: clearml::store::TaskModels {
            input: vec![],
            output: outputs
                .iter()
                .map(|(name, model)| ModelRef {
                    name: (*name).to_owned(),
                    model: (*model).to_owned(),
                })
                .collect(),
        },
        datasets: datasets.iter().map(|d| (*d).to_owned()).collect(),
        ..Default::default()
    }
}

/// A dataset in project `mnist` holding `train/0.png` and `labels.csv`.
pub fn dataset(platform: &InMemoryPlatform, id: &str, name: &str, is_final: bool) {
    let image = format!("{}-0", id);
    let labels = format!("0,{}\n", name);
    platform.add_dataset(
        id,
        name,
        &format!("mnist/.datasets/{}", name),
        is_final,
        &[
            ("train/0.png", image.as_bytes()),
            ("labels.csv", labels.as_bytes()),
        ],
    );
}

/// One endpoint → one model → one task → two datasets, one of them not yet finalized.
pub fn development(platform: &InMemoryPlatform) {
    serving(platform, SERVING_ID, &[("mnist", "m1")]);
    model(platform, "m1", "t1", b"mnist-weights");
    platform.add_task(training_task("t1", &[("best", "m1")], &["d1", "d2"]));
    dataset(platform, "d1", "digits-train", true);
    dataset(platform, "d2", "digits-test", false);
}
