//! Client for the experiment-tracking platform: tasks, models and datasets.

pub mod archive;
pub mod error;
pub mod memory;
pub mod rest;
pub mod store;
pub mod wire;

pub use error::ApiError;
pub use memory::InMemoryPlatform;
pub use rest::{RestPlatform, Settings};
pub use store::{
    DatasetRecord, DatasetStore, EntityId, ModelRecord, ModelRef, ModelStore, Platform,
    TaskDescription, TaskStore, UploadedModel,
};
