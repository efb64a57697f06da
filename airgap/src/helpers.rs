use std::path::Path;

use anyhow::{Context, Result};
use clearml::{DatasetStore, EntityId, TaskStore};
use log::info;
use time::OffsetDateTime;

pub use crate::manifest::add_to_manifest;

/// Project the exporter registers its own runs in.
pub const EXPORT_RUN_PROJECT: &str = "Exporting2Standalone";
/// Project the importer registers its own runs in.
pub const IMPORT_RUN_PROJECT: &str = "Deploying2Standalone";

/// Create a dataset from the files below `path`, upload it and finalize it.
///
/// Nothing is cleaned up if a step fails; the half-created dataset stays on the platform.
pub async fn add_dataset<S>(store: &S, project: &str, name: &str, path: &Path) -> Result<EntityId>
where
    S: DatasetStore + ?Sized,
{
    info!(
        "Creating dataset in project {}, name {}, files {}",
        project,
        name,
        path.display()
    );

    let id = store
        .create_dataset(project, name)
        .await
        .with_context(|| format!("failed to create dataset {}/{}", project, name))?;
    let files = store
        .add_files(&id, path)
        .await
        .with_context(|| format!("failed to add {} to dataset {}", path.display(), &id))?;
    store
        .upload_dataset(&id)
        .await
        .with_context(|| format!("failed to upload dataset {}", &id))?;
    store
        .finalize_dataset(&id)
        .await
        .with_context(|| format!("failed to finalize dataset {}", &id))?;

    info!("Dataset {} created with {} files", &id, files);
    Ok(id)
}

/// Record this run as a task named after today's date.
pub async fn register_run<S>(store: &S, project: &str) -> Result<EntityId>
where
    S: TaskStore + ?Sized,
{
    let name = OffsetDateTime::now_utc().date().to_string();
    let id = store
        .create_run_task(project, &name)
        .await
        .with_context(|| format!("failed to register run in {}", project))?;
    info!("Registered run {} as task {} in {}", &name, &id, project);
    Ok(id)
}

#[cfg(test)]
mod test {
    use std::fs;

    use clearml::{DatasetStore, InMemoryPlatform};

    use super::*;

    #[tokio::test]
    async fn add_dataset_creates_final_dataset() {
        let platform = InMemoryPlatform::new();
        let dir = tempdir::TempDir::new("helpers_dataset").unwrap();
        fs::create_dir_all(dir.path().join("images")).unwrap();
        fs::write(dir.path().join("images/a.png"), b"a").unwrap();

        let id = add_dataset(&platform, "mnist", "digits", dir.path())
            .await
            .unwrap();

        let record = platform.get_dataset(&id).await.unwrap();
        assert!(record.is_final);
        assert_eq!(record.name, "digits");
        assert_eq!(record.project, "mnist");
        assert_eq!(platform.dataset_files(&id).unwrap()["images/a.png"], b"a");
    }

    #[tokio::test]
    async fn add_dataset_fails_for_missing_folder() {
        let platform = InMemoryPlatform::new();
        let dir = tempdir::TempDir::new("helpers_missing").unwrap();

        let err = add_dataset(&platform, "mnist", "digits", &dir.path().join("nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to add"));
        // The empty dataset container is left behind.
        assert_eq!(platform.datasets().len(), 1);
        assert!(!platform.datasets()[0].is_final);
    }

    #[tokio::test]
    async fn register_run_creates_application_task() {
        let platform = InMemoryPlatform::new();
        let id = register_run(&platform, EXPORT_RUN_PROJECT).await.unwrap();

        let task = platform.task(&id).unwrap();
        assert_eq!(task.project, "Exporting2Standalone");
        assert_eq!(task.task_type, "application");
        assert_eq!(task.name, OffsetDateTime::now_utc().date().to_string());
    }
}
