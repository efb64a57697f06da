//! Move a served model, the tasks that produced it and their datasets from a development
//! platform to an air-gapped standalone one, through a folder carried across by hand.

pub mod config;
pub mod error;
pub mod export;
pub mod helpers;
pub mod import;
pub mod layout;
pub mod manifest;

#[cfg(test)]
mod fixtures;

#[cfg(test)]
mod test {
    use clearml::InMemoryPlatform;

    use crate::{
        export::{export_from_development, DatasetScope, ExportOptions},
        fixtures,
        import::{import_to_standalone, DatasetRecording, ImportOptions},
        layout::{Layout, DEPLOY_MANIFEST, IMPORT_MANIFEST},
        manifest::{self, ImportManifest},
    };

    #[tokio::test]
    async fn export_then_import() {
        let development = InMemoryPlatform::new();
        fixtures::development(&development);
        let dir = tempdir::TempDir::new("airgap").unwrap();

        let deploy = export_from_development(
            &development,
            &ExportOptions {
                serving_id: fixtures::SERVING_ID.to_owned(),
                developer: "dev".to_owned(),
                scope: DatasetScope::FirstTask,
                root: dir.path().to_path_buf(),
            },
        )
        .await
        .unwrap();
        assert_eq!(deploy.tasks.len(), 1);
        assert_eq!(deploy.tasks[0].datasets, vec!["d1", "d2"]);

        let standalone = InMemoryPlatform::new();
        let import_info = dir.path().join(IMPORT_MANIFEST);
        let imported = import_to_standalone(
            &standalone,
            &ImportOptions {
                deploy_info: dir.path().join(DEPLOY_MANIFEST),
                layout: Layout::under(dir.path()),
                output_uri: "http://files.standalone:8081".to_owned(),
                importer: "ops".to_owned(),
                recording: DatasetRecording::LastOnly,
                import_info: import_info.clone(),
            },
        )
        .await
        .unwrap();

        assert_eq!(imported.importer, "ops");
        assert_eq!(imported.imported_task.len(), 1);
        assert_eq!(imported.imported_model.len(), 1);
        assert_eq!(imported.imported_dataset.len(), 1);

        let task_mapping = imported.imported_task.values().next().unwrap();
        assert_eq!(task_mapping.development_task_id, "t1");
        let model_mapping = imported.imported_model.values().next().unwrap();
        assert_eq!(model_mapping.development_model_id, "m1");
        let dataset_mapping = imported.imported_dataset.values().next().unwrap();
        assert_eq!(dataset_mapping.development_dataset_id, "d2");

        let task = standalone.task(&task_mapping.standalone_task_id).unwrap();
        assert_eq!(task.datasets.len(), 2);
        assert_eq!(task.models.output.len(), 1);
        assert_eq!(task.models.output[0].name, "best");
        assert_eq!(task.models.output[0].model, model_mapping.standalone_model_id);

        let model = standalone.model(&model_mapping.standalone_model_id).unwrap();
        assert_eq!(&standalone.blob(&model.url).unwrap()[..], b"mnist-weights");

        let files = standalone
            .dataset_files(&dataset_mapping.standalone_dataset_id)
            .unwrap();
        assert_eq!(files["train/0.png"], b"d2-0".to_vec());

        let written: ImportManifest = manifest::load(&import_info).await.unwrap();
        assert_eq!(written, imported);
    }

    #[tokio::test]
    async fn importing_twice_creates_fresh_copies() {
        let development = InMemoryPlatform::new();
        fixtures::development(&development);
        let dir = tempdir::TempDir::new("airgap_twice").unwrap();
        export_from_development(
            &development,
            &ExportOptions {
                serving_id: fixtures::SERVING_ID.to_owned(),
                developer: String::new(),
                scope: DatasetScope::FirstTask,
                root: dir.path().to_path_buf(),
            },
        )
        .await
        .unwrap();

        let standalone = InMemoryPlatform::new();
        let options = ImportOptions {
            deploy_info: dir.path().join(DEPLOY_MANIFEST),
            layout: Layout::under(dir.path()),
            output_uri: "http://files.standalone:8081".to_owned(),
            importer: String::new(),
            recording: DatasetRecording::LastOnly,
            import_info: dir.path().join(IMPORT_MANIFEST),
        };

        let first = import_to_standalone(&standalone, &options).await.unwrap();
        let second = import_to_standalone(&standalone, &options).await.unwrap();

        let first_task = first.imported_task.keys().next().unwrap();
        let second_task = second.imported_task.keys().next().unwrap();
        assert_ne!(first_task, second_task);
        assert_ne!(
            first.imported_model.keys().next(),
            second.imported_model.keys().next()
        );

        let copies: Vec<_> = standalone
            .tasks()
            .into_iter()
            .filter(|t| t.name == "train")
            .collect();
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().all(|t| t.datasets.len() == 2));
        assert_eq!(standalone.datasets().len(), 4);
        assert_eq!(standalone.models().len(), 2);
    }
}
