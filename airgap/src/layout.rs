//! Where exported artifacts live on disk.

use std::path::{Path, PathBuf};

/// File name of the export manifest.
pub const DEPLOY_MANIFEST: &str = "deploy.json";
/// File name of the import manifest.
pub const IMPORT_MANIFEST: &str = "import.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub tasks: PathBuf,
    pub models: PathBuf,
    pub datasets: PathBuf,
}

impl Layout {
    /// Default `tasks/`, `models/` and `datasets/` folders below `root`.
    pub fn under(root: &Path) -> Self {
        Layout {
            tasks: root.join("tasks"),
            models: root.join("models"),
            datasets: root.join("datasets"),
        }
    }

    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.models.join(format!("{}.pt", model_id))
    }

    pub fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks.join(task_id)
    }

    pub fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.datasets.join(dataset_id)
    }
}
