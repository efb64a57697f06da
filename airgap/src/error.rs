use std::fmt;

/// Inconsistencies between a manifest, the serving configuration and the files on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// The serving service has no `endpoints` configuration object.
    NoEndpoints { serving_id: String },
    /// The `endpoints` configuration object is not a JSON object of endpoints.
    MalformedEndpoints { serving_id: String, reason: String },
    /// An endpoint does not reference a model.
    MissingEndpointModel { endpoint: String },
    /// A task references a dataset the deploy manifest has no details for.
    UnknownDataset { task: String, dataset: String },
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEndpoints { serving_id } => {
                write!(f, "serving service {} has no endpoints configuration", serving_id)
            }
            Self::MalformedEndpoints { serving_id, reason } => write!(
                f,
                "endpoints configuration of serving service {} is malformed: {}",
                serving_id, reason
            ),
            Self::MissingEndpointModel { endpoint } => {
                write!(f, "endpoint {} does not reference a model", endpoint)
            }
            Self::UnknownDataset { task, dataset } => write!(
                f,
                "dataset {} used by task {} is missing from the deploy manifest",
                dataset, task
            ),
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
