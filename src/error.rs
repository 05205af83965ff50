use crate::credentials::SecretRef;
use crate::image_reference::ParseError;
use crate::oci_registry::RegistryError;
use std::sync::Arc;

/// Failures of a refresh run.
///
/// Sources are shared behind `Arc` so a single in-flight lookup can hand the same
/// error to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to the Kubernetes API server")]
    ClusterConnectionFailed(#[source] Arc<kube::Error>),

    #[error("failed to list pods")]
    ListingFailed(#[source] Arc<kube::Error>),

    #[error("failed to get image pull secret {secret}")]
    SecretFetchFailed {
        secret: SecretRef,
        #[source]
        source: Arc<kube::Error>,
    },

    #[error("secret {secret} does not contain a .dockerconfigjson key")]
    NotDockerConfigSecret { secret: SecretRef },

    #[error("failed to parse docker config json from secret {secret}")]
    MalformedDockerConfig {
        secret: SecretRef,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error("failed to parse image reference {image}")]
    InvalidImageReference {
        image: String,
        #[source]
        source: ParseError,
    },

    #[error("failed to get image descriptor for {image}")]
    RegistryFetchFailed {
        image: String,
        #[source]
        source: Arc<RegistryError>,
    },

    #[error("failed to delete pod {namespace}/{name}")]
    DeletionFailed {
        namespace: String,
        name: String,
        #[source]
        source: Arc<kube::Error>,
    },

    #[error("run was cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Renders the error followed by its sources, `outer: inner: root`.
    pub fn chain(&self) -> String {
        format!("{:#}", anyhow::Error::new(self.clone()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
