use crate::cluster::Cluster;
use crate::credentials::CredentialDirectory;
use crate::error::{Error, Result};
use crate::image_reference::{ImageReference, repository_key};
use crate::keychain::Keychain;
use crate::loader::Loader;
use crate::oci_registry::{Platform, Registry, RegistryError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Latest registry digests for the images of the current run.
///
/// Each image is looked up once; concurrent callers share the lookup. Pull secrets
/// passed along with an image are remembered for its repository and used to
/// authenticate any later lookup of that repository, whatever the tag.
pub struct Repo {
    keychain: Arc<Keychain>,
    digests: Loader<String, String>,
}

impl Repo {
    pub fn new<C: Cluster, R: Registry>(
        cluster: Arc<C>,
        registry: Arc<R>,
        platform: Platform,
        digest_ttl: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let credentials = CredentialDirectory::new(cluster, cancel.clone());
        let keychain = Arc::new(Keychain::new(credentials));

        let fetcher_keychain = keychain.clone();
        let digests = Loader::new(
            move |image: String| {
                let registry = registry.clone();
                let keychain = fetcher_keychain.clone();
                let platform = platform.clone();
                async move { fetch_digest(registry.as_ref(), &keychain, &platform, image).await }
            },
            digest_ttl,
            cancel,
        );

        Self { keychain, digests }
    }

    /// Returns the hex part of the latest digest the registry publishes for `image`.
    pub async fn get_image_digest(
        &self,
        image: &str,
        namespace: &str,
        pull_secrets: &[String],
    ) -> Result<String> {
        if !pull_secrets.is_empty() {
            self.keychain
                .associate(repository_key(image), namespace, pull_secrets);
        }
        self.digests.load(&image.to_string()).await
    }
}

async fn fetch_digest<R: Registry>(
    registry: &R,
    keychain: &Keychain,
    platform: &Platform,
    image: String,
) -> Result<String> {
    let reference = ImageReference::parse(&image).map_err(|e| Error::InvalidImageReference {
        image: image.clone(),
        source: e,
    })?;

    let digest = registry
        .fetch_digest(&reference, keychain, platform)
        .await
        .map_err(|e| match e {
            RegistryError::Authentication(e) => e,
            e => Error::RegistryFetchFailed {
                image: image.clone(),
                source: Arc::new(e),
            },
        })?;

    info!("Found latest image digest {} for image {}", digest, image);
    Ok(digest_hex(&digest).to_string())
}

/// `sha256:abc` -> `abc`
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}
