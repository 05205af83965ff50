use crate::credentials::CredentialDirectory;
use crate::error::{Error, Result};
use crate::oci_registry::{AuthResolver, Credentials, Resource};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Pull secrets a workload referenced for a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSecretInfo {
    pub namespace: String,
    pub secrets: Vec<String>,
}

/// Registry credentials for the current run, resolved from the pull secrets workloads reference.
pub struct Keychain {
    pull_secrets: RwLock<HashMap<String, Arc<PullSecretInfo>>>,
    credentials: CredentialDirectory,
}

impl Keychain {
    pub fn new(credentials: CredentialDirectory) -> Self {
        Self {
            pull_secrets: RwLock::new(HashMap::new()),
            credentials,
        }
    }

    /// Records the pull secrets to try for `repository`, replacing earlier ones.
    pub fn associate(&self, repository: &str, namespace: &str, secrets: &[String]) {
        let info = Arc::new(PullSecretInfo {
            namespace: namespace.to_string(),
            secrets: secrets.to_vec(),
        });
        self.pull_secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(repository.to_string(), info);
    }

    pub fn pull_secrets(&self, repository: &str) -> Option<Arc<PullSecretInfo>> {
        self.pull_secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(repository)
            .cloned()
    }
}

impl AuthResolver for Keychain {
    async fn resolve(&self, resource: &Resource) -> Result<Credentials> {
        let Some(info) = self.pull_secrets(resource.repository()) else {
            debug!(
                "No image pull secrets for {}, using anonymous access",
                resource.repository()
            );
            return Ok(Credentials::Anonymous);
        };

        let registry = resource.registry();
        let namespace = info.namespace.as_str();
        let mut lookups: FuturesUnordered<_> = info
            .secrets
            .iter()
            .map(|secret| async move {
                (secret, self.credentials.get_auths(namespace, secret).await)
            })
            .collect();

        // Expect at most one of a workload's pull secrets to cover a registry
        let mut failure: Option<Error> = None;
        while let Some((secret, result)) = lookups.next().await {
            match result {
                Ok(auths) => {
                    if let Some(auth) = auths.find(registry) {
                        debug!(
                            "Using credentials from image pull secret {}/{} for registry {}",
                            namespace, secret, registry
                        );
                        return Ok(Credentials::Basic {
                            username: auth.username.clone(),
                            password: auth.password.clone(),
                        });
                    }
                }
                Err(e) => {
                    warn!("{}", e.chain());
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                debug!(
                    "No image pull secret of {} covers registry {}, using anonymous access",
                    resource.repository(),
                    registry
                );
                Ok(Credentials::Anonymous)
            }
        }
    }
}
