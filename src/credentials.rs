use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::secret_string::SecretString;
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub static DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
pub static DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// A pull secret reference, displayed as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DockerAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: SecretString,
}

/// Credentials parsed from one pull secret, keyed by registry host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerAuths(HashMap<String, DockerAuth>);

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

impl DockerAuths {
    /// Looks up the entry for a registry host, falling back to the host without its port.
    pub fn find(&self, registry: &str) -> Option<&DockerAuth> {
        self.0.get(registry).or_else(|| {
            registry
                .split_once(':')
                .and_then(|(host, _port)| self.0.get(host))
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, DockerAuth)> for DockerAuths {
    fn from_iter<I: IntoIterator<Item = (String, DockerAuth)>>(iter: I) -> Self {
        DockerAuths(iter.into_iter().collect())
    }
}

/// Parses a `.dockerconfigjson` payload.
///
/// Keys written as URLs, like `https://index.docker.io/v1/`, are reduced to their host.
pub fn parse_docker_config_json(data: &[u8]) -> serde_json::Result<DockerAuths> {
    let config: DockerConfig = serde_json::from_slice(data)?;
    Ok(config
        .auths
        .into_iter()
        .map(|(registry, auth)| (normalize_registry_key(&registry).to_string(), auth))
        .collect())
}

fn normalize_registry_key(key: &str) -> &str {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    without_scheme
        .split_once('/')
        .map_or(without_scheme, |(host, _path)| host)
}

/// Pull secret contents for the current run, each secret read and parsed at most once.
pub struct CredentialDirectory {
    auths: Loader<SecretRef, Arc<DockerAuths>>,
}

impl CredentialDirectory {
    pub fn new<C: Cluster>(cluster: Arc<C>, cancel: CancellationToken) -> Self {
        let auths = Loader::new(
            move |secret: SecretRef| {
                let cluster = cluster.clone();
                async move { fetch_auths(cluster.as_ref(), secret).await }
            },
            None,
            cancel,
        );
        Self { auths }
    }

    pub async fn get_auths(&self, namespace: &str, secret_name: &str) -> Result<Arc<DockerAuths>> {
        self.auths
            .load(&SecretRef::new(namespace, secret_name))
            .await
    }
}

async fn fetch_auths<C: Cluster>(cluster: &C, secret_ref: SecretRef) -> Result<Arc<DockerAuths>> {
    debug!("Fetching image pull secret {}", secret_ref);
    let secret = cluster
        .get_secret(&secret_ref.namespace, &secret_ref.name)
        .await
        .map_err(|e| Error::SecretFetchFailed {
            secret: secret_ref.clone(),
            source: Arc::new(e),
        })?;

    let auths = parse_secret(&secret_ref, &secret)?;
    info!(
        "Loaded {} registry credentials from image pull secret {}",
        auths.len(),
        secret_ref
    );
    Ok(Arc::new(auths))
}

fn parse_secret(secret_ref: &SecretRef, secret: &Secret) -> Result<DockerAuths> {
    if secret.type_.as_deref() != Some(DOCKER_CONFIG_JSON_TYPE) {
        debug!(
            "Image pull secret {} has type {:?} instead of {}",
            secret_ref, secret.type_, DOCKER_CONFIG_JSON_TYPE
        );
    }

    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(DOCKER_CONFIG_JSON_KEY))
        .ok_or_else(|| Error::NotDockerConfigSecret {
            secret: secret_ref.clone(),
        })?;

    parse_docker_config_json(&data.0).map_err(|e| Error::MalformedDockerConfig {
        secret: secret_ref.clone(),
        source: Arc::new(e),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::tests::FakeCluster;
    use k8s_openapi::ByteString;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    pub(crate) fn docker_config_secret(namespace: &str, name: &str, config: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(config.as_bytes().to_vec()),
        );
        Secret {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_docker_config_json() {
        let auths = parse_docker_config_json(
            br#"{"auths":{"registry.example.com":{"username":"u","password":"p"}}}"#,
        )
        .unwrap();
        let auth = auths.find("registry.example.com").unwrap();
        assert_eq!(auth.username, "u");
        assert_eq!(auth.password.expose_secret(), "p");
    }

    #[test]
    fn test_parse_docker_config_json_normalizes_url_keys() {
        let auths = parse_docker_config_json(
            br#"{"auths":{"https://index.docker.io/v1/":{"username":"hub","password":"pw"}}}"#,
        )
        .unwrap();
        assert_eq!(auths.find("index.docker.io").unwrap().username, "hub");
    }

    #[test]
    fn test_parse_docker_config_json_without_auths() {
        let auths = parse_docker_config_json(br#"{"credsStore":"desktop"}"#).unwrap();
        assert!(auths.is_empty());
    }

    #[test]
    fn test_parse_docker_config_json_rejects_invalid_json() {
        assert!(parse_docker_config_json(b"{not json").is_err());
        assert!(parse_docker_config_json(br#"{"auths":{"r.io":{"username":1}}}"#).is_err());
    }

    #[test]
    fn test_find_falls_back_to_host_without_port() {
        let auths = parse_docker_config_json(
            br#"{"auths":{"registry.example.com":{"username":"u","password":"p"}}}"#,
        )
        .unwrap();
        assert!(auths.find("registry.example.com:5000").is_some());
        assert!(auths.find("other.example.com").is_none());
    }

    #[tokio::test]
    async fn test_get_auths_fetches_each_secret_once() {
        let cluster = Arc::new(FakeCluster::default().with_secret(docker_config_secret(
            "ns",
            "reg-cred",
            r#"{"auths":{"registry.example.com":{"username":"u","password":"p"}}}"#,
        )));
        let directory = CredentialDirectory::new(cluster.clone(), CancellationToken::new());

        let (first, second) = tokio::join!(
            directory.get_auths("ns", "reg-cred"),
            directory.get_auths("ns", "reg-cred")
        );
        let third = directory.get_auths("ns", "reg-cred").await.unwrap();

        assert_eq!(first.unwrap(), third);
        assert_eq!(second.unwrap().find("registry.example.com").unwrap().username, "u");
        assert_eq!(cluster.secret_gets(), vec!["ns/reg-cred".to_string()]);
    }

    #[tokio::test]
    async fn test_get_auths_missing_secret() {
        let cluster = Arc::new(FakeCluster::default());
        let directory = CredentialDirectory::new(cluster, CancellationToken::new());

        let err = directory.get_auths("ns", "missing").await.unwrap_err();
        assert!(matches!(err, Error::SecretFetchFailed { ref secret, .. } if secret.to_string() == "ns/missing"));
    }

    #[tokio::test]
    async fn test_get_auths_secret_without_docker_config_key() {
        let mut secret = docker_config_secret("ns", "opaque", "{}");
        secret.type_ = Some("Opaque".to_string());
        secret.data = Some(BTreeMap::new());
        let cluster = Arc::new(FakeCluster::default().with_secret(secret));
        let directory = CredentialDirectory::new(cluster, CancellationToken::new());

        let err = directory.get_auths("ns", "opaque").await.unwrap_err();
        assert!(matches!(err, Error::NotDockerConfigSecret { .. }));
    }

    #[tokio::test]
    async fn test_get_auths_wrong_type_with_docker_config_key_is_accepted() {
        let mut secret = docker_config_secret(
            "ns",
            "opaque",
            r#"{"auths":{"registry.example.com":{"username":"u","password":"p"}}}"#,
        );
        secret.type_ = Some("Opaque".to_string());
        let cluster = Arc::new(FakeCluster::default().with_secret(secret));
        let directory = CredentialDirectory::new(cluster, CancellationToken::new());

        let auths = directory.get_auths("ns", "opaque").await.unwrap();
        assert_eq!(auths.len(), 1);
    }

    #[tokio::test]
    async fn test_get_auths_malformed_config_is_retried() {
        let cluster = Arc::new(FakeCluster::default().with_secret(docker_config_secret(
            "ns",
            "broken",
            "{not json",
        )));
        let directory = CredentialDirectory::new(cluster.clone(), CancellationToken::new());

        let err = directory.get_auths("ns", "broken").await.unwrap_err();
        assert!(matches!(err, Error::MalformedDockerConfig { .. }));
        assert!(directory.get_auths("ns", "broken").await.is_err());
        assert_eq!(cluster.secret_gets().len(), 2);
    }
}
