use crate::config::RegistryConfig;
use crate::error::Error;
use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use anyhow::Context;
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::future::Future;
use std::sync::LazyLock;
use tracing::{debug, info};

static MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";
static DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
static CHALLENGE_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_]+)="([^"]*)""#).expect("challenge parameter pattern is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to send request to {url}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("registry {registry} returned error status {status} for {url}")]
    Status {
        registry: String,
        status: StatusCode,
        url: String,
    },

    #[error("registry {registry} sent an unsupported authentication challenge: {challenge}")]
    UnsupportedChallenge { registry: String, challenge: String },

    #[error("token endpoint {realm} did not return a token")]
    MissingToken { realm: String },

    #[error("response does not contain HTTP header Docker-Content-Digest")]
    MissingDigest,

    #[error("failed to parse manifest")]
    Manifest(#[source] serde_json::Error),

    #[error("manifest list does not contain an image for platform {0}")]
    PlatformNotFound(Platform),

    #[error("failed to resolve registry credentials")]
    Authentication(#[source] Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Repository a registry request is authenticated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    registry: String,
    repository: String,
}

impl Resource {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
        }
    }

    pub fn for_image(image: &ImageReference) -> Self {
        Self::new(&image.registry, &image.name)
    }

    /// Registry host, e.g. `registry.example.com:5000`.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Image name as written by the workload, without tag or digest.
    pub fn repository(&self) -> &str {
        &self.repository
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic {
        username: String,
        password: SecretString,
    },
}

impl Credentials {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::Anonymous => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
        }
    }
}

/// Looks up the credentials to present to a registry for a repository.
pub trait AuthResolver: Send + Sync {
    fn resolve(
        &self,
        resource: &Resource,
    ) -> impl Future<Output = Result<Credentials, Error>> + Send;
}

/// Resolves the current digest published for an image reference.
pub trait Registry: Send + Sync + 'static {
    /// Returns the manifest digest, `<algorithm>:<hex>`, of the image's tag.
    fn fetch_digest<A: AuthResolver>(
        &self,
        image: &ImageReference,
        auth: &A,
        platform: &Platform,
    ) -> impl Future<Output = Result<String, RegistryError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ManifestIndex {
    #[serde(default)]
    manifests: Option<Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        let params: HashMap<String, String> = CHALLENGE_PARAM
            .captures_iter(params)
            .map(|caps| (caps[1].to_ascii_lowercase(), caps[2].to_string()))
            .collect();

        if scheme.eq_ignore_ascii_case("basic") {
            Some(Challenge::Basic)
        } else if scheme.eq_ignore_ascii_case("bearer") {
            Some(Challenge::Bearer {
                realm: params.get("realm")?.clone(),
                service: params.get("service").cloned(),
                scope: params.get("scope").cloned(),
            })
        } else {
            None
        }
    }
}

enum Authorization {
    None,
    Basic,
    Bearer(SecretString),
}

pub struct OciRegistryClient {
    http: Client,
    insecure_registries: HashSet<String>,
}

pub fn create_client(config: &RegistryConfig) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in &config.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

impl OciRegistryClient {
    pub fn new(config: &RegistryConfig) -> anyhow::Result<Self> {
        Ok(Self::with_client(
            create_client(config)?,
            config.insecure_registries.iter().cloned(),
        ))
    }

    pub fn with_client(http: Client, insecure_registries: impl IntoIterator<Item = String>) -> Self {
        Self {
            http,
            insecure_registries: insecure_registries.into_iter().collect(),
        }
    }

    fn scheme(&self, image: &ImageReference) -> &'static str {
        if self.insecure_registries.contains(&image.registry) {
            "http"
        } else {
            "https"
        }
    }

    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        url: &str,
        credentials: &Credentials,
        authorization: &Authorization,
    ) -> Result<Response, RegistryError> {
        debug!("Fetching manifest for {} from URL {}", image, url);
        let mut request = self.http.get(url).header(ACCEPT, MANIFEST_ACCEPT);
        request = match authorization {
            Authorization::None => request,
            Authorization::Basic => credentials.apply(request),
            Authorization::Bearer(token) => request.bearer_auth(token.expose_secret()),
        };
        request.send().await.map_err(|e| RegistryError::Request {
            url: url.to_string(),
            source: e,
        })
    }

    async fn authorize(
        &self,
        image: &ImageReference,
        challenge: &str,
        credentials: &Credentials,
    ) -> Result<Authorization, RegistryError> {
        match Challenge::parse(challenge) {
            Some(Challenge::Basic) => Ok(Authorization::Basic),
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let scope =
                    scope.unwrap_or_else(|| format!("repository:{}:pull", image.repository));
                let mut query = vec![("scope", scope)];
                if let Some(service) = service {
                    query.push(("service", service));
                }

                debug!("Requesting registry token from {}", realm);
                let request = credentials.apply(self.http.get(&realm).query(&query));
                let response = request.send().await.map_err(|e| RegistryError::Request {
                    url: realm.clone(),
                    source: e,
                })?;
                if !response.status().is_success() {
                    return Err(RegistryError::Status {
                        registry: image.registry.clone(),
                        status: response.status(),
                        url: realm,
                    });
                }

                let token: TokenResponse =
                    response.json().await.map_err(|e| RegistryError::Request {
                        url: realm.clone(),
                        source: e,
                    })?;
                token
                    .token
                    .or(token.access_token)
                    .filter(|token| !token.is_empty())
                    .map(|token| Authorization::Bearer(SecretString::new(token)))
                    .ok_or(RegistryError::MissingToken { realm })
            }
            None => Err(RegistryError::UnsupportedChallenge {
                registry: image.registry.clone(),
                challenge: challenge.to_string(),
            }),
        }
    }
}

impl Registry for OciRegistryClient {
    async fn fetch_digest<A: AuthResolver>(
        &self,
        image: &ImageReference,
        auth: &A,
        platform: &Platform,
    ) -> Result<String, RegistryError> {
        let credentials = auth
            .resolve(&Resource::for_image(image))
            .await
            .map_err(RegistryError::Authentication)?;

        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme(image),
            image.api_host(),
            image.repository,
            image.reference()
        );

        let mut response = self
            .fetch_manifest(image, &url, &credentials, &Authorization::None)
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let authorization = self.authorize(image, &challenge, &credentials).await?;
            response = self
                .fetch_manifest(image, &url, &credentials, &authorization)
                .await?;
        }

        if !response.status().is_success() {
            return Err(RegistryError::Status {
                registry: image.registry.clone(),
                status: response.status(),
                url,
            });
        }

        let digest = get_digest_from_response(&response)?;
        let body = response.bytes().await.map_err(|e| RegistryError::Request {
            url: url.clone(),
            source: e,
        })?;
        ensure_platform(&body, platform)?;

        debug!("Found image digest {} for {}", digest, image);
        Ok(digest)
    }
}

fn get_digest_from_response(response: &Response) -> Result<String, RegistryError> {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|value| value.to_str().ok())
        .filter(|digest| digest.contains(':'))
        .map(str::to_string)
        .ok_or(RegistryError::MissingDigest)
}

/// Fails when the manifest is an index without an image for `platform`.
fn ensure_platform(body: &[u8], platform: &Platform) -> Result<(), RegistryError> {
    let index: ManifestIndex = serde_json::from_slice(body).map_err(RegistryError::Manifest)?;
    match index.manifests {
        Some(entries) if !entries.iter().any(|entry| entry.platform.as_ref() == Some(platform)) => {
            Err(RegistryError::PlatformNotFound(platform.clone()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, HeaderValue, StatusCode as AxumStatus, header};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::get;
    use std::sync::{Arc, Mutex};

    const IMAGE_MANIFEST: &str =
        r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","layers":[]}"#;
    const MULTI_ARCH_INDEX: &str = r#"{"schemaVersion":2,"manifests":[
        {"digest":"sha256:111","platform":{"architecture":"amd64","os":"linux"}},
        {"digest":"sha256:222","platform":{"architecture":"arm64","os":"linux"}}]}"#;
    const ARM_ONLY_INDEX: &str = r#"{"schemaVersion":2,"manifests":[
        {"digest":"sha256:222","platform":{"architecture":"arm64","os":"linux"}}]}"#;

    struct StaticAuth {
        credentials: Credentials,
        resolved: Mutex<Vec<Resource>>,
    }

    impl StaticAuth {
        fn new(credentials: Credentials) -> Self {
            Self {
                credentials,
                resolved: Mutex::new(Vec::new()),
            }
        }
    }

    impl AuthResolver for StaticAuth {
        async fn resolve(&self, resource: &Resource) -> Result<Credentials, Error> {
            self.resolved.lock().unwrap().push(resource.clone());
            Ok(self.credentials.clone())
        }
    }

    struct FailingAuth;

    impl AuthResolver for FailingAuth {
        async fn resolve(&self, _resource: &Resource) -> Result<Credentials, Error> {
            Err(Error::Cancelled)
        }
    }

    #[derive(Clone)]
    struct RegistryState {
        auth: &'static str,
        body: &'static str,
        addr: Arc<Mutex<String>>,
    }

    fn manifest_response(body: &'static str) -> AxumResponse {
        (
            [(DOCKER_CONTENT_DIGEST, "sha256:abc123")],
            body.to_string(),
        )
            .into_response()
    }

    fn unauthorized(challenge: String) -> AxumResponse {
        let mut response = AxumStatus::UNAUTHORIZED.into_response();
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_str(&challenge).unwrap(),
        );
        response
    }

    async fn manifest(State(registry): State<RegistryState>, headers: HeaderMap) -> AxumResponse {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        match (registry.auth, authorization) {
            ("none", _) => manifest_response(registry.body),
            // "u:p"
            ("basic", Some("Basic dTpw")) => manifest_response(registry.body),
            ("basic", _) => unauthorized(r#"Basic realm="fake""#.to_string()),
            ("bearer", Some("Bearer t0ken")) => manifest_response(registry.body),
            ("bearer", _) => unauthorized(format!(
                r#"Bearer realm="http://{}/token",service="fake-registry""#,
                registry.addr.lock().unwrap()
            )),
            _ => AxumStatus::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    async fn token(
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> AxumResponse {
        let authorized = headers
            .get(header::AUTHORIZATION)
            .is_some_and(|value| value == "Basic dTpw");
        let scoped = query.get("scope").map(String::as_str) == Some("repository:team/app:pull")
            && query.get("service").map(String::as_str) == Some("fake-registry");
        if authorized && scoped {
            axum::Json(serde_json::json!({ "token": "t0ken" })).into_response()
        } else {
            AxumStatus::FORBIDDEN.into_response()
        }
    }

    async fn serve(auth: &'static str, body: &'static str) -> (String, OciRegistryClient) {
        let state = RegistryState {
            auth,
            body,
            addr: Arc::new(Mutex::new(String::new())),
        };
        let app = Router::new()
            .route("/v2/team/app/manifests/{reference}", get(manifest))
            .route("/token", get(token))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        *state.addr.lock().unwrap() = addr.clone();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = OciRegistryClient::with_client(Client::new(), [addr.clone()]);
        (addr, client)
    }

    fn basic(username: &str, password: &str) -> Credentials {
        Credentials::Basic {
            username: username.to_string(),
            password: SecretString::new(password),
        }
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
        );
        assert_eq!(
            challenge,
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/nginx:pull".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_basic_and_unknown_challenges() {
        assert_eq!(Challenge::parse(r#"Basic realm="Registry""#), Some(Challenge::Basic));
        assert_eq!(Challenge::parse("Negotiate"), None);
        assert_eq!(Challenge::parse("Bearer service=\"x\""), None);
    }

    #[test]
    fn test_parse_challenges_back_to_back() {
        for (header, realm, scope) in [
            (r#"Bearer realm="https://a.example.com/token",scope="repository:a:pull""#, "https://a.example.com/token", "repository:a:pull"),
            (r#"bearer Scope="repository:b:pull", Realm="https://b.example.com/token""#, "https://b.example.com/token", "repository:b:pull"),
        ] {
            assert_eq!(
                Challenge::parse(header),
                Some(Challenge::Bearer {
                    realm: realm.to_string(),
                    service: None,
                    scope: Some(scope.to_string()),
                })
            );
        }
    }

    #[test]
    fn test_ensure_platform() {
        let platform = Platform::default();
        assert!(ensure_platform(IMAGE_MANIFEST.as_bytes(), &platform).is_ok());
        assert!(ensure_platform(MULTI_ARCH_INDEX.as_bytes(), &platform).is_ok());
        assert!(matches!(
            ensure_platform(ARM_ONLY_INDEX.as_bytes(), &platform),
            Err(RegistryError::PlatformNotFound(_))
        ));
        assert!(matches!(
            ensure_platform(b"not json", &platform),
            Err(RegistryError::Manifest(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_digest_anonymous() {
        let (addr, client) = serve("none", IMAGE_MANIFEST).await;
        let image = ImageReference::parse(&format!("{}/team/app:latest", addr)).unwrap();
        let auth = StaticAuth::new(Credentials::Anonymous);

        let digest = client
            .fetch_digest(&image, &auth, &Platform::default())
            .await
            .unwrap();

        assert_eq!(digest, "sha256:abc123");
        assert_eq!(
            auth.resolved.lock().unwrap().as_slice(),
            &[Resource::new(addr.clone(), format!("{}/team/app", addr))]
        );
    }

    #[tokio::test]
    async fn test_fetch_digest_basic_challenge() {
        let (addr, client) = serve("basic", IMAGE_MANIFEST).await;
        let image = ImageReference::parse(&format!("{}/team/app:latest", addr)).unwrap();

        let digest = client
            .fetch_digest(&image, &StaticAuth::new(basic("u", "p")), &Platform::default())
            .await
            .unwrap();
        assert_eq!(digest, "sha256:abc123");

        let err = client
            .fetch_digest(&image, &StaticAuth::new(basic("u", "wrong")), &Platform::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Status { status, .. } if status == StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_fetch_digest_bearer_challenge() {
        let (addr, client) = serve("bearer", MULTI_ARCH_INDEX).await;
        let image = ImageReference::parse(&format!("{}/team/app:latest", addr)).unwrap();

        let digest = client
            .fetch_digest(&image, &StaticAuth::new(basic("u", "p")), &Platform::default())
            .await
            .unwrap();
        assert_eq!(digest, "sha256:abc123");

        let err = client
            .fetch_digest(&image, &StaticAuth::new(Credentials::Anonymous), &Platform::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Status { status, .. } if status == StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_fetch_digest_platform_not_published() {
        let (addr, client) = serve("none", ARM_ONLY_INDEX).await;
        let image = ImageReference::parse(&format!("{}/team/app:latest", addr)).unwrap();

        let err = client
            .fetch_digest(&image, &StaticAuth::new(Credentials::Anonymous), &Platform::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::PlatformNotFound(_)));
    }

    #[tokio::test]
    async fn test_fetch_digest_missing_manifest() {
        let (addr, client) = serve("none", IMAGE_MANIFEST).await;
        let image = ImageReference::parse(&format!("{}/team/other:latest", addr)).unwrap();

        let err = client
            .fetch_digest(&image, &StaticAuth::new(Credentials::Anonymous), &Platform::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Status { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_fetch_digest_authentication_failure() {
        let (addr, client) = serve("none", IMAGE_MANIFEST).await;
        let image = ImageReference::parse(&format!("{}/team/app:latest", addr)).unwrap();

        let err = client
            .fetch_digest(&image, &FailingAuth, &Platform::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Authentication(Error::Cancelled)));
    }
}
