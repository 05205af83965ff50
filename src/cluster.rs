use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// One page of the cluster-wide pod list.
#[derive(Debug, Default)]
pub struct PodPage {
    pub items: Vec<Pod>,
    /// Token for the next page, `None` or empty on the last page.
    pub continue_token: Option<String>,
}

/// The Kubernetes API calls a refresh run depends on.
pub trait Cluster: Send + Sync + 'static {
    fn list_pods(
        &self,
        continue_token: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = kube::Result<PodPage>> + Send;

    fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = kube::Result<Secret>> + Send;

    fn delete_pod(&self, namespace: &str, name: &str)
    -> impl Future<Output = kube::Result<()>> + Send;
}

pub async fn create_client() -> Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default()
        .await
        .map_err(|e| Error::ClusterConnectionFailed(Arc::new(e)))?;
    let api_server_info = client
        .apiserver_version()
        .await
        .map_err(|e| Error::ClusterConnectionFailed(Arc::new(e)))?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Cluster for KubeCluster {
    async fn list_pods(&self, continue_token: Option<&str>, limit: u32) -> kube::Result<PodPage> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let mut lp = ListParams::default().limit(limit);
        if let Some(token) = continue_token {
            lp = lp.continue_token(token);
        }

        let list = pods.list(&lp).await?;
        debug!("Listed page of {} pods", list.items.len());
        Ok(PodPage {
            continue_token: list.metadata.continue_,
            items: list.items,
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> kube::Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.get(name).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> kube::Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
