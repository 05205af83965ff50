use crate::append_list::AppendList;
use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::oci_registry::Registry;
use crate::repo::Repo;
use crate::state::{ContainerVerdict, ControllerContext, OwnerKinds, PodDecision, RunSummary};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static POD_PHASE_RUNNING: &str = "Running";
static IMAGE_PULL_POLICY_ALWAYS: &str = "Always";

/// A running pod with at least one `imagePullPolicy: Always` container.
#[derive(Debug)]
struct Candidate {
    namespace: String,
    name: String,
    pull_secrets: Vec<String>,
    containers: Vec<ContainerImage>,
}

#[derive(Debug)]
struct ContainerImage {
    name: String,
    image: String,
    image_id: String,
}

/// Scans every pod in the cluster and deletes the ones running an outdated image digest.
///
/// Cancelling `cancel` stops the scan; pods already found outdated are still deleted
/// before the run returns.
pub async fn run<C: Cluster, R: Registry>(
    ctx: ControllerContext<C, R>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let repo = Arc::new(Repo::new(
        ctx.cluster.clone(),
        ctx.registry.clone(),
        ctx.config.registry.platform.clone(),
        ctx.config.registry.digest_cache_ttl(),
        cancel.clone(),
    ));
    let decisions = Arc::new(AppendList::new());

    let (tx, mut rx) = mpsc::channel(ctx.config.scan.channel_capacity);
    let lister = tokio::spawn(list_pods(
        ctx.cluster.clone(),
        ctx.config.scan.page_size,
        tx,
        cancel.clone(),
    ));

    info!(
        "Scanning pods for containers with imagePullPolicy {} and outdated image digests",
        IMAGE_PULL_POLICY_ALWAYS
    );
    let mut summary = RunSummary::default();
    let mut workers = JoinSet::new();
    loop {
        let pod = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            pod = rx.recv() => match pod {
                Some(pod) => pod,
                None => break,
            },
        };
        summary.pods_listed += 1;

        let Some(candidate) = select_candidate(&pod, &ctx.owner_kinds) else {
            continue;
        };
        summary.pods_checked += 1;

        let repo = repo.clone();
        let decisions = decisions.clone();
        workers.spawn(async move {
            if check_pod(&repo, &candidate).await {
                decisions.append(PodDecision {
                    namespace: candidate.namespace,
                    name: candidate.name,
                });
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Pod check task failed: {}", e);
        }
    }

    let listing = lister.await.unwrap_or_else(|e| {
        error!("Pod listing task failed: {}", e);
        Err(Error::Cancelled)
    });

    // Pods already found outdated are deleted even if the scan was cut short
    let (deleted, failed) = delete_pods(ctx.cluster.as_ref(), decisions.drain()).await;
    summary.pods_deleted = deleted;
    summary.failed_deletions = failed;

    listing?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    info!(
        "Scanned {} pods, checked {}, deleted {}, failed to delete {}",
        summary.pods_listed, summary.pods_checked, summary.pods_deleted, summary.failed_deletions
    );
    Ok(summary)
}

/// Pages through the pods of all namespaces, feeding them to `tx` until the list ends.
async fn list_pods<C: Cluster>(
    cluster: Arc<C>,
    page_size: u32,
    tx: mpsc::Sender<Pod>,
    cancel: CancellationToken,
) -> Result<usize> {
    let mut continue_token: Option<String> = None;
    let mut listed = 0;
    loop {
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            page = cluster.list_pods(continue_token.as_deref(), page_size) => page,
        };
        let page = page.map_err(|e| {
            error!("Failed to list pods: {}", e);
            cancel.cancel();
            Error::ListingFailed(Arc::new(e))
        })?;

        for pod in page.items {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                sent = tx.send(pod) => {
                    if sent.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
            }
            listed += 1;
        }

        match page.continue_token {
            Some(token) if !token.is_empty() => continue_token = Some(token),
            _ => {
                debug!("Listed {} pods", listed);
                return Ok(listed);
            }
        }
    }
}

fn select_candidate(pod: &Pod, owner_kinds: &OwnerKinds) -> Option<Candidate> {
    let namespace = pod.metadata.namespace.as_deref()?;
    let name = pod.metadata.name.as_deref()?;
    let status = pod.status.as_ref()?;
    let spec = pod.spec.as_ref()?;

    if status.phase.as_deref() != Some(POD_PHASE_RUNNING) {
        debug!("Skipping pod {}/{} as it is not running", namespace, name);
        return None;
    }

    let Some(owner) = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|owners| owners.first())
    else {
        debug!("Skipping pod {}/{} without owner", namespace, name);
        return None;
    };
    if !owner_kinds.contains(&owner.kind) {
        debug!(
            "Skipping pod {}/{} owned by {} {}, which would not recreate it",
            namespace, name, owner.kind, owner.name
        );
        return None;
    }

    let always_pull: HashSet<&str> = spec
        .containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .filter(|container| container.image_pull_policy.as_deref() == Some(IMAGE_PULL_POLICY_ALWAYS))
        .map(|container| container.name.as_str())
        .collect();
    if always_pull.is_empty() {
        debug!(
            "Skipping pod {}/{} without containers using imagePullPolicy {}",
            namespace, name, IMAGE_PULL_POLICY_ALWAYS
        );
        return None;
    }

    let containers: Vec<ContainerImage> = status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .filter(|container_status| always_pull.contains(container_status.name.as_str()))
        .map(|container_status| ContainerImage {
            name: container_status.name.clone(),
            image: container_status.image.clone(),
            image_id: container_status.image_id.clone(),
        })
        .collect();
    if containers.is_empty() {
        debug!("Skipping pod {}/{} without container statuses", namespace, name);
        return None;
    }

    let pull_secrets = spec
        .image_pull_secrets
        .iter()
        .flatten()
        .map(|secret| secret.name.clone())
        .collect();

    Some(Candidate {
        namespace: namespace.to_string(),
        name: name.to_string(),
        pull_secrets,
        containers,
    })
}

/// Returns whether any checked container of the pod runs an outdated digest.
async fn check_pod(repo: &Repo, pod: &Candidate) -> bool {
    let verdicts = join_all(
        pod.containers
            .iter()
            .map(|container| check_container(repo, pod, container)),
    )
    .await;
    needs_update(pod, verdicts)
}

async fn check_container(repo: &Repo, pod: &Candidate, container: &ContainerImage) -> ContainerVerdict {
    let Some(current_digest) = image_id_digest(&container.image_id) else {
        info!(
            "Skipping container {} in pod {}/{} because its imageID field is empty",
            container.name, pod.namespace, pod.name
        );
        return ContainerVerdict::Unchanged;
    };

    match repo
        .get_image_digest(&container.image, &pod.namespace, &pod.pull_secrets)
        .await
    {
        Ok(latest_digest) if latest_digest == current_digest => {
            debug!(
                "Container {} in pod {}/{} is up to date with image {}",
                container.name, pod.namespace, pod.name, container.image
            );
            ContainerVerdict::Unchanged
        }
        Ok(latest_digest) => {
            info!(
                "Container {} in pod {}/{} runs digest {} but image {} is at {}",
                container.name, pod.namespace, pod.name, current_digest, container.image, latest_digest
            );
            ContainerVerdict::NeedsUpdate
        }
        Err(e) => ContainerVerdict::Failed(e),
    }
}

fn needs_update(pod: &Candidate, verdicts: Vec<ContainerVerdict>) -> bool {
    let mut needs_update = false;
    for verdict in verdicts {
        match verdict {
            ContainerVerdict::NeedsUpdate => needs_update = true,
            ContainerVerdict::Unchanged => {}
            ContainerVerdict::Failed(e) if e.is_cancelled() => {
                debug!("Check of pod {}/{} was cancelled", pod.namespace, pod.name);
            }
            ContainerVerdict::Failed(e) => {
                warn!(
                    "Failed to get latest image digest for pod {}/{}: {}",
                    pod.namespace,
                    pod.name,
                    e.chain()
                );
            }
        }
    }
    needs_update
}

/// Digest hex from a container status imageID like `sha256:<hex>` or `<image>@sha256:<hex>`.
fn image_id_digest(image_id: &str) -> Option<&str> {
    let digest = image_id
        .rsplit_once('@')
        .map_or(image_id, |(_, digest)| digest);
    digest
        .split_once(':')
        .map(|(_, hex)| hex)
        .filter(|hex| !hex.is_empty())
}

async fn delete_pods<C: Cluster>(cluster: &C, decisions: Vec<PodDecision>) -> (usize, usize) {
    let mut deleted = 0;
    let mut failed = 0;
    for decision in decisions {
        match cluster.delete_pod(&decision.namespace, &decision.name).await {
            Ok(()) => {
                info!(
                    "Deleted pod {}/{} to force image pull",
                    decision.namespace, decision.name
                );
                deleted += 1;
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                info!(
                    "Pod {}/{} is already gone, skipping deletion",
                    decision.namespace, decision.name
                );
            }
            Err(e) => {
                let err = Error::DeletionFailed {
                    namespace: decision.namespace,
                    name: decision.name,
                    source: Arc::new(e),
                };
                warn!("{}", err.chain());
                failed += 1;
            }
        }
    }
    (deleted, failed)
}
