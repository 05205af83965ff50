use crate::config::Config;
use std::collections::HashSet;
use std::sync::Arc;

/// Owner kinds whose controllers recreate a deleted pod.
///
/// Bare pods and Jobs are left alone: deleting them would not bring them back.
#[derive(Debug, Clone)]
pub struct OwnerKinds(HashSet<String>);

impl Default for OwnerKinds {
    fn default() -> Self {
        Self(
            ["ReplicaSet", "DaemonSet", "StatefulSet"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        )
    }
}

impl OwnerKinds {
    pub fn contains(&self, kind: &str) -> bool {
        self.0.contains(kind)
    }
}

pub struct ControllerContext<C, R> {
    pub(crate) cluster: Arc<C>,
    pub(crate) registry: Arc<R>,
    pub(crate) config: Arc<Config>,
    pub(crate) owner_kinds: Arc<OwnerKinds>,
}

impl<C, R> Clone for ControllerContext<C, R> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            owner_kinds: self.owner_kinds.clone(),
        }
    }
}

/// Identifies a pod to delete so its owner recreates it with the latest image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDecision {
    pub(crate) namespace: String,
    pub(crate) name: String,
}

/// Outcome of comparing one container's running digest with the registry's.
#[derive(Debug)]
pub enum ContainerVerdict {
    Unchanged,
    NeedsUpdate,
    Failed(crate::error::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub pods_listed: usize,
    pub pods_checked: usize,
    pub pods_deleted: usize,
    pub failed_deletions: usize,
}
