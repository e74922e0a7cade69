//! In-memory node repository for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use nodeadm_core::node::{NodeAttributes, NodeSpec, NodeState};
use nodeadm_core::testing::CallRecorder;

use crate::client::{NodeRepository, RepositoryError, RepositoryResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps node specs in a map and applies reported attributes to their
/// `current*` fields, the way the real repository does.
///
/// Calls are recorded as `repository/<operation>/<hostname>`.
#[derive(Default)]
pub struct InMemoryNodeRepository {
    nodes: Mutex<BTreeMap<String, NodeSpec>>,
    faults: Mutex<HashMap<String, String>>,
    attribute_updates: Mutex<Vec<(String, NodeAttributes)>>,
    pending_failures: Mutex<HashMap<String, usize>>,
    recorder: CallRecorder,
}

impl InMemoryNodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recorder(recorder: CallRecorder) -> Self {
        Self {
            recorder,
            ..Self::default()
        }
    }

    pub fn recorder(&self) -> &CallRecorder {
        &self.recorder
    }

    /// Insert or replace a node.
    pub fn put_node(&self, spec: NodeSpec) {
        lock(&self.nodes).insert(spec.hostname.clone(), spec);
    }

    pub fn remove_node(&self, hostname: &str) -> Option<NodeSpec> {
        lock(&self.nodes).remove(hostname)
    }

    pub fn node(&self, hostname: &str) -> Option<NodeSpec> {
        lock(&self.nodes).get(hostname).cloned()
    }

    /// Apply `f` to a stored spec, e.g. to bump a wanted generation.
    pub fn modify_node(&self, hostname: &str, f: impl FnOnce(&mut NodeSpec)) -> bool {
        match lock(&self.nodes).get_mut(hostname) {
            Some(spec) => {
                f(spec);
                true
            }
            None => false,
        }
    }

    /// Last fault reported for the node.
    pub fn fault(&self, hostname: &str) -> Option<String> {
        lock(&self.faults).get(hostname).cloned()
    }

    pub fn attribute_updates(&self) -> Vec<(String, NodeAttributes)> {
        lock(&self.attribute_updates).clone()
    }

    /// Make the next `times` calls of `operation` fail transiently.
    pub fn fail_next(&self, operation: &str, times: usize) {
        *lock(&self.pending_failures)
            .entry(operation.to_string())
            .or_default() += times;
    }

    fn call(&self, operation: &str, target: &str) -> RepositoryResult<()> {
        self.recorder.record("repository", operation, target);
        let mut pending = lock(&self.pending_failures);
        match pending.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RepositoryError::Transient(format!(
                    "injected failure for {} on {}",
                    operation, target
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodeRepository {
    async fn get_node_spec(&self, hostname: &str) -> RepositoryResult<Option<NodeSpec>> {
        self.call("get_node_spec", hostname)?;
        Ok(self.node(hostname))
    }

    async fn list_nodes(&self, parent_hostname: &str) -> RepositoryResult<Vec<NodeSpec>> {
        self.call("list_nodes", parent_hostname)?;
        Ok(lock(&self.nodes)
            .values()
            .filter(|spec| spec.parent_hostname.as_deref() == Some(parent_hostname))
            .cloned()
            .collect())
    }

    async fn update_attributes(
        &self,
        hostname: &str,
        attributes: &NodeAttributes,
    ) -> RepositoryResult<()> {
        self.call("update_attributes", hostname)?;
        let mut nodes = lock(&self.nodes);
        let spec = nodes
            .get_mut(hostname)
            .ok_or_else(|| RepositoryError::NotFound(hostname.to_string()))?;

        if let Some(image) = &attributes.docker_image {
            spec.current_docker_image = Some(image.clone());
        }
        if let Some(version) = &attributes.vespa_version {
            spec.current_vespa_version = Some(version.clone());
        }
        if let Some(generation) = attributes.restart_generation {
            spec.current_restart_generation = generation;
        }
        if let Some(generation) = attributes.reboot_generation {
            spec.current_reboot_generation = generation;
        }
        if let Some(fault) = &attributes.fault {
            lock(&self.faults).insert(hostname.to_string(), fault.clone());
        }
        lock(&self.attribute_updates).push((hostname.to_string(), attributes.clone()));
        Ok(())
    }

    async fn set_node_state(&self, hostname: &str, state: NodeState) -> RepositoryResult<()> {
        self.call("set_node_state", hostname)?;
        let mut nodes = lock(&self.nodes);
        let spec = nodes
            .get_mut(hostname)
            .ok_or_else(|| RepositoryError::NotFound(hostname.to_string()))?;
        spec.state = state;
        Ok(())
    }
}
