//! Deterministic in-memory implementations of [`ContainerRuntime`] and
//! [`StorageMaintainer`] for tests.
//!
//! Both record every call into a [`CallRecorder`] and support failure
//! injection per operation, either for the next call only or until cleared.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use nodeadm_core::image::DockerImage;
use nodeadm_core::naming::ContainerName;
use nodeadm_core::node::{NodeContext, ResourceAllocation};
use nodeadm_core::testing::CallRecorder;

use crate::container::{ContainerRuntime, ContainerStatus, ExecOutput, RuntimeError, RuntimeResult};
use crate::storage::{ArchiveOutcome, StorageError, StorageMaintainer, StorageResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Queued failures for one fake, keyed by operation name.
#[derive(Debug)]
struct FailurePlan<E> {
    once: HashMap<String, Vec<E>>,
    always: HashMap<String, E>,
}

impl<E: Clone> FailurePlan<E> {
    fn new() -> Self {
        Self {
            once: HashMap::new(),
            always: HashMap::new(),
        }
    }

    fn take(&mut self, operation: &str) -> Option<E> {
        if let Some(queue) = self.once.get_mut(operation) {
            if !queue.is_empty() {
                return Some(queue.remove(0));
            }
        }
        self.always.get(operation).cloned()
    }
}

/// A single recorded `exec_as_user` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub name: ContainerName,
    pub user: String,
    pub command: Vec<String>,
}

#[derive(Debug, Default)]
struct InFlight {
    current: HashMap<ContainerName, usize>,
    max: usize,
}

/// In-memory container engine.
///
/// Operations are recorded as `runtime/<op>/<container>`. Execs are recorded
/// as `exec:<last argument>` (e.g. `exec:resume`).
pub struct FakeContainerRuntime {
    containers: Mutex<HashMap<ContainerName, ContainerStatus>>,
    execs: Mutex<Vec<ExecCall>>,
    failures: Mutex<FailurePlan<RuntimeError>>,
    panics: Mutex<HashSet<String>>,
    in_flight: Mutex<InFlight>,
    latency: Duration,
    recorder: CallRecorder,
}

impl Default for FakeContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::with_recorder(CallRecorder::new())
    }

    pub fn with_recorder(recorder: CallRecorder) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            execs: Mutex::new(Vec::new()),
            failures: Mutex::new(FailurePlan::new()),
            panics: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(InFlight::default()),
            latency: Duration::ZERO,
            recorder,
        }
    }

    /// Every mutating call sleeps this long (tokio time, so pausable).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn recorder(&self) -> &CallRecorder {
        &self.recorder
    }

    /// Fail the next call of `operation` with `err`.
    pub fn fail_next(&self, operation: &str, err: RuntimeError) {
        lock(&self.failures)
            .once
            .entry(operation.to_string())
            .or_default()
            .push(err);
    }

    /// Fail every call of `operation` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, operation: &str, err: RuntimeError) {
        lock(&self.failures)
            .always
            .insert(operation.to_string(), err);
    }

    pub fn clear_failures(&self) {
        *lock(&self.failures) = FailurePlan::new();
    }

    /// Panic inside the next call of `operation`, simulating a bug in the
    /// calling task.
    pub fn panic_next(&self, operation: &str) {
        lock(&self.panics).insert(operation.to_string());
    }

    /// Put a container in place without recording a call.
    pub fn insert_container(&self, status: ContainerStatus) {
        lock(&self.containers).insert(status.name.clone(), status);
    }

    /// Remove a container behind the agent's back.
    pub fn vanish(&self, name: &ContainerName) {
        lock(&self.containers).remove(name);
    }

    pub fn container(&self, name: &ContainerName) -> Option<ContainerStatus> {
        lock(&self.containers).get(name).cloned()
    }

    pub fn containers(&self) -> Vec<ContainerStatus> {
        let mut all: Vec<_> = lock(&self.containers).values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        lock(&self.execs).clone()
    }

    /// Highest number of concurrent mutating calls seen on one container.
    pub fn max_in_flight_per_container(&self) -> usize {
        lock(&self.in_flight).max
    }

    /// Sum of resources of all containers that exist.
    pub fn allocated(&self) -> ResourceAllocation {
        lock(&self.containers)
            .values()
            .filter_map(|c| c.resources)
            .fold(ResourceAllocation::ZERO, |acc, r| acc.add(&r))
    }

    fn call(&self, operation: &str, name: &ContainerName) -> RuntimeResult<()> {
        self.recorder.record("runtime", operation, name.as_str());
        let key = operation.split(':').next().unwrap_or(operation);
        let panic = lock(&self.panics).remove(key);
        if panic {
            panic!("injected panic in {} on {}", operation, name);
        }
        match lock(&self.failures).take(key) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn mutate<T>(
        &self,
        name: &ContainerName,
        f: impl FnOnce(&mut HashMap<ContainerName, ContainerStatus>) -> RuntimeResult<T>,
    ) -> RuntimeResult<T> {
        {
            let mut in_flight = lock(&self.in_flight);
            let count = in_flight.current.entry(name.clone()).or_default();
            *count += 1;
            let count = *count;
            in_flight.max = in_flight.max.max(count);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = f(&mut lock(&self.containers));
        if let Some(count) = lock(&self.in_flight).current.get_mut(name) {
            *count = count.saturating_sub(1);
        }
        result
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn create_container(
        &self,
        image: &DockerImage,
        name: &ContainerName,
        hostname: &str,
        resources: &ResourceAllocation,
    ) -> RuntimeResult<()> {
        self.call("create", name)?;
        self.mutate(name, |containers| match containers.get(name) {
            Some(existing) if existing.image == *image => Ok(()),
            Some(_) => Err(RuntimeError::NameInUse(name.to_string())),
            None => {
                containers.insert(
                    name.clone(),
                    ContainerStatus {
                        name: name.clone(),
                        image: image.clone(),
                        running: false,
                        hostname: Some(hostname.to_string()),
                        resources: Some(*resources),
                    },
                );
                Ok(())
            }
        })
        .await
    }

    async fn start(&self, name: &ContainerName) -> RuntimeResult<()> {
        self.call("start", name)?;
        self.mutate(name, |containers| match containers.get_mut(name) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(name.to_string())),
        })
        .await
    }

    async fn stop(&self, name: &ContainerName) -> RuntimeResult<()> {
        self.call("stop", name)?;
        self.mutate(name, |containers| match containers.get_mut(name) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(name.to_string())),
        })
        .await
    }

    async fn remove(&self, name: &ContainerName) -> RuntimeResult<()> {
        self.call("remove", name)?;
        self.mutate(name, |containers| {
            containers.remove(name);
            Ok(())
        })
        .await
    }

    async fn exec_as_user(
        &self,
        name: &ContainerName,
        user: &str,
        command: &[String],
    ) -> RuntimeResult<ExecOutput> {
        let operation = format!(
            "exec:{}",
            command.last().map(String::as_str).unwrap_or_default()
        );
        self.call(&operation, name)?;
        let running = lock(&self.containers)
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false);
        if !running {
            return Err(RuntimeError::ContainerNotFound(name.to_string()));
        }
        lock(&self.execs).push(ExecCall {
            name: name.clone(),
            user: user.to_string(),
            command: command.to_vec(),
        });
        Ok(ExecOutput::default())
    }

    async fn inspect(&self, name: &ContainerName) -> RuntimeResult<Option<ContainerStatus>> {
        self.call("inspect", name)?;
        Ok(lock(&self.containers).get(name).cloned())
    }
}

/// In-memory storage maintainer. Nodes only have live storage once
/// [`add_live_storage`](Self::add_live_storage) is called for them.
pub struct FakeStorageMaintainer {
    live: Mutex<HashMap<ContainerName, u64>>,
    archived: Mutex<Vec<ContainerName>>,
    expired: Mutex<usize>,
    failures: Mutex<FailurePlan<StorageError>>,
    recorder: CallRecorder,
}

impl Default for FakeStorageMaintainer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStorageMaintainer {
    pub fn new() -> Self {
        Self::with_recorder(CallRecorder::new())
    }

    pub fn with_recorder(recorder: CallRecorder) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            archived: Mutex::new(Vec::new()),
            expired: Mutex::new(0),
            failures: Mutex::new(FailurePlan::new()),
            recorder,
        }
    }

    pub fn recorder(&self) -> &CallRecorder {
        &self.recorder
    }

    pub fn add_live_storage(&self, name: &ContainerName, bytes: u64) {
        lock(&self.live).insert(name.clone(), bytes);
    }

    pub fn has_live_storage(&self, name: &ContainerName) -> bool {
        lock(&self.live).contains_key(name)
    }

    /// Containers whose storage was archived, in order.
    pub fn archived(&self) -> Vec<ContainerName> {
        lock(&self.archived).clone()
    }

    /// Number of archives the next cleanup reports as removed.
    pub fn set_expired_archives(&self, count: usize) {
        *lock(&self.expired) = count;
    }

    /// Fail the next call of `operation` (`archive`, `cleanup`, `disk_usage`).
    pub fn fail_next(&self, operation: &str, message: &str) {
        lock(&self.failures)
            .once
            .entry(operation.to_string())
            .or_default()
            .push(Self::injected(message));
    }

    pub fn fail_always(&self, operation: &str, message: &str) {
        lock(&self.failures)
            .always
            .insert(operation.to_string(), Self::injected(message));
    }

    pub fn clear_failures(&self) {
        *lock(&self.failures) = FailurePlan::new();
    }

    fn injected(message: &str) -> StorageError {
        StorageError::Io {
            path: PathBuf::from("/fake/storage"),
            message: message.to_string(),
        }
    }

    fn call(&self, operation: &str, target: &str) -> StorageResult<()> {
        self.recorder.record("storage", operation, target);
        match lock(&self.failures).take(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageMaintainer for FakeStorageMaintainer {
    async fn archive_node_storage(&self, context: &NodeContext) -> StorageResult<ArchiveOutcome> {
        let name = &context.container_name;
        self.call("archive", name.as_str())?;
        if lock(&self.live).remove(name).is_none() {
            return Ok(ArchiveOutcome::NothingToArchive);
        }
        lock(&self.archived).push(name.clone());
        Ok(ArchiveOutcome::Archived(PathBuf::from(format!(
            "/fake/archive/{}",
            name
        ))))
    }

    async fn cleanup_after_archive(&self) -> StorageResult<usize> {
        self.call("cleanup", "")?;
        Ok(std::mem::take(&mut *lock(&self.expired)))
    }

    async fn disk_usage(&self, context: &NodeContext) -> StorageResult<u64> {
        self.call("disk_usage", context.container_name.as_str())?;
        Ok(lock(&self.live)
            .get(&context.container_name)
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeadm_core::node::NodeType;

    fn name(s: &str) -> ContainerName {
        ContainerName::new(s).unwrap()
    }

    fn image(s: &str) -> DockerImage {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_is_idempotent_for_same_image() {
        let runtime = FakeContainerRuntime::new();
        let resources = ResourceAllocation::new(1.0, 2.0, 10.0);
        runtime
            .create_container(&image("image1"), &name("host1"), "host1.test", &resources)
            .await
            .unwrap();
        runtime
            .create_container(&image("image1"), &name("host1"), "host1.test", &resources)
            .await
            .unwrap();
        assert_eq!(runtime.containers().len(), 1);

        let err = runtime
            .create_container(&image("image2"), &name("host1"), "host1.test", &resources)
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::NameInUse("host1".into()));
    }

    #[tokio::test]
    async fn test_remove_missing_succeeds_and_start_missing_fails() {
        let runtime = FakeContainerRuntime::new();
        runtime.remove(&name("ghost")).await.unwrap();
        assert!(matches!(
            runtime.start(&name("ghost")).await,
            Err(RuntimeError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let runtime = FakeContainerRuntime::new();
        let resources = ResourceAllocation::new(1.0, 1.0, 1.0);
        let cmd = vec!["/bin/nodectl".to_string(), "resume".to_string()];
        runtime
            .create_container(&image("image1"), &name("host1"), "host1.test", &resources)
            .await
            .unwrap();
        assert!(runtime.exec_as_user(&name("host1"), "root", &cmd).await.is_err());

        runtime.start(&name("host1")).await.unwrap();
        runtime.exec_as_user(&name("host1"), "root", &cmd).await.unwrap();
        assert_eq!(runtime.execs().len(), 1);
        assert_eq!(runtime.recorder().count("runtime", "exec:resume", "host1"), 2);
    }

    #[tokio::test]
    async fn test_failure_injection_once_and_always() {
        let runtime = FakeContainerRuntime::new();
        runtime.fail_next("inspect", RuntimeError::Unavailable("down".into()));
        assert!(runtime.inspect(&name("host1")).await.is_err());
        assert_eq!(runtime.inspect(&name("host1")).await.unwrap(), None);

        runtime.fail_always("exec", RuntimeError::Unavailable("down".into()));
        let cmd = vec!["restart".to_string()];
        assert!(runtime.exec_as_user(&name("host1"), "root", &cmd).await.is_err());
        assert!(runtime.exec_as_user(&name("host1"), "root", &cmd).await.is_err());
        runtime.clear_failures();
        assert!(matches!(
            runtime.exec_as_user(&name("host1"), "root", &cmd).await,
            Err(RuntimeError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fake_storage_archives_once() {
        let storage = FakeStorageMaintainer::new();
        let ctx = NodeContext::new("host2.test", NodeType::Tenant).unwrap();
        storage.add_live_storage(&ctx.container_name, 100);
        assert_eq!(storage.disk_usage(&ctx).await.unwrap(), 100);

        assert!(matches!(
            storage.archive_node_storage(&ctx).await.unwrap(),
            ArchiveOutcome::Archived(_)
        ));
        assert_eq!(
            storage.archive_node_storage(&ctx).await.unwrap(),
            ArchiveOutcome::NothingToArchive
        );
        assert_eq!(storage.archived(), vec![ctx.container_name.clone()]);
    }

    #[tokio::test]
    async fn test_fake_storage_failure_keeps_live_data() {
        let storage = FakeStorageMaintainer::new();
        let ctx = NodeContext::new("host2.test", NodeType::Tenant).unwrap();
        storage.add_live_storage(&ctx.container_name, 1);
        storage.fail_next("archive", "disk full");
        assert!(storage.archive_node_storage(&ctx).await.is_err());
        assert!(storage.has_live_storage(&ctx.container_name));
    }
}
