#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use nodeadm_agent::{AgentSettings, Capabilities, HostResources, NodeAgent, OrchestratorSettings, TickOutcome};
use nodeadm_core::error::ConvergenceError;
use nodeadm_core::naming::ContainerName;
use nodeadm_core::node::{NodeSpec, NodeState, ResourceAllocation};
use nodeadm_core::retry::BackoffPolicy;
use nodeadm_core::testing::CallRecorder;
use nodeadm_noderepo::InMemoryNodeRepository;
use nodeadm_runtime::fake::{FakeContainerRuntime, FakeStorageMaintainer};

pub const PARENT: &str = "dockerhost1.test.yahoo.com";

/// One simulated host: fakes sharing a recorder, plus the shared resources.
pub struct TestHost {
    pub recorder: CallRecorder,
    pub runtime: Arc<FakeContainerRuntime>,
    pub storage: Arc<FakeStorageMaintainer>,
    pub repository: Arc<InMemoryNodeRepository>,
    pub resources: Arc<HostResources>,
    pub suspend: watch::Sender<bool>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_capacity(ResourceAllocation::new(16.0, 64.0, 1000.0))
    }

    pub fn with_capacity(capacity: ResourceAllocation) -> Self {
        let recorder = CallRecorder::new();
        let (suspend, _) = watch::channel(false);
        Self {
            runtime: Arc::new(FakeContainerRuntime::with_recorder(recorder.clone())),
            storage: Arc::new(FakeStorageMaintainer::with_recorder(recorder.clone())),
            repository: Arc::new(InMemoryNodeRepository::with_recorder(recorder.clone())),
            resources: Arc::new(HostResources::new(capacity)),
            recorder,
            suspend,
        }
    }

    pub fn caps(&self) -> Capabilities {
        Capabilities {
            runtime: self.runtime.clone(),
            storage: self.storage.clone(),
            repository: self.repository.clone(),
            resources: self.resources.clone(),
        }
    }

    pub fn agent(&self, hostname: &str) -> NodeAgent {
        NodeAgent::new(
            hostname,
            self.caps(),
            AgentSettings::default(),
            self.suspend.subscribe(),
        )
        .unwrap()
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            host_hostname: PARENT.to_string(),
            tick_interval: Duration::from_secs(1),
            tick_jitter: Duration::ZERO,
            discovery_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(4), Duration::ZERO),
            agent: AgentSettings::default(),
        }
    }

    pub fn container_exists(&self, hostname: &str) -> bool {
        self.runtime
            .container(&ContainerName::from_hostname(hostname).unwrap())
            .is_some()
    }

    /// Tick until the agent reports an empty converged tick.
    pub async fn converge(&self, agent: &mut NodeAgent, max_ticks: usize) -> Result<(), ConvergenceError> {
        for _ in 0..max_ticks {
            agent.invalidate();
            if agent.tick().await? == (TickOutcome::Converged { actions: vec![] }) {
                return Ok(());
            }
        }
        Err(ConvergenceError::transient("did not converge"))
    }
}

pub fn node(hostname: &str, state: NodeState, image: &str) -> NodeSpec {
    NodeSpec::builder(hostname)
        .state(state)
        .wanted_docker_image(image.parse().unwrap())
        .vcpus(1.0)
        .memory_gb(2.0)
        .disk_gb(20.0)
        .parent_hostname(PARENT)
        .build()
}

/// Poll `condition` under paused tokio time.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}
