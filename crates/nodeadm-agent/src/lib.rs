// nodeadm-agent: Node convergence state machine and host-wide orchestration
// Depends on nodeadm-core, nodeadm-runtime, nodeadm-noderepo

pub mod agent;
pub mod orchestrator;
pub mod resources;

pub use agent::{Action, AgentSettings, Capabilities, NodeAgent, TickOutcome};
pub use orchestrator::{AgentPhase, AgentStatus, DiscoveryReport, HostOrchestrator, OrchestratorSettings};
pub use resources::HostResources;
