mod common;

use nodeadm_agent::{Action, TickOutcome};
use nodeadm_core::error::ConvergenceError;
use nodeadm_core::naming::ContainerName;
use nodeadm_core::node::{NodeState, ResourceAllocation};

use common::{TestHost, node};

const HOST1: &str = "host1.test.yahoo.com";

#[tokio::test]
async fn test_idempotence_second_run_makes_no_calls() {
    let host = TestHost::new();
    let mut agent = host.agent(HOST1);
    host.repository
        .put_node(node(HOST1, NodeState::Active, "image1:1.0"));
    agent.tick().await.unwrap();

    host.recorder.clear();
    assert_eq!(agent.tick().await.unwrap(), TickOutcome::Skipped);
    assert!(host.recorder.calls_for("runtime").is_empty());
    assert!(host.recorder.calls_for("storage").is_empty());
}

#[tokio::test]
async fn test_idempotence_with_forced_inspect() {
    let host = TestHost::new();
    let mut agent = host.agent(HOST1);
    host.repository
        .put_node(node(HOST1, NodeState::Active, "image1:1.0"));
    agent.tick().await.unwrap();

    host.recorder.clear();
    agent.invalidate();
    assert_eq!(
        agent.tick().await.unwrap(),
        TickOutcome::Converged { actions: vec![] }
    );
    let runtime_ops: Vec<String> = host
        .recorder
        .calls_for("runtime")
        .into_iter()
        .map(|c| c.operation)
        .collect();
    assert_eq!(runtime_ops, vec!["inspect"]);
}

#[tokio::test]
async fn test_convergence_from_running_container_to_every_state() {
    for state in NodeState::ALL {
        let host = TestHost::new();
        let mut agent = host.agent(HOST1);
        host.repository
            .put_node(node(HOST1, NodeState::Active, "image1:1.0"));
        agent.tick().await.unwrap();
        assert!(host.container_exists(HOST1));

        host.repository
            .put_node(node(HOST1, state, "image1:1.0"));
        host.converge(&mut agent, 5).await.unwrap();

        let expected = host.repository.node(HOST1).unwrap().state.wants_container();
        assert_eq!(
            host.container_exists(HOST1),
            expected,
            "container presence after converging to {}",
            state
        );
        if state == NodeState::Dirty {
            assert_eq!(host.repository.node(HOST1).unwrap().state, NodeState::Ready);
        }
    }
}

#[tokio::test]
async fn test_convergence_from_absent_to_active_after_transient_failures() {
    use nodeadm_runtime::container::RuntimeError;

    let host = TestHost::new();
    let mut agent = host.agent(HOST1);
    host.repository
        .put_node(node(HOST1, NodeState::Active, "image1:1.0"));
    host.runtime
        .fail_next("create", RuntimeError::Unavailable("daemon restarting".into()));
    host.runtime
        .fail_next("exec", RuntimeError::Unavailable("daemon restarting".into()));

    assert!(agent.tick().await.is_err());
    assert!(agent.tick().await.is_err());
    host.converge(&mut agent, 3).await.unwrap();
    let container = host
        .runtime
        .container(&ContainerName::new("host1").unwrap())
        .unwrap();
    assert!(container.running);
    // The failed resume is retried even though the container is already up.
    assert_eq!(host.runtime.execs().len(), 1);
    assert_eq!(host.runtime.execs()[0].command[1], "resume");
}

#[tokio::test]
async fn test_no_data_loss_dirty_never_ready_without_archive() {
    let host = TestHost::new();
    let mut agent = host.agent(HOST1);
    let name = ContainerName::new("host1").unwrap();
    host.storage.add_live_storage(&name, 1 << 20);
    host.repository
        .put_node(node(HOST1, NodeState::Dirty, "image1:1.0"));
    host.storage.fail_always("archive", "read-only file system");

    for _ in 0..5 {
        let err = agent.tick().await.unwrap_err();
        assert!(matches!(err, ConvergenceError::StorageFault(_)));
        assert_eq!(host.repository.node(HOST1).unwrap().state, NodeState::Dirty);
    }
    assert_eq!(host.recorder.count("repository", "set_node_state", HOST1), 0);
    assert!(host.storage.has_live_storage(&name));

    host.storage.clear_failures();
    agent.tick().await.unwrap();
    assert_eq!(host.repository.node(HOST1).unwrap().state, NodeState::Ready);
    assert_eq!(host.storage.archived(), vec![name]);

    let calls = host.recorder.calls();
    let ready_at = calls
        .iter()
        .position(|c| c.matches("repository", "set_node_state", HOST1))
        .unwrap();
    let archived_at = calls
        .iter()
        .rposition(|c| c.matches("storage", "archive", "host1"))
        .unwrap();
    assert!(archived_at < ready_at);
}

#[tokio::test]
async fn test_removal_before_creation_on_image_change() {
    let host = TestHost::new();
    let mut agent = host.agent(HOST1);
    host.repository
        .put_node(node(HOST1, NodeState::Active, "image1:1.0"));
    agent.tick().await.unwrap();

    host.repository
        .modify_node(HOST1, |spec| spec.wanted_docker_image = Some("image1:2.0".parse().unwrap()));
    host.recorder.clear();
    let outcome = agent.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Converged {
            actions: vec![
                Action::RemoveContainer,
                Action::CreateContainer,
                Action::StartContainer,
                Action::ExecResume,
                Action::PublishAttributes,
            ]
        }
    );

    let remove_at = host
        .recorder
        .position_from(0, "runtime", "remove", "host1")
        .unwrap();
    let create_at = host
        .recorder
        .position_from(0, "runtime", "create", "host1")
        .unwrap();
    assert!(remove_at < create_at);
    assert_eq!(
        host.repository.node(HOST1).unwrap().current_vespa_version.as_deref(),
        Some("2.0")
    );
}

#[tokio::test]
async fn test_resource_ledger_never_exceeds_capacity() {
    let host = TestHost::with_capacity(ResourceAllocation::new(2.0, 4.0, 40.0));
    let hostnames = ["host1.a.com", "host2.a.com", "host3.a.com"];
    let mut agents: Vec<_> = hostnames.iter().map(|h| host.agent(h)).collect();
    for hostname in hostnames {
        host.repository
            .put_node(node(hostname, NodeState::Active, "image1:1.0"));
    }

    let mut results = Vec::new();
    for agent in agents.iter_mut() {
        results.push(agent.tick().await);
    }
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(matches!(results[2], Err(ConvergenceError::NonRetryable(_))));
    assert!(host.runtime.allocated().fits_within(&host.resources.capacity()));
    assert!(host.resources.allocated().fits_within(&host.resources.capacity()));
    assert!(host.repository.fault("host3.a.com").is_some());

    // Freeing one node lets the blocked one in on a later tick.
    host.repository
        .put_node(node("host1.a.com", NodeState::Parked, "image1:1.0"));
    agents[0].tick().await.unwrap();
    agents[2].tick().await.unwrap();
    assert!(host.container_exists("host3.a.com"));
    assert!(host.runtime.allocated().fits_within(&host.resources.capacity()));
}

#[tokio::test]
async fn test_container_name_collision_is_conflict() {
    let host = TestHost::new();
    let mut first = host.agent("web1.zone-a.example.com");
    let mut second = host.agent("web1.zone-b.example.com");
    host.repository
        .put_node(node("web1.zone-a.example.com", NodeState::Active, "image1:1.0"));
    host.repository
        .put_node(node("web1.zone-b.example.com", NodeState::Active, "image1:1.0"));

    first.tick().await.unwrap();
    let err = second.tick().await.unwrap_err();
    assert!(matches!(err, ConvergenceError::Conflict(_)));
    assert_eq!(host.runtime.containers().len(), 1);
    assert_eq!(
        host.runtime.containers()[0].hostname.as_deref(),
        Some("web1.zone-a.example.com")
    );
}

#[tokio::test]
async fn test_name_conflict_holds_no_capacity() {
    let host = TestHost::with_capacity(ResourceAllocation::new(8.0, 64.0, 1000.0));
    let sized = |hostname: &str| {
        node(hostname, NodeState::Active, "image1:1.0")
            .to_builder()
            .vcpus(3.0)
            .build()
    };
    let mut owner = host.agent("host1.a.com");
    let mut clash = host.agent("host1.b.com");
    let mut other = host.agent("host9.a.com");
    for hostname in ["host1.a.com", "host1.b.com", "host9.a.com"] {
        host.repository.put_node(sized(hostname));
    }

    owner.tick().await.unwrap();
    let err = clash.tick().await.unwrap_err();
    assert!(matches!(err, ConvergenceError::Conflict(_)));
    assert_eq!(host.resources.reservation("host1.b.com"), None);

    other.tick().await.unwrap();
    assert!(host.container_exists("host9.a.com"));
    assert_eq!(host.resources.allocated().vcpus, 6.0);
}

#[tokio::test]
async fn test_downsized_container_is_replaced_within_capacity() {
    let host = TestHost::with_capacity(ResourceAllocation::new(4.0, 64.0, 1000.0));
    let mut big = host.agent("host1.a.com");
    let mut small = host.agent("host2.a.com");
    host.repository.put_node(
        node("host1.a.com", NodeState::Active, "image1:1.0")
            .to_builder()
            .vcpus(4.0)
            .build(),
    );
    big.tick().await.unwrap();

    host.repository
        .modify_node("host1.a.com", |spec| spec.vcpus = 1.0);
    let outcome = big.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Converged {
            actions: vec![
                Action::RemoveContainer,
                Action::CreateContainer,
                Action::StartContainer,
                Action::ExecResume,
            ]
        }
    );
    let container = host
        .runtime
        .container(&ContainerName::new("host1").unwrap())
        .unwrap();
    assert_eq!(container.resources.unwrap().vcpus, 1.0);

    host.repository.put_node(
        node("host2.a.com", NodeState::Active, "image1:1.0")
            .to_builder()
            .vcpus(3.0)
            .build(),
    );
    small.tick().await.unwrap();
    assert!(host.runtime.allocated().fits_within(&host.resources.capacity()));
    assert!(host.resources.allocated().fits_within(&host.resources.capacity()));
}

#[tokio::test]
async fn test_failed_resize_keeps_larger_reservation() {
    use nodeadm_runtime::container::RuntimeError;

    let host = TestHost::with_capacity(ResourceAllocation::new(4.0, 64.0, 1000.0));
    let mut big = host.agent("host1.a.com");
    let mut small = host.agent("host2.a.com");
    host.repository.put_node(
        node("host1.a.com", NodeState::Active, "image1:1.0")
            .to_builder()
            .vcpus(4.0)
            .build(),
    );
    host.repository.put_node(
        node("host2.a.com", NodeState::Active, "image1:1.0")
            .to_builder()
            .vcpus(3.0)
            .build(),
    );
    big.tick().await.unwrap();

    host.repository
        .modify_node("host1.a.com", |spec| spec.vcpus = 1.0);
    host.runtime
        .fail_next("remove", RuntimeError::Unavailable("daemon restarting".into()));
    assert!(big.tick().await.is_err());
    assert_eq!(host.resources.reservation("host1.a.com").unwrap().vcpus, 4.0);

    // The old container still holds four vcpus, so nothing else fits yet.
    let err = small.tick().await.unwrap_err();
    assert!(matches!(err, ConvergenceError::NonRetryable(_)));
    assert!(host.runtime.allocated().fits_within(&host.resources.capacity()));

    host.converge(&mut big, 3).await.unwrap();
    assert_eq!(host.resources.reservation("host1.a.com").unwrap().vcpus, 1.0);
    host.converge(&mut small, 3).await.unwrap();
    assert!(host.container_exists("host2.a.com"));
    assert!(host.runtime.allocated().fits_within(&host.resources.capacity()));
}
