use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::image::DockerImage;
use crate::naming::ContainerName;

/// Node lifecycle state, as decided by the node repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Provisioned,
    Dirty,
    Ready,
    Active,
    Inactive,
    Parked,
    Failed,
}

impl NodeState {
    pub const ALL: [NodeState; 7] = [
        Self::Provisioned,
        Self::Dirty,
        Self::Ready,
        Self::Active,
        Self::Inactive,
        Self::Parked,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioned => "provisioned",
            Self::Dirty => "dirty",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Parked => "parked",
            Self::Failed => "failed",
        }
    }

    /// Only active nodes may run a container.
    pub fn wants_container(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown node state: {:?}", s))
    }
}

/// Role of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Tenant,
    Host,
    Proxy,
    Config,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant => write!(f, "tenant"),
            Self::Host => write!(f, "host"),
            Self::Proxy => write!(f, "proxy"),
            Self::Config => write!(f, "config"),
        }
    }
}

/// Resources assigned to a container.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocation {
    pub vcpus: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
}

impl ResourceAllocation {
    pub const ZERO: ResourceAllocation = ResourceAllocation {
        vcpus: 0.0,
        memory_gb: 0.0,
        disk_gb: 0.0,
    };

    pub fn new(vcpus: f64, memory_gb: f64, disk_gb: f64) -> Self {
        Self {
            vcpus,
            memory_gb,
            disk_gb,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.vcpus > 0.0 && self.memory_gb > 0.0 && self.disk_gb > 0.0
    }

    pub fn add(&self, other: &ResourceAllocation) -> ResourceAllocation {
        ResourceAllocation {
            vcpus: self.vcpus + other.vcpus,
            memory_gb: self.memory_gb + other.memory_gb,
            disk_gb: self.disk_gb + other.disk_gb,
        }
    }

    /// Component-wise maximum of the two shapes.
    pub fn max_each(&self, other: &ResourceAllocation) -> ResourceAllocation {
        ResourceAllocation {
            vcpus: self.vcpus.max(other.vcpus),
            memory_gb: self.memory_gb.max(other.memory_gb),
            disk_gb: self.disk_gb.max(other.disk_gb),
        }
    }

    /// Whether a container running with these limits already has the
    /// `wanted` shape. A zero dimension means the runtime does not report
    /// that limit and is not compared.
    pub fn matches(&self, wanted: &ResourceAllocation) -> bool {
        const EPSILON: f64 = 1e-3;
        let close = |actual: f64, wanted: f64| actual == 0.0 || (actual - wanted).abs() < EPSILON;
        close(self.vcpus, wanted.vcpus)
            && close(self.memory_gb, wanted.memory_gb)
            && close(self.disk_gb, wanted.disk_gb)
    }

    /// True if every dimension is at most the matching one in `capacity`.
    pub fn fits_within(&self, capacity: &ResourceAllocation) -> bool {
        self.vcpus <= capacity.vcpus
            && self.memory_gb <= capacity.memory_gb
            && self.disk_gb <= capacity.disk_gb
    }
}

impl fmt::Display for ResourceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[vcpus: {}, memory: {} GB, disk: {} GB]",
            self.vcpus, self.memory_gb, self.disk_gb
        )
    }
}

/// Desired state for one node, as served by the node repository.
///
/// Fetched fresh on every tick and never mutated in place; use
/// [`NodeSpec::to_builder`] to derive a modified copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub hostname: String,
    pub state: NodeState,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wanted_docker_image: Option<DockerImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_docker_image: Option<DockerImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_vespa_version: Option<String>,
    #[serde(default)]
    pub flavor: String,
    pub vcpus: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
    #[serde(default)]
    pub wanted_restart_generation: u64,
    #[serde(default)]
    pub current_restart_generation: u64,
    #[serde(default)]
    pub wanted_reboot_generation: u64,
    #[serde(default)]
    pub current_reboot_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hostname: Option<String>,
}

impl NodeSpec {
    pub fn builder(hostname: &str) -> NodeSpecBuilder {
        NodeSpecBuilder::new(hostname)
    }

    pub fn to_builder(&self) -> NodeSpecBuilder {
        NodeSpecBuilder {
            spec: self.clone(),
        }
    }

    pub fn resources(&self) -> ResourceAllocation {
        ResourceAllocation::new(self.vcpus, self.memory_gb, self.disk_gb)
    }

    pub fn container_name(&self) -> Result<ContainerName> {
        ContainerName::from_hostname(&self.hostname)
    }

    pub fn wants_restart(&self) -> bool {
        self.wanted_restart_generation > self.current_restart_generation
    }

    pub fn wants_reboot(&self) -> bool {
        self.wanted_reboot_generation > self.current_reboot_generation
    }

    /// Reject specs that cannot be converged.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            bail!("Node spec has empty hostname");
        }
        if !self.resources().is_positive() {
            bail!(
                "Node {} has non-positive resources {}",
                self.hostname,
                self.resources()
            );
        }
        if self.state == NodeState::Active && self.wanted_docker_image.is_none() {
            bail!("Active node {} has no wanted docker image", self.hostname);
        }
        Ok(())
    }

    /// SHA-256 over the desired fields, hex encoded. Two specs with equal
    /// fingerprints need the same container on the host. Facts reported back
    /// by the agent (`current*`) are not part of it.
    pub fn fingerprint(&self) -> String {
        let node_type = self.node_type.to_string();
        let image = self
            .wanted_docker_image
            .as_ref()
            .map(DockerImage::as_str)
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        for field in [
            self.hostname.as_str(),
            self.state.as_str(),
            node_type.as_str(),
            image,
            self.flavor.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        for value in [self.vcpus, self.memory_gb, self.disk_gb] {
            hasher.update(value.to_bits().to_le_bytes());
        }
        hasher.update(self.wanted_restart_generation.to_le_bytes());
        hasher.update(self.wanted_reboot_generation.to_le_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Builder for [`NodeSpec`].
#[derive(Debug, Clone)]
pub struct NodeSpecBuilder {
    spec: NodeSpec,
}

impl NodeSpecBuilder {
    fn new(hostname: &str) -> Self {
        Self {
            spec: NodeSpec {
                hostname: hostname.to_string(),
                state: NodeState::Provisioned,
                node_type: NodeType::Tenant,
                wanted_docker_image: None,
                current_docker_image: None,
                current_vespa_version: None,
                flavor: "docker".to_string(),
                vcpus: 1.0,
                memory_gb: 1.0,
                disk_gb: 1.0,
                wanted_restart_generation: 0,
                current_restart_generation: 0,
                wanted_reboot_generation: 0,
                current_reboot_generation: 0,
                parent_hostname: None,
            },
        }
    }

    pub fn state(mut self, state: NodeState) -> Self {
        self.spec.state = state;
        self
    }

    pub fn node_type(mut self, node_type: NodeType) -> Self {
        self.spec.node_type = node_type;
        self
    }

    pub fn wanted_docker_image(mut self, image: DockerImage) -> Self {
        self.spec.wanted_docker_image = Some(image);
        self
    }

    pub fn current_docker_image(mut self, image: Option<DockerImage>) -> Self {
        self.spec.current_docker_image = image;
        self
    }

    pub fn current_vespa_version(mut self, version: Option<String>) -> Self {
        self.spec.current_vespa_version = version;
        self
    }

    pub fn flavor(mut self, flavor: &str) -> Self {
        self.spec.flavor = flavor.to_string();
        self
    }

    pub fn vcpus(mut self, vcpus: f64) -> Self {
        self.spec.vcpus = vcpus;
        self
    }

    pub fn memory_gb(mut self, memory_gb: f64) -> Self {
        self.spec.memory_gb = memory_gb;
        self
    }

    pub fn disk_gb(mut self, disk_gb: f64) -> Self {
        self.spec.disk_gb = disk_gb;
        self
    }

    pub fn wanted_restart_generation(mut self, generation: u64) -> Self {
        self.spec.wanted_restart_generation = generation;
        self
    }

    pub fn current_restart_generation(mut self, generation: u64) -> Self {
        self.spec.current_restart_generation = generation;
        self
    }

    pub fn wanted_reboot_generation(mut self, generation: u64) -> Self {
        self.spec.wanted_reboot_generation = generation;
        self
    }

    pub fn current_reboot_generation(mut self, generation: u64) -> Self {
        self.spec.current_reboot_generation = generation;
        self
    }

    pub fn parent_hostname(mut self, parent: &str) -> Self {
        self.spec.parent_hostname = Some(parent.to_string());
        self
    }

    pub fn build(self) -> NodeSpec {
        self.spec
    }
}

/// Identity of a node on this host, handed to storage operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContext {
    pub hostname: String,
    pub container_name: ContainerName,
    pub node_type: NodeType,
}

impl NodeContext {
    pub fn new(hostname: &str, node_type: NodeType) -> Result<Self> {
        Ok(Self {
            hostname: hostname.to_string(),
            container_name: ContainerName::from_hostname(hostname)?,
            node_type,
        })
    }
}

/// Observed facts reported to the node repository. Only set fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<DockerImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vespa_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl NodeAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_docker_image(mut self, image: DockerImage) -> Self {
        self.docker_image = Some(image);
        self
    }

    pub fn with_vespa_version(mut self, version: &str) -> Self {
        self.vespa_version = Some(version.to_string());
        self
    }

    pub fn with_restart_generation(mut self, generation: u64) -> Self {
        self.restart_generation = Some(generation);
        self
    }

    pub fn with_reboot_generation(mut self, generation: u64) -> Self {
        self.reboot_generation = Some(generation);
        self
    }

    pub fn with_fault(mut self, fault: &str) -> Self {
        self.fault = Some(fault.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_spec() -> NodeSpec {
        NodeSpec::builder("host1.test.yahoo.com")
            .state(NodeState::Active)
            .wanted_docker_image("image1".parse().unwrap())
            .vcpus(2.0)
            .memory_gb(4.0)
            .disk_gb(1.0)
            .wanted_restart_generation(1)
            .current_restart_generation(1)
            .build()
    }

    #[test]
    fn test_node_state_roundtrip() {
        for state in NodeState::ALL {
            assert_eq!(state.as_str().parse::<NodeState>().unwrap(), state);
        }
        assert!("deprovisioned".parse::<NodeState>().is_err());
    }

    #[test]
    fn test_only_active_wants_container() {
        for state in NodeState::ALL {
            assert_eq!(state.wants_container(), state == NodeState::Active);
        }
    }

    #[test]
    fn test_resource_fits_within() {
        let capacity = ResourceAllocation::new(4.0, 8.0, 100.0);
        assert!(ResourceAllocation::new(4.0, 8.0, 100.0).fits_within(&capacity));
        assert!(!ResourceAllocation::new(4.5, 1.0, 1.0).fits_within(&capacity));
        let sum = ResourceAllocation::new(2.0, 4.0, 1.0).add(&ResourceAllocation::new(2.0, 4.0, 1.0));
        assert_eq!(sum, ResourceAllocation::new(4.0, 8.0, 2.0));
    }

    #[test]
    fn test_generation_triggers() {
        let spec = active_spec();
        assert!(!spec.wants_restart());
        assert!(!spec.wants_reboot());

        let bumped = spec.to_builder().wanted_restart_generation(2).build();
        assert!(bumped.wants_restart());

        let rebooting = spec.to_builder().wanted_reboot_generation(1).build();
        assert!(rebooting.wants_reboot());
    }

    #[test]
    fn test_validate() {
        assert!(active_spec().validate().is_ok());
        assert!(active_spec().to_builder().vcpus(0.0).build().validate().is_err());

        let mut no_image = active_spec();
        no_image.wanted_docker_image = None;
        assert!(no_image.validate().is_err());

        let dirty = no_image.to_builder().state(NodeState::Dirty).build();
        assert!(dirty.validate().is_ok());
    }

    #[test]
    fn test_fingerprint_distinguishes_nan_resources() {
        let nan = NodeSpec::builder("host1.test").vcpus(f64::NAN).build();
        let other = nan.to_builder().state(NodeState::Dirty).build();
        assert_ne!(nan.fingerprint(), other.fingerprint());
        assert_ne!(
            nan.fingerprint(),
            nan.to_builder().wanted_reboot_generation(1).build().fingerprint()
        );
        assert_eq!(nan.fingerprint(), nan.clone().fingerprint());
    }

    #[test]
    fn test_resource_shape_helpers() {
        let small = ResourceAllocation::new(1.0, 2.0, 20.0);
        let large = ResourceAllocation::new(4.0, 1.0, 20.0);
        assert_eq!(small.max_each(&large), ResourceAllocation::new(4.0, 2.0, 20.0));

        assert!(small.matches(&small));
        assert!(!large.matches(&small));
        // Docker reports no disk limit and rounds memory to whole MiB.
        assert!(ResourceAllocation::new(1.0, 2.0004, 0.0).matches(&small));
        assert!(!ResourceAllocation::new(1.0, 2.5, 0.0).matches(&small));
    }

    #[test]
    fn test_fingerprint_ignores_reported_fields() {
        let spec = active_spec();
        let reported = spec
            .to_builder()
            .current_docker_image(Some("image1".parse().unwrap()))
            .current_vespa_version(Some("0.0.0".to_string()))
            .current_restart_generation(1)
            .build();
        assert_eq!(spec.fingerprint(), reported.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_desired_fields() {
        let spec = active_spec();
        let fp = spec.fingerprint();
        assert_eq!(fp.len(), 64);
        assert_ne!(fp, spec.to_builder().state(NodeState::Dirty).build().fingerprint());
        assert_ne!(
            fp,
            spec.to_builder()
                .wanted_docker_image("image2".parse().unwrap())
                .build()
                .fingerprint()
        );
        assert_ne!(fp, spec.to_builder().wanted_restart_generation(2).build().fingerprint());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let json = r#"{
            "hostname": "host2.test.yahoo.com",
            "state": "dirty",
            "type": "tenant",
            "wantedDockerImage": "image2",
            "flavor": "docker",
            "vcpus": 1,
            "memoryGb": 1,
            "diskGb": 1,
            "wantedRestartGeneration": 1,
            "currentRestartGeneration": 1
        }"#;
        let spec: NodeSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.state, NodeState::Dirty);
        assert_eq!(spec.node_type, NodeType::Tenant);
        assert_eq!(spec.wanted_docker_image.unwrap().as_str(), "image2");
        assert_eq!(spec.wanted_reboot_generation, 0);
        assert_eq!(spec.parent_hostname, None);
    }

    #[test]
    fn test_attributes_only_serialize_set_fields() {
        let attrs = NodeAttributes::new()
            .with_docker_image("image1".parse().unwrap())
            .with_vespa_version("0.0.0");
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"dockerImage": "image1", "vespaVersion": "0.0.0"})
        );
        assert!(NodeAttributes::new().is_empty());
        assert!(!attrs.is_empty());
    }

    #[test]
    fn test_node_context_derives_container_name() {
        let ctx = NodeContext::new("host2.test.yahoo.com", NodeType::Tenant).unwrap();
        assert_eq!(ctx.container_name.as_str(), "host2");
    }
}
