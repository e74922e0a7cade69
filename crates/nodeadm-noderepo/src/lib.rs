// nodeadm-noderepo: Client for the node repository (desired state + reported attributes)
// Depends on nodeadm-core

pub mod client;
pub mod http;
pub mod memory;

pub use client::{NodeRepository, RepositoryError, RepositoryResult};
pub use http::HttpNodeRepository;
pub use memory::InMemoryNodeRepository;
