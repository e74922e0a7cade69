//! # nodeadm — per-host node administrator
//!
//! Facade crate that re-exports the nodeadm workspace crates so consumers
//! can depend on a single `nodeadm` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | nodeadm-core | Node specs, names, images, config, errors, retry, logging |
//! | [`runtime`] | nodeadm-runtime | Container runtime and storage maintainer capabilities |
//! | [`noderepo`] | nodeadm-noderepo | Node repository client (HTTP and in-memory) |
//! | [`agent`] | nodeadm-agent | Per-node convergence agents and host orchestrator |
//! | [`cli`] | nodeadm-cli | `nodeadm` command line |

pub use nodeadm_agent as agent;
pub use nodeadm_cli as cli;
pub use nodeadm_core as core;
pub use nodeadm_noderepo as noderepo;
pub use nodeadm_runtime as runtime;
