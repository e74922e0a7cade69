// nodeadm-cli: Clap commands and daemon wiring
// Depends on nodeadm-core, nodeadm-runtime, nodeadm-noderepo, nodeadm-agent

pub mod commands;
pub mod wiring;

pub use commands::run;
