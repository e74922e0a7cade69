// nodeadm-runtime: Container runtime + host storage capabilities
// Depends on nodeadm-core

pub mod container;
pub mod docker;
pub mod fake;
pub mod storage;
