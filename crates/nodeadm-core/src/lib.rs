// nodeadm-core: Pure types, config, errors, utilities
// No internal nodeadm dependencies; the other crates build on this one.

pub mod config;
pub mod error;
pub mod image;
pub mod naming;
pub mod node;
pub mod observability;
pub mod retry;
pub mod testing;
pub mod time;
