//! Core logic for lxdtest
//!
//! This crate provides:
//! - The container lifecycle controller (launch, start, wait, provision, destroy)
//! - SSH access provisioning into a running container
//! - The remote execution transport with retryable command execution
//! - Instance state handed back to (and persisted by) the caller

mod access;
mod error;
mod lifecycle;
mod state;
mod transport;

pub use access::*;
pub use error::*;
pub use lifecycle::*;
pub use state::*;
pub use transport::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
