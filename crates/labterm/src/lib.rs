//! labterm: container-isolated labs with an interactive browser terminal.
//!
//! A lab session provisions one sandbox container from a lab build context,
//! lets one WebSocket terminal at a time attach to an interactive shell in it,
//! runs the lab's validator on request and releases the sandbox on reset.

pub mod api;
pub mod bridge;
pub mod container;
pub mod exec;
pub mod provision;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;
