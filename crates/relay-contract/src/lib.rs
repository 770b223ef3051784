//! Collaborator contracts consumed by the Relay orchestrator.
//!
//! The transport, credential store, persistent storage, plugin host, AI
//! responder, voice processor, and update checker are external to the core.
//! This crate pins their narrow interfaces, the transport event stream, the
//! error taxonomy shared by every layer, and deterministic in-memory
//! collaborators used by tests and local runs.

pub mod collaborators;
pub mod errors;
pub mod in_memory;
pub mod transport;

pub use collaborators::*;
pub use errors::*;
pub use in_memory::*;
pub use transport::*;
