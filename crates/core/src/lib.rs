//! # codeloop core
//!
//! Domain types, traits, and error definitions for the codeloop agent runtime.
//! This crate has no framework dependencies. It defines the domain model
//! that the provider, config, and agent crates implement against.
//!
//! ## Seams
//!
//! The two external collaborators of the agent loop are traits here:
//! - [`Provider`]: a chat-completion backend (streaming or not)
//! - [`CodeExecutor`]: the sandboxed kernel that runs extracted code
//!
//! Implementations live elsewhere (or in the host application), which keeps
//! the loop testable with scripted mocks.

pub mod error;
pub mod executor;
pub mod language;
pub mod message;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ErrorKind, ExecutionError, ProviderError, ProviderErrorKind, Result};
pub use executor::{CodeExecutor, ExecutionOutput, ExecutionRequest, FinalizeRecord};
pub use language::Language;
pub use message::{Message, Role};
pub use provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
