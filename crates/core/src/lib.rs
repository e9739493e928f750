//! # Tilt Core
//!
//! Domain types, traits, and error definitions for the Tilt computer-use
//! agent. This crate has **no HTTP or storage dependencies**; it defines the model
//! that every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the sampling loop is a trait here. Implementations
//! live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted providers and in-memory stores
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod observer;
pub mod provider;
pub mod store;
pub mod tool;
pub mod version;

// Re-export key types at crate root for ergonomics
pub use error::{Error, LoopError, ProviderError, Result, StoreError, ToolError};
pub use message::{CacheControl, ContentBlock, Message, MessageContent, Role, ToolResultContent};
pub use observer::{ApiExchange, LoopObserver, NullObserver};
pub use provider::{ApiProvider, Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use store::{
    CurrentTask, Interjection, InterjectionStore, NewTask, SettingsStore, Store, Task, TaskStatus,
    TaskStore, TaskToolUse, TaskUpdate,
};
pub use tool::{Tool, ToolCollection, ToolResult};
pub use version::ToolVersion;
