//! # loom-core
//!
//! The LOOM agent runtime: resolves an agent reference, runs it through the
//! executor for its kind, and streams progress as `StreamEvent`s.
//!
//! This crate provides:
//! - The collaborator traits (`ModelCall`, `ResourceResolver`, `HttpClient`, …)
//! - The `RuntimeExecutor` that resolves agents and drives task lifecycles
//! - One executor per agent kind, plus the streaming helpers they share
//!
//! ## Usage
//!
//! ```rust,ignore
//! use loom_core::{Collaborators, ExecuteOptions, Project, RuntimeExecutor};
//!
//! let runtime = RuntimeExecutor::new(project, Collaborators::default().with_model(model), config);
//! let outputs = runtime.execute("writer", inputs, ExecuteOptions::default(), sink).await?;
//! ```

pub mod bindings;
pub mod cache;
pub mod collaborators;
pub mod executors;
pub mod extract;
pub mod partial_json;
pub mod project;
pub mod retry;
pub mod runtime;
pub mod task;
pub mod template;
pub mod traits;

pub use collaborators::{Collaborators, InMemoryCache, NoMemory, NoResolver, NoopCache, ReqwestHttpClient};
pub use extract::{extract_stream, ExtractChunk, MetadataExtractor};
pub use partial_json::PartialJsonEmitter;
pub use project::Project;
pub use retry::RetryPolicy;
pub use runtime::{ExecuteOptions, RunStream, RuntimeExecutor};
pub use traits::{
    CachePort, HttpClient, HttpRequest, HttpResponse, ImageModelCall, MemoryLookup, MemoryVariable, ModelCall,
    ModelStream, ResourceResolver,
};
