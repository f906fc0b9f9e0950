#![warn(missing_docs)]

//! dfsync server subsystem: write-lock arbitration, concurrency guards, file
//! operations and the asynchronous notification pipeline
//!
//! A single [`FileService`] owns the lock table and the guard set. The RPC
//! layer hands every call to [`FileServiceHandler`], which routes CallbackList
//! requests through the [`NotificationPipeline`] and everything else straight
//! to the service.

#[allow(missing_docs)]
pub mod config;
#[allow(missing_docs)]
pub mod error;
pub mod guard;
pub mod handler;
pub mod lock;
pub mod pipeline;
pub mod server;
pub mod service;

pub use config::ServerConfig;
pub use error::{ServiceError, ServiceResult};
pub use guard::GuardSet;
pub use handler::FileServiceHandler;
pub use lock::{AcquireOutcome, LockManager, WriteLease};
pub use pipeline::{NotificationPipeline, PipelineStats, TaskState};
pub use server::DfsServer;
pub use service::{ChunkSink, ChunkSource, FetchRequest, FileService, StoreRequest};
