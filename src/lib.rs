//! `reqflow` is a client-side HTTP request lifecycle engine: declarative
//! request descriptors, a validated response pipeline, retry behaviors, and
//! race-free task state with cancellation.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{Environment, Manager, RetryBehavior, RetryStrategy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let environment = Environment::new("https://api.example.com/v1")?;
//!     let manager = Manager::builder(environment)
//!         .default_header("X-Api-Version", "3")
//!         .default_timeout(Duration::from_secs(10))
//!         .default_retry_behavior(RetryBehavior::retry_network_failure(
//!             RetryStrategy::RetryOnce,
//!         ))
//!         .try_build()?;
//!
//!     let task = manager
//!         .get("search")
//!         .param("query", "cats")
//!         .parse_as_json()
//!         .send(&manager)?;
//!
//!     if let Some((response, value)) = task.join().await.success() {
//!         println!("{} -> {value}", response.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Give the manager a default timeout; descriptors inherit it.
//! - Retry behaviors only fire for idempotent requests unless told
//!   otherwise; prefer keeping it that way.
//! - Use the mock registry in tests instead of a substitute transport
//!   unless you need to script transport-level failures.

mod body;
mod descriptor;
mod error;
mod executor;
mod headers;
pub mod mock;
mod processor;
mod retry;
mod state;
mod transport;

pub use crate::body::{DeferredParts, MultipartPart, PartContent};
pub use crate::descriptor::{
    CachePolicy, CacheStoragePolicy, Credential, Environment, Method, RequestDescriptor,
};
pub use crate::error::{Error, ErrorCode, TransportError, TransportErrorKind};
pub use crate::executor::{Manager, ManagerBuilder, Task, TaskResult};
pub use crate::headers::HeaderSet;
pub use crate::processor::{HttpResponse, ParseRequest};
pub use crate::retry::{
    RetryBehavior, RetryContext, RetryOutcome, RetryStrategy, RetryVerdict,
};
pub use crate::state::{TaskState, Transition};
pub use crate::transport::{
    HyperTransport, PreparedRequest, Transport, TransportConfig, TransportResponse,
};

pub type ReqflowResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Credential, Environment, Error, Manager, Method, MultipartPart, ReqflowResult,
        RequestDescriptor, RetryBehavior, RetryStrategy, Task, TaskResult, TaskState,
    };
}
