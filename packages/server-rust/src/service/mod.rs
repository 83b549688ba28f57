//! Request-level concerns shared by every route.
//!
//! 1. **Context** (`context`): trace ids, principals, the per-request context
//! 2. **Authentication** (`auth`): bearer extraction and the identity resolver
//! 3. **Middleware** (`middleware`): the ingress layer chain
//! 4. **Storage** (`store`): the profile store collaborator
//! 5. **Background workers** (`worker`): periodic and queued tasks

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod middleware;
pub mod store;
pub mod worker;

pub use auth::{AuthFailure, AuthResolver, HttpAuthResolver};
pub use config::{ConfigError, ServiceConfig};
pub use context::{Principal, RequestContext, TraceId};
pub use error::{ApiError, ServiceError};
pub use store::{MemoryProfileStore, ProfileStore, StoreError};
pub use worker::{BackgroundRunnable, BackgroundWorker};
