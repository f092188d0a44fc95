//! Backend Invocation
//!
//! The seam between the routing core and real providers. The core only
//! knows backends by id; reaching them is the embedder's job.
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::backend::{Invoker, Invocation, InvokeError, RequestOptions};
//!
//! struct MyInvoker;
//!
//! #[async_trait::async_trait]
//! impl Invoker for MyInvoker {
//!     async fn invoke(&self, backend_id: &str, instance_id: &str, prompt: &str,
//!                     options: &RequestOptions) -> Result<Invocation, InvokeError> {
//!         // call the provider
//!     }
//! }
//! ```

mod traits;

pub use traits::{HealthProbe, Invocation, InvokeError, Invoker, ProbeError, RequestOptions};
