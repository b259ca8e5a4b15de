//! # scm-sdk - Strata Cloud Manager API client core
//!
//! An async Rust client for the Strata Cloud Manager / SASE configuration
//! API. It owns the part every resource call goes through: configuration
//! resolution, OAuth2 client-credentials authentication, and a request
//! pipeline that refreshes the bearer token and retries transient failures.
//!
//! ## Features
//!
//! - Configuration from explicit values, `SCM_*` environment variables, a
//!   JSON credentials file, or defaults
//! - Single-flight JWT refresh shared by all concurrent callers
//! - Retry on expired tokens (401) and overload (429/502/503/504)
//! - Structured error envelopes and typed sentinel errors
//! - Optional full request/response dumps through a pluggable log sink
//! - Generic resource services with concurrent "list everything" paging
//!
//! ## Basic Usage
//!
//! ```no_run
//! use scm_sdk::objects::{Address, AddressService};
//! use scm_sdk::{Client, Config, Context, ListInput};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), scm_sdk::ScmError> {
//!     let mut client = Client::new(Config {
//!         auth_file: Some("scm-creds.json".to_string()),
//!         check_environment: Some(true),
//!         ..Default::default()
//!     });
//!     client.setup()?;
//!
//!     let addresses = AddressService::new(Arc::new(client));
//!     let ctx = Context::new();
//!     let all = addresses
//!         .list(&ctx, &ListInput::folder("Shared").with_limit(-1))
//!         .await?;
//!
//!     for address in &all.data {
//!         println!("{} {:?}", address.name, address.ip_netmask);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Raw requests
//!
//! ```no_run
//! use scm_sdk::{ApiRequest, Client, Context};
//!
//! # async fn run(client: &Client) -> Result<(), scm_sdk::ScmError> {
//! let request = ApiRequest::get("objects", "/tags").query("folder", "Shared");
//! let page: serde_json::Value = client.execute_json(&Context::new(), &request).await?;
//! println!("{}", page["total"]);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod objects;
pub mod resource;
pub mod response;
pub mod servers;
pub mod transport;

// Re-export main types for convenience
pub use auth::{AuthResponse, Token};
pub use client::{ApiRequest, Client};
pub use config::{Config, Settings};
pub use context::Context;
pub use error::{Result, ScmError};
pub use logging::{LogLevel, LogSink, StdLogSink};
pub use resource::{ListInput, ListOutput, Location, Position, Resource, Service};
pub use response::{ErrorEntry, Response};
pub use servers::ServerTable;
pub use transport::{HttpRequest, HttpResponse, LoggingTransport, ReqwestTransport, Transport};
