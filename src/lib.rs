//! Spheregate - A multi-tenant application gateway
//!
//! This library provides an HTTP gateway that:
//! - Maps each request's hostname to a tenant configured in a platform repository
//! - Initializes tenants lazily on first contact, one initialization per hostname
//! - Routes requests through the tenant's route mappings
//! - Serves static package content with entity tags and conditional requests
//! - Dispatches server-function calls into registered server modules
//! - Runs tag-filtered test suites through an operational endpoint

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod github;
pub mod module;
pub mod pipeline;
pub mod repo;
pub mod request;
pub mod route;
pub mod server;
pub mod tenant;
pub mod testrunner;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
