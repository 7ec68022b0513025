//! HTTP integration providers for e-signature, background check and
//! document search steps.

pub mod http;
pub mod registry;

pub use http::HttpProvider;
pub use registry::build_providers;
